//! Samples and pipeline events
//!
//! Everything here is immutable once emitted. Timestamps are milliseconds
//! since the Unix epoch, which is what the sinks speak.

use std::collections::BTreeMap;

use serde::Serialize;

use pump_modbus::RawValue;

use crate::config::ReadBlock;
use crate::error::AcqError;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Final interpreted value of a parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParsedValue {
    Integer(i64),
    Number(f64),
    Text(String),
    /// Bit code to state, for bit-mapped parameters
    Bits(BTreeMap<String, bool>),
}

impl From<RawValue> for ParsedValue {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Integer(v) => ParsedValue::Integer(v),
            RawValue::Float(v) => ParsedValue::Number(v),
            RawValue::Text(s) => ParsedValue::Text(s),
        }
    }
}

impl ParsedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParsedValue::Integer(v) => Some(*v as f64),
            ParsedValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

/// One decoded parameter observation
#[derive(Debug, Clone, Serialize)]
pub struct ParameterSample {
    pub conn_id: String,
    pub device_id: String,
    pub code: String,
    /// Pre-scale integer or float as reconstructed from the registers
    pub raw: RawValue,
    pub parsed: ParsedValue,
    pub unit: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Outcome of reading one block during a tick
#[derive(Debug, Clone)]
pub struct BlockResult {
    pub block: ReadBlock,
    /// Register words; bit tables deliver 0/1 words
    pub outcome: Result<Vec<u16>, AcqError>,
}

/// A completed gather for one device, successful blocks and failed ones
#[derive(Debug, Clone)]
pub struct DataAcquired {
    pub conn_id: String,
    pub device_id: String,
    pub blocks: Vec<BlockResult>,
    pub ts: i64,
}

/// The parsed batch for one device tick
#[derive(Debug, Clone, Serialize)]
pub struct DataParsed {
    pub conn_id: String,
    pub device_id: String,
    pub samples: Vec<ParameterSample>,
    pub ts: i64,
}

/// A parameter's compare-value moved
#[derive(Debug, Clone, Serialize)]
pub struct ParamChanged {
    pub conn_id: String,
    pub device_id: String,
    pub code: String,
    pub old: ParsedValue,
    pub new: ParsedValue,
    pub ts: i64,
    pub sample: ParameterSample,
}

impl ParamChanged {
    /// Debounce key
    pub fn fingerprint(&self) -> (String, String, String) {
        (
            self.conn_id.clone(),
            self.device_id.clone(),
            self.code.clone(),
        )
    }
}

/// A batch left for the time-series sink
#[derive(Debug, Clone)]
pub struct DataStored {
    pub conn_id: String,
    pub device_id: String,
    pub points: usize,
    pub ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_value_json_shapes() {
        assert_eq!(
            serde_json::to_string(&ParsedValue::Integer(5)).unwrap(),
            "5"
        );
        assert_eq!(
            serde_json::to_string(&ParsedValue::Text("运行".to_string())).unwrap(),
            "\"运行\""
        );

        let mut bits = BTreeMap::new();
        bits.insert("alarm_low".to_string(), true);
        assert_eq!(
            serde_json::to_string(&ParsedValue::Bits(bits)).unwrap(),
            "{\"alarm_low\":true}"
        );
    }

    #[test]
    fn test_raw_to_parsed_conversion() {
        assert_eq!(
            ParsedValue::from(RawValue::Integer(7)),
            ParsedValue::Integer(7)
        );
        assert_eq!(
            ParsedValue::from(RawValue::Float(1.5)),
            ParsedValue::Number(1.5)
        );
    }
}
