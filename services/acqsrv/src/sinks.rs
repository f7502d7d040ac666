//! Sink adapters
//!
//! The time-series sink and the message broker are external collaborators
//! behind traits. This module carries the mapping from parsed batches to
//! sink points and broker payloads, plus logging stand-ins used when no
//! real client is wired in.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use pump_modbus::RawValue;

use crate::error::Result;
use crate::model::{DataParsed, ParamChanged, ParsedValue};

/// Measurement every point is filed under
pub const MEASUREMENT: &str = "nbcb_collect_pump_sensor_data";

/// One time-series point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub measurement: String,
    /// connection_id, device_id, parameter_code
    pub tags: BTreeMap<String, String>,
    /// The single "value" field
    pub value: f64,
    /// Milliseconds since the Unix epoch
    pub ts: i64,
}

/// Time-series sink client boundary
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write(&self, batch: Vec<DataPoint>) -> Result<()>;
}

/// Message broker client boundary; at-least-once, retain off
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Map a parsed batch to sink points.
///
/// Bit-mapped parameters expand into one point per bit code, named
/// `<parent>_<bit_code>`. Enum parameters store the numeric raw; the label
/// only travels on the broker path. String parameters have no float
/// representation and are skipped.
pub fn batch_to_points(batch: &DataParsed) -> Vec<DataPoint> {
    let mut points = Vec::with_capacity(batch.samples.len());

    for sample in &batch.samples {
        match &sample.parsed {
            ParsedValue::Bits(bits) => {
                for (bit_code, &state) in bits {
                    points.push(point(
                        &batch.conn_id,
                        &batch.device_id,
                        &format!("{}_{bit_code}", sample.code),
                        f64::from(u8::from(state)),
                        sample.ts,
                    ));
                }
            },
            ParsedValue::Text(_) => {
                // Enum label: the numeric raw goes to storage
                if let RawValue::Integer(raw) = &sample.raw {
                    points.push(point(
                        &batch.conn_id,
                        &batch.device_id,
                        &sample.code,
                        *raw as f64,
                        sample.ts,
                    ));
                } else {
                    debug!(
                        "Sample '{}/{}/{}' has no numeric representation, skipping",
                        batch.conn_id, batch.device_id, sample.code
                    );
                }
            },
            other => {
                if let Some(value) = other.as_f64() {
                    points.push(point(
                        &batch.conn_id,
                        &batch.device_id,
                        &sample.code,
                        value,
                        sample.ts,
                    ));
                }
            },
        }
    }

    points
}

fn point(conn_id: &str, device_id: &str, code: &str, value: f64, ts: i64) -> DataPoint {
    let mut tags = BTreeMap::new();
    tags.insert("connection_id".to_string(), conn_id.to_string());
    tags.insert("device_id".to_string(), device_id.to_string());
    tags.insert("parameter_code".to_string(), code.to_string());

    DataPoint {
        measurement: MEASUREMENT.to_string(),
        tags,
        value,
        ts,
    }
}

/// Topic for a device's batch payloads
pub fn data_topic(base: &str, conn_id: &str, device_id: &str) -> String {
    format!("{base}/{conn_id}/{device_id}/data")
}

/// Topic for single change events
pub fn changes_topic(base: &str, conn_id: &str, device_id: &str) -> String {
    format!("{base}/{conn_id}/{device_id}/changes")
}

/// JSON payload for the data topic; UTF-8, non-ASCII kept verbatim
pub fn batch_payload(batch: &DataParsed) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(batch)?)
}

/// JSON payload for the changes topic
pub fn change_payload(event: &ParamChanged) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

/// Stand-in sink that logs and succeeds
#[derive(Debug, Default)]
pub struct LoggingTimeSeriesSink;

#[async_trait]
impl TimeSeriesSink for LoggingTimeSeriesSink {
    async fn write(&self, batch: Vec<DataPoint>) -> Result<()> {
        debug!("Time-series sink received {} point(s)", batch.len());
        Ok(())
    }
}

/// Stand-in broker that logs and succeeds
#[derive(Debug, Default)]
pub struct LoggingBroker;

#[async_trait]
impl Broker for LoggingBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        debug!("Broker publish to '{topic}' ({} bytes)", payload.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParameterSample;

    fn sample(code: &str, raw: RawValue, parsed: ParsedValue) -> ParameterSample {
        ParameterSample {
            conn_id: "c1".to_string(),
            device_id: "pump1".to_string(),
            code: code.to_string(),
            raw,
            parsed,
            unit: String::new(),
            ts: 1_700_000_000_000,
            metadata: BTreeMap::new(),
        }
    }

    fn batch(samples: Vec<ParameterSample>) -> DataParsed {
        DataParsed {
            conn_id: "c1".to_string(),
            device_id: "pump1".to_string(),
            samples,
            ts: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_numeric_sample_becomes_one_point() {
        let points = batch_to_points(&batch(vec![sample(
            "flow",
            RawValue::Integer(42),
            ParsedValue::Integer(42),
        )]));

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, MEASUREMENT);
        assert_eq!(points[0].value, 42.0);
        assert_eq!(points[0].tags.get("parameter_code").unwrap(), "flow");
        assert_eq!(points[0].tags.get("connection_id").unwrap(), "c1");
    }

    #[test]
    fn test_bits_expand_per_code() {
        let mut bits = BTreeMap::new();
        bits.insert("alarm_low".to_string(), true);
        bits.insert("alarm_high".to_string(), false);

        let points = batch_to_points(&batch(vec![sample(
            "status",
            RawValue::Integer(1),
            ParsedValue::Bits(bits),
        )]));

        assert_eq!(points.len(), 2);
        let codes: Vec<&str> = points
            .iter()
            .map(|p| p.tags.get("parameter_code").unwrap().as_str())
            .collect();
        assert!(codes.contains(&"status_alarm_low"));
        assert!(codes.contains(&"status_alarm_high"));

        let low = points
            .iter()
            .find(|p| p.tags.get("parameter_code").unwrap() == "status_alarm_low")
            .unwrap();
        assert_eq!(low.value, 1.0);
    }

    #[test]
    fn test_enum_label_stores_numeric_raw() {
        let points = batch_to_points(&batch(vec![sample(
            "mode",
            RawValue::Integer(3),
            ParsedValue::Text("运行".to_string()),
        )]));

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 3.0);
    }

    #[test]
    fn test_string_parameter_skipped() {
        let points = batch_to_points(&batch(vec![sample(
            "name",
            RawValue::Text("PUMP".to_string()),
            ParsedValue::Text("PUMP".to_string()),
        )]));
        assert!(points.is_empty());
    }

    #[test]
    fn test_topics() {
        assert_eq!(data_topic("plant", "c1", "pump1"), "plant/c1/pump1/data");
        assert_eq!(
            changes_topic("plant", "c1", "pump1"),
            "plant/c1/pump1/changes"
        );
    }

    #[test]
    fn test_payload_preserves_non_ascii() {
        let b = batch(vec![sample(
            "mode",
            RawValue::Integer(1),
            ParsedValue::Text("运行".to_string()),
        )]);
        let payload = batch_payload(&b).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("运行"));
    }
}
