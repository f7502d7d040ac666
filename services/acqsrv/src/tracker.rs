//! Last-value memory and change detection
//!
//! Entries are keyed by (conn, device, code) and live for the whole run.
//! The compare-value is the raw word for bit-mapped parameters, the parsed
//! value for everything else; the first observation of a key records
//! silently.

use dashmap::DashMap;

use crate::config::ParameterSpec;
use crate::model::{ParamChanged, ParameterSample, ParsedValue};

/// Last compared value and when it was emitted
#[derive(Debug, Clone)]
pub struct LastValueEntry {
    pub value: ParsedValue,
    pub ts: i64,
}

/// Change detector over the stream of samples
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: DashMap<(String, String, String), LastValueEntry>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample. Returns the change event when the compare-value
    /// moved; the caller only feeds samples whose spec has `on_change`.
    pub fn observe(
        &self,
        param: &ParameterSpec,
        sample: &ParameterSample,
    ) -> Option<ParamChanged> {
        let compare = compare_value(param, sample);
        let key = (
            sample.conn_id.clone(),
            sample.device_id.clone(),
            sample.code.clone(),
        );

        let mut entry = match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(LastValueEntry {
                    value: compare,
                    ts: sample.ts,
                });
                return None;
            },
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.into_ref(),
        };

        if values_equal(&entry.value, &compare, param.precision) {
            return None;
        }

        let old = entry.value.clone();
        *entry = LastValueEntry {
            value: compare.clone(),
            ts: sample.ts,
        };

        Some(ParamChanged {
            conn_id: sample.conn_id.clone(),
            device_id: sample.device_id.clone(),
            code: sample.code.clone(),
            old,
            new: compare,
            ts: sample.ts,
            sample: sample.clone(),
        })
    }

    /// Number of tracked keys, bounded by the configured parameter set
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Raw word for bit-mapped parameters, parsed value otherwise
fn compare_value(param: &ParameterSpec, sample: &ParameterSample) -> ParsedValue {
    if param.bit_map.is_some() {
        ParsedValue::from(sample.raw.clone())
    } else {
        sample.parsed.clone()
    }
}

fn values_equal(old: &ParsedValue, new: &ParsedValue, precision: u32) -> bool {
    match (old, new) {
        (ParsedValue::Number(a), ParsedValue::Number(b)) => {
            (a - b).abs() < 10f64.powi(-(precision as i32))
        },
        (ParsedValue::Bits(a), ParsedValue::Bits(b)) => a == b,
        (a, b) => a == b,
    }
}
