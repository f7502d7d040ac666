//! Register image parsing
//!
//! Turns a tick's block reads into typed parameter samples. Failures stay
//! local: a missed block only skips the parameters that needed it, a bad
//! parameter only skips itself.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use pump_modbus::{codec, DataType, RawValue};

use crate::config::{ConnectionSpec, DeviceSpec, ParameterSpec};
use crate::error::{AcqError, Result};
use crate::model::{DataAcquired, ParameterSample, ParsedValue};

/// Sparse per-tick register image for one device
pub type RegisterImage = HashMap<u16, u16>;

/// Merge the successful blocks of a tick into one image
pub fn build_image(acquired: &DataAcquired) -> RegisterImage {
    let mut image = RegisterImage::new();
    for block in &acquired.blocks {
        if let Ok(words) = &block.outcome {
            for (i, &word) in words.iter().enumerate() {
                image.insert(block.block.start.wrapping_add(i as u16), word);
            }
        }
    }
    image
}

/// Parse every enabled parameter of a device from a tick's image
pub fn parse_device_tick(
    conn: &ConnectionSpec,
    device: &DeviceSpec,
    acquired: &DataAcquired,
) -> Vec<ParameterSample> {
    let image = build_image(acquired);
    let mut samples = Vec::with_capacity(device.parameters.len());

    for param in &device.parameters {
        if !param.enabled {
            continue;
        }

        match parse_parameter(conn, param, &image) {
            Ok((raw, parsed)) => {
                let mut metadata = BTreeMap::new();
                if !device.description.is_empty() {
                    metadata.insert("description".to_string(), device.description.clone());
                }
                samples.push(ParameterSample {
                    conn_id: acquired.conn_id.clone(),
                    device_id: acquired.device_id.clone(),
                    code: param.code.clone(),
                    raw,
                    parsed,
                    unit: param.unit.clone(),
                    ts: acquired.ts,
                    metadata,
                });
            },
            Err(AcqError::MissingRegisters(msg)) => {
                debug!(
                    "Skipping '{}/{}/{}' this tick: {msg}",
                    acquired.conn_id, acquired.device_id, param.code
                );
            },
            Err(e) => {
                debug!(
                    "Failed to parse '{}/{}/{}': {e}",
                    acquired.conn_id, acquired.device_id, param.code
                );
            },
        }
    }

    samples
}

/// Decode one parameter from an image
pub fn parse_parameter(
    conn: &ConnectionSpec,
    param: &ParameterSpec,
    image: &RegisterImage,
) -> Result<(RawValue, ParsedValue)> {
    let addresses = param.required_addresses();
    let mut registers = Vec::with_capacity(addresses.len());
    for address in &addresses {
        match image.get(address) {
            Some(&word) => registers.push(word),
            None => {
                return Err(AcqError::missing_registers(format!(
                    "address {address} absent from this tick's blocks"
                )));
            },
        }
    }

    decode_registers(conn, param, &registers)
}

/// Decode one parameter from its registers, already extracted
pub fn decode_registers(
    conn: &ConnectionSpec,
    param: &ParameterSpec,
    registers: &[u16],
) -> Result<(RawValue, ParsedValue)> {
    // Coil and discrete tables are one bit per address; the spec-level type
    // does not apply there
    let data_type = if conn.register_type.is_bit() {
        DataType::Bit
    } else {
        param.data_type
    };

    let decoded = codec::decode_value(
        registers,
        data_type,
        conn.byte_order,
        param.scale,
        param.offset,
    )?;

    let parsed = interpret(param, data_type, &decoded.raw, &decoded.scaled);
    Ok((decoded.raw, parsed))
}

fn interpret(
    param: &ParameterSpec,
    data_type: DataType,
    raw: &RawValue,
    scaled: &RawValue,
) -> ParsedValue {
    // Bit-mapped uint16 expands into named booleans
    if data_type == DataType::Uint16 {
        if let (Some(map), RawValue::Integer(value)) = (param.bit_index_map(), raw) {
            return ParsedValue::Bits(codec::decode_bit_map(*value as u16, &map));
        }
    }

    // Enum labels apply to uint16 values and single bits
    if matches!(data_type, DataType::Uint16 | DataType::Bit) {
        if let (Some(map), RawValue::Integer(value)) = (&param.enum_map, raw) {
            if let Some(label) = map.get(&value.to_string()) {
                return ParsedValue::Text(label.clone());
            }
            return ParsedValue::Integer(*value);
        }
    }

    match (data_type, scaled) {
        (DataType::Float32, RawValue::Float(value)) => {
            ParsedValue::Number(round_to(*value, param.precision))
        },
        (_, other) => ParsedValue::from(other.clone()),
    }
}

/// Half-away-from-zero rounding to a number of decimal places
fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}
