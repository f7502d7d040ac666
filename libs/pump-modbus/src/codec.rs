//! Typed value reconstruction from register images
//!
//! Registers arrive as big-endian 16-bit words. A 32-bit value spans two
//! registers whose bytes are labelled [A,B,C,D] with A = hi(reg0). The word
//! order names the byte sequence handed to the native little-endian decoder:
//!
//! | Order | Sequence fed to the LE decoder |
//! |-------|--------------------------------|
//! | ABCD  | [D,C,B,A] (reversed, i.e. big-endian value) |
//! | DCBA  | [A,B,C,D] as-is |
//! | BADC  | [B,A,D,C] |
//! | CDAB  | [C,D,A,B] |

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, Result};

/// Word order for reconstructing 32-bit values from two registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WordOrder {
    #[default]
    #[serde(rename = "ABCD")]
    Abcd,
    #[serde(rename = "DCBA")]
    Dcba,
    #[serde(rename = "BADC")]
    Badc,
    #[serde(rename = "CDAB")]
    Cdab,
}

/// Parameter data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bit,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    String,
}

impl DataType {
    /// Registers consumed starting at the base address. `String` spans as
    /// many registers as the spec lists addresses for, so the minimum is 1.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
            _ => 1,
        }
    }
}

/// A decoded register value before parameter-level interpretation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Integer(v) => Some(*v as f64),
            RawValue::Float(v) => Some(*v),
            RawValue::Text(_) => None,
        }
    }
}

/// Result of `decode_value`: the wire-level value and the scaled value
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Pre-scale integer or float as reconstructed from the registers
    pub raw: RawValue,
    /// `raw * scale + offset`; truncated toward zero for integer types.
    /// Precision rounding for floats is the parser's concern, not ours.
    pub scaled: RawValue,
}

/// Rearrange two registers into the byte sequence for the LE decoder
pub fn regs_to_le_bytes(regs: &[u16; 2], order: WordOrder) -> [u8; 4] {
    let [h0, h1] = [regs[0].to_be_bytes(), regs[1].to_be_bytes()];
    let (a, b, c, d) = (h0[0], h0[1], h1[0], h1[1]);

    match order {
        WordOrder::Abcd => [d, c, b, a],
        WordOrder::Dcba => [a, b, c, d],
        WordOrder::Badc => [b, a, d, c],
        WordOrder::Cdab => [c, d, a, b],
    }
}

/// Inverse of `regs_to_le_bytes`: place LE value bytes back into registers
pub fn le_bytes_to_regs(bytes: [u8; 4], order: WordOrder) -> [u16; 2] {
    let [x0, x1, x2, x3] = bytes;
    let (a, b, c, d) = match order {
        WordOrder::Abcd => (x3, x2, x1, x0),
        WordOrder::Dcba => (x0, x1, x2, x3),
        WordOrder::Badc => (x1, x0, x3, x2),
        WordOrder::Cdab => (x2, x3, x0, x1),
    };
    [u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])]
}

/// Reconstruct a u32 from two registers
pub fn regs_to_u32(regs: &[u16; 2], order: WordOrder) -> u32 {
    LittleEndian::read_u32(&regs_to_le_bytes(regs, order))
}

/// Reconstruct an i32 from two registers
pub fn regs_to_i32(regs: &[u16; 2], order: WordOrder) -> i32 {
    LittleEndian::read_i32(&regs_to_le_bytes(regs, order))
}

/// Reconstruct an f32 from two registers
pub fn regs_to_f32(regs: &[u16; 2], order: WordOrder) -> f32 {
    LittleEndian::read_f32(&regs_to_le_bytes(regs, order))
}

/// Encode a u32 into two registers (test support and write paths)
pub fn u32_to_regs(value: u32, order: WordOrder) -> [u16; 2] {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    le_bytes_to_regs(bytes, order)
}

/// Encode an f32 into two registers (test support and write paths)
pub fn f32_to_regs(value: f32, order: WordOrder) -> [u16; 2] {
    let mut bytes = [0u8; 4];
    LittleEndian::write_f32(&mut bytes, value);
    le_bytes_to_regs(bytes, order)
}

/// Decode a typed value from a register slice under a word-order policy
/// and apply scale/offset.
///
/// Integer outputs are truncated toward zero after scaling. Float precision
/// rounding is left to the caller.
pub fn decode_value(
    registers: &[u16],
    data_type: DataType,
    order: WordOrder,
    scale: f64,
    offset: f64,
) -> Result<Decoded> {
    let needed = data_type.register_count() as usize;
    if registers.len() < needed {
        return Err(ModbusError::Truncated(format!(
            "{data_type:?} needs {needed} registers, got {}",
            registers.len()
        )));
    }

    let raw = match data_type {
        DataType::Bit => RawValue::Integer(i64::from(registers[0] & 0x0001)),
        DataType::Uint16 => RawValue::Integer(i64::from(registers[0])),
        DataType::Int16 => RawValue::Integer(i64::from(registers[0] as i16)),
        DataType::Uint32 => {
            RawValue::Integer(i64::from(regs_to_u32(&[registers[0], registers[1]], order)))
        },
        DataType::Int32 => {
            RawValue::Integer(i64::from(regs_to_i32(&[registers[0], registers[1]], order)))
        },
        DataType::Float32 => {
            RawValue::Float(f64::from(regs_to_f32(&[registers[0], registers[1]], order)))
        },
        DataType::String => RawValue::Text(decode_string(registers)),
    };

    let scaled = match &raw {
        RawValue::Integer(v) if matches!(data_type, DataType::Bit) => RawValue::Integer(*v),
        RawValue::Integer(v) => {
            let scaled = *v as f64 * scale + offset;
            RawValue::Integer(scaled.trunc() as i64)
        },
        RawValue::Float(v) => RawValue::Float(v * scale + offset),
        RawValue::Text(s) => RawValue::Text(s.clone()),
    };

    Ok(Decoded { raw, scaled })
}

/// Expand a bit-mapped u16 into named booleans. `map` goes bit index → code.
pub fn decode_bit_map(raw: u16, map: &BTreeMap<u8, String>) -> BTreeMap<String, bool> {
    map.iter()
        .map(|(&bit, code)| (code.clone(), (raw >> bit) & 1 != 0))
        .collect()
}

/// Concatenate the (hi, lo) bytes of each register as ASCII, trimming
/// trailing NULs
fn decode_string(registers: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(registers.len() * 2);
    for &reg in registers {
        let [hi, lo] = reg.to_be_bytes();
        bytes.push(hi);
        bytes.push(lo);
    }
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_order_abcd_is_big_endian() {
        let regs = [0x1234, 0x5678];
        assert_eq!(regs_to_u32(&regs, WordOrder::Abcd), 0x1234_5678);
    }

    #[test]
    fn test_word_order_dcba_is_little_endian() {
        let regs = [0x1234, 0x5678];
        assert_eq!(regs_to_u32(&regs, WordOrder::Dcba), 0x7856_3412);
    }

    #[test]
    fn test_word_order_badc_and_cdab() {
        let regs = [0x1234, 0x5678];
        assert_eq!(regs_to_u32(&regs, WordOrder::Badc), 0x5678_1234);
        assert_eq!(regs_to_u32(&regs, WordOrder::Cdab), 0x3412_7856);
    }

    #[test]
    fn test_float32_abcd_known_vector() {
        // IEEE-754 of 0x12345678
        let decoded = decode_value(
            &[0x1234, 0x5678],
            DataType::Float32,
            WordOrder::Abcd,
            1.0,
            0.0,
        )
        .unwrap();

        let expected = f64::from(f32::from_bits(0x1234_5678));
        match decoded.raw {
            RawValue::Float(v) => assert!((v - expected).abs() < 1e-40),
            other => panic!("Unexpected raw: {other:?}"),
        }
    }

    #[test]
    fn test_float32_dcba_known_vector() {
        let decoded = decode_value(
            &[0x1234, 0x5678],
            DataType::Float32,
            WordOrder::Dcba,
            1.0,
            0.0,
        )
        .unwrap();

        let expected = f64::from(f32::from_bits(0x7856_3412));
        match decoded.raw {
            RawValue::Float(v) => assert!((v - expected).abs() < f64::EPSILON),
            other => panic!("Unexpected raw: {other:?}"),
        }
    }

    #[test]
    fn test_u32_roundtrip_all_orders() {
        for order in [
            WordOrder::Abcd,
            WordOrder::Dcba,
            WordOrder::Badc,
            WordOrder::Cdab,
        ] {
            for value in [0u32, 1, 0x1234_5678, 0xDEAD_BEEF, u32::MAX] {
                let regs = u32_to_regs(value, order);
                assert_eq!(regs_to_u32(&regs, order), value, "order {order:?}");
            }
        }
    }

    #[test]
    fn test_f32_roundtrip_all_orders() {
        for order in [
            WordOrder::Abcd,
            WordOrder::Dcba,
            WordOrder::Badc,
            WordOrder::Cdab,
        ] {
            for value in [0.0f32, 1.0, -1.0, 25.0, std::f32::consts::PI, f32::MAX] {
                let regs = f32_to_regs(value, order);
                assert_eq!(regs_to_f32(&regs, order), value, "order {order:?}");
            }
        }
    }

    #[test]
    fn test_int16_sign_extension() {
        let decoded =
            decode_value(&[0xFFFE], DataType::Int16, WordOrder::Abcd, 1.0, 0.0).unwrap();
        assert_eq!(decoded.raw, RawValue::Integer(-2));
    }

    #[test]
    fn test_integer_scaling_truncates_toward_zero() {
        let decoded =
            decode_value(&[0x0007], DataType::Uint16, WordOrder::Abcd, 0.5, 0.0).unwrap();
        assert_eq!(decoded.raw, RawValue::Integer(7));
        assert_eq!(decoded.scaled, RawValue::Integer(3));

        let negative =
            decode_value(&[0xFFF9], DataType::Int16, WordOrder::Abcd, 0.5, 0.0).unwrap();
        // -7 * 0.5 = -3.5, truncation keeps -3
        assert_eq!(negative.scaled, RawValue::Integer(-3));
    }

    #[test]
    fn test_bit_decode() {
        let decoded = decode_value(&[0x0003], DataType::Bit, WordOrder::Abcd, 1.0, 0.0).unwrap();
        assert_eq!(decoded.raw, RawValue::Integer(1));

        let zero = decode_value(&[0x0002], DataType::Bit, WordOrder::Abcd, 1.0, 0.0).unwrap();
        assert_eq!(zero.raw, RawValue::Integer(0));
    }

    #[test]
    fn test_string_decode_trims_trailing_nul() {
        // "PUMP" followed by a NUL-padded register
        let decoded = decode_value(
            &[0x5055, 0x4D50, 0x0000],
            DataType::String,
            WordOrder::Abcd,
            1.0,
            0.0,
        )
        .unwrap();
        assert_eq!(decoded.raw, RawValue::Text("PUMP".to_string()));
    }

    #[test]
    fn test_truncated_slice_rejected() {
        let err = decode_value(&[0x1234], DataType::Float32, WordOrder::Abcd, 1.0, 0.0)
            .unwrap_err();
        assert!(matches!(err, ModbusError::Truncated(_)));
    }

    #[test]
    fn test_bit_map_decode() {
        let mut map = BTreeMap::new();
        map.insert(0u8, "alarm_low".to_string());
        map.insert(2u8, "alarm_high".to_string());

        let bits = decode_bit_map(0x0005, &map);
        assert_eq!(bits.get("alarm_low"), Some(&true));
        assert_eq!(bits.get("alarm_high"), Some(&true));

        let bits = decode_bit_map(0x0004, &map);
        assert_eq!(bits.get("alarm_low"), Some(&false));
        assert_eq!(bits.get("alarm_high"), Some(&true));
    }
}
