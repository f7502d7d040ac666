//! Modbus PDU (Protocol Data Unit) handling
//!
//! Builders and parsers for the standard read/write function codes used on
//! both the master side (requests out, responses in) and the slave side
//! (requests in, responses out).

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, Result};

/// Largest PDU payload allowed by the Modbus spec (function code + 252 bytes)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum registers in one read request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum coils in one read request
pub const MAX_READ_COILS: u16 = 2000;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ModbusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(ModbusError::Protocol(format!(
                "Invalid function code: 0x{value:02X}"
            ))),
        }
    }
}

impl FunctionCode {
    /// Whether this code reads single-bit tables (coils, discrete inputs)
    pub fn is_bit_read(self) -> bool {
        matches!(self, FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailedToRespond = 0x0B,
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> u8 {
        code as u8
    }
}

/// A request PDU as received by the slave side
#[derive(Debug, Clone)]
pub enum Request {
    ReadCoils { start: u16, quantity: u16 },
    ReadDiscreteInputs { start: u16, quantity: u16 },
    ReadHoldingRegisters { start: u16, quantity: u16 },
    ReadInputRegisters { start: u16, quantity: u16 },
    WriteSingleCoil { address: u16, on: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { start: u16, values: Vec<bool> },
    WriteMultipleRegisters { start: u16, values: Vec<u16> },
}

/// Parse a request PDU (slave side)
pub fn parse_request(pdu: &[u8]) -> Result<Request> {
    if pdu.is_empty() {
        return Err(ModbusError::Protocol("Empty PDU".to_string()));
    }

    let function = FunctionCode::try_from(pdu[0])?;
    let data = &pdu[1..];

    match function {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => {
            let (start, quantity) = parse_addr_quantity(data)?;
            Ok(match function {
                FunctionCode::ReadCoils => Request::ReadCoils { start, quantity },
                FunctionCode::ReadDiscreteInputs => Request::ReadDiscreteInputs { start, quantity },
                FunctionCode::ReadHoldingRegisters => {
                    Request::ReadHoldingRegisters { start, quantity }
                },
                _ => Request::ReadInputRegisters { start, quantity },
            })
        },
        FunctionCode::WriteSingleCoil => {
            let (address, value) = parse_addr_quantity(data)?;
            Ok(Request::WriteSingleCoil {
                address,
                on: value == 0xFF00,
            })
        },
        FunctionCode::WriteSingleRegister => {
            let (address, value) = parse_addr_quantity(data)?;
            Ok(Request::WriteSingleRegister { address, value })
        },
        FunctionCode::WriteMultipleCoils => {
            let (start, quantity) = parse_addr_quantity(data)?;
            let values = parse_coil_payload(&data[4..], quantity)?;
            Ok(Request::WriteMultipleCoils { start, values })
        },
        FunctionCode::WriteMultipleRegisters => {
            let (start, quantity) = parse_addr_quantity(data)?;
            let values = parse_register_payload(&data[4..], quantity)?;
            Ok(Request::WriteMultipleRegisters { start, values })
        },
    }
}

fn parse_addr_quantity(data: &[u8]) -> Result<(u16, u16)> {
    if data.len() < 4 {
        return Err(ModbusError::Protocol("Request too short".to_string()));
    }
    Ok((
        u16::from_be_bytes([data[0], data[1]]),
        u16::from_be_bytes([data[2], data[3]]),
    ))
}

fn parse_coil_payload(data: &[u8], quantity: u16) -> Result<Vec<bool>> {
    if data.is_empty() {
        return Err(ModbusError::Protocol("Missing byte count".to_string()));
    }
    let byte_count = data[0] as usize;
    if data.len() < 1 + byte_count || byte_count < (quantity as usize).div_ceil(8) {
        return Err(ModbusError::Protocol("Coil payload too short".to_string()));
    }

    let mut values = Vec::with_capacity(quantity as usize);
    for i in 0..quantity as usize {
        let byte = data[1 + i / 8];
        values.push((byte >> (i % 8)) & 1 != 0);
    }
    Ok(values)
}

fn parse_register_payload(data: &[u8], quantity: u16) -> Result<Vec<u16>> {
    if data.is_empty() {
        return Err(ModbusError::Protocol("Missing byte count".to_string()));
    }
    let byte_count = data[0] as usize;
    if data.len() < 1 + byte_count || byte_count < quantity as usize * 2 {
        return Err(ModbusError::Protocol(
            "Register payload too short".to_string(),
        ));
    }

    let mut values = Vec::with_capacity(quantity as usize);
    for chunk in data[1..1 + quantity as usize * 2].chunks_exact(2) {
        values.push(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    Ok(values)
}

// ---------------------------------------------------------------------------
// Request builders (master side)
// ---------------------------------------------------------------------------

/// Build a read request PDU (0x01, 0x02, 0x03, 0x04)
pub fn build_read_request(function: FunctionCode, start: u16, quantity: u16) -> Result<Vec<u8>> {
    let limit = if function.is_bit_read() {
        MAX_READ_COILS
    } else {
        MAX_READ_REGISTERS
    };
    if quantity == 0 || quantity > limit {
        return Err(ModbusError::InvalidRequest(format!(
            "Read quantity {quantity} out of range 1..={limit}"
        )));
    }

    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    Ok(pdu)
}

/// Build a write single coil request PDU (0x05)
pub fn build_write_single_coil(address: u16, on: bool) -> Vec<u8> {
    let value: u16 = if on { 0xFF00 } else { 0x0000 };
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleCoil.into());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build a write single register request PDU (0x06)
pub fn build_write_single_register(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleRegister.into());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build a write multiple coils request PDU (0x0F)
pub fn build_write_multiple_coils(start: u16, values: &[bool]) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Err(ModbusError::InvalidRequest("Empty coil write".to_string()));
    }

    let payload = pack_coils(values);
    let mut pdu = Vec::with_capacity(6 + payload.len());
    pdu.push(FunctionCode::WriteMultipleCoils.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(payload.len() as u8);
    pdu.extend_from_slice(&payload);
    Ok(pdu)
}

/// Build a write multiple registers request PDU (0x10)
pub fn build_write_multiple_registers(start: u16, values: &[u16]) -> Result<Vec<u8>> {
    if values.is_empty() || values.len() > MAX_READ_REGISTERS as usize {
        return Err(ModbusError::InvalidRequest(format!(
            "Register write length {} out of range",
            values.len()
        )));
    }

    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(FunctionCode::WriteMultipleRegisters.into());
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    Ok(pdu)
}

// ---------------------------------------------------------------------------
// Response builders (slave side)
// ---------------------------------------------------------------------------

/// Build a read response PDU carrying bit values (0x01, 0x02)
pub fn build_bit_read_response(function: FunctionCode, values: &[bool]) -> Vec<u8> {
    let payload = pack_coils(values);
    let mut pdu = Vec::with_capacity(2 + payload.len());
    pdu.push(function.into());
    pdu.push(payload.len() as u8);
    pdu.extend_from_slice(&payload);
    pdu
}

/// Build a read response PDU carrying register values (0x03, 0x04)
pub fn build_register_read_response(function: FunctionCode, values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(2 + values.len() * 2);
    pdu.push(function.into());
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

/// Build a write echo response PDU (0x05, 0x06: address + value; 0x0F, 0x10: address + quantity)
pub fn build_write_response(function: FunctionCode, address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.into());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build an exception response PDU
pub fn build_exception_response(function_code: u8, exception: ExceptionCode) -> Vec<u8> {
    vec![function_code | 0x80, exception.into()]
}

// ---------------------------------------------------------------------------
// Response parsers (master side)
// ---------------------------------------------------------------------------

/// Parse a read response into register words, checking for exception PDUs
pub fn parse_register_read_response(
    pdu: &[u8],
    expected: FunctionCode,
    quantity: u16,
) -> Result<Vec<u16>> {
    let data = response_payload(pdu, expected)?;
    if data.is_empty() {
        return Err(ModbusError::Protocol("Missing byte count".to_string()));
    }
    let byte_count = data[0] as usize;
    if byte_count != quantity as usize * 2 || data.len() < 1 + byte_count {
        return Err(ModbusError::Protocol(format!(
            "Register response byte count {byte_count} does not match quantity {quantity}"
        )));
    }

    let mut values = Vec::with_capacity(quantity as usize);
    for chunk in data[1..1 + byte_count].chunks_exact(2) {
        values.push(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    Ok(values)
}

/// Parse a read response into bit values, checking for exception PDUs
pub fn parse_bit_read_response(
    pdu: &[u8],
    expected: FunctionCode,
    quantity: u16,
) -> Result<Vec<bool>> {
    let data = response_payload(pdu, expected)?;
    if data.is_empty() {
        return Err(ModbusError::Protocol("Missing byte count".to_string()));
    }
    let byte_count = data[0] as usize;
    if byte_count < (quantity as usize).div_ceil(8) || data.len() < 1 + byte_count {
        return Err(ModbusError::Protocol(format!(
            "Bit response byte count {byte_count} too short for quantity {quantity}"
        )));
    }

    let mut values = Vec::with_capacity(quantity as usize);
    for i in 0..quantity as usize {
        let byte = data[1 + i / 8];
        values.push((byte >> (i % 8)) & 1 != 0);
    }
    Ok(values)
}

/// Validate a write echo response, checking for exception PDUs
pub fn parse_write_response(pdu: &[u8], expected: FunctionCode) -> Result<()> {
    let data = response_payload(pdu, expected)?;
    if data.len() < 4 {
        return Err(ModbusError::Protocol("Write echo too short".to_string()));
    }
    Ok(())
}

/// Strip the function code, surfacing exceptions and echo mismatches
fn response_payload(pdu: &[u8], expected: FunctionCode) -> Result<&[u8]> {
    if pdu.is_empty() {
        return Err(ModbusError::Protocol("Empty response PDU".to_string()));
    }

    let code = pdu[0];
    if code & 0x80 != 0 {
        if pdu.len() < 2 {
            return Err(ModbusError::Protocol(
                "Truncated exception response".to_string(),
            ));
        }
        return Err(ModbusError::Exception(pdu[1]));
    }
    if code != u8::from(expected) {
        return Err(ModbusError::Protocol(format!(
            "Function code mismatch: sent 0x{:02X}, got 0x{code:02X}",
            u8::from(expected)
        )));
    }
    Ok(&pdu[1..])
}

/// Pack bit values LSB-first into bytes
fn pack_coils(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &on) in values.iter().enumerate() {
        if on {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}
