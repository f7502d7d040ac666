//! Modbus master client
//!
//! One client per upstream device link. The whole request/response exchange
//! runs under a single mutex: Modbus is half-duplex per device, so the lock
//! is the serialization point, not an accident.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{ModbusError, Result};
use crate::frame::{self, ModbusMode};
use crate::pdu::{self, FunctionCode};
use crate::transport::{Transport, TransportStats};

/// Modbus TCP/RTU master over one transport
#[derive(Debug)]
pub struct ModbusClient {
    inner: Mutex<ClientInner>,
    unit_id: u8,
    timeout: Duration,
}

#[derive(Debug)]
struct ClientInner {
    transport: Box<dyn Transport>,
    mode: ModbusMode,
    next_transaction: u16,
    /// Stream reassembly buffer, cleared before every exchange
    rx: Vec<u8>,
}

impl ModbusClient {
    pub fn new(
        transport: Box<dyn Transport>,
        mode: ModbusMode,
        unit_id: u8,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(ClientInner {
                transport,
                mode,
                next_transaction: 0,
                rx: Vec::with_capacity(260),
            }),
            unit_id,
            timeout,
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.lock().await.transport.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.inner.lock().await.transport.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.transport.is_connected()
    }

    pub async fn transport_stats(&self) -> TransportStats {
        self.inner.lock().await.transport.stats()
    }

    pub async fn describe(&self) -> String {
        self.inner.lock().await.transport.describe()
    }

    /// Read holding registers (FC 0x03)
    pub async fn read_holding_registers(&self, start: u16, quantity: u16) -> Result<Vec<u16>> {
        let request = pdu::build_read_request(FunctionCode::ReadHoldingRegisters, start, quantity)?;
        let response = self.execute(&request).await?;
        pdu::parse_register_read_response(&response, FunctionCode::ReadHoldingRegisters, quantity)
    }

    /// Read input registers (FC 0x04)
    pub async fn read_input_registers(&self, start: u16, quantity: u16) -> Result<Vec<u16>> {
        let request = pdu::build_read_request(FunctionCode::ReadInputRegisters, start, quantity)?;
        let response = self.execute(&request).await?;
        pdu::parse_register_read_response(&response, FunctionCode::ReadInputRegisters, quantity)
    }

    /// Read coils (FC 0x01)
    pub async fn read_coils(&self, start: u16, quantity: u16) -> Result<Vec<bool>> {
        let request = pdu::build_read_request(FunctionCode::ReadCoils, start, quantity)?;
        let response = self.execute(&request).await?;
        pdu::parse_bit_read_response(&response, FunctionCode::ReadCoils, quantity)
    }

    /// Read discrete inputs (FC 0x02)
    pub async fn read_discrete_inputs(&self, start: u16, quantity: u16) -> Result<Vec<bool>> {
        let request = pdu::build_read_request(FunctionCode::ReadDiscreteInputs, start, quantity)?;
        let response = self.execute(&request).await?;
        pdu::parse_bit_read_response(&response, FunctionCode::ReadDiscreteInputs, quantity)
    }

    /// Write a single holding register (FC 0x06)
    pub async fn write_single_register(&self, address: u16, value: u16) -> Result<()> {
        let request = pdu::build_write_single_register(address, value);
        let response = self.execute(&request).await?;
        pdu::parse_write_response(&response, FunctionCode::WriteSingleRegister)
    }

    /// Write multiple holding registers (FC 0x10)
    pub async fn write_multiple_registers(&self, start: u16, values: &[u16]) -> Result<()> {
        let request = pdu::build_write_multiple_registers(start, values)?;
        let response = self.execute(&request).await?;
        pdu::parse_write_response(&response, FunctionCode::WriteMultipleRegisters)
    }

    /// Write a single coil (FC 0x05)
    pub async fn write_single_coil(&self, address: u16, on: bool) -> Result<()> {
        let request = pdu::build_write_single_coil(address, on);
        let response = self.execute(&request).await?;
        pdu::parse_write_response(&response, FunctionCode::WriteSingleCoil)
    }

    /// Write multiple coils (FC 0x0F)
    pub async fn write_multiple_coils(&self, start: u16, values: &[bool]) -> Result<()> {
        let request = pdu::build_write_multiple_coils(start, values)?;
        let response = self.execute(&request).await?;
        pdu::parse_write_response(&response, FunctionCode::WriteMultipleCoils)
    }

    /// Run one request/response exchange and return the response PDU
    async fn execute(&self, request_pdu: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let deadline = Instant::now() + self.timeout;

        // Leftover bytes belong to an exchange that timed out earlier
        inner.rx.clear();

        let transaction_id = match inner.mode {
            ModbusMode::Tcp => {
                inner.next_transaction = inner.next_transaction.wrapping_add(1);
                Some(inner.next_transaction)
            },
            ModbusMode::Rtu => None,
        };

        let frame = match inner.mode {
            ModbusMode::Tcp => {
                frame::build_tcp_frame(transaction_id.unwrap_or(0), self.unit_id, request_pdu)
            },
            ModbusMode::Rtu => frame::build_rtu_frame(self.unit_id, request_pdu),
        };

        trace!("Sending frame: {frame:02X?}");
        inner.transport.send(&frame).await?;

        loop {
            let complete = match inner.mode {
                ModbusMode::Tcp => frame::tcp_frame_length(&inner.rx)?,
                ModbusMode::Rtu => frame::rtu_frame_length(&inner.rx),
            };

            if let Some(total) = complete {
                let raw: Vec<u8> = inner.rx.drain(..total).collect();
                let parsed = match inner.mode {
                    ModbusMode::Tcp => frame::parse_tcp_frame(&raw)?,
                    ModbusMode::Rtu => frame::parse_rtu_frame(&raw)?,
                };

                if let (Some(sent), Some(received)) = (transaction_id, parsed.transaction_id) {
                    if sent != received {
                        debug!("Discarding stale transaction {received} (expected {sent})");
                        continue;
                    }
                }
                if parsed.unit_id != self.unit_id {
                    return Err(ModbusError::Protocol(format!(
                        "Unit id mismatch: sent {}, got {}",
                        self.unit_id, parsed.unit_id
                    )));
                }

                return Ok(parsed.pdu);
            }

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| ModbusError::Timeout("Response deadline exceeded".to_string()))?;

            let mut buf = [0u8; 260];
            let n = inner.transport.receive(&mut buf, remaining).await?;
            inner.rx.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, ScriptedExchange};

    fn tcp_client(script: Vec<ScriptedExchange>) -> ModbusClient {
        ModbusClient::new(
            Box::new(MockTransport::with_script(script)),
            ModbusMode::Tcp,
            1,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_read_holding_registers_tcp() {
        // Transaction 1, unit 1, FC 03 response with two registers
        let response_pdu = pdu::build_register_read_response(
            FunctionCode::ReadHoldingRegisters,
            &[0x1234, 0x5678],
        );
        let response = frame::build_tcp_frame(1, 1, &response_pdu);

        let client = tcp_client(vec![ScriptedExchange::reply(response)]);
        client.connect().await.unwrap();

        let values = client.read_holding_registers(0x0010, 2).await.unwrap();
        assert_eq!(values, vec![0x1234, 0x5678]);
    }

    #[tokio::test]
    async fn test_exception_response_surfaces() {
        let response_pdu = pdu::build_exception_response(0x03, pdu::ExceptionCode::IllegalDataAddress);
        let response = frame::build_tcp_frame(1, 1, &response_pdu);

        let client = tcp_client(vec![ScriptedExchange::reply(response)]);
        client.connect().await.unwrap();

        let err = client.read_holding_registers(0xFFF0, 2).await.unwrap_err();
        assert!(matches!(err, ModbusError::Exception(0x02)));
    }

    #[tokio::test]
    async fn test_write_single_register_rtu() {
        let echo_pdu = pdu::build_write_response(FunctionCode::WriteSingleRegister, 0x0001, 0x00AB);
        let response = frame::build_rtu_frame(1, &echo_pdu);

        let client = ModbusClient::new(
            Box::new(MockTransport::with_script(vec![ScriptedExchange::reply(
                response,
            )])),
            ModbusMode::Rtu,
            1,
            Duration::from_millis(200),
        );
        client.connect().await.unwrap();

        client.write_single_register(0x0001, 0x00AB).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_coils_tcp() {
        let response_pdu =
            pdu::build_bit_read_response(FunctionCode::ReadCoils, &[true, false, true]);
        let response = frame::build_tcp_frame(1, 1, &response_pdu);

        let client = tcp_client(vec![ScriptedExchange::reply(response)]);
        client.connect().await.unwrap();

        let values = client.read_coils(0, 3).await.unwrap();
        assert_eq!(values, vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_unit_id_mismatch_rejected() {
        let response_pdu = pdu::build_register_read_response(
            FunctionCode::ReadHoldingRegisters,
            &[0x0001],
        );
        // Wrong unit id in the MBAP header
        let response = frame::build_tcp_frame(1, 9, &response_pdu);

        let client = tcp_client(vec![ScriptedExchange::reply(response)]);
        client.connect().await.unwrap();

        let err = client.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_transport_fault_propagates() {
        let client = tcp_client(vec![ScriptedExchange::fail(ModbusError::Transport(
            "connection reset".to_string(),
        ))]);
        client.connect().await.unwrap();

        let err = client.read_holding_registers(0, 1).await.unwrap_err();
        assert!(err.is_transport_fault());
        assert!(!client.is_connected().await);
    }
}
