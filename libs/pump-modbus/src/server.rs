//! Modbus TCP slave
//!
//! A register bank with the four standard tables plus a TCP server loop that
//! serves it to external clients. Writes from clients land in the bank only;
//! nothing propagates anywhere else from here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ModbusError, Result};
use crate::frame::{build_tcp_frame, MbapHeader};
use crate::pdu::{self, ExceptionCode, FunctionCode, Request, MAX_PDU_SIZE};

/// Which of the four slave tables an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterTable {
    Coils,
    DiscreteInputs,
    Holding,
    Input,
}

#[derive(Debug, Default)]
struct Tables {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
}

/// Sparse register image served by the slave
///
/// All four tables live under one lock so a block update is atomic: a
/// concurrent read observes the image either before or after the whole
/// block, never a partial mix.
#[derive(Debug, Default)]
pub struct RegisterBank {
    tables: RwLock<Tables>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a contiguous block of register words into a word table.
    /// For bit tables, each word maps 0/non-0 to a bool.
    pub fn apply_block(&self, table: RegisterTable, start: u16, words: &[u16]) {
        let mut tables = self.tables.write();
        for (i, &word) in words.iter().enumerate() {
            let address = start.wrapping_add(i as u16);
            match table {
                RegisterTable::Holding => {
                    tables.holding.insert(address, word);
                },
                RegisterTable::Input => {
                    tables.input.insert(address, word);
                },
                RegisterTable::Coils => {
                    tables.coils.insert(address, word != 0);
                },
                RegisterTable::DiscreteInputs => {
                    tables.discrete_inputs.insert(address, word != 0);
                },
            }
        }
    }

    pub fn read_holding(&self, start: u16, quantity: u16) -> Vec<u16> {
        let tables = self.tables.read();
        (0..quantity)
            .map(|i| {
                tables
                    .holding
                    .get(&start.wrapping_add(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn read_input(&self, start: u16, quantity: u16) -> Vec<u16> {
        let tables = self.tables.read();
        (0..quantity)
            .map(|i| {
                tables
                    .input
                    .get(&start.wrapping_add(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn read_coils(&self, start: u16, quantity: u16) -> Vec<bool> {
        let tables = self.tables.read();
        (0..quantity)
            .map(|i| {
                tables
                    .coils
                    .get(&start.wrapping_add(i))
                    .copied()
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn read_discrete_inputs(&self, start: u16, quantity: u16) -> Vec<bool> {
        let tables = self.tables.read();
        (0..quantity)
            .map(|i| {
                tables
                    .discrete_inputs
                    .get(&start.wrapping_add(i))
                    .copied()
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn write_single_register(&self, address: u16, value: u16) {
        self.tables.write().holding.insert(address, value);
    }

    pub fn write_multiple_registers(&self, start: u16, values: &[u16]) {
        let mut tables = self.tables.write();
        for (i, &value) in values.iter().enumerate() {
            tables.holding.insert(start.wrapping_add(i as u16), value);
        }
    }

    pub fn write_single_coil(&self, address: u16, on: bool) {
        self.tables.write().coils.insert(address, on);
    }

    pub fn write_multiple_coils(&self, start: u16, values: &[bool]) {
        let mut tables = self.tables.write();
        for (i, &on) in values.iter().enumerate() {
            tables.coils.insert(start.wrapping_add(i as u16), on);
        }
    }
}

/// Local Modbus TCP server serving one register bank
#[derive(Debug)]
pub struct ModbusTcpServer {
    listener: TcpListener,
    bank: Arc<RegisterBank>,
    local_addr: SocketAddr,
}

impl ModbusTcpServer {
    /// Bind the listener. Fails if the address is already taken; the caller
    /// decides whether to probe another port.
    pub async fn bind(addr: SocketAddr, bank: Arc<RegisterBank>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ModbusError::Transport(format!("Failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ModbusError::Transport(e.to_string()))?;

        Ok(Self {
            listener,
            bank,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bank(&self) -> Arc<RegisterBank> {
        Arc::clone(&self.bank)
    }

    /// Accept loop. Runs until cancelled; each client gets its own task.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Modbus slave listening on {}", self.local_addr);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Slave client connected from {peer}");
                            let bank = Arc::clone(&self.bank);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_client(stream, bank, cancel).await {
                                    debug!("Slave client {peer} closed: {e}");
                                }
                            });
                        },
                        Err(e) => {
                            warn!("Slave accept failed on {}: {e}", self.local_addr);
                        },
                    }
                },
            }
        }

        info!("Modbus slave on {} stopped", self.local_addr);
    }
}

/// Serve one client connection until it closes or the server shuts down
async fn serve_client(
    mut stream: TcpStream,
    bank: Arc<RegisterBank>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut header = [0u8; 7];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read_exact(&mut header) => {
                read.map_err(|e| ModbusError::Transport(e.to_string()))?;
            },
        }

        let mbap = MbapHeader::from_bytes(&header)?;
        let pdu_length = mbap.pdu_length() as usize;
        if pdu_length == 0 || pdu_length > MAX_PDU_SIZE {
            return Err(ModbusError::Frame(format!(
                "Unreasonable PDU length {pdu_length}"
            )));
        }

        let mut request_pdu = vec![0u8; pdu_length];
        stream
            .read_exact(&mut request_pdu)
            .await
            .map_err(|e| ModbusError::Transport(e.to_string()))?;

        let response_pdu = match pdu::parse_request(&request_pdu) {
            Ok(request) => handle_request(&bank, request),
            Err(_) => pdu::build_exception_response(request_pdu[0], ExceptionCode::IllegalFunction),
        };

        let response = build_tcp_frame(mbap.transaction_id, mbap.unit_id, &response_pdu);
        stream
            .write_all(&response)
            .await
            .map_err(|e| ModbusError::Transport(e.to_string()))?;
    }
}

fn handle_request(bank: &RegisterBank, request: Request) -> Vec<u8> {
    match request {
        Request::ReadCoils { start, quantity } => {
            let values = bank.read_coils(start, quantity);
            pdu::build_bit_read_response(FunctionCode::ReadCoils, &values)
        },
        Request::ReadDiscreteInputs { start, quantity } => {
            let values = bank.read_discrete_inputs(start, quantity);
            pdu::build_bit_read_response(FunctionCode::ReadDiscreteInputs, &values)
        },
        Request::ReadHoldingRegisters { start, quantity } => {
            let values = bank.read_holding(start, quantity);
            pdu::build_register_read_response(FunctionCode::ReadHoldingRegisters, &values)
        },
        Request::ReadInputRegisters { start, quantity } => {
            let values = bank.read_input(start, quantity);
            pdu::build_register_read_response(FunctionCode::ReadInputRegisters, &values)
        },
        Request::WriteSingleCoil { address, on } => {
            bank.write_single_coil(address, on);
            pdu::build_write_response(
                FunctionCode::WriteSingleCoil,
                address,
                if on { 0xFF00 } else { 0x0000 },
            )
        },
        Request::WriteSingleRegister { address, value } => {
            bank.write_single_register(address, value);
            pdu::build_write_response(FunctionCode::WriteSingleRegister, address, value)
        },
        Request::WriteMultipleCoils { start, values } => {
            bank.write_multiple_coils(start, &values);
            pdu::build_write_response(FunctionCode::WriteMultipleCoils, start, values.len() as u16)
        },
        Request::WriteMultipleRegisters { start, values } => {
            bank.write_multiple_registers(start, &values);
            pdu::build_write_response(
                FunctionCode::WriteMultipleRegisters,
                start,
                values.len() as u16,
            )
        },
    }
}
