//! Configuration model
//!
//! Specs are created at load time and immutable for the life of a run.
//! Validation happens once at load; a connection or device that fails
//! validation is refused, it does not limp along.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pump_modbus::{DataType, WordOrder};

use crate::error::{AcqError, Result};

/// Default background poll interval
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default per-operation timeout
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// `min_poll_interval` when the field is absent. An explicit 0 is legal and
/// means "as fast as possible", throttled only by pipeline backpressure.
const DEFAULT_MIN_POLL_INTERVAL_MS: u64 = 10;

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Which upstream register table a connection polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    DiscreteInput,
}

impl RegisterType {
    /// Coil and discrete tables carry one bit per address
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::DiscreteInput)
    }
}

/// Device polling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    #[default]
    Periodic,
    Continuous,
    OnDemand,
}

/// Physical link description, tagged variant instead of a class hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSpec {
    Tcp {
        host: String,
        port: u16,
    },
    Rtu {
        serial_port: String,
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_parity")]
        parity: String,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// A contiguous register range read in one PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
}

impl ReadBlock {
    pub fn contains(&self, address: u16) -> bool {
        address >= self.start && u32::from(address) < u32::from(self.start) + u32::from(self.count)
    }

    fn overlaps(&self, other: &ReadBlock) -> bool {
        let a_end = u32::from(self.start) + u32::from(self.count);
        let b_end = u32::from(other.start) + u32::from(other.count);
        u32::from(self.start) < b_end && u32::from(other.start) < a_end
    }
}

/// One named bit inside a bit-mapped uint16 parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitEntry {
    pub code: String,
    #[serde(default)]
    pub name: String,
}

/// A typed parameter decoded from one or more registers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub code: String,
    pub data_type: DataType,
    /// Base address; `string` parameters list every register they span
    pub addresses: Vec<u16>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Decimal places for float parsing and change comparison
    #[serde(default)]
    pub precision: u32,
    /// Bit index ("0".."15") to bit code; only valid on `uint16`
    #[serde(default)]
    pub bit_map: Option<BTreeMap<String, BitEntry>>,
    /// Stringified raw value to display label
    #[serde(default)]
    pub enum_map: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub on_change: bool,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ParameterSpec {
    /// Registers this parameter occupies, starting at `addresses[0]`.
    /// String parameters span every listed address.
    pub fn register_count(&self) -> u16 {
        match self.data_type {
            DataType::String => self.addresses.len() as u16,
            other => other.register_count(),
        }
    }

    /// Every address this parameter needs present in the tick image
    pub fn required_addresses(&self) -> Vec<u16> {
        match (self.data_type, self.addresses.first()) {
            (DataType::String, _) => self.addresses.clone(),
            (_, Some(&base)) => (0..self.register_count())
                .map(|i| base.wrapping_add(i))
                .collect(),
            (_, None) => Vec::new(),
        }
    }

    /// The bit map with indices parsed, for the codec
    pub fn bit_index_map(&self) -> Option<BTreeMap<u8, String>> {
        self.bit_map.as_ref().map(|map| {
            map.iter()
                .filter_map(|(index, entry)| {
                    index.parse::<u8>().ok().map(|i| (i, entry.code.clone()))
                })
                .collect()
        })
    }

    fn validate(&self, device_id: &str) -> Result<()> {
        let ctx = format!("device '{device_id}' parameter '{}'", self.code);

        if self.code.is_empty() {
            return Err(AcqError::invalid_spec(format!(
                "{ctx}: empty parameter code"
            )));
        }
        if self.addresses.is_empty() {
            return Err(AcqError::invalid_spec(format!("{ctx}: no addresses")));
        }

        if let Some(bit_map) = &self.bit_map {
            if self.data_type != DataType::Uint16 {
                return Err(AcqError::invalid_spec(format!(
                    "{ctx}: bit_map requires data_type uint16, got {:?}",
                    self.data_type
                )));
            }
            for (index, entry) in bit_map {
                match index.parse::<u8>() {
                    Ok(i) if i < 16 => {},
                    _ => {
                        return Err(AcqError::invalid_spec(format!(
                            "{ctx}: bit index '{index}' outside \"0\"..\"15\""
                        )));
                    },
                }
                if entry.code.is_empty() {
                    return Err(AcqError::invalid_spec(format!(
                        "{ctx}: bit {index} has an empty code"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// One polled device on a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_id: String,
    #[serde(default)]
    pub poll_mode: PollMode,
    #[serde(default)]
    pub read_blocks: Vec<ReadBlock>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub description: String,
    /// External JSON file overriding poll_mode, read_blocks, parameters and
    /// description; resolved by the config provider at load
    #[serde(default)]
    pub config_path: Option<String>,
}

impl DeviceSpec {
    pub fn parameter(&self, code: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.code == code)
    }

    /// Find the bit-mapped parent parameter owning a bit code
    pub fn bit_parent(&self, bit_code: &str) -> Option<(&ParameterSpec, u8)> {
        for param in &self.parameters {
            if let Some(map) = param.bit_index_map() {
                if let Some((&index, _)) = map.iter().find(|(_, code)| code.as_str() == bit_code) {
                    return Some((param, index));
                }
            }
        }
        None
    }

    fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(AcqError::invalid_spec("empty device_id"));
        }
        if self.read_blocks.is_empty() {
            return Err(AcqError::invalid_spec(format!(
                "device '{}': no read blocks",
                self.device_id
            )));
        }

        for block in &self.read_blocks {
            if block.count == 0 {
                return Err(AcqError::invalid_spec(format!(
                    "device '{}': zero-length block at {}",
                    self.device_id, block.start
                )));
            }
        }

        // No two blocks may overlap for the same register table
        for (i, a) in self.read_blocks.iter().enumerate() {
            for b in &self.read_blocks[i + 1..] {
                if a.overlaps(b) {
                    return Err(AcqError::invalid_spec(format!(
                        "device '{}': blocks ({},{}) and ({},{}) overlap",
                        self.device_id, a.start, a.count, b.start, b.count
                    )));
                }
            }
        }

        let mut codes = HashSet::new();
        for param in &self.parameters {
            param.validate(&self.device_id)?;

            if !codes.insert(param.code.clone()) {
                return Err(AcqError::invalid_spec(format!(
                    "device '{}': duplicate parameter code '{}'",
                    self.device_id, param.code
                )));
            }
            if let Some(map) = &param.bit_map {
                for entry in map.values() {
                    if !codes.insert(entry.code.clone()) {
                        return Err(AcqError::invalid_spec(format!(
                            "device '{}': duplicate bit code '{}'",
                            self.device_id, entry.code
                        )));
                    }
                }
            }

            // Every enabled parameter must be covered by the blocks
            if param.enabled {
                for address in param.required_addresses() {
                    if !self.read_blocks.iter().any(|b| b.contains(address)) {
                        return Err(AcqError::invalid_spec(format!(
                            "device '{}': parameter '{}' address {} not covered by any block",
                            self.device_id, param.code, address
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// One long-lived upstream link and the devices behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub conn_id: String,
    pub transport: TransportSpec,
    pub slave_id: u8,
    pub register_type: RegisterType,
    #[serde(default)]
    pub byte_order: WordOrder,
    /// Local slave port; absent or 0 auto-allocates from [60000, 65535]
    #[serde(default)]
    pub slave_port: Option<u16>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub min_poll_interval_ms: Option<u64>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub pause_after_connect_ms: u64,
    #[serde(default)]
    pub close_after_gather: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

impl ConnectionSpec {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.min_poll_interval_ms
                .unwrap_or(DEFAULT_MIN_POLL_INTERVAL_MS),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn pause_after_connect(&self) -> Duration {
        Duration::from_millis(self.pause_after_connect_ms)
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceSpec> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.conn_id.is_empty() {
            return Err(AcqError::invalid_spec("empty conn_id"));
        }
        if !(1..=247).contains(&self.slave_id) {
            return Err(AcqError::invalid_spec(format!(
                "connection '{}': slave_id {} outside 1..=247",
                self.conn_id, self.slave_id
            )));
        }
        if self.timeout_ms == 0 {
            return Err(AcqError::invalid_spec(format!(
                "connection '{}': zero timeout",
                self.conn_id
            )));
        }

        match &self.transport {
            TransportSpec::Tcp { host, port } => {
                if host.is_empty() || *port == 0 {
                    return Err(AcqError::invalid_spec(format!(
                        "connection '{}': invalid tcp endpoint {host}:{port}",
                        self.conn_id
                    )));
                }
            },
            TransportSpec::Rtu { serial_port, .. } => {
                if serial_port.is_empty() {
                    return Err(AcqError::invalid_spec(format!(
                        "connection '{}': empty serial port",
                        self.conn_id
                    )));
                }
            },
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !device_ids.insert(device.device_id.clone()) {
                return Err(AcqError::invalid_spec(format!(
                    "connection '{}': duplicate device_id '{}'",
                    self.conn_id, device.device_id
                )));
            }
        }

        Ok(())
    }
}

/// Top-level configuration record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    /// Devices attached to every connection that declares none of its own
    #[serde(default)]
    pub auto_create_devices: Vec<DeviceSpec>,
}

impl Config {
    pub fn connection(&self, conn_id: &str) -> Option<&ConnectionSpec> {
        self.connections.iter().find(|c| c.conn_id == conn_id)
    }

    /// Validate every connection. Invalid ones are reported with their
    /// errors so the runtime can refuse them and start the rest.
    pub fn validate(&self) -> Vec<(String, AcqError)> {
        let mut failures = Vec::new();
        let mut seen = HashSet::new();

        for conn in &self.connections {
            if !seen.insert(conn.conn_id.clone()) {
                failures.push((
                    conn.conn_id.clone(),
                    AcqError::invalid_spec(format!("duplicate conn_id '{}'", conn.conn_id)),
                ));
                continue;
            }
            if let Err(e) = conn.validate() {
                failures.push((conn.conn_id.clone(), e));
            }
        }

        failures
    }
}
