//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use acqsrv::config::{
    BitEntry, Config, ConnectionSpec, DeviceSpec, ParameterSpec, PollMode, ReadBlock,
    RegisterType, TransportSpec,
};
use acqsrv::error::Result;
use acqsrv::sinks::{Broker, DataPoint, TimeSeriesSink};
use pump_modbus::{DataType, WordOrder};

pub fn tcp_connection(conn_id: &str, port: u16, devices: Vec<DeviceSpec>) -> ConnectionSpec {
    ConnectionSpec {
        conn_id: conn_id.to_string(),
        transport: TransportSpec::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        },
        slave_id: 1,
        register_type: RegisterType::Holding,
        byte_order: WordOrder::Abcd,
        slave_port: None,
        poll_interval_ms: 100,
        min_poll_interval_ms: Some(0),
        timeout_ms: 2000,
        pause_after_connect_ms: 0,
        close_after_gather: false,
        enabled: true,
        devices,
    }
}

pub fn device(device_id: &str, poll_mode: PollMode, blocks: Vec<ReadBlock>) -> DeviceSpec {
    DeviceSpec {
        device_id: device_id.to_string(),
        poll_mode,
        read_blocks: blocks,
        parameters: Vec::new(),
        description: String::new(),
        config_path: None,
    }
}

pub fn parameter(code: &str, data_type: DataType, address: u16) -> ParameterSpec {
    ParameterSpec {
        code: code.to_string(),
        data_type,
        addresses: vec![address],
        scale: 1.0,
        offset: 0.0,
        precision: 0,
        bit_map: None,
        enum_map: None,
        on_change: false,
        unit: String::new(),
        enabled: true,
    }
}

pub fn bit_mapped_parameter(code: &str, address: u16, bits: &[(&str, &str)]) -> ParameterSpec {
    let mut map = BTreeMap::new();
    for (index, bit_code) in bits {
        map.insert(
            index.to_string(),
            BitEntry {
                code: bit_code.to_string(),
                name: String::new(),
            },
        );
    }
    let mut param = parameter(code, DataType::Uint16, address);
    param.bit_map = Some(map);
    param
}

pub fn single_connection_config(conn: ConnectionSpec) -> Config {
    Config {
        connections: vec![conn],
        auto_create_devices: Vec::new(),
    }
}

/// Records every batch the pipeline stores
#[derive(Default)]
pub struct RecordingSink {
    pub batches: Mutex<Vec<Vec<DataPoint>>>,
}

#[async_trait]
impl TimeSeriesSink for RecordingSink {
    async fn write(&self, batch: Vec<DataPoint>) -> Result<()> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

impl RecordingSink {
    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

/// Records every broker publish
#[derive(Default)]
pub struct RecordingBroker {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

impl RecordingBroker {
    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

/// Wait until `predicate` holds or the deadline passes
pub async fn wait_for<F>(mut predicate: F, deadline: std::time::Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    predicate()
}
