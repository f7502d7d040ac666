//! Event pipeline
//!
//! Explicit bounded channels between the acquisition stages, one consumer
//! task per topic. Ordering is preserved per device because every stage is
//! a single task over FIFO channels; backpressure is the channels' bounded
//! capacity: a full parser queue blocks the poller that is submitting.
//!
//! Topics: acquired (exactly one consumer, the parser), parsed (sink
//! writer), changed (fanned out at-least-once to the broker publisher and
//! the rule engine).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{Config, ConnectionSpec, DeviceSpec};
use crate::model::{now_ms, DataAcquired, DataParsed, DataStored, ParamChanged};
use crate::parser;
use crate::sinks::{self, Broker, TimeSeriesSink};
use crate::slave::SlaveManager;
use crate::tracker::ChangeTracker;

/// Channel capacities; the acquired queue is the backpressure point
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub acquired_capacity: usize,
    pub parsed_capacity: usize,
    pub changed_capacity: usize,
    /// Base for broker topics
    pub broker_base_topic: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            acquired_capacity: 64,
            parsed_capacity: 64,
            changed_capacity: 64,
            broker_base_topic: "pump".to_string(),
        }
    }
}

/// Everything the pipeline stages need
pub struct PipelineDeps {
    pub config: Arc<Config>,
    pub tracker: Arc<ChangeTracker>,
    pub slaves: Arc<SlaveManager>,
    pub ts_sink: Arc<dyn TimeSeriesSink>,
    pub broker: Arc<dyn Broker>,
    /// Subscription handed to the rule engine
    pub rules_tx: mpsc::Sender<ParamChanged>,
}

/// Handles into a running pipeline
pub struct Pipeline {
    acquired_tx: mpsc::Sender<DataAcquired>,
    stored_rx: parking_lot::Mutex<Option<mpsc::Receiver<DataStored>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Producers submit completed gathers here; a full queue blocks them
    pub fn acquired_tx(&self) -> mpsc::Sender<DataAcquired> {
        self.acquired_tx.clone()
    }

    /// The storage confirmation stream; one taker
    pub fn take_stored_rx(&self) -> Option<mpsc::Receiver<DataStored>> {
        self.stored_rx.lock().take()
    }

    /// Wait for the stage tasks to finish after shutdown
    pub async fn join(self) {
        drop(self.acquired_tx);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

type SpecIndex = HashMap<(String, String), (Arc<ConnectionSpec>, Arc<DeviceSpec>)>;

fn build_index(config: &Config) -> SpecIndex {
    let mut index = SpecIndex::new();
    for conn in &config.connections {
        let conn_arc = Arc::new(conn.clone());
        for device in &conn.devices {
            index.insert(
                (conn.conn_id.clone(), device.device_id.clone()),
                (Arc::clone(&conn_arc), Arc::new(device.clone())),
            );
        }
    }
    index
}

/// Spawn the stage tasks and return the pipeline handles
pub fn spawn_pipeline(
    cfg: PipelineConfig,
    deps: PipelineDeps,
    shutdown: CancellationToken,
) -> Pipeline {
    let (acquired_tx, acquired_rx) = mpsc::channel(cfg.acquired_capacity);
    let (parsed_tx, parsed_rx) = mpsc::channel(cfg.parsed_capacity);
    let (changed_tx, changed_rx) = mpsc::channel(cfg.changed_capacity);
    let (publish_tx, publish_rx) = mpsc::channel(cfg.changed_capacity);
    let (stored_tx, stored_rx) = mpsc::channel(cfg.parsed_capacity);

    let index = Arc::new(build_index(&deps.config));

    let tasks = vec![
        tokio::spawn(parser_stage(
            acquired_rx,
            parsed_tx,
            changed_tx,
            Arc::clone(&index),
            Arc::clone(&deps.tracker),
            Arc::clone(&deps.slaves),
            shutdown.clone(),
        )),
        tokio::spawn(sink_stage(
            parsed_rx,
            stored_tx,
            Arc::clone(&deps.ts_sink),
            Arc::clone(&deps.broker),
            cfg.broker_base_topic.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(fanout_stage(
            changed_rx,
            publish_tx,
            deps.rules_tx.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(publish_stage(
            publish_rx,
            Arc::clone(&deps.broker),
            cfg.broker_base_topic.clone(),
            shutdown,
        )),
    ];

    Pipeline {
        acquired_tx,
        stored_rx: parking_lot::Mutex::new(Some(stored_rx)),
        tasks,
    }
}

/// Acquired -> slave mirror -> samples -> parsed + changed
async fn parser_stage(
    mut acquired_rx: mpsc::Receiver<DataAcquired>,
    parsed_tx: mpsc::Sender<DataParsed>,
    changed_tx: mpsc::Sender<ParamChanged>,
    index: Arc<SpecIndex>,
    tracker: Arc<ChangeTracker>,
    slaves: Arc<SlaveManager>,
    shutdown: CancellationToken,
) {
    loop {
        let acquired = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = acquired_rx.recv() => match received {
                Some(acquired) => acquired,
                None => break,
            },
        };

        let key = (acquired.conn_id.clone(), acquired.device_id.clone());
        let Some((conn, device)) = index.get(&key) else {
            warn!(
                "Dropping acquisition for unknown '{}/{}'",
                acquired.conn_id, acquired.device_id
            );
            continue;
        };

        // Mirror successful blocks into the local slave before anything
        // else can observe this tick
        for block in &acquired.blocks {
            if let Ok(words) = &block.outcome {
                slaves.apply_block(
                    &acquired.conn_id,
                    conn.register_type,
                    block.block.start,
                    words,
                );
            }
        }

        let samples = parser::parse_device_tick(conn, device, &acquired);
        if samples.is_empty() {
            continue;
        }

        let mut changes = Vec::new();
        for sample in &samples {
            if let Some(param) = device.parameter(&sample.code) {
                if param.on_change {
                    if let Some(event) = tracker.observe(param, sample) {
                        changes.push(event);
                    }
                }
            }
        }

        let parsed = DataParsed {
            conn_id: acquired.conn_id.clone(),
            device_id: acquired.device_id.clone(),
            samples,
            ts: acquired.ts,
        };
        if parsed_tx.send(parsed).await.is_err() {
            break;
        }
        for event in changes {
            if changed_tx.send(event).await.is_err() {
                return;
            }
        }
    }

    debug!("Parser stage stopped");
}

/// Parsed -> time-series sink + broker data topic -> stored
async fn sink_stage(
    mut parsed_rx: mpsc::Receiver<DataParsed>,
    stored_tx: mpsc::Sender<DataStored>,
    ts_sink: Arc<dyn TimeSeriesSink>,
    broker: Arc<dyn Broker>,
    base_topic: String,
    shutdown: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = parsed_rx.recv() => match received {
                Some(batch) => batch,
                None => break,
            },
        };

        let points = sinks::batch_to_points(&batch);
        let point_count = points.len();
        if !points.is_empty() {
            // Storage is at-most-once: a failed batch is logged and dropped
            if let Err(e) = ts_sink.write(points).await {
                error!(
                    "Time-series write for '{}/{}' failed, dropping batch: {e}",
                    batch.conn_id, batch.device_id
                );
            }
        }

        match sinks::batch_payload(&batch) {
            Ok(payload) => {
                let topic = sinks::data_topic(&base_topic, &batch.conn_id, &batch.device_id);
                if let Err(e) = broker.publish(&topic, payload).await {
                    // The broker client retries natively if it can
                    warn!("Broker publish to '{topic}' failed: {e}");
                }
            },
            Err(e) => error!("Cannot serialize batch: {e}"),
        }

        let stored = DataStored {
            conn_id: batch.conn_id,
            device_id: batch.device_id,
            points: point_count,
            ts: now_ms(),
        };
        if stored_tx.send(stored).await.is_err() {
            break;
        }
    }

    debug!("Sink stage stopped");
}

/// Changed -> broker publisher and rule engine, at-least-once each
async fn fanout_stage(
    mut changed_rx: mpsc::Receiver<ParamChanged>,
    publish_tx: mpsc::Sender<ParamChanged>,
    rules_tx: mpsc::Sender<ParamChanged>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = changed_rx.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };

        if publish_tx.send(event.clone()).await.is_err() {
            break;
        }
        if rules_tx.send(event).await.is_err() {
            break;
        }
    }

    debug!("Fan-out stage stopped");
}

/// Change events -> broker changes topic
async fn publish_stage(
    mut publish_rx: mpsc::Receiver<ParamChanged>,
    broker: Arc<dyn Broker>,
    base_topic: String,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = publish_rx.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };

        match sinks::change_payload(&event) {
            Ok(payload) => {
                let topic =
                    sinks::changes_topic(&base_topic, &event.conn_id, &event.device_id);
                if let Err(e) = broker.publish(&topic, payload).await {
                    warn!("Broker publish to '{topic}' failed: {e}");
                }
            },
            Err(e) => error!("Cannot serialize change event: {e}"),
        }
    }

    debug!("Publish stage stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ParameterSpec, PollMode, ReadBlock, RegisterType, TransportSpec,
    };
    use crate::error::Result;
    use crate::model::BlockResult;
    use crate::sinks::DataPoint;
    use async_trait::async_trait;
    use pump_modbus::{DataType, WordOrder};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<Vec<DataPoint>>>,
    }

    #[async_trait]
    impl TimeSeriesSink for RecordingSink {
        async fn write(&self, batch: Vec<DataPoint>) -> Result<()> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBroker {
        published: StdMutex<Vec<(String, Vec<u8>)>>,
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

    fn test_config() -> Config {
        Config {
            connections: vec![ConnectionSpec {
                conn_id: "c1".to_string(),
                transport: TransportSpec::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: 502,
                },
                slave_id: 1,
                register_type: RegisterType::Holding,
                byte_order: WordOrder::Abcd,
                slave_port: None,
                poll_interval_ms: 1000,
                min_poll_interval_ms: None,
                timeout_ms: 10_000,
                pause_after_connect_ms: 0,
                close_after_gather: false,
                enabled: true,
                devices: vec![DeviceSpec {
                    device_id: "pump1".to_string(),
                    poll_mode: PollMode::Periodic,
                    read_blocks: vec![ReadBlock { start: 0, count: 2 }],
                    parameters: vec![ParameterSpec {
                        code: "flow".to_string(),
                        data_type: DataType::Uint16,
                        addresses: vec![0],
                        scale: 1.0,
                        offset: 0.0,
                        precision: 0,
                        bit_map: None,
                        enum_map: None,
                        on_change: true,
                        unit: String::new(),
                        enabled: true,
                    }],
                    description: String::new(),
                    config_path: None,
                }],
            }],
            auto_create_devices: vec![],
        }
    }

    fn acquired(words: Vec<u16>, ts: i64) -> DataAcquired {
        DataAcquired {
            conn_id: "c1".to_string(),
            device_id: "pump1".to_string(),
            blocks: vec![BlockResult {
                block: ReadBlock {
                    start: 0,
                    count: words.len() as u16,
                },
                outcome: Ok(words),
            }],
            ts,
        }
    }

    #[tokio::test]
    async fn test_tick_flows_to_sinks_and_changes() {
        let sink = Arc::new(RecordingSink::default());
        let broker = Arc::new(RecordingBroker::default());
        let (rules_tx, mut rules_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let pipeline = spawn_pipeline(
            PipelineConfig::default(),
            PipelineDeps {
                config: Arc::new(test_config()),
                tracker: Arc::new(ChangeTracker::new()),
                slaves: Arc::new(SlaveManager::new()),
                ts_sink: sink.clone(),
                broker: broker.clone(),
                rules_tx,
            },
            shutdown.clone(),
        );

        let tx = pipeline.acquired_tx();
        let mut stored_rx = pipeline.take_stored_rx().unwrap();

        // First tick records the baseline, second one changes the value
        tx.send(acquired(vec![41, 0], 1)).await.unwrap();
        tx.send(acquired(vec![42, 0], 2)).await.unwrap();

        let first = stored_rx.recv().await.unwrap();
        assert_eq!(first.points, 1);
        let _second = stored_rx.recv().await.unwrap();

        let change = rules_rx.recv().await.unwrap();
        assert_eq!(change.code, "flow");
        assert_eq!(change.old, crate::model::ParsedValue::Integer(41));
        assert_eq!(change.new, crate::model::ParsedValue::Integer(42));

        // Both data batches went to storage and the broker
        assert_eq!(sink.batches.lock().unwrap().len(), 2);
        let published = broker.published.lock().unwrap();
        let data_msgs = published
            .iter()
            .filter(|(topic, _)| topic.ends_with("/data"))
            .count();
        let change_msgs = published
            .iter()
            .filter(|(topic, _)| topic.ends_with("/changes"))
            .count();
        assert_eq!(data_msgs, 2);
        assert_eq!(change_msgs, 1);

        shutdown.cancel();
        pipeline.join().await;
    }

    #[tokio::test]
    async fn test_sink_error_is_dropped_not_fatal() {
        struct FailingSink;

        #[async_trait]
        impl TimeSeriesSink for FailingSink {
            async fn write(&self, _batch: Vec<DataPoint>) -> Result<()> {
                Err(crate::error::AcqError::Internal("sink down".to_string()))
            }
        }

        let broker = Arc::new(RecordingBroker::default());
        let (rules_tx, _rules_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let pipeline = spawn_pipeline(
            PipelineConfig::default(),
            PipelineDeps {
                config: Arc::new(test_config()),
                tracker: Arc::new(ChangeTracker::new()),
                slaves: Arc::new(SlaveManager::new()),
                ts_sink: Arc::new(FailingSink),
                broker: broker.clone(),
                rules_tx,
            },
            shutdown.clone(),
        );

        let tx = pipeline.acquired_tx();
        let mut stored_rx = pipeline.take_stored_rx().unwrap();

        tx.send(acquired(vec![1, 2], 1)).await.unwrap();

        // The batch still completes the pipeline and reaches the broker
        let stored = stored_rx.recv().await.unwrap();
        assert_eq!(stored.conn_id, "c1");
        assert_eq!(broker.published.lock().unwrap().len(), 1);

        shutdown.cancel();
        pipeline.join().await;
    }

    #[tokio::test]
    async fn test_slave_image_updated_before_parsed_leaves() {
        let slaves = Arc::new(SlaveManager::new());
        let shutdown = CancellationToken::new();
        let config = test_config();
        slaves
            .start_slave(&config.connections[0], &shutdown)
            .await
            .unwrap();

        let (rules_tx, _rules_rx) = mpsc::channel(16);
        let pipeline = spawn_pipeline(
            PipelineConfig::default(),
            PipelineDeps {
                config: Arc::new(config),
                tracker: Arc::new(ChangeTracker::new()),
                slaves: Arc::clone(&slaves),
                ts_sink: Arc::new(RecordingSink::default()),
                broker: Arc::new(RecordingBroker::default()),
                rules_tx,
            },
            shutdown.clone(),
        );

        let tx = pipeline.acquired_tx();
        let mut stored_rx = pipeline.take_stored_rx().unwrap();

        tx.send(acquired(vec![0xAA, 0xBB], 1)).await.unwrap();
        stored_rx.recv().await.unwrap();

        let bank = slaves.get("c1").unwrap().bank();
        assert_eq!(bank.read_holding(0, 2), vec![0xAA, 0xBB]);

        shutdown.cancel();
        pipeline.join().await;
    }
}
