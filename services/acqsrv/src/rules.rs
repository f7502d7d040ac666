//! Rule engine contract
//!
//! The core ships the debounce and the read/write primitives; the rules
//! themselves are loaded externally. A rule sees change events and may read
//! parameters or write control registers back through the dispatcher at
//! write priority. A panicking rule is contained at the engine boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::dispatch::{Command, DEFAULT_REQUEST_TIMEOUT, PRIORITY_WRITE};
use crate::error::{AcqError, Result};
use crate::manager::ConnectionManager;
use crate::model::{ParamChanged, ParsedValue};
use crate::parser;

/// Events with the same fingerprint inside this window are dropped
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// One externally provided rule
#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    async fn on_param_changed(&self, event: &ParamChanged, ctx: &RuleContext) -> Result<()>;
}

/// Read/write primitives handed to rules
pub struct RuleContext {
    manager: Arc<ConnectionManager>,
    config: Arc<Config>,
}

impl RuleContext {
    pub fn new(manager: Arc<ConnectionManager>, config: Arc<Config>) -> Self {
        Self { manager, config }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Read one parameter now, at write priority, waiting up to the request
    /// budget. `code` may also name one bit of a bit-mapped parent.
    pub async fn read_parameter(
        &self,
        conn_id: &str,
        device_id: &str,
        code: &str,
    ) -> Result<ParsedValue> {
        let conn = self
            .config
            .connection(conn_id)
            .ok_or_else(|| AcqError::not_found(format!("connection '{conn_id}'")))?;
        let device = conn
            .device(device_id)
            .ok_or_else(|| AcqError::not_found(format!("device '{conn_id}/{device_id}'")))?;

        let (param, bit) = match device.parameter(code) {
            Some(param) => (param, None),
            None => {
                let (parent, index) = device.bit_parent(code).ok_or_else(|| {
                    AcqError::not_found(format!("parameter '{conn_id}/{device_id}/{code}'"))
                })?;
                (parent, Some((index, code.to_string())))
            },
        };

        let addresses = param.required_addresses();
        let start = *addresses.iter().min().unwrap_or(&0);
        let end = *addresses.iter().max().unwrap_or(&0);
        let count = end - start + 1;

        let managed = self.manager.ensure(conn_id)?;
        let words = managed
            .dispatcher
            .read_block(conn.register_type, start, count, PRIORITY_WRITE)
            .await?;

        let mut image = parser::RegisterImage::new();
        for (i, &word) in words.iter().enumerate() {
            image.insert(start.wrapping_add(i as u16), word);
        }

        let (raw, parsed) = parser::parse_parameter(conn, param, &image)?;

        match bit {
            None => Ok(parsed),
            Some((index, bit_code)) => match raw {
                pump_modbus::RawValue::Integer(value) => {
                    let state = (value as u16 >> index) & 1 != 0;
                    debug!("Bit '{bit_code}' of '{}' reads {state}", param.code);
                    Ok(ParsedValue::Integer(i64::from(state)))
                },
                other => Err(AcqError::Internal(format!(
                    "bit parent decoded to non-integer {other:?}"
                ))),
            },
        }
    }

    /// Write one holding register at write priority
    pub async fn write_register(&self, conn_id: &str, address: u16, value: u16) -> Result<()> {
        self.submit_write(conn_id, Command::WriteRegister { address, value })
            .await
    }

    /// Write consecutive holding registers at write priority
    pub async fn write_registers(&self, conn_id: &str, start: u16, values: Vec<u16>) -> Result<()> {
        self.submit_write(conn_id, Command::WriteRegisters { start, values })
            .await
    }

    /// Write one coil at write priority
    pub async fn write_coil(&self, conn_id: &str, address: u16, on: bool) -> Result<()> {
        self.submit_write(conn_id, Command::WriteCoil { address, on })
            .await
    }

    async fn submit_write(&self, conn_id: &str, command: Command) -> Result<()> {
        let managed = self.manager.ensure(conn_id)?;
        managed
            .dispatcher
            .submit(command, PRIORITY_WRITE, DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }
}

/// Debouncing dispatcher over the change stream
pub struct RuleEngine {
    rules: Vec<Arc<dyn Rule>>,
    ctx: Arc<RuleContext>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Arc<dyn Rule>>, ctx: Arc<RuleContext>) -> Self {
        Self { rules, ctx }
    }

    /// Spawn the engine task over its change-event subscription
    pub fn spawn(
        self,
        mut events: mpsc::Receiver<ParamChanged>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_processed: HashMap<(String, String, String), Instant> = HashMap::new();

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => match received {
                        Some(event) => event,
                        None => break,
                    },
                };

                let key = event.fingerprint();
                let now = Instant::now();
                if let Some(&seen) = last_processed.get(&key) {
                    if now.duration_since(seen) < DEBOUNCE_WINDOW {
                        debug!(
                            "Debounced change of '{}/{}/{}'",
                            event.conn_id, event.device_id, event.code
                        );
                        continue;
                    }
                }
                last_processed.insert(key, now);

                for rule in &self.rules {
                    self.invoke(rule, &event).await;
                }
            }

            debug!("Rule engine stopped");
        })
    }

    /// Run one rule; panics and errors end here, not in the pipeline
    async fn invoke(&self, rule: &Arc<dyn Rule>, event: &ParamChanged) {
        let outcome = std::panic::AssertUnwindSafe(rule.on_param_changed(event, &self.ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                warn!(
                    "Rule '{}' failed on '{}/{}/{}': {e}",
                    rule.name(),
                    event.conn_id,
                    event.device_id,
                    event.code
                );
            },
            Err(_) => {
                error!(
                    "Rule '{}' panicked on '{}/{}/{}'",
                    rule.name(),
                    event.conn_id,
                    event.device_id,
                    event.code
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParameterSample;
    use pump_modbus::RawValue;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRule {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Rule for CountingRule {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_param_changed(&self, _event: &ParamChanged, _ctx: &RuleContext) -> Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingRule;

    #[async_trait]
    impl Rule for PanickingRule {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn on_param_changed(&self, _event: &ParamChanged, _ctx: &RuleContext) -> Result<()> {
            panic!("rule bug");
        }
    }

    fn change_event(code: &str, ts: i64) -> ParamChanged {
        let sample = ParameterSample {
            conn_id: "c1".to_string(),
            device_id: "pump1".to_string(),
            code: code.to_string(),
            raw: RawValue::Integer(1),
            parsed: ParsedValue::Integer(1),
            unit: String::new(),
            ts,
            metadata: BTreeMap::new(),
        };
        ParamChanged {
            conn_id: "c1".to_string(),
            device_id: "pump1".to_string(),
            code: code.to_string(),
            old: ParsedValue::Integer(0),
            new: ParsedValue::Integer(1),
            ts,
            sample,
        }
    }

    fn empty_ctx() -> Arc<RuleContext> {
        let config = Arc::new(Config::default());
        let manager = Arc::new(ConnectionManager::new(&config, CancellationToken::new()));
        Arc::new(RuleContext::new(manager, config))
    }

    #[tokio::test]
    async fn test_debounce_drops_rapid_duplicates() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let engine = RuleEngine::new(
            vec![Arc::new(CountingRule {
                invocations: Arc::clone(&invocations),
            })],
            empty_ctx(),
        );

        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = engine.spawn(rx, shutdown.clone());

        // 20 ms apart: second one debounced
        tx.send(change_event("flow", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(change_event("flow", 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // 60 ms after the first processed event: passes
        tx.send(change_event("flow", 3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_different_fingerprints_not_debounced() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let engine = RuleEngine::new(
            vec![Arc::new(CountingRule {
                invocations: Arc::clone(&invocations),
            })],
            empty_ctx(),
        );

        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = engine.spawn(rx, shutdown.clone());

        tx.send(change_event("flow", 1)).await.unwrap();
        tx.send(change_event("pressure", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_rule_panic_is_contained() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let engine = RuleEngine::new(
            vec![
                Arc::new(PanickingRule),
                Arc::new(CountingRule {
                    invocations: Arc::clone(&invocations),
                }),
            ],
            empty_ctx(),
        );

        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = engine.spawn(rx, shutdown.clone());

        tx.send(change_event("flow", 1)).await.unwrap();
        tx.send(change_event("pressure", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The panicking rule never stops the engine or its peers
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert!(!handle.is_finished());

        shutdown.cancel();
        let _ = handle.await;
    }
}
