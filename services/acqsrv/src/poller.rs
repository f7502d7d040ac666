//! Per-device polling
//!
//! Three strategies. Periodic fires on an interval with a small start skew;
//! a tick landing while the previous read is still in flight is dropped, not
//! queued, so a slow device never builds a backlog. Continuous runs
//! read-to-read with a minimum gap. On-demand does nothing by itself.
//!
//! Results go into the acquisition channel with a blocking send: when the
//! parser stalls, polling stalls with it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConnectionSpec, DeviceSpec, PollMode};
use crate::dispatch::{Dispatcher, PRIORITY_BACKGROUND_READ};
use crate::model::{now_ms, DataAcquired};

/// Skew before the first periodic tick so pollers do not fire in lockstep
const START_SKEW: Duration = Duration::from_millis(100);

/// Consecutive continuous-mode failures before the long pause
const FAILURE_STREAK_LIMIT: u32 = 10;

/// Pause after a failure streak; the counter resets afterwards
const FAILURE_STREAK_PAUSE: Duration = Duration::from_secs(5);

/// Pause after an isolated continuous-mode failure
const FAILURE_PAUSE: Duration = Duration::from_secs(1);

/// Spawn the polling task for one device. On-demand devices get none.
pub fn spawn_device_poller(
    conn: Arc<ConnectionSpec>,
    device: Arc<DeviceSpec>,
    dispatcher: Arc<Dispatcher>,
    acquired_tx: mpsc::Sender<DataAcquired>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    match device.poll_mode {
        PollMode::Periodic => Some(tokio::spawn(periodic_loop(
            conn,
            device,
            dispatcher,
            acquired_tx,
            shutdown,
        ))),
        PollMode::Continuous => Some(tokio::spawn(continuous_loop(
            conn,
            device,
            dispatcher,
            acquired_tx,
            shutdown,
        ))),
        PollMode::OnDemand => {
            debug!(
                "Device '{}/{}' is on-demand, no poller",
                conn.conn_id, device.device_id
            );
            None
        },
    }
}

async fn periodic_loop(
    conn: Arc<ConnectionSpec>,
    device: Arc<DeviceSpec>,
    dispatcher: Arc<Dispatcher>,
    acquired_tx: mpsc::Sender<DataAcquired>,
    shutdown: CancellationToken,
) {
    info!(
        "Periodic poller for '{}/{}' every {:?}",
        conn.conn_id,
        device.device_id,
        conn.poll_interval()
    );

    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = sleep(START_SKEW) => {},
    }

    let mut ticker = interval(conn.poll_interval());
    // A tick that fires mid-read is coalesced, never queued
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {},
        }

        if !poll_once(&conn, &device, &dispatcher, &acquired_tx, &shutdown).await {
            break;
        }
    }

    info!(
        "Periodic poller for '{}/{}' stopped",
        conn.conn_id, device.device_id
    );
}

async fn continuous_loop(
    conn: Arc<ConnectionSpec>,
    device: Arc<DeviceSpec>,
    dispatcher: Arc<Dispatcher>,
    acquired_tx: mpsc::Sender<DataAcquired>,
    shutdown: CancellationToken,
) {
    let gap = conn.min_poll_interval();
    info!(
        "Continuous poller for '{}/{}' with {:?} gap",
        conn.conn_id, device.device_id, gap
    );

    let mut failures = 0u32;

    while !shutdown.is_cancelled() {
        let gathered = dispatcher
            .gather(
                conn.register_type,
                device.read_blocks.clone(),
                PRIORITY_BACKGROUND_READ,
            )
            .await;

        match gathered {
            Ok(blocks) => {
                failures = 0;
                let acquired = DataAcquired {
                    conn_id: conn.conn_id.clone(),
                    device_id: device.device_id.clone(),
                    blocks,
                    ts: now_ms(),
                };
                // Backpressure point: a full parser queue parks this loop
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = acquired_tx.send(acquired) => {
                        if sent.is_err() {
                            break;
                        }
                    },
                }
                if !gap.is_zero() {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(gap) => {},
                    }
                }
            },
            Err(e) => {
                failures += 1;
                let pause = if failures >= FAILURE_STREAK_LIMIT {
                    warn!(
                        "Continuous poll of '{}/{}' failed {failures} times in a row: {e}",
                        conn.conn_id, device.device_id
                    );
                    failures = 0;
                    FAILURE_STREAK_PAUSE
                } else {
                    debug!(
                        "Continuous poll of '{}/{}' failed: {e}",
                        conn.conn_id, device.device_id
                    );
                    FAILURE_PAUSE
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(pause) => {},
                }
            },
        }
    }

    info!(
        "Continuous poller for '{}/{}' stopped",
        conn.conn_id, device.device_id
    );
}

/// One poll round shared by the periodic loop. Returns false when the
/// pipeline is gone.
async fn poll_once(
    conn: &ConnectionSpec,
    device: &DeviceSpec,
    dispatcher: &Dispatcher,
    acquired_tx: &mpsc::Sender<DataAcquired>,
    shutdown: &CancellationToken,
) -> bool {
    match dispatcher
        .gather(
            conn.register_type,
            device.read_blocks.clone(),
            PRIORITY_BACKGROUND_READ,
        )
        .await
    {
        Ok(blocks) => {
            let acquired = DataAcquired {
                conn_id: conn.conn_id.clone(),
                device_id: device.device_id.clone(),
                blocks,
                ts: now_ms(),
            };
            tokio::select! {
                _ = shutdown.cancelled() => false,
                sent = acquired_tx.send(acquired) => sent.is_ok(),
            }
        },
        Err(e) => {
            debug!(
                "Poll of '{}/{}' failed: {e}",
                conn.conn_id, device.device_id
            );
            true
        },
    }
}
