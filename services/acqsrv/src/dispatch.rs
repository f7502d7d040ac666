//! Per-connection priority dispatch
//!
//! One consumer task per connection serializes every read and write against
//! the transport. Requests queue in a binary heap keyed by priority with a
//! FIFO tie-break, so writes overtake queued background reads but nothing
//! ever pre-empts a request already on the wire.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ReadBlock, RegisterType};
use crate::connection::Connection;
use crate::error::{AcqError, Result};
use crate::model::BlockResult;

/// Background poll reads
pub const PRIORITY_BACKGROUND_READ: i32 = 1;

/// Reads requested by external callers
pub const PRIORITY_ON_DEMAND_READ: i32 = 2;

/// Control writes and rule-engine traffic
pub const PRIORITY_WRITE: i32 = 10;

/// Submission-to-completion budget for reads and writes, dispatcher wait
/// included
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A transport operation to run on the connection
#[derive(Debug, Clone)]
pub enum Command {
    /// Read every block of a device in order
    GatherBlocks {
        register_type: RegisterType,
        blocks: Vec<ReadBlock>,
    },
    /// Read one block
    ReadBlock {
        register_type: RegisterType,
        start: u16,
        count: u16,
    },
    WriteRegister {
        address: u16,
        value: u16,
    },
    WriteRegisters {
        start: u16,
        values: Vec<u16>,
    },
    WriteCoil {
        address: u16,
        on: bool,
    },
    WriteCoils {
        start: u16,
        values: Vec<bool>,
    },
}

impl Command {
    fn kind(&self) -> &'static str {
        match self {
            Command::GatherBlocks { .. } => "gather",
            Command::ReadBlock { .. } => "read",
            Command::WriteRegister { .. }
            | Command::WriteRegisters { .. }
            | Command::WriteCoil { .. }
            | Command::WriteCoils { .. } => "write",
        }
    }
}

/// What a completed command hands back
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Gathered(Vec<BlockResult>),
    Words(Vec<u16>),
    Written,
}

struct QueuedRequest {
    priority: i32,
    seq: u64,
    command: Command,
    responder: oneshot::Sender<Result<CommandOutcome>>,
    cancel: CancellationToken,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Larger priority first; FIFO within a priority
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle for submitting requests to one connection's consumer task
pub struct Dispatcher {
    conn_id: String,
    tx: mpsc::UnboundedSender<QueuedRequest>,
    seq: AtomicU64,
}

impl Dispatcher {
    /// Spawn the consumer task for a connection
    pub fn spawn(connection: Arc<Connection>, shutdown: CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = connection.conn_id().to_string();

        tokio::spawn(consumer_loop(connection, rx, shutdown));

        Arc::new(Self {
            conn_id,
            tx,
            seq: AtomicU64::new(0),
        })
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Submit a command and wait for its outcome.
    ///
    /// The timeout covers queue wait plus execution. On timeout the request
    /// is cancelled; if it has not started it never touches the transport.
    pub async fn submit(
        &self,
        command: Command,
        priority: i32,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let cancel = CancellationToken::new();
        let (responder, response) = oneshot::channel();

        let request = QueuedRequest {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            command,
            responder,
            cancel: cancel.clone(),
        };

        self.tx.send(request).map_err(|_| {
            AcqError::Channel(format!("Dispatcher for '{}' is gone", self.conn_id))
        })?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AcqError::Channel(format!(
                "Dispatcher for '{}' dropped the request",
                self.conn_id
            ))),
            Err(_) => {
                cancel.cancel();
                Err(AcqError::Timeout(format!(
                    "Request on '{}' did not complete within {timeout:?}",
                    self.conn_id
                )))
            },
        }
    }

    /// Gather a device's blocks at background priority
    pub async fn gather(
        &self,
        register_type: RegisterType,
        blocks: Vec<ReadBlock>,
        priority: i32,
    ) -> Result<Vec<BlockResult>> {
        match self
            .submit(
                Command::GatherBlocks {
                    register_type,
                    blocks,
                },
                priority,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?
        {
            CommandOutcome::Gathered(results) => Ok(results),
            other => Err(AcqError::Internal(format!(
                "Gather returned unexpected outcome: {other:?}"
            ))),
        }
    }

    /// Read one block at the given priority
    pub async fn read_block(
        &self,
        register_type: RegisterType,
        start: u16,
        count: u16,
        priority: i32,
    ) -> Result<Vec<u16>> {
        match self
            .submit(
                Command::ReadBlock {
                    register_type,
                    start,
                    count,
                },
                priority,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?
        {
            CommandOutcome::Words(words) => Ok(words),
            other => Err(AcqError::Internal(format!(
                "Read returned unexpected outcome: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

async fn consumer_loop(
    connection: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    shutdown: CancellationToken,
) {
    let mut heap: BinaryHeap<QueuedRequest> = BinaryHeap::new();

    loop {
        if heap.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(request) => heap.push(request),
                    None => break,
                },
            }
        }

        // Everything that arrived while the previous request ran competes
        // on priority now
        while let Ok(request) = rx.try_recv() {
            heap.push(request);
        }

        let Some(request) = heap.pop() else { continue };

        if request.cancel.is_cancelled() {
            debug!(
                "Skipping cancelled {} request on '{}'",
                request.command.kind(),
                connection.conn_id()
            );
            let _ = request
                .responder
                .send(Err(AcqError::Cancelled("Cancelled before start".to_string())));
            continue;
        }

        // At most one request in flight: the await is the exclusion
        let result = connection.execute(&request.command).await;
        if let Err(e) = &result {
            debug!(
                "{} request on '{}' failed: {e}",
                request.command.kind(),
                connection.conn_id()
            );
        }
        let _ = request.responder.send(result);

        if shutdown.is_cancelled() {
            break;
        }
    }

    // Flush whatever is left so no caller hangs
    while let Ok(request) = rx.try_recv() {
        heap.push(request);
    }
    if !heap.is_empty() {
        warn!(
            "Dispatcher for '{}' dropping {} queued request(s) on shutdown",
            connection.conn_id(),
            heap.len()
        );
    }
    for request in heap.drain() {
        let _ = request
            .responder
            .send(Err(AcqError::Cancelled("Dispatcher shut down".to_string())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(priority: i32, seq: u64) -> QueuedRequest {
        let (responder, _rx) = oneshot::channel();
        QueuedRequest {
            priority,
            seq,
            command: Command::ReadBlock {
                register_type: RegisterType::Holding,
                start: 0,
                count: 1,
            },
            responder,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_heap_orders_by_priority_then_seq() {
        let mut heap = BinaryHeap::new();
        heap.push(request(PRIORITY_BACKGROUND_READ, 0));
        heap.push(request(PRIORITY_WRITE, 1));
        heap.push(request(PRIORITY_ON_DEMAND_READ, 2));
        heap.push(request(PRIORITY_WRITE, 3));

        let order: Vec<(i32, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|r| (r.priority, r.seq))
            .collect();
        assert_eq!(
            order,
            vec![
                (PRIORITY_WRITE, 1),
                (PRIORITY_WRITE, 3),
                (PRIORITY_ON_DEMAND_READ, 2),
                (PRIORITY_BACKGROUND_READ, 0),
            ]
        );
    }
}
