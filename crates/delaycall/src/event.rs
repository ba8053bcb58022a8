//! Observable dispatch events.
//!
//! Every routing-table insertion, sink invocation and routing-table removal is
//! published as a [`DispatchEvent`] on a broadcast channel. Insertions and
//! removals are published while the routing lock is held, so for any key the
//! event stream alternates `WorkerSpawned` / `WorkerRetired` with matching
//! generations.

use crate::SinkError;
use tokio::sync::broadcast;

/// Which component invoked the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPath {
    /// Executed synchronously by the dispatcher.
    Direct,
    /// Executed by the key's delay worker.
    Delayed { generation: u64 },
}

/// Outcome of one sink invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub key: String,
    pub sequence_id: u64,
    pub path: ExecutionPath,
    pub outcome: Result<(), SinkError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A routing entry was installed and its worker is about to start.
    WorkerSpawned { key: String, generation: u64 },
    Executed(Receipt),
    /// A worker removed its routing entry and exited after processing
    /// `processed` requests.
    WorkerRetired {
        key: String,
        generation: u64,
        processed: u64,
    },
}

/// Sending half shared by the dispatcher, routing table and workers.
#[derive(Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    /// Never blocks. Events published with no subscriber are discarded.
    pub(crate) fn publish(&self, event: DispatchEvent) {
        let _ = self.tx.send(event);
    }
}
