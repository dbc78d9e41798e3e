//! Read-only engine events for external observers (approval workflows,
//! notifications, audit).
//!
//! Events go out on a bounded broadcast channel. A lagging observer loses
//! the oldest events; the engine never waits for observers.

use tokio::sync::broadcast;

use crate::protocol::{DocumentId, UserId};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    OperationApplied {
        document_id: DocumentId,
        version: u64,
        author_id: UserId,
    },
    CheckpointWritten {
        document_id: DocumentId,
        version: u64,
    },
    /// `degraded` flips to true when checkpoints keep failing and back to
    /// false once a flush succeeds.
    DocumentDegraded {
        document_id: DocumentId,
        degraded: bool,
    },
    DocumentLoaded {
        document_id: DocumentId,
        version: u64,
    },
    DocumentEvicted {
        document_id: DocumentId,
        version: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No observers is the common case.
        let _ = self.tx.send(event);
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
