//! Durable storage for document checkpoints and the operation log.
//!
//! ```text
//! ┌────────────┐  append(record)   ┌──────────────────────────────────┐
//! │ Sequencer  │ ────────────────► │ DurableStore                     │
//! │ (per doc)  │  flush(checkpoint)│  checkpoints — full state (LZ4)  │
//! └─────┬──────┘ ────────────────► │  oplog       — applied ops       │
//!       │                          │  metadata    — per-doc summary   │
//!       │ load + replay_from       └──────────────────────────────────┘
//!       ▼
//! ┌────────────┐
//! │ Document   │  checkpoint state + ops after checkpoint.version
//! └────────────┘
//! ```
//!
//! Every operation is appended to the log before its author is acknowledged.
//! A flush writes the checkpoint and drops the log prefix it covers in one
//! atomic step, so a crash between the two can never lose an operation.

pub mod memory;
pub mod record;
pub mod rocks;

use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use record::{CheckpointRecord, LogRecord};
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Backend for checkpoints and the operation log.
///
/// Implementations are synchronous; calls are short and issued from the
/// owning document's sequencer task only.
pub trait DurableStore: Send + Sync + 'static {
    /// Append one applied operation. Appending a version that is already
    /// present overwrites it with identical content.
    fn append(&self, record: &LogRecord) -> Result<(), StoreError>;

    /// Atomically store `checkpoint` and drop log records with
    /// `version <= checkpoint.version`. A checkpoint older than the stored
    /// one is ignored. Returns the number of log records dropped.
    fn flush(&self, checkpoint: &CheckpointRecord) -> Result<u64, StoreError>;

    /// Latest checkpoint for a document, if any.
    fn load(&self, document_id: Uuid) -> Result<Option<CheckpointRecord>, StoreError>;

    /// Log records with `version > after`, in version order.
    fn replay_from(&self, document_id: Uuid, after: u64) -> Result<Vec<LogRecord>, StoreError>;

    /// Every document with a checkpoint or a log record.
    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Corrupted log record for document {document_id} at version {version}")]
    Corrupted { document_id: Uuid, version: u64 },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
