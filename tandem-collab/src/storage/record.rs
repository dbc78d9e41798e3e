//! Durable record formats.
//!
//! Log record layout (bincode, standard config):
//! ```text
//! ┌──────────┬─────────┬───────────┬──────────────┬─────────────┬───────────┬──────────┐
//! │ doc_id   │ version │ author_id │ client_op_id │ applied_at  │ operation │ checksum │
//! │ 16 bytes │ varint  │ 16 bytes  │ Option<u64>  │ varint (ms) │ codec     │ u32      │
//! └──────────┴─────────┴───────────┴──────────────┴─────────────┴───────────┴──────────┘
//! ```
//! The checksum is FNV-1a style over every other field. A record that fails
//! verification is treated as corruption, never silently replayed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{AppliedId, AppliedOperation, Checkpoint};
use crate::storage::StoreError;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// One applied operation in the durable log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub document_id: Uuid,
    pub version: u64,
    pub author_id: Uuid,
    pub client_op_id: Option<u64>,
    pub applied_at_ms: u64,
    /// Operation in the binary codec form.
    pub operation: Vec<u8>,
    pub checksum: u32,
}

impl LogRecord {
    pub fn new(
        document_id: Uuid,
        version: u64,
        author_id: Uuid,
        client_op_id: Option<u64>,
        applied_at_ms: u64,
        operation: Vec<u8>,
    ) -> Self {
        let mut record = Self {
            document_id,
            version,
            author_id,
            client_op_id,
            applied_at_ms,
            operation,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    pub fn from_applied(applied: &AppliedOperation) -> Result<Self, StoreError> {
        let operation = tandem_ot::encode(&applied.operation)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self::new(
            applied.document_id,
            applied.version,
            applied.author_id,
            applied.client_op_id,
            applied.applied_at_ms,
            operation,
        ))
    }

    /// Decode back into an applied operation, verifying integrity first.
    pub fn to_applied(&self) -> Result<AppliedOperation, StoreError> {
        if !self.verify() {
            return Err(StoreError::Corrupted {
                document_id: self.document_id,
                version: self.version,
            });
        }
        let operation = tandem_ot::decode(&self.operation)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(AppliedOperation {
            document_id: self.document_id,
            version: self.version,
            operation,
            author_id: self.author_id,
            client_op_id: self.client_op_id,
            applied_at_ms: self.applied_at_ms,
        })
    }

    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    fn compute_checksum(&self) -> u32 {
        let mut hash = FNV_OFFSET;
        let mut mix = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u32;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };
        mix(self.document_id.as_bytes());
        mix(&self.version.to_le_bytes());
        mix(self.author_id.as_bytes());
        mix(&self.client_op_id.map_or([0xFF; 8], u64::to_le_bytes));
        mix(&self.applied_at_ms.to_le_bytes());
        mix(&self.operation);
        hash
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Full document state as of `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub document_id: Uuid,
    pub version: u64,
    pub state: String,
    pub created_at_ms: u64,
    pub applied_ids: Vec<AppliedId>,
}

impl CheckpointRecord {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            document_id: checkpoint.document_id,
            version: checkpoint.version,
            state: checkpoint.state.clone(),
            created_at_ms: checkpoint.created_at_ms,
            applied_ids: checkpoint.applied_ids.clone(),
        }
    }

    pub fn into_checkpoint(self) -> Checkpoint {
        Checkpoint {
            document_id: self.document_id,
            version: self.version,
            state: self.state,
            created_at_ms: self.created_at_ms,
            applied_ids: self.applied_ids,
        }
    }

    /// Encode and LZ4-compress.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}
