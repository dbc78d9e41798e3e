//! Canonical document state owned by a sequencer.
//!
//! ```text
//!  checkpoint_version            oldest_replayable        version
//!        │                              │                    │
//!  ──────┼──────────────────────────────┼────────────────────┤
//!        │◄──────── applied_log (since last checkpoint) ────►│
//!                                       │◄── history window ►│
//! ```
//!
//! `applied_log` is truncated on every successful checkpoint; `history` is a
//! fixed-size window that survives truncation so slightly stale submissions
//! can still be transformed.
//!
//! The latest `(author, client_op_id)` pairs of each author are remembered
//! and written into checkpoints, so a retried submission is recognised even
//! after the log that carried it was truncated.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tandem_ot::{transform, Operation};

use crate::error::CollabError;
use crate::protocol::{CheckpointState, DocumentId, ProtocolError, UserId, VersionedOperation};

/// An operation after the sequencer has ordered and applied it.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub document_id: DocumentId,
    pub version: u64,
    /// The operation as applied, i.e. already transformed to the prior version.
    pub operation: Operation,
    pub author_id: UserId,
    pub client_op_id: Option<u64>,
    pub applied_at_ms: u64,
}

impl AppliedOperation {
    pub fn to_versioned(&self) -> Result<VersionedOperation, CollabError> {
        Ok(VersionedOperation {
            version: self.version,
            author_id: self.author_id,
            client_op_id: self.client_op_id,
            operation: encode_operation(&self.operation)?,
            applied_at_ms: self.applied_at_ms,
        })
    }
}

/// Recent ids remembered per author.
pub const RECENT_IDS_PER_AUTHOR: usize = 64;

/// Version a client-tagged operation was applied at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedId {
    pub author_id: UserId,
    pub client_op_id: u64,
    pub version: u64,
}

/// Persisted full state of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub document_id: DocumentId,
    pub version: u64,
    pub state: String,
    pub created_at_ms: u64,
    /// Recent client ids as of `version`.
    pub applied_ids: Vec<AppliedId>,
}

/// What a subscriber needs to catch up to the current version.
#[derive(Debug, Clone, PartialEq)]
pub enum Bootstrap {
    /// Operations after the subscriber's last seen version.
    Replay(Vec<AppliedOperation>),
    /// Last checkpoint plus every operation applied since.
    Checkpoint {
        checkpoint: CheckpointState,
        operations: Vec<AppliedOperation>,
    },
}

pub struct Document {
    id: DocumentId,
    state: String,
    len: usize,
    version: u64,
    applied_log: Vec<AppliedOperation>,
    history: VecDeque<AppliedOperation>,
    window: usize,
    checkpoint_version: u64,
    checkpoint_state: String,
    recent_ids: HashMap<UserId, VecDeque<AppliedId>>,
}

impl Document {
    /// A brand-new empty document at version 0.
    pub fn new(id: DocumentId, window: usize) -> Self {
        Self {
            id,
            state: String::new(),
            len: 0,
            version: 0,
            applied_log: Vec::new(),
            history: VecDeque::new(),
            window: window.max(1),
            checkpoint_version: 0,
            checkpoint_state: String::new(),
            recent_ids: HashMap::new(),
        }
    }

    /// Rebuild from the latest checkpoint and the log records after it.
    pub fn restore(
        id: DocumentId,
        checkpoint: Option<Checkpoint>,
        log: Vec<AppliedOperation>,
        window: usize,
    ) -> Result<Self, CollabError> {
        let mut doc = Self::new(id, window);
        if let Some(checkpoint) = checkpoint {
            doc.len = checkpoint.state.chars().count();
            doc.state = checkpoint.state.clone();
            doc.version = checkpoint.version;
            doc.checkpoint_version = checkpoint.version;
            doc.checkpoint_state = checkpoint.state;
            for id in checkpoint.applied_ids {
                doc.remember(id);
            }
        }

        for entry in log {
            if entry.version <= doc.version {
                continue;
            }
            if entry.version != doc.version + 1 {
                return Err(CollabError::BaseVersionMismatch {
                    document_id: id,
                    detail: format!(
                        "log jumps from version {} to {}",
                        doc.version, entry.version
                    ),
                });
            }
            doc.state = entry.operation.apply(&doc.state).map_err(|e| {
                CollabError::BaseVersionMismatch {
                    document_id: id,
                    detail: format!("replaying version {}: {e}", entry.version),
                }
            })?;
            doc.len = entry.operation.target_len();
            doc.version = entry.version;
            doc.record(entry);
        }
        Ok(doc)
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn applied_log(&self) -> &[AppliedOperation] {
        &self.applied_log
    }

    pub fn checkpoint_version(&self) -> u64 {
        self.checkpoint_version
    }

    /// Operations applied since the last checkpoint.
    pub fn ops_since_checkpoint(&self) -> u64 {
        self.version - self.checkpoint_version
    }

    /// Lowest base version a submission may still carry.
    pub fn oldest_replayable(&self) -> u64 {
        self.version - self.history.len() as u64
    }

    /// Version at which `author_id`'s operation `client_op_id` was applied,
    /// if it is among that author's recent operations.
    pub fn applied_version(&self, author_id: UserId, client_op_id: u64) -> Option<u64> {
        self.recent_ids
            .get(&author_id)?
            .iter()
            .rev()
            .find(|id| id.client_op_id == client_op_id)
            .map(|id| id.version)
    }

    /// Sequence `op`, generated against `base_version`, into the document.
    ///
    /// Stale submissions are transformed against every operation applied
    /// after their base, with the applied operation taking insert priority.
    pub fn submit(
        &mut self,
        op: Operation,
        base_version: u64,
        author_id: UserId,
        client_op_id: Option<u64>,
    ) -> Result<AppliedOperation, CollabError> {
        if base_version > self.version {
            return Err(CollabError::InvalidBaseVersion {
                base: base_version,
                current: self.version,
            });
        }
        let oldest = self.oldest_replayable();
        if base_version < oldest {
            return Err(CollabError::ResyncRequired {
                base: base_version,
                oldest,
                current: self.version,
            });
        }

        let skip = (base_version - oldest) as usize;
        let expected_len = self
            .history
            .get(skip)
            .map_or(self.len, |next| next.operation.base_len());
        if op.base_len() != expected_len {
            return Err(CollabError::MalformedOperation {
                reason: format!(
                    "operation spans {} chars, document had {} at version {}",
                    op.base_len(),
                    expected_len,
                    base_version
                ),
                current: self.version,
            });
        }

        let mut rebased = op;
        for applied in self.history.iter().skip(skip) {
            let (_, transformed) = transform(&applied.operation, &rebased)
                .map_err(|e| self.inconsistent(format!("transform at v{}: {e}", applied.version)))?;
            rebased = transformed;
        }

        let new_state = rebased
            .apply(&self.state)
            .map_err(|e| self.inconsistent(format!("apply at v{}: {e}", self.version)))?;

        self.state = new_state;
        self.len = rebased.target_len();
        self.version += 1;
        let applied = AppliedOperation {
            document_id: self.id,
            version: self.version,
            operation: rebased,
            author_id,
            client_op_id,
            applied_at_ms: now_ms(),
        };
        self.record(applied.clone());
        Ok(applied)
    }

    /// Operations applied after `version`, or `None` once `version` has
    /// fallen out of the history window.
    pub fn history_since(
        &self,
        version: u64,
    ) -> Option<impl Iterator<Item = &AppliedOperation> + '_> {
        let oldest = self.oldest_replayable();
        if version < oldest || version > self.version {
            return None;
        }
        Some(self.history.iter().skip((version - oldest) as usize))
    }

    /// Everything `subscriber`, which last saw `last_seen`, needs.
    pub fn bootstrap(
        &self,
        last_seen: Option<u64>,
        subscriber: UserId,
    ) -> Result<Bootstrap, CollabError> {
        if let Some(seen) = last_seen {
            if seen > self.version {
                return Err(CollabError::InvalidBaseVersion {
                    base: seen,
                    current: self.version,
                });
            }
            if seen >= self.oldest_replayable() {
                let skip = (seen - self.oldest_replayable()) as usize;
                return Ok(Bootstrap::Replay(
                    self.history.iter().skip(skip).cloned().collect(),
                ));
            }
        }
        Ok(Bootstrap::Checkpoint {
            checkpoint: CheckpointState {
                version: self.checkpoint_version,
                state: self.checkpoint_state.clone(),
                applied_op_ids: self
                    .recent_ids
                    .get(&subscriber)
                    .into_iter()
                    .flatten()
                    .filter(|id| id.version <= self.checkpoint_version)
                    .map(|id| id.client_op_id)
                    .collect(),
            },
            operations: self.applied_log.clone(),
        })
    }

    /// Current state as a checkpoint.
    pub fn snapshot(&self) -> Checkpoint {
        Checkpoint {
            document_id: self.id,
            version: self.version,
            state: self.state.clone(),
            created_at_ms: now_ms(),
            applied_ids: self.recent_ids.values().flatten().copied().collect(),
        }
    }

    /// A checkpoint covering `checkpoint.version` has been persisted.
    pub fn mark_checkpointed(&mut self, checkpoint: &Checkpoint) {
        if checkpoint.version <= self.checkpoint_version {
            return;
        }
        self.applied_log.retain(|op| op.version > checkpoint.version);
        self.checkpoint_version = checkpoint.version;
        self.checkpoint_state = checkpoint.state.clone();
    }

    fn record(&mut self, applied: AppliedOperation) {
        if let Some(client_op_id) = applied.client_op_id {
            self.remember(AppliedId {
                author_id: applied.author_id,
                client_op_id,
                version: applied.version,
            });
        }
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(applied.clone());
        self.applied_log.push(applied);
    }

    fn remember(&mut self, id: AppliedId) {
        let ids = self.recent_ids.entry(id.author_id).or_default();
        if ids.len() == RECENT_IDS_PER_AUTHOR {
            ids.pop_front();
        }
        ids.push_back(id);
    }

    fn inconsistent(&self, detail: String) -> CollabError {
        CollabError::BaseVersionMismatch {
            document_id: self.id,
            detail,
        }
    }
}

pub(crate) fn encode_operation(op: &Operation) -> Result<Vec<u8>, CollabError> {
    tandem_ot::encode(op).map_err(|e| ProtocolError::Serialization(e.to_string()).into())
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
