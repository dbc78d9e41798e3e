//! Checkpointing: durable store access in document terms, and the flush
//! schedule that decides when to write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CheckpointPolicy;
use crate::document::{AppliedOperation, Checkpoint, Document};
use crate::error::CollabError;
use crate::protocol::DocumentId;
use crate::storage::{CheckpointRecord, DurableStore, LogRecord, StoreError};

/// Typed facade over a [`DurableStore`].
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn DurableStore>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn append(&self, applied: &AppliedOperation) -> Result<(), StoreError> {
        self.store.append(&LogRecord::from_applied(applied)?)
    }

    /// Persist a document snapshot and drop the log prefix it covers. The
    /// caller marks the document checkpointed once this returns.
    pub fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let dropped = self
            .store
            .flush(&CheckpointRecord::from_checkpoint(checkpoint))?;
        log::debug!(
            "Checkpointed {} at v{} ({dropped} log records dropped)",
            checkpoint.document_id,
            checkpoint.version
        );
        Ok(())
    }

    pub fn load(&self, document_id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .store
            .load(document_id)?
            .map(CheckpointRecord::into_checkpoint))
    }

    /// Applied operations with `version > after`, integrity-checked.
    pub fn replay_from(
        &self,
        document_id: DocumentId,
        after: u64,
    ) -> Result<Vec<AppliedOperation>, StoreError> {
        self.store
            .replay_from(document_id, after)?
            .iter()
            .map(LogRecord::to_applied)
            .collect()
    }

    /// Rebuild a document from its checkpoint and log. A document that was
    /// never stored comes back empty at version 0.
    pub fn load_document(
        &self,
        document_id: DocumentId,
        window: usize,
    ) -> Result<Document, CollabError> {
        let unavailable = |detail: String| CollabError::DocumentUnavailable {
            document_id,
            detail,
        };
        let checkpoint = self.load(document_id).map_err(|e| unavailable(e.to_string()))?;
        let after = checkpoint.as_ref().map_or(0, |cp| cp.version);
        let log = self
            .replay_from(document_id, after)
            .map_err(|e| unavailable(e.to_string()))?;
        let replayed = log.len();
        let document = Document::restore(document_id, checkpoint, log, window)
            .map_err(|e| unavailable(e.to_string()))?;
        log::info!(
            "Loaded document {document_id} at v{} (checkpoint v{}, {replayed} ops replayed)",
            document.version(),
            document.checkpoint_version()
        );
        Ok(document)
    }
}

/// Decides when a document is due for a checkpoint.
///
/// Due once `max_ops` operations are pending or the oldest pending one is
/// `max_interval` old. Failed flushes back off exponentially; continuous
/// failure for `degraded_after` marks the document degraded.
#[derive(Debug, Clone)]
pub struct FlushSchedule {
    policy: CheckpointPolicy,
    pending_ops: u64,
    pending_since: Option<Instant>,
    failures: u32,
    failing_since: Option<Instant>,
    retry_at: Option<Instant>,
}

impl FlushSchedule {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            pending_ops: 0,
            pending_since: None,
            failures: 0,
            failing_since: None,
            retry_at: None,
        }
    }

    pub fn record_op(&mut self) {
        self.record_op_at(Instant::now());
    }

    pub fn record_op_at(&mut self, now: Instant) {
        self.pending_ops += 1;
        self.pending_since.get_or_insert(now);
    }

    pub fn is_due(&self) -> bool {
        self.is_due_at(Instant::now())
    }

    pub fn is_due_at(&self, now: Instant) -> bool {
        if self.pending_ops == 0 && self.failures == 0 {
            return false;
        }
        if let Some(retry_at) = self.retry_at {
            return now >= retry_at;
        }
        self.pending_ops >= self.policy.max_ops
            || self
                .pending_since
                .is_some_and(|since| now.duration_since(since) >= self.policy.max_interval)
    }

    pub fn on_success(&mut self) {
        if self.failures > 0 {
            log::info!("Checkpoint succeeded after {} failed attempts", self.failures);
        }
        self.pending_ops = 0;
        self.pending_since = None;
        self.failures = 0;
        self.failing_since = None;
        self.retry_at = None;
    }

    pub fn on_failure(&mut self) {
        self.on_failure_at(Instant::now());
    }

    pub fn on_failure_at(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.failing_since.get_or_insert(now);
        self.retry_at = Some(now + self.backoff());
    }

    /// Delay before the next attempt after the current run of failures.
    pub fn backoff(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(16);
        self.policy
            .retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.policy.retry_max)
    }

    pub fn is_degraded_at(&self, now: Instant) -> bool {
        self.failing_since
            .is_some_and(|since| now.duration_since(since) >= self.policy.degraded_after)
    }

    pub fn pending_ops(&self) -> u64 {
        self.pending_ops
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use tandem_ot::Operation;
    use uuid::Uuid;

    fn policy() -> CheckpointPolicy {
        CheckpointPolicy {
            max_ops: 3,
            max_interval: Duration::from_secs(5),
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_millis(350),
            degraded_after: Duration::from_secs(1),
        }
    }

    fn edit(doc: &mut Document, text: &str) -> AppliedOperation {
        let op = Operation::insert_at(doc.len(), doc.len(), text).unwrap();
        let version = doc.version();
        doc.submit(op, version, Uuid::nil(), None).unwrap()
    }

    #[test]
    fn test_due_after_max_ops() {
        let now = Instant::now();
        let mut schedule = FlushSchedule::new(policy());
        assert!(!schedule.is_due_at(now));
        schedule.record_op_at(now);
        schedule.record_op_at(now);
        assert!(!schedule.is_due_at(now));
        schedule.record_op_at(now);
        assert!(schedule.is_due_at(now));
        schedule.on_success();
        assert!(!schedule.is_due_at(now));
    }

    #[test]
    fn test_due_after_max_interval() {
        let start = Instant::now();
        let mut schedule = FlushSchedule::new(policy());
        schedule.record_op_at(start);
        assert!(!schedule.is_due_at(start + Duration::from_secs(4)));
        assert!(schedule.is_due_at(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_failure_backoff_and_degraded() {
        let start = Instant::now();
        let mut schedule = FlushSchedule::new(policy());
        schedule.record_op_at(start);

        schedule.on_failure_at(start);
        assert_eq!(schedule.backoff(), Duration::from_millis(100));
        assert!(!schedule.is_due_at(start + Duration::from_millis(50)));
        assert!(schedule.is_due_at(start + Duration::from_millis(100)));

        schedule.on_failure_at(start);
        assert_eq!(schedule.backoff(), Duration::from_millis(200));
        schedule.on_failure_at(start);
        assert_eq!(schedule.backoff(), Duration::from_millis(350));

        assert!(!schedule.is_degraded_at(start + Duration::from_millis(999)));
        assert!(schedule.is_degraded_at(start + Duration::from_secs(1)));

        schedule.on_success();
        assert!(!schedule.is_degraded_at(start + Duration::from_secs(10)));
        assert_eq!(schedule.failures(), 0);
    }

    #[test]
    fn test_flush_load_replay_roundtrip() {
        let store = CheckpointStore::new(Arc::new(MemoryStore::new()));
        let id = Uuid::new_v4();
        let mut doc = Document::new(id, 8);

        for text in ["alpha ", "beta "] {
            let applied = edit(&mut doc, text);
            store.append(&applied).unwrap();
        }
        let snapshot = doc.snapshot();
        store.write_checkpoint(&snapshot).unwrap();
        doc.mark_checkpointed(&snapshot);
        assert!(doc.applied_log().is_empty());

        let applied = edit(&mut doc, "gamma");
        store.append(&applied).unwrap();

        let checkpoint = store.load(id).unwrap().unwrap();
        assert_eq!(checkpoint.version, 2);
        assert_eq!(checkpoint.state, "alpha beta ");
        let tail = store.replay_from(id, checkpoint.version).unwrap();
        assert_eq!(tail.len(), 1);

        let restored = store.load_document(id, 8).unwrap();
        assert_eq!(restored.state(), doc.state());
        assert_eq!(restored.version(), 3);
    }

    #[test]
    fn test_unknown_document_loads_empty() {
        let store = CheckpointStore::new(Arc::new(MemoryStore::new()));
        let doc = store.load_document(Uuid::new_v4(), 8).unwrap();
        assert_eq!(doc.version(), 0);
        assert_eq!(doc.state(), "");
    }

    #[test]
    fn test_load_failure_is_unavailable() {
        let backend = Arc::new(MemoryStore::new());
        backend.set_available(false);
        let store = CheckpointStore::new(backend);
        assert!(matches!(
            store.load_document(Uuid::new_v4(), 8),
            Err(CollabError::DocumentUnavailable { .. })
        ));
    }
}
