//! In-process [`DurableStore`] for tests and ephemeral servers.
//!
//! Can be switched unavailable, or made slow, to exercise retry,
//! degraded-mode and backpressure paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use super::record::{CheckpointRecord, LogRecord};
use super::{DurableStore, StoreError};

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<Uuid, CheckpointRecord>,
    log: BTreeMap<(Uuid, u64), LogRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    appends: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Block every read and write for `delay` before it runs.
    pub fn set_latency(&self, delay: Duration) {
        self.latency_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful appends so far.
    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }

    /// Successful flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Log records currently retained for a document.
    pub fn log_len(&self, document_id: Uuid) -> usize {
        self.lock()
            .map(|inner| {
                inner
                    .log
                    .range((document_id, 0)..=(document_id, u64::MAX))
                    .count()
            })
            .unwrap_or(0)
    }

    fn stall(&self) {
        let delay = self.latency_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl DurableStore for MemoryStore {
    fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.stall();
        self.check()?;
        self.lock()?
            .log
            .insert((record.document_id, record.version), record.clone());
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self, checkpoint: &CheckpointRecord) -> Result<u64, StoreError> {
        self.stall();
        self.check()?;
        let mut inner = self.lock()?;
        let document_id = checkpoint.document_id;
        if let Some(existing) = inner.checkpoints.get(&document_id) {
            if existing.version >= checkpoint.version {
                return Ok(0);
            }
        }

        let covered: Vec<(Uuid, u64)> = inner
            .log
            .range((document_id, 0)..=(document_id, checkpoint.version))
            .map(|(key, _)| *key)
            .collect();
        for key in &covered {
            inner.log.remove(key);
        }
        inner.checkpoints.insert(document_id, checkpoint.clone());
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(covered.len() as u64)
    }

    fn load(&self, document_id: Uuid) -> Result<Option<CheckpointRecord>, StoreError> {
        self.stall();
        self.check()?;
        Ok(self.lock()?.checkpoints.get(&document_id).cloned())
    }

    fn replay_from(&self, document_id: Uuid, after: u64) -> Result<Vec<LogRecord>, StoreError> {
        self.stall();
        self.check()?;
        if after == u64::MAX {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()?
            .log
            .range((document_id, after + 1)..=(document_id, u64::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        self.check()?;
        let inner = self.lock()?;
        let mut ids: Vec<Uuid> = inner.checkpoints.keys().copied().collect();
        ids.extend(inner.log.keys().map(|(id, _)| *id));
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doc: Uuid, version: u64) -> LogRecord {
        LogRecord::new(doc, version, Uuid::nil(), Some(version), 0, vec![1, 0])
    }

    #[test]
    fn test_flush_drops_covered_records() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        for v in 1..=5 {
            store.append(&record(doc, v)).unwrap();
        }
        let cp = CheckpointRecord {
            document_id: doc,
            version: 3,
            state: "abc".into(),
            created_at_ms: 0,
            applied_ids: Vec::new(),
        };
        assert_eq!(store.flush(&cp).unwrap(), 3);
        assert_eq!(store.log_len(doc), 2);
        assert_eq!(store.replay_from(doc, 3).unwrap().len(), 2);
        assert_eq!(store.load(doc).unwrap(), Some(cp));
        assert_eq!(store.flush_count(), 1);
    }

    #[test]
    fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        store.set_available(false);
        assert!(matches!(
            store.append(&record(doc, 1)),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.load(doc).is_err());
        assert!(store.list_documents().is_err());

        store.set_available(true);
        store.append(&record(doc, 1)).unwrap();
        assert_eq!(store.append_count(), 1);
        assert_eq!(store.list_documents().unwrap(), vec![doc]);
    }
}
