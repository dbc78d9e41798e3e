//! The assembled engine: store, sequencers, broadcaster and connections.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::broadcast::{BroadcastStats, SessionBroadcaster};
use crate::checkpoint::CheckpointStore;
use crate::config::ServerConfig;
use crate::connection::ConnectionManager;
use crate::error::CollabError;
use crate::observer::{EngineEvent, EventBus};
use crate::protocol::DocumentId;
use crate::sequencer::{DocumentRegistry, DocumentSnapshot, Submission};
use crate::storage::{DurableStore, MemoryStore, RocksStore, StoreConfig};

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub loaded_documents: usize,
    pub broadcast: BroadcastStats,
}

pub struct CollabEngine {
    config: ServerConfig,
    store: CheckpointStore,
    events: EventBus,
    broadcaster: Arc<SessionBroadcaster>,
    registry: Arc<DocumentRegistry>,
    connections: Arc<ConnectionManager>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl CollabEngine {
    /// Build an engine on RocksDB when `storage_path` is set, in memory
    /// otherwise.
    pub fn open(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, CollabError> {
        let store: Arc<dyn DurableStore> = match &config.storage_path {
            Some(path) => {
                log::info!("Opening document store at {}", path.display());
                Arc::new(RocksStore::open(StoreConfig::new(path.clone()))?)
            }
            None => {
                log::info!("No storage path configured; documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, authenticator, store))
    }

    pub fn with_store(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        let store = CheckpointStore::new(store);
        let events = EventBus::default();
        let broadcaster = Arc::new(SessionBroadcaster::new(config.max_participants_per_document));
        let registry = Arc::new(DocumentRegistry::new(
            store.clone(),
            broadcaster.clone(),
            events.clone(),
            config.sequencer.clone(),
        ));
        let connections = Arc::new(ConnectionManager::new(
            authenticator,
            registry.clone(),
            broadcaster.clone(),
            config.outbound_queue_capacity,
            config.liveness_timeout(),
        ));
        Self {
            config,
            store,
            events,
            broadcaster,
            registry,
            connections,
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<SessionBroadcaster> {
        &self.broadcaster
    }

    /// Read-only event stream for approval and notification hooks.
    pub fn observe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Start the heartbeat reaper. Must be called inside a tokio runtime;
    /// later calls are no-ops.
    pub fn start_reaper(&self) {
        let Ok(mut slot) = self.reaper.lock() else {
            return;
        };
        if slot.is_none() {
            *slot = Some(self.connections.spawn_reaper(self.config.heartbeat_interval));
        }
    }

    /// Sequence an operation outside any connection (imports, tooling).
    pub async fn submit(
        &self,
        document_id: DocumentId,
        submission: Submission,
    ) -> Result<u64, CollabError> {
        self.registry.submit(document_id, submission).await
    }

    pub async fn snapshot(&self, document_id: DocumentId) -> Result<DocumentSnapshot, CollabError> {
        self.registry.snapshot(document_id).await
    }

    pub async fn flush(&self, document_id: DocumentId) -> Result<u64, CollabError> {
        self.registry.flush(document_id).await
    }

    /// Every document the store knows about, loaded or not.
    pub fn stored_documents(&self) -> Result<Vec<DocumentId>, CollabError> {
        Ok(self.store.backend().list_documents()?)
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            active_connections: self.connections.connection_count().await,
            total_connections: self.connections.total_accepted(),
            loaded_documents: self.registry.loaded_documents().await.len(),
            broadcast: self.broadcaster.stats().await,
        }
    }

    /// Close every connection, then flush and stop every document.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.reaper.lock() {
            if let Some(reaper) = slot.take() {
                reaper.abort();
            }
        }
        self.connections.shutdown().await;
        self.registry.shutdown().await;
        log::info!("Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OpenAuthenticator;
    use tandem_ot::Operation;
    use uuid::Uuid;

    fn engine() -> CollabEngine {
        CollabEngine::open(ServerConfig::for_testing(), Arc::new(OpenAuthenticator)).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_engine_round_trip() {
        let engine = engine();
        let doc = Uuid::new_v4();
        let op = Operation::insert_at(0, 0, "notes").unwrap();
        let version = engine
            .submit(
                doc,
                Submission {
                    operation: tandem_ot::encode(&op).unwrap(),
                    base_version: 0,
                    author_id: Uuid::new_v4(),
                    client_op_id: None,
                    origin: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(engine.snapshot(doc).await.unwrap().content, "notes");
        assert_eq!(engine.flush(doc).await.unwrap(), 1);
        assert_eq!(engine.stored_documents().unwrap(), vec![doc]);
    }

    #[tokio::test]
    async fn test_stats_and_shutdown() {
        let engine = engine();
        engine.start_reaper();
        engine.start_reaper();
        let accepted = engine.connections().accept("alice").await.unwrap();
        let stats = engine.stats().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_connections, 1);

        engine.shutdown().await;
        assert_eq!(engine.stats().await.active_connections, 0);
        assert!(accepted.handle.close_reason().is_some());
    }

    #[test]
    fn test_open_with_rocksdb() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("docs")),
            ..ServerConfig::for_testing()
        };
        let engine = CollabEngine::open(config, Arc::new(OpenAuthenticator)).unwrap();
        assert!(engine.stored_documents().unwrap().is_empty());
    }
}
