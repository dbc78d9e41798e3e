//! Persistence integration tests.
//!
//! Verifies:
//! - Documents survive an orderly restart
//! - Acknowledged operations survive a crash before any checkpoint
//! - Recovery from a checkpoint plus a log tail
//! - Store outages degrade a document without losing operations
//! - Multi-document isolation on disk

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tandem_collab::storage::{DurableStore, MemoryStore, RocksStore, StoreConfig};
use tandem_collab::{
    CheckpointPolicy, CheckpointStore, CollabEngine, OpenAuthenticator, ServerConfig, Submission,
};
use tandem_ot::Operation;
use tempfile::tempdir;
use uuid::Uuid;

/// Checkpoints only when asked and documents stay loaded.
fn config(path: Option<&Path>) -> ServerConfig {
    let mut config = ServerConfig::for_testing();
    config.storage_path = path.map(Path::to_path_buf);
    config.sequencer.hibernate_after = Duration::from_secs(60);
    config.sequencer.checkpoint = CheckpointPolicy {
        max_ops: 1000,
        max_interval: Duration::from_secs(60),
        ..config.sequencer.checkpoint
    };
    config
}

fn open(path: &Path) -> CollabEngine {
    CollabEngine::open(config(Some(path)), Arc::new(OpenAuthenticator)).unwrap()
}

fn append(doc_len: usize, text: &str, base: u64) -> Submission {
    Submission {
        operation: tandem_ot::encode(&Operation::insert_at(doc_len, doc_len, text).unwrap())
            .unwrap(),
        base_version: base,
        author_id: Uuid::new_v4(),
        client_op_id: None,
        origin: None,
    }
}

/// Append `words` one submission at a time.
async fn write_words(engine: &CollabEngine, doc: Uuid, words: &[&str]) {
    let mut len = 0;
    for (i, word) in words.iter().enumerate() {
        engine.submit(doc, append(len, word, i as u64)).await.unwrap();
        len += word.chars().count();
    }
}

fn current_thread() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_document_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();

    let engine = open(&path);
    write_words(&engine, doc, &["persist", "ent ", "state"]).await;
    engine.shutdown().await;
    drop(engine);

    let engine = open(&path);
    assert_eq!(engine.stored_documents().unwrap(), vec![doc]);
    let snapshot = engine.snapshot(doc).await.unwrap();
    assert_eq!(snapshot.content, "persistent state");
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.checkpoint_version, 3);
    engine.shutdown().await;
}

#[test]
fn test_acknowledged_operations_survive_crash() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();

    // The runtime is dropped with the actors still alive: no final flush.
    current_thread().block_on(async {
        let engine = open(&path);
        write_words(&engine, doc, &["a", "b", "c", "d", "e"]).await;
        let snapshot = engine.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.checkpoint_version, 0);
        assert_eq!(snapshot.unpersisted, 0);
    });

    current_thread().block_on(async {
        let engine = open(&path);
        let snapshot = engine.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.content, "abcde");
        assert_eq!(snapshot.version, 5);
        assert_eq!(snapshot.checkpoint_version, 0);
        engine.shutdown().await;
    });
}

#[test]
fn test_recovery_from_checkpoint_and_log_tail() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Uuid::new_v4();

    current_thread().block_on(async {
        let engine = open(&path);
        write_words(&engine, doc, &["one ", "two "]).await;
        assert_eq!(engine.flush(doc).await.unwrap(), 2);
        engine.submit(doc, append(8, "three", 2)).await.unwrap();
    });

    let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
    assert_eq!(store.load(doc).unwrap().map(|cp| cp.version), Some(2));
    let tail: Vec<u64> = store
        .replay_from(doc, 2)
        .unwrap()
        .iter()
        .map(|record| record.version)
        .collect();
    assert_eq!(tail, vec![3]);

    let document = CheckpointStore::new(Arc::new(store))
        .load_document(doc, 16)
        .unwrap();
    assert_eq!(document.state(), "one two three");
    assert_eq!(document.version(), 3);
    assert_eq!(document.checkpoint_version(), 2);
}

#[tokio::test]
async fn test_store_outage_keeps_accepting_edits() {
    let backend = Arc::new(MemoryStore::new());
    let engine = CollabEngine::with_store(
        config(None),
        Arc::new(OpenAuthenticator),
        backend.clone(),
    );
    let doc = Uuid::new_v4();
    write_words(&engine, doc, &["up"]).await;

    backend.set_available(false);
    engine.submit(doc, append(2, " down", 1)).await.unwrap();
    engine.submit(doc, append(7, " still", 2)).await.unwrap();
    let snapshot = engine.snapshot(doc).await.unwrap();
    assert_eq!(snapshot.unpersisted, 2);
    assert!(snapshot.degraded);
    assert!(engine.flush(doc).await.is_err());

    backend.set_available(true);
    assert_eq!(engine.flush(doc).await.unwrap(), 3);
    let snapshot = engine.snapshot(doc).await.unwrap();
    assert_eq!(snapshot.content, "up down still");
    assert_eq!(snapshot.unpersisted, 0);
    assert!(!snapshot.degraded);
    assert_eq!(backend.log_len(doc), 0);
}

#[tokio::test]
async fn test_documents_are_isolated_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let docs: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    let engine = open(&path);
    for (n, doc) in docs.iter().enumerate() {
        let text = format!("document {n}");
        write_words(&engine, *doc, &[text.as_str()]).await;
    }
    engine.shutdown().await;
    drop(engine);

    let engine = open(&path);
    let mut stored = engine.stored_documents().unwrap();
    stored.sort();
    let mut expected = docs.clone();
    expected.sort();
    assert_eq!(stored, expected);
    for (n, doc) in docs.iter().enumerate() {
        let snapshot = engine.snapshot(*doc).await.unwrap();
        assert_eq!(snapshot.content, format!("document {n}"));
        assert_eq!(snapshot.version, 1);
    }
    engine.shutdown().await;
}
