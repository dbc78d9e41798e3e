//! # tandem-collab — Real-time collaboration engine for Tandem
//!
//! Operational-Transform editing over WebSocket with one sequencer per
//! document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer      │
//! │ (per user)  │     Binary Proto    │ ConnectionMgr   │
//! └──────┬──────┘                     └────────┬────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                    ┌─────────────────┐     ┌──────────────────┐
//! │ClientDocument│                    │ DocumentActor   │────►│ CheckpointStore  │
//! │ (rebase)     │                    │ (one per doc)   │     │ (RocksDB / mem)  │
//! └──────────────┘                    └────────┬────────┘     └──────────────────┘
//!                                              │
//!                                     ┌────────┴─────────┐
//!                                     │SessionBroadcaster│
//!                                     │ (ordered fan-out)│
//!                                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)
//! - [`document`] — Canonical state, versioning, transform window
//! - [`sequencer`] — Per-document actors and their registry
//! - [`broadcast`] — Session fan-out with bounded per-connection queues
//! - [`connection`] — Connection handles, liveness, subscriptions
//! - [`checkpoint`] — Checkpoint scheduling over a durable store
//! - [`storage`] — `DurableStore` trait, RocksDB and in-memory stores
//! - [`server`] / [`client`] — WebSocket endpoints
//! - [`reconcile`] — Client-side pending-edit reconciliation
//! - [`observer`] — Read-only engine events

pub mod auth;
pub mod broadcast;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod connection;
pub mod document;
pub mod engine;
pub mod error;
pub mod observer;
pub mod protocol;
pub mod reconcile;
pub mod sequencer;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{Authenticator, OpenAuthenticator, TokenAuthenticator};
pub use broadcast::{BroadcastStats, PublishReport, SessionBroadcaster};
pub use checkpoint::{CheckpointStore, FlushSchedule};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{CheckpointPolicy, SequencerConfig, ServerConfig};
pub use connection::{AcceptedConnection, CloseReason, ConnectionHandle, ConnectionManager};
pub use document::{AppliedId, AppliedOperation, Bootstrap, Checkpoint, Document};
pub use engine::{CollabEngine, EngineStats};
pub use error::CollabError;
pub use observer::{EngineEvent, EventBus};
pub use protocol::{
    ClientMessage, ParticipantInfo, ProtocolError, RejectReason, ResyncReason, Selection,
    ServerMessage,
};
pub use reconcile::{ClientDocument, ReconcileError};
pub use sequencer::{DocumentRegistry, DocumentSnapshot, SequencerState, Submission};
pub use server::SyncServer;
pub use storage::{
    CheckpointRecord, DocumentMetadata, DurableStore, LogRecord, MemoryStore, RocksStore,
    StoreConfig, StoreError,
};
