//! Binary wire protocol between clients and the collaboration server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`ClientMessage`] or [`ServerMessage`]:
//! ```text
//! ┌─────────────┬──────────────────────────────────────────┐
//! │ variant tag │ fields (varints, 16-byte UUIDs, payloads) │
//! │ varint      │ variable                                 │
//! └─────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Operations travel as opaque `Vec<u8>` payloads produced by
//! [`tandem_ot::encode`]; the sequencer decodes and validates them so a bad
//! payload is rejected with the document's current version attached.
//!
//! Handshake:
//! ```text
//! client                         server
//!   │── Hello{token} ─────────────►│
//!   │◄──────── Welcome{user, conn} ─│
//!   │── Subscribe{doc, last_seen} ─►│
//!   │◄── Subscribed{cp?, replay[]} ─│
//!   │── SubmitOperation ──────────►│
//!   │◄── Ack | Reject ──────────────│
//!   │◄── OperationBroadcast (push) ─│
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tandem_ot::{transform_index, Operation};

pub type DocumentId = Uuid;
pub type UserId = Uuid;
pub type ConnectionId = Uuid;

/// Upper bound for one decoded frame.
pub const FRAME_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// A cursor or selection inside a document, in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn caret(pos: usize) -> Self {
        Self {
            anchor: pos,
            head: pos,
        }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }

    /// Move the selection through an applied operation.
    pub fn transform(&self, op: &Operation) -> Self {
        Self {
            anchor: transform_index(op, self.anchor),
            head: transform_index(op, self.head),
        }
    }
}

/// Presence entry as seen by peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    /// Milliseconds since the Unix epoch.
    pub joined_at_ms: u64,
    pub last_seen_version: u64,
    pub selection: Option<Selection>,
}

/// Checkpointed document state shipped to late joiners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u64,
    pub state: String,
    /// The subscriber's own `client_op_id`s already folded into `state`.
    pub applied_op_ids: Vec<u64>,
}

/// An applied operation as replayed to a (re)subscribing client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedOperation {
    pub version: u64,
    pub author_id: UserId,
    /// Author-assigned id, so a reconnecting author can recognise its own
    /// in-flight operation in the replay.
    pub client_op_id: Option<u64>,
    pub operation: Vec<u8>,
    pub applied_at_ms: u64,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    MalformedOperation(String),
    InvalidBaseVersion,
    ResyncRequired,
    BaseVersionMismatch,
    SequencerBusy,
    DocumentUnavailable,
    Authentication,
    NotSubscribed,
    Protocol(String),
}

impl RejectReason {
    /// Whether resubmitting the same request later may succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::SequencerBusy | Self::DocumentUnavailable)
    }

    /// Whether the client must resubscribe before submitting again.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Self::InvalidBaseVersion | Self::ResyncRequired | Self::BaseVersionMismatch
        )
    }
}

/// Why the server asks a client to resubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncReason {
    /// The document was reloaded from its last checkpoint.
    Reloaded,
    /// The client's outbound queue overflowed.
    Overflow,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Hello {
        token: String,
    },
    Subscribe {
        document_id: DocumentId,
        /// `None` on first join; the last applied version when reconnecting.
        last_seen_version: Option<u64>,
    },
    Unsubscribe {
        document_id: DocumentId,
    },
    SubmitOperation {
        document_id: DocumentId,
        base_version: u64,
        operation: Vec<u8>,
        client_op_id: u64,
    },
    UpdateCursor {
        document_id: DocumentId,
        version: u64,
        selection: Selection,
    },
    Heartbeat {
        nonce: u64,
    },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome {
        user_id: UserId,
        connection_id: ConnectionId,
        heartbeat_interval_ms: u64,
    },
    Subscribed {
        document_id: DocumentId,
        current_version: u64,
        checkpoint: Option<CheckpointState>,
        replay_operations: Vec<VersionedOperation>,
    },
    Ack {
        document_id: DocumentId,
        version: u64,
        client_op_id: u64,
    },
    Reject {
        document_id: Option<DocumentId>,
        client_op_id: Option<u64>,
        reason: RejectReason,
        current_version: Option<u64>,
    },
    OperationBroadcast {
        document_id: DocumentId,
        version: u64,
        operation: Vec<u8>,
        author_id: UserId,
        client_op_id: Option<u64>,
    },
    PresenceUpdate {
        document_id: DocumentId,
        participants: Vec<ParticipantInfo>,
        degraded: bool,
    },
    Resynchronize {
        document_id: DocumentId,
        reason: ResyncReason,
    },
    HeartbeatAck {
        nonce: u64,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }

    /// Document this message concerns, if any.
    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            Self::Subscribed { document_id, .. }
            | Self::Ack { document_id, .. }
            | Self::OperationBroadcast { document_id, .. }
            | Self::PresenceUpdate { document_id, .. }
            | Self::Resynchronize { document_id, .. } => Some(*document_id),
            Self::Reject { document_id, .. } => *document_id,
            Self::Welcome { .. } | Self::HeartbeatAck { .. } => None,
        }
    }
}

fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let config = bincode::config::standard().with_limit::<FRAME_LIMIT_BYTES>();
    let (msg, _) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
