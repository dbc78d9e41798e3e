use thiserror::Error;

use crate::protocol::{ConnectionId, DocumentId, ProtocolError, RejectReason};
use crate::storage::StoreError;

/// Errors surfaced by the collaboration engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error("Malformed operation: {reason}")]
    MalformedOperation { reason: String, current: u64 },

    #[error("Base version {base} is ahead of current version {current}")]
    InvalidBaseVersion { base: u64, current: u64 },

    #[error("Base version {base} predates retained history (oldest {oldest}); resubscribe")]
    ResyncRequired { base: u64, oldest: u64, current: u64 },

    /// Stored history no longer matches the operation being applied. The
    /// document is reloaded and subscribers are asked to resubscribe.
    #[error("Document {document_id} history is inconsistent: {detail}")]
    BaseVersionMismatch { document_id: DocumentId, detail: String },

    #[error("Sequencer for document {0} is busy")]
    SequencerBusy(DocumentId),

    #[error("Document {document_id} unavailable: {detail}")]
    DocumentUnavailable { document_id: DocumentId, detail: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection {connection_id} is not subscribed to {document_id}")]
    NotSubscribed {
        connection_id: ConnectionId,
        document_id: DocumentId,
    },

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("Document {document_id} already has {limit} participants")]
    SessionFull { document_id: DocumentId, limit: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CollabError {
    /// Wire-level reason for a `Reject`.
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            Self::MalformedOperation { reason, .. } => RejectReason::MalformedOperation(reason.clone()),
            Self::InvalidBaseVersion { .. } => RejectReason::InvalidBaseVersion,
            Self::ResyncRequired { .. } => RejectReason::ResyncRequired,
            Self::BaseVersionMismatch { .. } => RejectReason::BaseVersionMismatch,
            Self::SequencerBusy(_) => RejectReason::SequencerBusy,
            Self::DocumentUnavailable { .. } | Self::Store(_) => RejectReason::DocumentUnavailable,
            Self::Authentication(_) => RejectReason::Authentication,
            Self::NotSubscribed { .. } | Self::UnknownConnection(_) => RejectReason::NotSubscribed,
            Self::SessionFull { .. } => RejectReason::Protocol(self.to_string()),
            Self::Protocol(e) => RejectReason::Protocol(e.to_string()),
        }
    }

    /// Authoritative document version known when the error was raised.
    pub fn current_version(&self) -> Option<u64> {
        match self {
            Self::MalformedOperation { current, .. }
            | Self::InvalidBaseVersion { current, .. }
            | Self::ResyncRequired { current, .. } => Some(*current),
            _ => None,
        }
    }

    pub fn retryable(&self) -> bool {
        self.reject_reason().retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_reject_mapping_carries_version() {
        let err = CollabError::InvalidBaseVersion { base: 5, current: 3 };
        assert_eq!(err.reject_reason(), RejectReason::InvalidBaseVersion);
        assert_eq!(err.current_version(), Some(3));
        assert!(!err.retryable());
        assert_eq!(err.to_string(), "Base version 5 is ahead of current version 3");
    }

    #[test]
    fn test_busy_is_retryable() {
        let err = CollabError::SequencerBusy(Uuid::nil());
        assert!(err.retryable());
        assert_eq!(err.current_version(), None);
    }

    #[test]
    fn test_store_error_maps_to_unavailable() {
        let err: CollabError = StoreError::Unavailable("disk".into()).into();
        assert_eq!(err.reject_reason(), RejectReason::DocumentUnavailable);
        assert!(err.retryable());
    }
}
