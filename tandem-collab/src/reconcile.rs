//! Client-side reconciliation.
//!
//! A [`ClientDocument`] keeps three layers:
//!
//! ```text
//!   shadow ──inflight──► (acked soon) ──buffer──► content
//!   server state          one op on the wire        what the user sees
//!   at `version`
//! ```
//!
//! At most one operation is in flight; further local edits are composed
//! into the buffer. Remote operations are transformed through inflight and
//! buffer, with the remote side winning insert ties as it did on the server.
//! Redelivered versions are ignored, so at-least-once delivery is safe.
//!
//! After a resubscribe the pending edits are rebased: against the replayed
//! operations when the server could replay, against a diff to the
//! checkpointed state otherwise.

use tandem_ot::{compose, transform, OtError, Operation};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{
    CheckpointState, ClientMessage, DocumentId, ParticipantInfo, ProtocolError, RejectReason,
    ServerMessage, UserId, VersionedOperation,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ot(#[from] OtError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    client_op_id: u64,
    operation: Operation,
}

/// One document as seen by one client.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    document_id: DocumentId,
    user_id: Option<UserId>,
    shadow: String,
    content: String,
    version: u64,
    /// Bootstrapped at least once, so `version` is meaningful to the server.
    synced: bool,
    subscribed: bool,
    /// A `Subscribe` is on the wire and unanswered.
    subscribing: bool,
    inflight: Option<Pending>,
    buffer: Option<Operation>,
    next_op_id: u64,
    participants: Vec<ParticipantInfo>,
    degraded: bool,
}

impl ClientDocument {
    pub fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            user_id: None,
            shadow: String::new(),
            content: String::new(),
            version: 0,
            synced: false,
            subscribed: false,
            subscribing: false,
            inflight: None,
            buffer: None,
            // Random start keeps ids from two sessions of one user apart.
            next_op_id: Uuid::new_v4().as_u64_pair().0 >> 1,
            participants: Vec::new(),
            degraded: false,
        }
    }

    /// Identity assigned by the server's `Welcome`; used to recognise our
    /// own operations in a replay.
    pub fn set_user(&mut self, user_id: UserId) {
        self.user_id = Some(user_id);
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Last server version reflected locally.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn is_subscribing(&self) -> bool {
        self.subscribing
    }

    pub fn has_pending(&self) -> bool {
        self.inflight.is_some() || self.buffer.is_some()
    }

    pub fn inflight_id(&self) -> Option<u64> {
        self.inflight.as_ref().map(|p| p.client_op_id)
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Length of `content` in chars.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// The `Subscribe` to send next. Marks a subscription as requested.
    pub fn subscribe_message(&mut self) -> ClientMessage {
        self.subscribing = true;
        ClientMessage::Subscribe {
            document_id: self.document_id,
            last_seen_version: self.synced.then_some(self.version),
        }
    }

    /// Mark the subscription lost (connection dropped or server request).
    pub fn reset_subscription(&mut self) {
        self.subscribed = false;
        self.subscribing = false;
    }

    /// Drop all local state and pending edits, keeping the identity.
    pub fn reset(&mut self) {
        self.reset_subscription();
        self.shadow.clear();
        self.content.clear();
        self.version = 0;
        self.synced = false;
        self.inflight = None;
        self.buffer = None;
    }

    /// Apply a local edit made against `content`. Returns the submission to
    /// send, if the edit can go out now.
    pub fn apply_local(&mut self, op: Operation) -> Result<Option<ClientMessage>, ReconcileError> {
        self.content = op.apply(&self.content)?;
        self.buffer = Some(match self.buffer.take() {
            Some(buffered) => compose(&buffered, &op)?,
            None => op,
        });
        self.flush_buffer()
    }

    pub fn insert(&mut self, pos: usize, text: &str) -> Result<Option<ClientMessage>, ReconcileError> {
        let op = Operation::insert_at(self.len(), pos, text)?;
        self.apply_local(op)
    }

    pub fn delete(&mut self, pos: usize, count: usize) -> Result<Option<ClientMessage>, ReconcileError> {
        let op = Operation::delete_at(self.len(), pos, count)?;
        self.apply_local(op)
    }

    /// Feed one server message. Returns a message to send back, if any.
    pub fn handle(&mut self, msg: &ServerMessage) -> Result<Option<ClientMessage>, ReconcileError> {
        if msg.document_id() != Some(self.document_id) {
            return Ok(None);
        }
        match msg {
            ServerMessage::Subscribed {
                current_version,
                checkpoint,
                replay_operations,
                ..
            } => self.on_subscribed(*current_version, checkpoint.as_ref(), replay_operations),
            ServerMessage::Ack {
                version,
                client_op_id,
                ..
            } => self.on_ack(*version, *client_op_id),
            ServerMessage::Reject {
                client_op_id,
                reason,
                ..
            } => Ok(self.on_reject(*client_op_id, reason)),
            ServerMessage::OperationBroadcast {
                version,
                operation,
                author_id,
                client_op_id,
                ..
            } => {
                if !self.subscribed {
                    return Ok(None);
                }
                let op = tandem_ot::decode(operation)?;
                self.receive(*version, op, *author_id, *client_op_id)
            }
            ServerMessage::PresenceUpdate {
                participants,
                degraded,
                ..
            } => {
                self.participants = participants.clone();
                self.degraded = *degraded;
                Ok(None)
            }
            ServerMessage::Resynchronize { .. } => Ok(self.resubscribe()),
            ServerMessage::Welcome { .. } | ServerMessage::HeartbeatAck { .. } => Ok(None),
        }
    }

    /// A remote operation at `version`.
    pub fn receive(
        &mut self,
        version: u64,
        op: Operation,
        author_id: UserId,
        client_op_id: Option<u64>,
    ) -> Result<Option<ClientMessage>, ReconcileError> {
        if version <= self.version {
            // Redelivery.
            return Ok(None);
        }
        if version != self.version + 1 {
            log::warn!(
                "Version gap on {}: have {}, got {version}",
                self.document_id,
                self.version
            );
            return Ok(self.resubscribe());
        }
        if self.is_own(author_id, client_op_id) {
            return self.acknowledge(version);
        }

        let mut remote = op.clone();
        if let Some(pending) = self.inflight.as_mut() {
            let (r, p) = transform(&remote, &pending.operation)?;
            remote = r;
            pending.operation = p;
        }
        if let Some(buffered) = self.buffer.as_mut() {
            let (r, b) = transform(&remote, buffered)?;
            remote = r;
            *buffered = b;
        }
        self.content = remote.apply(&self.content)?;
        self.shadow = op.apply(&self.shadow)?;
        self.version = version;
        Ok(None)
    }

    pub fn on_ack(
        &mut self,
        version: u64,
        client_op_id: u64,
    ) -> Result<Option<ClientMessage>, ReconcileError> {
        if !self.subscribed || version <= self.version || self.inflight_id() != Some(client_op_id) {
            return Ok(None);
        }
        if version != self.version + 1 {
            return Ok(self.resubscribe());
        }
        self.acknowledge(version)
    }

    pub fn on_reject(
        &mut self,
        client_op_id: Option<u64>,
        reason: &RejectReason,
    ) -> Option<ClientMessage> {
        // Subscriptions carry no op id.
        let refused_subscribe = client_op_id.is_none() && !self.subscribed;
        if refused_subscribe {
            self.subscribing = false;
            if matches!(reason, RejectReason::InvalidBaseVersion) {
                // The server is behind what we saw; start over from its state.
                self.synced = false;
            }
        }
        if reason.requires_resync()
            || matches!(reason, RejectReason::NotSubscribed)
            || (refused_subscribe && reason.retryable())
        {
            return self.resubscribe();
        }

        let ours = client_op_id.is_some() && client_op_id == self.inflight_id();
        match reason {
            _ if !ours => None,
            reason if reason.retryable() => self.pending_message().ok().flatten(),
            RejectReason::MalformedOperation(detail) => {
                log::warn!(
                    "Server refused local edits on {}: {detail}; discarding them",
                    self.document_id
                );
                self.inflight = None;
                self.buffer = None;
                self.content = self.shadow.clone();
                None
            }
            _ => None,
        }
    }

    /// Bootstrap after (re)subscribing. Pending edits are rebased onto the
    /// server state and resubmitted.
    pub fn on_subscribed(
        &mut self,
        current_version: u64,
        checkpoint: Option<&CheckpointState>,
        replay: &[VersionedOperation],
    ) -> Result<Option<ClientMessage>, ReconcileError> {
        self.subscribed = true;
        self.subscribing = false;
        match checkpoint {
            None => {
                for entry in replay {
                    let op = tandem_ot::decode(&entry.operation)?;
                    // A submission produced mid-replay is resent below
                    // against the final version.
                    let reply =
                        self.receive(entry.version, op, entry.author_id, entry.client_op_id)?;
                    if !self.subscribed {
                        return Ok(reply);
                    }
                }
                if self.version != current_version {
                    return Ok(self.resubscribe());
                }
            }
            Some(checkpoint) => self.rebase_onto(current_version, checkpoint, replay)?,
        }
        self.synced = true;

        if self.inflight.is_some() {
            return Ok(self.pending_message()?);
        }
        self.flush_buffer()
    }

    fn rebase_onto(
        &mut self,
        current_version: u64,
        checkpoint: &CheckpointState,
        replay: &[VersionedOperation],
    ) -> Result<(), ReconcileError> {
        let mut server = checkpoint.state.clone();
        let mut own_applied = self
            .inflight
            .as_ref()
            .is_some_and(|pending| checkpoint.applied_op_ids.contains(&pending.client_op_id));
        for entry in replay {
            server = tandem_ot::decode(&entry.operation)?.apply(&server)?;
            own_applied |= self.is_own(entry.author_id, entry.client_op_id);
        }

        let (base, pending) = if own_applied {
            let base = match self.inflight.take() {
                Some(inflight) => inflight.operation.apply(&self.shadow)?,
                None => self.shadow.clone(),
            };
            (base, self.buffer.take())
        } else {
            let pending = match (self.inflight.take(), self.buffer.take()) {
                (Some(inflight), Some(buffered)) => Some(compose(&inflight.operation, &buffered)?),
                (Some(inflight), None) => Some(inflight.operation),
                (None, buffered) => buffered,
            };
            (self.shadow.clone(), pending)
        };

        let rebased = match pending {
            Some(pending) => {
                let server_op = Operation::diff(&base, &server);
                let (_, rebased) = transform(&server_op, &pending)?;
                Some(rebased).filter(|op| !op.is_noop())
            }
            None => None,
        };

        self.content = match &rebased {
            Some(op) => op.apply(&server)?,
            None => server.clone(),
        };
        self.shadow = server;
        self.version = current_version;
        self.buffer = rebased;
        Ok(())
    }

    fn is_own(&self, author_id: UserId, client_op_id: Option<u64>) -> bool {
        match (&self.inflight, client_op_id) {
            (Some(pending), Some(id)) => {
                self.user_id == Some(author_id) && pending.client_op_id == id
            }
            _ => false,
        }
    }

    fn acknowledge(&mut self, version: u64) -> Result<Option<ClientMessage>, ReconcileError> {
        if let Some(pending) = self.inflight.take() {
            self.shadow = pending.operation.apply(&self.shadow)?;
        }
        self.version = version;
        self.flush_buffer()
    }

    /// Request a fresh bootstrap unless one is already on its way.
    fn resubscribe(&mut self) -> Option<ClientMessage> {
        self.subscribed = false;
        if self.subscribing {
            return None;
        }
        Some(self.subscribe_message())
    }

    /// Move the buffer in flight when nothing else is.
    fn flush_buffer(&mut self) -> Result<Option<ClientMessage>, ReconcileError> {
        if !self.subscribed || self.inflight.is_some() {
            return Ok(None);
        }
        let Some(operation) = self.buffer.take() else {
            return Ok(None);
        };
        if operation.is_noop() {
            return Ok(None);
        }
        self.next_op_id += 1;
        self.inflight = Some(Pending {
            client_op_id: self.next_op_id,
            operation,
        });
        self.pending_message()
    }

    fn pending_message(&self) -> Result<Option<ClientMessage>, ReconcileError> {
        let Some(pending) = &self.inflight else {
            return Ok(None);
        };
        Ok(Some(ClientMessage::SubmitOperation {
            document_id: self.document_id,
            base_version: self.version,
            operation: tandem_ot::encode(&pending.operation)?,
            client_op_id: pending.client_op_id,
        }))
    }
}
