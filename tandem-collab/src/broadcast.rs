//! Per-document fan-out of sequencer output.
//!
//! Each participant is reached through its connection's bounded outbound
//! queue. The sequencer publishes from its own task one version at a time,
//! so every connection sees versions in order and never N+1 before N. A
//! broadcast is encoded once and the same frame is shared by every queue.
//!
//! A queue that is full means the client fell behind: it gets a
//! `Resynchronize { reason: Overflow }` notice and an overflow close, and must
//! resubscribe, rather than buffering an unbounded backlog on the server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;

use crate::connection::{ConnectionHandle, Frame, SendFailure};
use crate::document::{now_ms, AppliedOperation};
use crate::error::CollabError;
use crate::protocol::{
    ConnectionId, DocumentId, ParticipantInfo, ProtocolError, ResyncReason, Selection,
    ServerMessage,
};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub operations_published: u64,
    pub frames_sent: u64,
    pub connections_dropped: u64,
    pub active_sessions: usize,
    pub active_participants: usize,
}

/// Hot-path counters, read via [`SessionBroadcaster::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    operations_published: AtomicU64,
    frames_sent: AtomicU64,
    connections_dropped: AtomicU64,
}

/// Result of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct Participant {
    info: ParticipantInfo,
    connection: Weak<ConnectionHandle>,
}

#[derive(Default)]
struct Session {
    participants: HashMap<ConnectionId, Participant>,
    degraded: bool,
}

impl Session {
    fn presence(&self, document_id: DocumentId) -> ServerMessage {
        let mut participants: Vec<ParticipantInfo> =
            self.participants.values().map(|p| p.info.clone()).collect();
        participants.sort_by_key(|p| (p.joined_at_ms, p.connection_id));
        ServerMessage::PresenceUpdate {
            document_id,
            participants,
            degraded: self.degraded,
        }
    }
}

pub struct SessionBroadcaster {
    sessions: RwLock<HashMap<DocumentId, Session>>,
    max_participants: usize,
    stats: AtomicBroadcastStats,
}

impl SessionBroadcaster {
    pub fn new(max_participants: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_participants,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a connection to a document session.
    ///
    /// `subscribed` is queued to the connection before it can observe any
    /// later broadcast; peers then receive a presence update.
    pub async fn join(
        &self,
        document_id: DocumentId,
        connection: &Arc<ConnectionHandle>,
        last_seen_version: u64,
        degraded: bool,
        subscribed: &ServerMessage,
    ) -> Result<ParticipantInfo, CollabError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(document_id).or_default();
        session.degraded = degraded;

        let rejoining = session.participants.contains_key(&connection.id());
        if !rejoining && session.participants.len() >= self.max_participants {
            return Err(CollabError::SessionFull {
                document_id,
                limit: self.max_participants,
            });
        }

        if let Err(failure) = connection.try_send(subscribed) {
            if matches!(failure, SendFailure::Full) {
                connection.overflow(document_id);
            }
            if session.participants.is_empty() {
                sessions.remove(&document_id);
            }
            return Err(failure.into());
        }
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);

        let info = ParticipantInfo {
            user_id: connection.user_id(),
            connection_id: connection.id(),
            joined_at_ms: now_ms(),
            last_seen_version,
            selection: None,
        };
        session.participants.insert(
            connection.id(),
            Participant {
                info: info.clone(),
                connection: Arc::downgrade(connection),
            },
        );
        log::debug!(
            "Connection {} joined {document_id} at v{last_seen_version} ({} participants)",
            connection.id(),
            session.participants.len()
        );

        self.send_presence(document_id, session);
        Ok(info)
    }

    /// Remove a connection from a session. Peers get a presence update.
    pub async fn leave(&self, document_id: DocumentId, connection_id: ConnectionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&document_id) else {
            return false;
        };
        if session.participants.remove(&connection_id).is_none() {
            return false;
        }
        log::debug!("Connection {connection_id} left {document_id}");

        self.send_presence(document_id, session);
        if session.participants.is_empty() {
            sessions.remove(&document_id);
        }
        true
    }

    /// Fan an applied operation out. The connection in `origin` gets an `Ack`
    /// in place of the broadcast.
    pub async fn publish(
        &self,
        applied: &AppliedOperation,
        origin: Option<ConnectionId>,
    ) -> Result<PublishReport, CollabError> {
        let document_id = applied.document_id;
        let broadcast: Frame = Arc::new(
            ServerMessage::OperationBroadcast {
                document_id,
                version: applied.version,
                operation: tandem_ot::encode(&applied.operation)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
                author_id: applied.author_id,
                client_op_id: applied.client_op_id,
            }
            .encode()?,
        );
        self.stats.operations_published.fetch_add(1, Ordering::Relaxed);

        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&document_id) else {
            return Ok(PublishReport::default());
        };

        let mut report = PublishReport::default();
        let mut gone = Vec::new();
        for (connection_id, participant) in session.participants.iter_mut() {
            if let Some(selection) = participant.info.selection {
                participant.info.selection = Some(selection.transform(&applied.operation));
            }
            let Some(connection) = participant.connection.upgrade() else {
                gone.push(*connection_id);
                continue;
            };

            let is_author = origin == Some(*connection_id);
            let sent = match (is_author, applied.client_op_id) {
                (true, Some(client_op_id)) => connection.try_send(&ServerMessage::Ack {
                    document_id,
                    version: applied.version,
                    client_op_id,
                }),
                _ => connection.try_send_frame(broadcast.clone()),
            };
            match sent {
                Ok(()) => {
                    report.delivered += 1;
                    participant.info.last_seen_version = applied.version;
                }
                Err(SendFailure::Full) => {
                    log::warn!(
                        "Outbound queue full for {connection_id} on {document_id}; dropping connection"
                    );
                    connection.overflow(document_id);
                    report.dropped += 1;
                    gone.push(*connection_id);
                }
                Err(failure) => {
                    log::debug!("Skipping {connection_id}: {failure:?}");
                    gone.push(*connection_id);
                }
            }
        }
        self.stats
            .frames_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .connections_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);

        if !gone.is_empty() {
            for connection_id in &gone {
                session.participants.remove(connection_id);
            }
            self.send_presence(document_id, session);
            if session.participants.is_empty() {
                sessions.remove(&document_id);
            }
        }
        Ok(report)
    }

    /// Repeat the `Ack` for an operation sequenced earlier, to its author's
    /// connection only. Returns whether it was queued.
    pub async fn acknowledge(
        &self,
        document_id: DocumentId,
        connection_id: ConnectionId,
        version: u64,
        client_op_id: u64,
    ) -> bool {
        let sessions = self.sessions.read().await;
        let Some(connection) = sessions
            .get(&document_id)
            .and_then(|s| s.participants.get(&connection_id))
            .and_then(|p| p.connection.upgrade())
        else {
            return false;
        };
        let ack = ServerMessage::Ack {
            document_id,
            version,
            client_op_id,
        };
        match connection.try_send(&ack) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(SendFailure::Full) => {
                connection.overflow(document_id);
                false
            }
            Err(_) => false,
        }
    }

    /// Tell every participant to resubscribe and clear the session.
    pub async fn resynchronize(&self, document_id: DocumentId, reason: ResyncReason) -> usize {
        let Some(session) = self.sessions.write().await.remove(&document_id) else {
            return 0;
        };
        let msg = ServerMessage::Resynchronize {
            document_id,
            reason,
        };
        let mut notified = 0;
        for participant in session.participants.values() {
            if let Some(connection) = participant.connection.upgrade() {
                match connection.try_send(&msg) {
                    Ok(()) => notified += 1,
                    Err(SendFailure::Full) => connection.overflow(document_id),
                    Err(_) => {}
                }
            }
        }
        log::info!("Asked {notified} participants of {document_id} to resubscribe ({reason:?})");
        notified
    }

    /// Record a participant's selection as of the current version.
    pub async fn update_cursor(
        &self,
        document_id: DocumentId,
        connection_id: ConnectionId,
        version: u64,
        selection: Selection,
    ) -> Result<(), CollabError> {
        let mut sessions = self.sessions.write().await;
        let participant = sessions
            .get_mut(&document_id)
            .and_then(|s| s.participants.get_mut(&connection_id))
            .ok_or(CollabError::NotSubscribed {
                connection_id,
                document_id,
            })?;
        participant.info.selection = Some(selection);
        participant.info.last_seen_version = participant.info.last_seen_version.max(version);

        if let Some(session) = sessions.get(&document_id) {
            self.send_presence(document_id, session);
        }
        Ok(())
    }

    /// Flip the degraded flag; participants are told when it changes.
    pub async fn set_degraded(&self, document_id: DocumentId, degraded: bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&document_id) {
            if session.degraded != degraded {
                session.degraded = degraded;
                self.send_presence(document_id, session);
            }
        }
    }

    pub async fn participant_count(&self, document_id: DocumentId) -> usize {
        self.sessions
            .read()
            .await
            .get(&document_id)
            .map_or(0, |s| s.participants.len())
    }

    pub async fn participants(&self, document_id: DocumentId) -> Vec<ParticipantInfo> {
        match self.sessions.read().await.get(&document_id) {
            Some(session) => match session.presence(document_id) {
                ServerMessage::PresenceUpdate { participants, .. } => participants,
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    pub async fn is_participant(&self, document_id: DocumentId, connection_id: ConnectionId) -> bool {
        self.sessions
            .read()
            .await
            .get(&document_id)
            .is_some_and(|s| s.participants.contains_key(&connection_id))
    }

    pub async fn stats(&self) -> BroadcastStats {
        let sessions = self.sessions.read().await;
        BroadcastStats {
            operations_published: self.stats.operations_published.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            connections_dropped: self.stats.connections_dropped.load(Ordering::Relaxed),
            active_sessions: sessions.len(),
            active_participants: sessions.values().map(|s| s.participants.len()).sum(),
        }
    }

    /// Best-effort presence fan-out; never waits on a queue.
    fn send_presence(&self, document_id: DocumentId, session: &Session) {
        let frame = match session.presence(document_id).encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode presence for {document_id}: {e}");
                return;
            }
        };
        for participant in session.participants.values() {
            let Some(connection) = participant.connection.upgrade() else {
                continue;
            };
            match connection.try_send_frame(frame.clone()) {
                Ok(()) => {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(SendFailure::Full) => {
                    // Removed from the session on the next publish.
                    connection.overflow(document_id);
                }
                Err(_) => {}
            }
        }
    }
}
