//! Connection handles and the connection manager.
//!
//! A [`ConnectionHandle`] is owned by the manager; sessions hold only weak
//! references. Each handle has a bounded outbound frame queue (drained by
//! the transport task) and a close signal. Closing a connection removes its
//! participants, never the reverse.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::broadcast::SessionBroadcaster;
use crate::error::CollabError;
use crate::protocol::{
    ConnectionId, DocumentId, ParticipantInfo, ProtocolError, ResyncReason, Selection,
    ServerMessage, UserId,
};
use crate::sequencer::{DocumentRegistry, Submission};

/// One encoded server frame, shared between queues.
pub type Frame = Arc<Vec<u8>>;

/// Why a connection was closed by the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Disconnected,
    HeartbeatTimeout,
    Overflow,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    Full,
    Closed,
    Encode(ProtocolError),
}

impl From<SendFailure> for CollabError {
    fn from(failure: SendFailure) -> Self {
        match failure {
            SendFailure::Encode(e) => CollabError::Protocol(e),
            SendFailure::Full | SendFailure::Closed => {
                CollabError::Protocol(ProtocolError::ConnectionClosed)
            }
        }
    }
}

pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Frame>,
    close_tx: watch::Sender<Option<CloseReason>>,
    connected_at: Instant,
    /// Milliseconds after `connected_at` of the last inbound frame.
    last_seen_ms: AtomicU64,
}

/// Receiving ends of a freshly opened connection, for the transport task.
pub struct AcceptedConnection {
    pub handle: Arc<ConnectionHandle>,
    pub outbound: mpsc::Receiver<Frame>,
    pub closed: watch::Receiver<Option<CloseReason>>,
}

impl ConnectionHandle {
    /// New handle with an outbound queue of `capacity` frames. One extra
    /// slot is held back for the overflow notice.
    pub fn open(user_id: UserId, capacity: usize) -> AcceptedConnection {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1) + 1);
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            outbound: outbound_tx,
            close_tx,
            connected_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        });
        AcceptedConnection {
            handle,
            outbound: outbound_rx,
            closed: close_rx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, msg: &ServerMessage) -> Result<(), SendFailure> {
        let frame = msg.encode().map_err(SendFailure::Encode)?;
        self.try_send_frame(Arc::new(frame))
    }

    pub fn try_send_frame(&self, frame: Frame) -> Result<(), SendFailure> {
        let permit = self.outbound.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })?;
        if self.outbound.capacity() == 0 {
            // That was the reserved slot; releasing the permit hands it back.
            return Err(SendFailure::Full);
        }
        permit.send(frame);
        Ok(())
    }

    /// Close a connection that fell behind on `document_id`. A
    /// `Resynchronize { reason: Overflow }` notice goes out in the reserved
    /// slot first so the client knows to resubscribe from its last version.
    pub fn overflow(&self, document_id: DocumentId) {
        let notice = ServerMessage::Resynchronize {
            document_id,
            reason: ResyncReason::Overflow,
        };
        match notice.encode() {
            Ok(frame) => {
                if self.outbound.try_send(Arc::new(frame)).is_err() {
                    log::debug!("No room for overflow notice on {}", self.id);
                }
            }
            Err(e) => log::warn!("Failed to encode overflow notice: {e}"),
        }
        self.close(CloseReason::Overflow);
    }

    /// Signal the transport task to close. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.connected_at.elapsed().saturating_sub(last)
    }
}

struct ConnectionEntry {
    handle: Arc<ConnectionHandle>,
    documents: HashSet<DocumentId>,
}

/// Accepts, tracks and tears down connections.
pub struct ConnectionManager {
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<DocumentRegistry>,
    broadcaster: Arc<SessionBroadcaster>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    outbound_capacity: usize,
    liveness_timeout: Duration,
    total_accepted: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        registry: Arc<DocumentRegistry>,
        broadcaster: Arc<SessionBroadcaster>,
        outbound_capacity: usize,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            authenticator,
            registry,
            broadcaster,
            connections: RwLock::new(HashMap::new()),
            outbound_capacity,
            liveness_timeout,
            total_accepted: AtomicU64::new(0),
        }
    }

    /// Authenticate and register a new connection.
    pub async fn accept(&self, token: &str) -> Result<AcceptedConnection, CollabError> {
        let user_id = self.authenticator.authenticate(token)?;
        let accepted = ConnectionHandle::open(user_id, self.outbound_capacity);
        self.connections.write().await.insert(
            accepted.handle.id(),
            ConnectionEntry {
                handle: accepted.handle.clone(),
                documents: HashSet::new(),
            },
        );
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Accepted connection {} for user {user_id}",
            accepted.handle.id()
        );
        Ok(accepted)
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|entry| entry.handle.clone())
    }

    /// Join a document session. The `Subscribed` bootstrap is queued on the
    /// connection by the document's sequencer.
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
        last_seen_version: Option<u64>,
    ) -> Result<ParticipantInfo, CollabError> {
        let handle = self
            .get(connection_id)
            .await
            .ok_or(CollabError::UnknownConnection(connection_id))?;
        handle.touch();

        let participant = self
            .registry
            .subscribe(document_id, handle, last_seen_version)
            .await?;

        let mut connections = self.connections.write().await;
        match connections.get_mut(&connection_id) {
            Some(entry) => {
                entry.documents.insert(document_id);
            }
            None => {
                // Disconnected while subscribing.
                drop(connections);
                self.broadcaster.leave(document_id, connection_id).await;
                return Err(CollabError::UnknownConnection(connection_id));
            }
        }
        Ok(participant)
    }

    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
    ) -> Result<(), CollabError> {
        let removed = self
            .connections
            .write()
            .await
            .get_mut(&connection_id)
            .is_some_and(|entry| entry.documents.remove(&document_id));
        if !removed {
            return Err(CollabError::NotSubscribed {
                connection_id,
                document_id,
            });
        }
        self.broadcaster.leave(document_id, connection_id).await;
        Ok(())
    }

    /// Route a submission to the document's sequencer. Returns the version
    /// assigned; the author's `Ack` arrives through its outbound queue.
    pub async fn submit(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
        base_version: u64,
        operation: Vec<u8>,
        client_op_id: u64,
    ) -> Result<u64, CollabError> {
        let handle = self.subscribed_handle(connection_id, document_id).await?;
        handle.touch();
        self.registry
            .submit(
                document_id,
                Submission {
                    operation,
                    base_version,
                    author_id: handle.user_id(),
                    client_op_id: Some(client_op_id),
                    origin: Some(connection_id),
                },
            )
            .await
    }

    pub async fn update_cursor(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
        version: u64,
        selection: Selection,
    ) -> Result<(), CollabError> {
        let handle = self.subscribed_handle(connection_id, document_id).await?;
        handle.touch();
        self.registry
            .update_cursor(document_id, connection_id, version, selection)
            .await
    }

    /// Record a heartbeat.
    pub async fn heartbeat(&self, connection_id: ConnectionId) -> Result<(), CollabError> {
        let handle = self
            .get(connection_id)
            .await
            .ok_or(CollabError::UnknownConnection(connection_id))?;
        handle.touch();
        Ok(())
    }

    /// Remove a connection and its participants. Idempotent; peers get a
    /// presence update without this call waiting on their delivery.
    pub async fn disconnect(&self, connection_id: ConnectionId, reason: CloseReason) -> bool {
        let Some(entry) = self.connections.write().await.remove(&connection_id) else {
            return false;
        };
        entry.handle.close(reason);
        for document_id in &entry.documents {
            self.broadcaster.leave(*document_id, connection_id).await;
        }
        log::info!(
            "Disconnected {connection_id} ({reason:?}, {} sessions left)",
            entry.documents.len()
        );
        true
    }

    /// Force-disconnect every connection silent for longer than the
    /// liveness timeout. Returns the reaped ids.
    pub async fn reap_idle(&self) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .connections
            .read()
            .await
            .values()
            .filter(|entry| entry.handle.idle_for() > self.liveness_timeout)
            .map(|entry| entry.handle.id())
            .collect();
        for connection_id in &stale {
            log::warn!("Connection {connection_id} missed heartbeats; reaping");
            self.disconnect(*connection_id, CloseReason::HeartbeatTimeout)
                .await;
        }
        stale
    }

    /// Periodically reap idle connections until the manager is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.reap_idle().await;
            }
        })
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        for connection_id in ids {
            self.disconnect(connection_id, CloseReason::Shutdown).await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    pub async fn documents_of(&self, connection_id: ConnectionId) -> Vec<DocumentId> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|entry| entry.documents.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn subscribed_handle(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
    ) -> Result<Arc<ConnectionHandle>, CollabError> {
        let connections = self.connections.read().await;
        let entry = connections
            .get(&connection_id)
            .ok_or(CollabError::UnknownConnection(connection_id))?;
        if !entry.documents.contains(&document_id) {
            return Err(CollabError::NotSubscribed {
                connection_id,
                document_id,
            });
        }
        Ok(entry.handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_first_reason_wins() {
        let conn = ConnectionHandle::open(Uuid::new_v4(), 4);
        assert_eq!(conn.handle.close_reason(), None);
        conn.handle.close(CloseReason::Overflow);
        conn.handle.close(CloseReason::Disconnected);
        assert_eq!(*conn.closed.borrow(), Some(CloseReason::Overflow));
    }

    #[test]
    fn test_try_send_reports_full_and_closed() {
        let mut conn = ConnectionHandle::open(Uuid::new_v4(), 1);
        let msg = ServerMessage::HeartbeatAck { nonce: 1 };
        conn.handle.try_send(&msg).unwrap();
        assert_eq!(conn.handle.try_send(&msg), Err(SendFailure::Full));

        assert!(conn.outbound.try_recv().is_ok());
        conn.outbound.close();
        assert_eq!(conn.handle.try_send(&msg), Err(SendFailure::Closed));
    }

    #[test]
    fn test_overflow_notice_uses_reserved_slot() {
        let mut conn = ConnectionHandle::open(Uuid::new_v4(), 2);
        let doc = Uuid::new_v4();
        let msg = ServerMessage::HeartbeatAck { nonce: 1 };
        conn.handle.try_send(&msg).unwrap();
        conn.handle.try_send(&msg).unwrap();
        assert_eq!(conn.handle.try_send(&msg), Err(SendFailure::Full));

        conn.handle.overflow(doc);
        assert_eq!(conn.handle.close_reason(), Some(CloseReason::Overflow));

        let mut frames = Vec::new();
        while let Ok(frame) = conn.outbound.try_recv() {
            frames.push(ServerMessage::decode(&frame).unwrap());
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.last(),
            Some(&ServerMessage::Resynchronize {
                document_id: doc,
                reason: ResyncReason::Overflow
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracking() {
        let conn = ConnectionHandle::open(Uuid::new_v4(), 1);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(conn.handle.idle_for() >= Duration::from_secs(3));
        conn.handle.touch();
        assert!(conn.handle.idle_for() < Duration::from_secs(1));
    }
}
