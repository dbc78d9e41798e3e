//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Local edits with one operation in flight per document
//! - Remote operations transformed into local state
//! - Heartbeats at the interval the server asks for
//!
//! Edits made while disconnected stay buffered in their [`ClientDocument`]
//! and are rebased and sent after the next subscribe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_ot::Operation;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ClientMessage, ConnectionId, DocumentId, ParticipantInfo, ProtocolError, RejectReason,
    Selection, ServerMessage, UserId,
};
use crate::reconcile::{ClientDocument, ReconcileError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause before resending an operation the server was too busy for.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Disconnected,
    /// Bootstrapped; local state now reflects `version`.
    Synced {
        document_id: DocumentId,
        version: u64,
    },
    RemoteOperation {
        document_id: DocumentId,
        version: u64,
        author_id: UserId,
    },
    Acknowledged {
        document_id: DocumentId,
        version: u64,
    },
    Rejected {
        document_id: Option<DocumentId>,
        reason: RejectReason,
    },
    Presence {
        document_id: DocumentId,
        participants: Vec<ParticipantInfo>,
        degraded: bool,
    },
    /// The server asked us to resubscribe; pending edits are kept.
    Resynchronizing {
        document_id: DocumentId,
    },
}

type Documents = Arc<Mutex<HashMap<DocumentId, ClientDocument>>>;

/// The sync client.
pub struct SyncClient {
    server_url: String,
    token: String,
    state: Arc<RwLock<ConnectionState>>,
    user_id: Arc<RwLock<Option<UserId>>>,
    documents: Documents,
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            user_id: Arc::new(RwLock::new(None)),
            documents: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, authenticate and resubscribe to every open document.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<(), ProtocolError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let (mut ws, _) = tokio_tungstenite::connect_async(self.server_url.as_str())
            .await
            .map_err(|e| {
                log::warn!("Connecting to {} failed: {e}", self.server_url);
                ProtocolError::ConnectionClosed
            })?;

        let hello = ClientMessage::Hello {
            token: self.token.clone(),
        };
        ws.send(Message::Binary(hello.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => return ServerMessage::decode(&data),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    _ => return Err(ProtocolError::ConnectionClosed),
                }
            }
        })
        .await
        .map_err(|_| ProtocolError::Timeout)??;

        let (user_id, connection_id, heartbeat_interval) = match welcome {
            ServerMessage::Welcome {
                user_id,
                connection_id,
                heartbeat_interval_ms,
            } => (
                user_id,
                connection_id,
                Duration::from_millis(heartbeat_interval_ms.max(1)),
            ),
            ServerMessage::Reject { reason, .. } => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "handshake rejected: {reason:?}"
                )))
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "expected Welcome, got {other:?}"
                )))
            }
        };
        *self.user_id.write().await = Some(user_id);

        let (mut ws_writer, ws_reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(1024);

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let bytes = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Dropping unencodable message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Heartbeat task
        let beats = out_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            let mut nonce = 0u64;
            loop {
                ticker.tick().await;
                nonce += 1;
                if beats.send(ClientMessage::Heartbeat { nonce }).await.is_err() {
                    break;
                }
            }
        });

        // Resubscribe before the reader can observe anything.
        {
            let mut documents = self.documents.lock().await;
            for document in documents.values_mut() {
                document.set_user(user_id);
                document.reset_subscription();
                let _ = out_tx.send(document.subscribe_message()).await;
            }
        }

        // Reader task: reconcile incoming messages
        let reader = tokio::spawn(read_loop(
            ws_reader,
            self.documents.clone(),
            out_tx.clone(),
            self.event_tx.clone(),
            self.state.clone(),
        ));

        self.tasks.extend([writer, heartbeat, reader]);
        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self
            .event_tx
            .send(SyncEvent::Connected {
                user_id,
                connection_id,
            })
            .await;
        log::info!("Connected to {} as {user_id}", self.server_url);
        Ok(())
    }

    /// Drop the connection. Open documents and pending edits are kept.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for document in self.documents.lock().await.values_mut() {
            document.reset_subscription();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Disconnect and connect again, rebasing pending edits.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.disconnect().await;
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Start tracking a document and subscribe to it when connected.
    pub async fn open(&self, document_id: DocumentId) -> Result<(), ProtocolError> {
        let subscribe = {
            let mut documents = self.documents.lock().await;
            let document = documents
                .entry(document_id)
                .or_insert_with(|| ClientDocument::new(document_id));
            if let Some(user_id) = *self.user_id.read().await {
                document.set_user(user_id);
            }
            if document.is_subscribed() || document.is_subscribing() {
                return Ok(());
            }
            document.subscribe_message()
        };
        self.send(subscribe).await
    }

    /// Stop tracking a document. Pending edits are discarded.
    pub async fn close(&self, document_id: DocumentId) -> Result<(), ProtocolError> {
        if self.documents.lock().await.remove(&document_id).is_some() {
            self.send(ClientMessage::Unsubscribe { document_id }).await?;
        }
        Ok(())
    }

    /// Apply a local edit to an open document.
    pub async fn apply(&self, document_id: DocumentId, op: Operation) -> Result<(), ReconcileError> {
        let reply = {
            let mut documents = self.documents.lock().await;
            let document = documents.get_mut(&document_id).ok_or_else(|| {
                ProtocolError::UnexpectedMessage(format!("document {document_id} is not open"))
            })?;
            document.apply_local(op)?
        };
        if let Some(msg) = reply {
            self.send(msg).await?;
        }
        Ok(())
    }

    pub async fn insert(&self, document_id: DocumentId, pos: usize, text: &str) -> Result<(), ReconcileError> {
        let len = self.document_len(document_id).await?;
        self.apply(document_id, Operation::insert_at(len, pos, text)?)
            .await
    }

    pub async fn delete(&self, document_id: DocumentId, pos: usize, count: usize) -> Result<(), ReconcileError> {
        let len = self.document_len(document_id).await?;
        self.apply(document_id, Operation::delete_at(len, pos, count)?)
            .await
    }

    /// Share a selection made on the current local state. Cursors are
    /// ephemeral, so nothing is sent while edits are pending.
    pub async fn update_cursor(&self, document_id: DocumentId, selection: Selection) -> Result<(), ProtocolError> {
        let msg = {
            let documents = self.documents.lock().await;
            match documents.get(&document_id) {
                Some(document) if document.is_subscribed() && !document.has_pending() => {
                    ClientMessage::UpdateCursor {
                        document_id,
                        version: document.version(),
                        selection,
                    }
                }
                _ => return Ok(()),
            }
        };
        self.send(msg).await
    }

    pub async fn content(&self, document_id: DocumentId) -> Option<String> {
        self.documents
            .lock()
            .await
            .get(&document_id)
            .map(|d| d.content().to_string())
    }

    pub async fn version(&self, document_id: DocumentId) -> Option<u64> {
        self.documents.lock().await.get(&document_id).map(ClientDocument::version)
    }

    pub async fn has_pending(&self, document_id: DocumentId) -> bool {
        self.documents
            .lock()
            .await
            .get(&document_id)
            .is_some_and(ClientDocument::has_pending)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn user_id(&self) -> Option<UserId> {
        *self.user_id.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn document_len(&self, document_id: DocumentId) -> Result<usize, ProtocolError> {
        self.documents
            .lock()
            .await
            .get(&document_id)
            .map(ClientDocument::len)
            .ok_or_else(|| ProtocolError::UnexpectedMessage(format!("document {document_id} is not open")))
    }

    /// Queue a message. Dropped silently while offline; subscriptions and
    /// pending edits are replayed on connect.
    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Ok(()),
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

type WsReader = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;

/// Feed server messages into their documents until the socket closes.
async fn read_loop(
    mut ws_reader: WsReader,
    documents: Documents,
    out_tx: mpsc::Sender<ClientMessage>,
    event_tx: mpsc::Sender<SyncEvent>,
    state: Arc<RwLock<ConnectionState>>,
) {
    while let Some(msg) = ws_reader.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let msg = match ServerMessage::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Ignoring undecodable server frame: {e}");
                continue;
            }
        };

        let reply = match msg.document_id() {
            Some(document_id) => {
                let mut documents = documents.lock().await;
                match documents.get_mut(&document_id) {
                    Some(document) => match document.handle(&msg) {
                        Ok(reply) => reply,
                        Err(e) => {
                            // Local state can no longer be trusted.
                            log::error!("Reconciling {document_id} failed: {e}; resubscribing");
                            document.reset();
                            Some(document.subscribe_message())
                        }
                    },
                    None => None,
                }
            }
            None => None,
        };

        if let Some(event) = event_for(&msg, &documents).await {
            let _ = event_tx.send(event).await;
        }
        if let Some(reply) = reply {
            if matches!(&msg, ServerMessage::Reject { reason, .. } if reason.retryable()) {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            if out_tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    for document in documents.lock().await.values_mut() {
        document.reset_subscription();
    }
    *state.write().await = ConnectionState::Disconnected;
    let _ = event_tx.send(SyncEvent::Disconnected).await;
}

async fn event_for(msg: &ServerMessage, documents: &Documents) -> Option<SyncEvent> {
    match msg {
        ServerMessage::Subscribed { document_id, .. } => {
            let version = documents.lock().await.get(document_id).map(ClientDocument::version)?;
            Some(SyncEvent::Synced {
                document_id: *document_id,
                version,
            })
        }
        ServerMessage::OperationBroadcast {
            document_id,
            version,
            author_id,
            ..
        } => Some(SyncEvent::RemoteOperation {
            document_id: *document_id,
            version: *version,
            author_id: *author_id,
        }),
        ServerMessage::Ack {
            document_id,
            version,
            ..
        } => Some(SyncEvent::Acknowledged {
            document_id: *document_id,
            version: *version,
        }),
        ServerMessage::Reject {
            document_id,
            reason,
            ..
        } => Some(SyncEvent::Rejected {
            document_id: *document_id,
            reason: reason.clone(),
        }),
        ServerMessage::PresenceUpdate {
            document_id,
            participants,
            degraded,
        } => Some(SyncEvent::Presence {
            document_id: *document_id,
            participants: participants.clone(),
            degraded: *degraded,
        }),
        ServerMessage::Resynchronize { document_id, .. } => Some(SyncEvent::Resynchronizing {
            document_id: *document_id,
        }),
        ServerMessage::Welcome { .. } | ServerMessage::HeartbeatAck { .. } => None,
    }
}
