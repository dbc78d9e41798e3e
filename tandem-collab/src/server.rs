//! WebSocket front end.
//!
//! Architecture:
//! ```text
//! Client A ──┐                               ┌── DocumentActor (doc 1) ──┐
//!            ├── connection task ── manager ─┤                           ├── CheckpointStore
//! Client B ──┘        ▲                      └── DocumentActor (doc 2) ──┘
//!                     │                                  │
//!                     └──── outbound queue ◄── SessionBroadcaster
//! ```
//!
//! Each socket gets one task. It authenticates the `Hello`, then multiplexes
//! three sources: inbound frames, its outbound queue (acks, broadcasts,
//! presence) and its close signal. Submissions are handled inline so one
//! connection's operations reach the sequencer in the order they were sent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::connection::{AcceptedConnection, CloseReason};
use crate::engine::CollabEngine;
use crate::error::CollabError;
use crate::protocol::{
    ClientMessage, ConnectionId, DocumentId, ProtocolError, RejectReason, ServerMessage,
    FRAME_LIMIT_BYTES,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long an overflowed connection gets to take its queued frames.
const OVERFLOW_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The sync server.
pub struct SyncServer {
    engine: Arc<CollabEngine>,
}

impl SyncServer {
    pub fn new(engine: Arc<CollabEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<CollabEngine> {
        &self.engine
    }

    pub fn bind_addr(&self) -> &str {
        &self.engine.config().bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        self.engine.start_reaper();
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(engine, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        engine: Arc<CollabEngine>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let mut ws = tokio_tungstenite::accept_async(stream).await?;

        let accepted = match Self::handshake(&engine, &mut ws).await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::info!("Handshake from {addr} failed: {e}");
                let reject = reject(None, None, &e);
                let _ = ws.send(Message::Binary(reject.encode()?.into())).await;
                let _ = ws.close(None).await;
                return Ok(());
            }
        };

        let AcceptedConnection {
            handle,
            mut outbound,
            mut closed,
        } = accepted;
        let connection_id = handle.id();
        let welcome = ServerMessage::Welcome {
            user_id: handle.user_id(),
            connection_id,
            heartbeat_interval_ms: engine.config().heartbeat_interval.as_millis() as u64,
        };
        ws.send(Message::Binary(welcome.encode()?.into())).await?;
        log::info!("WebSocket session {connection_id} established from {addr}");

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let mut reason = CloseReason::Disconnected;

        loop {
            tokio::select! {
                biased;

                changed = closed.changed() => {
                    let closed_with = *closed.borrow();
                    if changed.is_err() || closed_with.is_some() {
                        reason = closed_with.unwrap_or(CloseReason::Shutdown);
                        if reason == CloseReason::Overflow {
                            // The queue ends with the overflow notice.
                            let drain = async {
                                while let Ok(frame) = outbound.try_recv() {
                                    let bytes = Arc::try_unwrap(frame)
                                        .unwrap_or_else(|shared| (*shared).clone());
                                    if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                                        break;
                                    }
                                }
                            };
                            if tokio::time::timeout(OVERFLOW_DRAIN_TIMEOUT, drain).await.is_err() {
                                log::debug!("Gave up draining {connection_id} after overflow");
                            }
                        }
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let bytes = Arc::try_unwrap(frame).unwrap_or_else(|shared| (*shared).clone());
                    if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            handle.touch();
                            let reply = Self::dispatch(&engine, connection_id, &data).await;
                            if let Some(frame) = reply.as_ref().and_then(to_frame) {
                                if ws_sender.send(frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => handle.touch(),
                        Some(Ok(Message::Text(_))) => {
                            let reply = reject(
                                None,
                                None,
                                &ProtocolError::UnexpectedMessage("text frame".into()).into(),
                            );
                            if let Some(frame) = to_frame(&reply) {
                                if ws_sender.send(frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            log::debug!("WebSocket error on {connection_id}: {e}");
                            break;
                        }
                    }
                }
            }
        }

        engine.connections().disconnect(connection_id, reason).await;
        log::info!("WebSocket session {connection_id} from {addr} closed ({reason:?})");
        Ok(())
    }

    /// Wait for `Hello` and authenticate it.
    async fn handshake(
        engine: &CollabEngine,
        ws: &mut WebSocketStream<TcpStream>,
    ) -> Result<AcceptedConnection, CollabError> {
        let first = tokio::time::timeout(engine.config().handshake_timeout, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => return Ok(data),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(_)) => {
                        return Err(ProtocolError::UnexpectedMessage("expected Hello".into()))
                    }
                    Some(Err(_)) | None => return Err(ProtocolError::ConnectionClosed),
                }
            }
        })
        .await
        .map_err(|_| ProtocolError::Timeout)??;

        match ClientMessage::decode(&first)? {
            ClientMessage::Hello { token } => engine.connections().accept(&token).await,
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "expected Hello, got {}",
                message_name(&other)
            ))
            .into()),
        }
    }

    /// Apply one client frame. Returns a message to send straight back.
    async fn dispatch(
        engine: &CollabEngine,
        connection_id: ConnectionId,
        data: &[u8],
    ) -> Option<ServerMessage> {
        if data.len() > FRAME_LIMIT_BYTES {
            return Some(reject(
                None,
                None,
                &ProtocolError::Deserialization("frame too large".into()).into(),
            ));
        }
        let msg = match ClientMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => return Some(reject(None, None, &e.into())),
        };
        log::debug!("{connection_id} -> {}", message_name(&msg));

        let connections = engine.connections();
        match msg {
            ClientMessage::Hello { .. } => Some(reject(
                None,
                None,
                &ProtocolError::UnexpectedMessage("already authenticated".into()).into(),
            )),
            ClientMessage::Subscribe {
                document_id,
                last_seen_version,
            } => connections
                .subscribe(connection_id, document_id, last_seen_version)
                .await
                .err()
                .map(|e| reject(Some(document_id), None, &e)),
            ClientMessage::Unsubscribe { document_id } => connections
                .unsubscribe(connection_id, document_id)
                .await
                .err()
                .map(|e| reject(Some(document_id), None, &e)),
            ClientMessage::SubmitOperation {
                document_id,
                base_version,
                operation,
                client_op_id,
            } => connections
                .submit(connection_id, document_id, base_version, operation, client_op_id)
                .await
                .err()
                .map(|e| reject(Some(document_id), Some(client_op_id), &e)),
            ClientMessage::UpdateCursor {
                document_id,
                version,
                selection,
            } => connections
                .update_cursor(connection_id, document_id, version, selection)
                .await
                .err()
                .map(|e| reject(Some(document_id), None, &e)),
            ClientMessage::Heartbeat { nonce } => match connections.heartbeat(connection_id).await {
                Ok(()) => Some(ServerMessage::HeartbeatAck { nonce }),
                Err(e) => Some(reject(None, None, &e)),
            },
        }
    }
}

fn reject(
    document_id: Option<DocumentId>,
    client_op_id: Option<u64>,
    error: &CollabError,
) -> ServerMessage {
    let reason = error.reject_reason();
    if matches!(reason, RejectReason::Protocol(_) | RejectReason::Authentication) {
        log::info!("Rejecting request: {error}");
    } else {
        log::debug!("Rejecting request: {error}");
    }
    ServerMessage::Reject {
        document_id,
        client_op_id,
        reason,
        current_version: error.current_version(),
    }
}

fn to_frame(msg: &ServerMessage) -> Option<Message> {
    match msg.encode() {
        Ok(bytes) => Some(Message::Binary(bytes.into())),
        Err(e) => {
            log::error!("Failed to encode reply: {e}");
            None
        }
    }
}

fn message_name(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::Hello { .. } => "Hello",
        ClientMessage::Subscribe { .. } => "Subscribe",
        ClientMessage::Unsubscribe { .. } => "Unsubscribe",
        ClientMessage::SubmitOperation { .. } => "SubmitOperation",
        ClientMessage::UpdateCursor { .. } => "UpdateCursor",
        ClientMessage::Heartbeat { .. } => "Heartbeat",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAuthenticator;
    use crate::config::ServerConfig;
    use uuid::Uuid;

    fn engine() -> Arc<CollabEngine> {
        let auth = TokenAuthenticator::new().with_token("secret", Uuid::new_v4());
        Arc::new(CollabEngine::open(ServerConfig::for_testing(), Arc::new(auth)).unwrap())
    }

    #[test]
    fn test_reject_carries_current_version() {
        let err = CollabError::InvalidBaseVersion { base: 5, current: 3 };
        let doc = Uuid::new_v4();
        assert_eq!(
            reject(Some(doc), Some(9), &err),
            ServerMessage::Reject {
                document_id: Some(doc),
                client_op_id: Some(9),
                reason: RejectReason::InvalidBaseVersion,
                current_version: Some(3),
            }
        );
    }

    #[tokio::test]
    async fn test_dispatch_rejects_garbage_and_second_hello() {
        let engine = engine();
        let accepted = engine.connections().accept("secret").await.unwrap();
        let id = accepted.handle.id();

        let reply = SyncServer::dispatch(&engine, id, &[0xde, 0xad]).await;
        assert!(matches!(
            reply,
            Some(ServerMessage::Reject { reason: RejectReason::Protocol(_), .. })
        ));

        let hello = ClientMessage::Hello { token: "secret".into() }.encode().unwrap();
        assert!(matches!(
            SyncServer::dispatch(&engine, id, &hello).await,
            Some(ServerMessage::Reject { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_heartbeat_and_unsubscribed_submit() {
        let engine = engine();
        let accepted = engine.connections().accept("secret").await.unwrap();
        let id = accepted.handle.id();

        let beat = ClientMessage::Heartbeat { nonce: 11 }.encode().unwrap();
        assert_eq!(
            SyncServer::dispatch(&engine, id, &beat).await,
            Some(ServerMessage::HeartbeatAck { nonce: 11 })
        );

        let doc = Uuid::new_v4();
        let submit = ClientMessage::SubmitOperation {
            document_id: doc,
            base_version: 0,
            operation: Vec::new(),
            client_op_id: 1,
        }
        .encode()
        .unwrap();
        assert_eq!(
            SyncServer::dispatch(&engine, id, &submit).await,
            Some(ServerMessage::Reject {
                document_id: Some(doc),
                client_op_id: Some(1),
                reason: RejectReason::NotSubscribed,
                current_version: None,
            })
        );
    }
}
