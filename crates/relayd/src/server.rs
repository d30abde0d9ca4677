//! WebSocket front end: accepts client connections and drives the
//! per-connection protocol state machine.
//!
//! Each connection gets two tasks: a read loop that parses client frames
//! and dispatches to the registry/router, and a writer task draining the
//! connection's outbound queue into the socket. Connection close, however
//! it happens, funnels into exactly one unregister.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

use protocol::{ClientMessage, ServerMessage};

use crate::registry::{ConnectionId, RegistryError, SessionRegistry};
use crate::router::{MessageRouter, RouterError};

/// WebSocket relay server.
pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    outbound_queue_depth: usize,
}

impl RelayServer {
    /// Binds the server to `addr` (e.g. `127.0.0.1:9300`; port 0 picks an
    /// ephemeral port).
    pub async fn bind(addr: &str, outbound_queue_depth: usize) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry)));

        Ok(Self {
            listener,
            registry,
            router,
            outbound_queue_depth,
        })
    }

    /// The address the server is actually listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Handle to the shared session registry.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until the surrounding task is cancelled.
    ///
    /// Each accepted connection runs in its own task; a failed accept is
    /// logged and does not stop the server.
    pub async fn run(self) {
        tracing::info!(addr = ?self.listener.local_addr(), "Relay server listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let registry = Arc::clone(&self.registry);
                    let router = Arc::clone(&self.router);
                    let queue_depth = self.outbound_queue_depth;
                    tokio::spawn(async move {
                        handle_connection(registry, router, stream, peer_addr, queue_depth).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Drives one client connection from WebSocket handshake to teardown.
async fn handle_connection(
    registry: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    queue_depth: usize,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(peer_addr = %peer_addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let connection_id = ConnectionId::new_v4();
    tracing::info!(connection_id = %connection_id, peer_addr = %peer_addr, "Client connected");

    let (mut ws_sink, mut ws_rx) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(queue_depth);

    // Writer task: drains the outbound queue into the socket, then closes
    // it once every sender (read loop and registry entry) is gone.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message.to_json() {
                Ok(json) => {
                    if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                        tracing::debug!(error = %e, "Failed to send WebSocket message");
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize server message");
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    // Read loop. Breaking out of it is the one way a connection ends.
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                let message = match ClientMessage::from_json(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(
                            connection_id = %connection_id,
                            error = %e,
                            "Ignoring unparseable frame"
                        );
                        continue;
                    }
                };

                let keep_open = dispatch(
                    &registry,
                    &router,
                    &connection_id,
                    &outbound_tx,
                    message,
                )
                .await;
                if !keep_open {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {
                // Binary frames and ping/pong are not part of the protocol.
            }
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Exactly-once teardown: the first (only) pass through here owns the
    // departure broadcast; unregister is a no-op for unregistered
    // connections.
    if let Some(identity) = registry.unregister(&connection_id) {
        registry.broadcast_except(
            &connection_id,
            ServerMessage::UserDisconnected {
                username: identity.username,
            },
        );
    }
    tracing::info!(connection_id = %connection_id, "Client disconnected");

    // Release our queue sender so the writer can flush and close.
    drop(outbound_tx);
    let _ = writer.await;
}

/// Applies one client message. Returns `false` when the server should
/// force-close the connection.
async fn dispatch(
    registry: &SessionRegistry,
    router: &MessageRouter,
    connection_id: &ConnectionId,
    outbound_tx: &mpsc::Sender<ServerMessage>,
    message: ClientMessage,
) -> bool {
    match message {
        ClientMessage::Register {
            username,
            public_key,
        } => {
            match registry.register(*connection_id, &username, &public_key, outbound_tx.clone()) {
                Ok((identity, peers)) => {
                    // The caller sees the pre-existing peers first; everyone
                    // else hears about the arrival only after the identity
                    // is resolvable.
                    let _ = outbound_tx
                        .send(ServerMessage::UpdateUserList { users: peers })
                        .await;
                    registry.broadcast_except(
                        connection_id,
                        ServerMessage::UserConnected {
                            username: identity.username,
                            public_key: identity.public_key,
                        },
                    );
                    true
                }
                Err(e @ RegistryError::InvalidInput(_)) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Registration failed");
                    let _ = outbound_tx
                        .send(ServerMessage::RegistrationFailed {
                            reason: "Missing username or public key.".to_string(),
                        })
                        .await;
                    true
                }
                Err(e @ RegistryError::AlreadyRegistered(_)) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Registration failed");
                    let _ = outbound_tx
                        .send(ServerMessage::RegistrationFailed {
                            reason: "Connection is already registered.".to_string(),
                        })
                        .await;
                    true
                }
                Err(e @ RegistryError::NameTaken(_)) => {
                    // Name collisions are terminal: inform, then close.
                    tracing::warn!(connection_id = %connection_id, error = %e, "Registration failed");
                    let _ = outbound_tx
                        .send(ServerMessage::RegistrationFailed {
                            reason: "Username already taken.".to_string(),
                        })
                        .await;
                    false
                }
            }
        }
        ClientMessage::SendMessage {
            to_username,
            envelope,
        } => {
            match router.relay(connection_id, &to_username, envelope) {
                Ok(()) => {}
                Err(RouterError::UnauthenticatedSender) => {
                    // Protocol violation; drop the request.
                    tracing::warn!(
                        connection_id = %connection_id,
                        "Relay attempted before registration"
                    );
                }
                Err(e @ RouterError::RecipientOffline { .. }) => {
                    let _ = outbound_tx
                        .send(ServerMessage::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
            true
        }
    }
}
