//! WebSocket Race Server
//!
//! Async WebSocket server for live race connections. Parses inbound
//! events, dispatches them to the coordinator, and pumps outbound
//! broadcasts back over each connection's channel.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::race::coordinator::RaceCoordinator;
use crate::race::model::UserIdentity;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static bind address"),
            max_connections: 1000,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Race server errors.
#[derive(Debug, thiserror::Error)]
pub enum RaceServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Identity presented on the first identified event.
    identity: Option<UserIdentity>,
    /// Room the connection joined (if any).
    room_code: Option<String>,
    /// Connection time.
    #[allow(dead_code)]
    connected_at: Instant,
    /// Message sender (for direct messaging to client).
    #[allow(dead_code)]
    sender: mpsc::Sender<ServerMessage>,
}

/// The WebSocket-facing race server.
pub struct RaceServer {
    config: ServerConfig,
    coordinator: Arc<RaceCoordinator>,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RaceServer {
    /// Create a new race server around the process coordinator.
    pub fn new(config: ServerConfig, coordinator: Arc<RaceCoordinator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            coordinator,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Run the accept loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RaceServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Race server listening on {}", self.config.bind_addr);

        let matchmaking_handle = self.coordinator.spawn_matchmaking_loop();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let client_count = self.clients.read().await.len();
                            if client_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        matchmaking_handle.abort();
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let coordinator = self.coordinator.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            // Register client
            {
                let mut clients = clients.write().await;
                clients.insert(
                    addr,
                    ConnectedClient {
                        identity: None,
                        room_code: None,
                        connected_at: Instant::now(),
                        sender: msg_tx.clone(),
                    },
                );
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::RaceError {
                                            message: "Invalid message format".to_string(),
                                        }).await;
                                        continue;
                                    }
                                };

                                Self::handle_client_message(
                                    addr,
                                    client_msg,
                                    &clients,
                                    &coordinator,
                                    &msg_tx,
                                ).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            // Ping/pong handled by the protocol layer
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // Cleanup
            sender_task.abort();

            let removed = clients.write().await.remove(&addr);
            if let Some(client) = removed {
                if let Some(identity) = client.identity {
                    coordinator
                        .handle_disconnect(&identity.id, client.room_code.as_deref())
                        .await;
                }
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Dispatch one parsed client event against the coordinator.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        clients: &Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
        coordinator: &Arc<RaceCoordinator>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::FindRace { identity, mode } => {
                {
                    let mut clients = clients.write().await;
                    if let Some(client) = clients.get_mut(&addr) {
                        client.identity = Some(identity.clone());
                    }
                }

                if let Err(e) = coordinator.find_race(identity, mode, sender.clone()).await {
                    let _ = sender
                        .send(ServerMessage::RaceError {
                            message: e.to_string(),
                        })
                        .await;
                }
            }

            ClientMessage::CancelMatchmaking => {
                let identity = {
                    let clients = clients.read().await;
                    clients.get(&addr).and_then(|c| c.identity.clone())
                };
                if let Some(identity) = identity {
                    coordinator.cancel_matchmaking(&identity.id, sender).await;
                }
            }

            ClientMessage::JoinRace { room_code, identity } => {
                match coordinator
                    .join_room(&identity, &room_code, Some(sender.clone()))
                    .await
                {
                    Ok(race) => {
                        let mut clients = clients.write().await;
                        if let Some(client) = clients.get_mut(&addr) {
                            client.identity = Some(identity);
                            client.room_code = Some(race.room_code);
                        }
                    }
                    Err(e) => {
                        let _ = sender
                            .send(ServerMessage::RaceError {
                                message: e.to_string(),
                            })
                            .await;
                    }
                }
            }

            ClientMessage::StartRace { room_code } => {
                let identity = {
                    let clients = clients.read().await;
                    clients.get(&addr).and_then(|c| c.identity.clone())
                };

                let Some(identity) = identity else {
                    let _ = sender
                        .send(ServerMessage::RaceError {
                            message: "Join the race before starting it".to_string(),
                        })
                        .await;
                    return;
                };

                if let Err(e) = coordinator.start_room(&room_code, &identity.id).await {
                    let _ = sender
                        .send(ServerMessage::RaceError {
                            message: e.to_string(),
                        })
                        .await;
                }
            }

            ClientMessage::UpdateProgress {
                room_code,
                identity,
                progress,
                wpm,
                accuracy,
            } => {
                coordinator
                    .submit_progress(&room_code, &identity.id, progress, wpm, accuracy)
                    .await;
            }

            ClientMessage::FinishRace { room_code, identity } => {
                coordinator.finish_race(&room_code, &identity.id).await;
            }

            ClientMessage::LeaveRace { room_code } => {
                let identity = {
                    let mut clients = clients.write().await;
                    let client = clients.get_mut(&addr);
                    if let Some(client) = client {
                        client.room_code = None;
                        client.identity.clone()
                    } else {
                        None
                    }
                };
                if let Some(identity) = identity {
                    coordinator.leave_room(&room_code, &identity.id).await;
                }
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
