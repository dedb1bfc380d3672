//! WebSocket push server over a [`PushHub`].
//!
//! ```text
//! Client A ──┐                          ┌── Group S1 ──► A, B
//!            ├── PushServer ── PushHub ─┤
//! Client B ──┘        ▲                 └── Group S2 ──► C
//!                     │
//! Producer ── Publish ┘
//! ```
//!
//! Per socket:
//! 1. `Welcome{connection_id}`, or `Rejected{ConnectionLimit}` and close
//! 2. `JoinGroup` is answered with `JoinAck` or `JoinFailed`
//! 3. group notifications are relayed as `Notification` frames
//!
//! Remote producers send `Publish` frames; the hub fans them out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agora_core::SessionId;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::{HubError, HubStats, NotificationReceiver, PushHub};
use crate::protocol::{ConnectionId, MessageType, ProtocolError, PushMessage, RejectReason};

/// Environment variable overriding [`ServerConfig::bind_addr`].
pub const ENV_BIND_ADDR: &str = "AGORA_BIND_ADDR";
/// Environment variable overriding [`ServerConfig::max_connections`].
pub const ENV_MAX_CONNECTIONS: &str = "AGORA_MAX_CONNECTIONS";
/// Environment variable overriding [`ServerConfig::broadcast_capacity`].
pub const ENV_BROADCAST_CAPACITY: &str = "AGORA_BROADCAST_CAPACITY";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections admitted before new ones are rejected
    pub max_connections: usize,
    /// Broadcast channel capacity per session group
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections: 10_000,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, small limits.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_connections: 16,
            broadcast_capacity: 64,
        }
    }

    /// Defaults overlaid with `AGORA_*` environment variables.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns per variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(value) = lookup(ENV_MAX_CONNECTIONS) {
            config.max_connections = parse_var(ENV_MAX_CONNECTIONS, &value)?;
        }
        if let Some(value) = lookup(ENV_BROADCAST_CAPACITY) {
            config.broadcast_capacity = parse_var(ENV_BROADCAST_CAPACITY, &value)?;
        }
        Ok(config)
    }
}

fn parse_var(name: &'static str, value: &str) -> Result<usize, ServerError> {
    value.trim().parse().map_err(|_| ServerError::InvalidConfig {
        name,
        value: value.to_string(),
    })
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Invalid value for {name}: {value:?}")]
    InvalidConfig { name: &'static str, value: String },
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
}

/// The push server. Clones share the hub and connection table.
#[derive(Clone)]
pub struct PushServer {
    config: ServerConfig,
    hub: Arc<PushHub>,
    stats: Arc<AtomicServerStats>,
    /// Per-connection disconnect signal
    kicks: Arc<RwLock<HashMap<ConnectionId, Arc<Notify>>>>,
}

impl PushServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(PushHub::new(config.max_connections, config.broadcast_capacity));
        Self::with_hub(config, hub)
    }

    /// Serve an existing hub (shared with in-process producers).
    pub fn with_hub(config: ServerConfig, hub: Arc<PushHub>) -> Self {
        Self {
            config,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
            kicks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &Arc<PushHub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept loop on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Push server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Close a connection from the server side, as a transport failure would.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        match self.kicks.read().await.get(connection_id) {
            Some(kick) => {
                kick.notify_one();
                true
            }
            None => false,
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let connection_id = match self.hub.register_connection().await {
            Ok(id) => id,
            Err(HubError::ConnectionLimit { .. }) => {
                self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                send(&mut ws_sender, &PushMessage::rejected(RejectReason::ConnectionLimit)).await?;
                let _ = ws_sender.close().await;
                return Ok(());
            }
            Err(e) => {
                log::error!("Could not register connection from {addr}: {e}");
                return Ok(());
            }
        };

        let kick = Arc::new(Notify::new());
        self.kicks.write().await.insert(connection_id, kick.clone());
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Connection {connection_id} established from {addr}");

        let result = async {
            send(&mut ws_sender, &PushMessage::welcome(connection_id)).await?;
            self.connection_loop(connection_id, &kick, &mut ws_sender, &mut ws_receiver)
                .await
        }
        .await;

        self.kicks.write().await.remove(&connection_id);
        self.hub.unregister_connection(&connection_id).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {connection_id} closed");
        result
    }

    async fn connection_loop<S, R>(
        &self,
        connection_id: ConnectionId,
        kick: &Notify,
        ws_sender: &mut S,
        ws_receiver: &mut R,
    ) -> Result<(), ServerError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let mut group: Option<(SessionId, NotificationReceiver)> = None;

        loop {
            tokio::select! {
                _ = kick.notified() => {
                    log::info!("Disconnecting {connection_id} on request");
                    let _ = ws_sender.close().await;
                    return Ok(());
                }

                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        let bytes: Vec<u8> = data.into();
                        match PushMessage::decode(&bytes) {
                            Ok(msg) => self.handle_message(connection_id, msg, &mut group, ws_sender).await?,
                            Err(e) => log::warn!("Undecodable frame from {connection_id}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        log::debug!("WebSocket error on {connection_id}: {e}");
                        return Ok(());
                    }
                    _ => {}
                },

                notification = async {
                    match group.as_mut() {
                        Some((_, rx)) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match notification {
                    Ok(n) => send(ws_sender, &PushMessage::notification(connection_id, &n)).await?,
                    Err(RecvError::Lagged(count)) => {
                        if let Some((session_id, _)) = &group {
                            self.hub.note_lagged(session_id, count).await;
                        }
                    }
                    Err(RecvError::Closed) => group = None,
                },
            }
        }
    }

    async fn handle_message<S>(
        &self,
        connection_id: ConnectionId,
        msg: PushMessage,
        group: &mut Option<(SessionId, NotificationReceiver)>,
        ws_sender: &mut S,
    ) -> Result<(), ServerError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match msg.msg_type {
            MessageType::JoinGroup => {
                let Some(session_id) = msg.session_id else {
                    log::warn!("JoinGroup without session from {connection_id}");
                    return Ok(());
                };
                if msg.connection_id != connection_id {
                    let reply = PushMessage::join_failed(connection_id, session_id, "connection id mismatch");
                    return send(ws_sender, &reply).await;
                }
                match self.hub.join(&connection_id, &session_id).await {
                    Ok(rx) => {
                        *group = Some((session_id.clone(), rx));
                        send(ws_sender, &PushMessage::join_ack(connection_id, session_id)).await?;
                    }
                    Err(e) => {
                        let reply = PushMessage::join_failed(connection_id, session_id, &e.to_string());
                        send(ws_sender, &reply).await?;
                    }
                }
            }
            MessageType::LeaveGroup => {
                self.hub.leave(&connection_id).await;
                *group = None;
            }
            MessageType::Publish => match msg.change_notification() {
                Ok(notification) => {
                    self.hub.publish(&notification).await;
                }
                Err(e) => log::warn!("Bad publish from {connection_id}: {e}"),
            },
            MessageType::Ping => {
                send(ws_sender, &PushMessage::pong(connection_id)).await?;
            }
            other => log::debug!("Ignoring {other:?} from {connection_id}"),
        }
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
        }
    }

    pub async fn hub_stats(&self) -> HubStats {
        self.hub.stats().await
    }
}

async fn send<S>(ws_sender: &mut S, msg: &PushMessage) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_config_from_lookup_overrides() {
        let config = ServerConfig::from_lookup(|key| match key {
            ENV_BIND_ADDR => Some("0.0.0.0:7000".to_string()),
            ENV_MAX_CONNECTIONS => Some(" 12 ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = ServerConfig::from_lookup(|key| {
            (key == ENV_BROADCAST_CAPACITY).then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ServerError::InvalidConfig { name: ENV_BROADCAST_CAPACITY, .. }
        ));
    }

    #[tokio::test]
    async fn test_server_shares_hub() {
        let hub = Arc::new(PushHub::new(3, 8));
        let server = PushServer::with_hub(ServerConfig::for_testing(), hub.clone());
        assert!(Arc::ptr_eq(server.hub(), &hub));
        assert_eq!(server.stats().await, ServerStats::default());
        assert!(!server.disconnect(&uuid::Uuid::new_v4()).await);
    }
}
