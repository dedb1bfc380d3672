//! WebSocket [`PushChannel`] against a [`PushServer`](crate::server::PushServer).
//!
//! `connect` performs the handshake (`Welcome` or `Rejected`) and hands the
//! socket to a supervisor task. The supervisor owns the socket for the rest
//! of its life:
//!
//! ```text
//!            commands (Join, Stop)
//! WsPushChannel ───────────────────► supervisor ◄──── frames ──── PushServer
//!      ▲                                 │
//!      └──────── ChannelEvent ◄──────────┘
//! ```
//!
//! When the socket drops without a `stop`, the supervisor emits
//! `Reconnecting`, redials per the reconnect [`RetryPolicy`] and emits either
//! `Reconnected(new_id)` or `Closed(Some(error))`. The new connection has no
//! group membership; whoever listens has to join again.

use std::future::Future;
use std::time::Duration;

use agora_core::SessionId;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::channel::{ChannelError, ChannelEvent, EventStream, PushChannel, EVENT_BUFFER};
use crate::protocol::{ConnectionId, MessageType, PushMessage, RejectReason};
use crate::storage::{RetryMachine, RetryPolicy, RetryState, Transient};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket channel configuration.
#[derive(Debug, Clone)]
pub struct WsChannelConfig {
    /// Hub URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// Bound on the handshake and on each group join
    pub join_timeout: Duration,
    /// Redial policy after an unexpected socket loss
    pub reconnect: RetryPolicy,
}

impl Default for WsChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            join_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy::exponential(5, Duration::from_millis(200), Duration::from_secs(5)),
        }
    }
}

impl WsChannelConfig {
    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            join_timeout: Duration::from_secs(1),
            reconnect: RetryPolicy::exponential(3, Duration::from_millis(20), Duration::from_millis(100)),
        }
    }
}

enum Command {
    Join {
        connection_id: ConnectionId,
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Stop,
}

struct Active {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// WebSocket push channel.
pub struct WsPushChannel {
    config: WsChannelConfig,
    active: Mutex<Option<Active>>,
}

impl WsPushChannel {
    pub fn new(config: WsChannelConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WsChannelConfig {
        &self.config
    }

    async fn shutdown_active(&self) {
        let Some(mut active) = self.active.lock().await.take() else {
            return;
        };
        let _ = active.commands.try_send(Command::Stop);
        if timeout(Duration::from_secs(1), &mut active.task).await.is_err() {
            active.task.abort();
        }
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn connect(&self, token: &str) -> Result<(ConnectionId, EventStream), ChannelError> {
        self.shutdown_active().await;

        let url = self.config.url.clone();
        let token = token.to_string();
        let (connection_id, ws) = open(&url, &token, self.config.join_timeout).await?;
        log::info!("Push channel connected as {connection_id}");

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let supervisor = Supervisor {
            url,
            token,
            join_timeout: self.config.join_timeout,
            reconnect: self.config.reconnect.clone(),
            connection_id,
            commands: commands_rx,
            events: events_tx,
            pending_join: None,
        };
        let task = tokio::spawn(supervisor.run(ws));

        *self.active.lock().await = Some(Active {
            commands: commands_tx,
            task,
        });
        Ok((connection_id, events_rx))
    }

    async fn join_group(&self, connection_id: ConnectionId, session_id: &SessionId) -> Result<(), ChannelError> {
        let commands = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.commands.clone())
            .ok_or(ChannelError::Closed)?;

        let (reply, response) = oneshot::channel();
        commands
            .send(Command::Join {
                connection_id,
                session_id: session_id.clone(),
                reply,
            })
            .await
            .map_err(|_| ChannelError::Closed)?;
        response.await.map_err(|_| ChannelError::Closed)?
    }

    async fn stop(&self) {
        self.shutdown_active().await;
    }
}

/// Dial and wait for `Welcome` or `Rejected`.
async fn open(url: &str, token: &str, limit: Duration) -> Result<(ConnectionId, WsStream), ChannelError> {
    match timeout(limit, handshake(url, token)).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::ConnectFailed("handshake timed out".into())),
    }
}

async fn handshake(url: &str, token: &str) -> Result<(ConnectionId, WsStream), ChannelError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
    if !token.is_empty() {
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ChannelError::Token(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                let msg = PushMessage::decode(&bytes)?;
                return match msg.msg_type {
                    MessageType::Welcome => Ok((msg.connection_id, ws)),
                    MessageType::Rejected => Err(match msg.reject_reason()? {
                        RejectReason::ConnectionLimit => ChannelError::ConnectionLimit,
                        RejectReason::Unauthorized => ChannelError::Unauthorized,
                    }),
                    other => Err(ChannelError::ConnectFailed(format!("unexpected {other:?} during handshake"))),
                };
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ChannelError::ConnectFailed("closed during handshake".into()));
            }
            Some(Err(e)) => return Err(ChannelError::ConnectFailed(e.to_string())),
            Some(Ok(_)) => {}
        }
    }
}

struct PendingJoin {
    session_id: SessionId,
    reply: oneshot::Sender<Result<(), ChannelError>>,
    deadline: Instant,
}

enum Exit {
    Stopped,
    Lost(String),
}

enum Redial {
    Restored(ConnectionId, WsStream),
    Failed(ChannelError),
    Stopped,
}

struct Supervisor {
    url: String,
    token: String,
    join_timeout: Duration,
    reconnect: RetryPolicy,
    connection_id: ConnectionId,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ChannelEvent>,
    pending_join: Option<PendingJoin>,
}

impl Supervisor {
    async fn run(mut self, mut ws: WsStream) {
        loop {
            match self.pump(&mut ws).await {
                Exit::Stopped => {
                    let _ = ws.close(None).await;
                    log::debug!("Push channel {} stopped", self.connection_id);
                    return;
                }
                Exit::Lost(reason) => {
                    log::info!("Push channel {} lost: {reason}", self.connection_id);
                    self.fail_pending(ChannelError::Closed);
                    if self.events.send(ChannelEvent::Reconnecting).await.is_err() {
                        return;
                    }
                    match self.redial().await {
                        Redial::Restored(connection_id, new_ws) => {
                            log::info!("Push channel reconnected as {connection_id}");
                            self.connection_id = connection_id;
                            ws = new_ws;
                            if self.events.send(ChannelEvent::Reconnected(connection_id)).await.is_err() {
                                return;
                            }
                        }
                        Redial::Failed(e) => {
                            log::warn!("Push channel gave up reconnecting: {e}");
                            let _ = self.events.send(ChannelEvent::Closed(Some(e))).await;
                            return;
                        }
                        Redial::Stopped => return,
                    }
                }
            }
        }
    }

    /// Serve commands and frames on a live socket until it stops or drops.
    async fn pump(&mut self, ws: &mut WsStream) -> Exit {
        loop {
            let deadline = self.pending_join.as_ref().map(|p| p.deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Join { connection_id, session_id, reply }) => {
                        if connection_id != self.connection_id {
                            let _ = reply.send(Err(ChannelError::JoinFailed(format!(
                                "stale connection {connection_id}"
                            ))));
                            continue;
                        }
                        let frame = PushMessage::join_group(connection_id, session_id.clone());
                        if let Err(e) = send(ws, &frame).await {
                            let _ = reply.send(Err(ChannelError::Closed));
                            return Exit::Lost(e);
                        }
                        self.fail_pending(ChannelError::JoinFailed("superseded".into()));
                        self.pending_join = Some(PendingJoin {
                            session_id,
                            reply,
                            deadline: Instant::now() + self.join_timeout,
                        });
                    }
                    Some(Command::Stop) | None => return Exit::Stopped,
                },

                frame = ws.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match PushMessage::decode(&bytes) {
                            Ok(msg) => {
                                if !self.handle_frame(msg).await {
                                    return Exit::Stopped;
                                }
                            }
                            Err(e) => log::warn!("Undecodable frame on {}: {e}", self.connection_id),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws.send(Message::Pong(data)).await {
                            return Exit::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Lost("closed by hub".into()),
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    Some(Ok(_)) => {}
                },

                _ = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => self.fail_pending(ChannelError::JoinTimeout),
            }
        }
    }

    /// Returns `false` once nobody listens to events any more.
    async fn handle_frame(&mut self, msg: PushMessage) -> bool {
        match msg.msg_type {
            MessageType::Notification => match msg.change_notification() {
                Ok(n) => return self.events.send(ChannelEvent::Notification(n)).await.is_ok(),
                Err(e) => log::warn!("Bad notification on {}: {e}", self.connection_id),
            },
            MessageType::JoinAck => self.settle_join(msg.session_id.as_ref(), Ok(())),
            MessageType::JoinFailed => {
                let reason = msg.failure_reason();
                self.settle_join(msg.session_id.as_ref(), Err(ChannelError::JoinFailed(reason)));
            }
            MessageType::Pong => {}
            other => log::debug!("Ignoring {other:?} on {}", self.connection_id),
        }
        true
    }

    fn settle_join(&mut self, session_id: Option<&SessionId>, result: Result<(), ChannelError>) {
        let matches = matches!(
            (&self.pending_join, session_id),
            (Some(pending), Some(id)) if &pending.session_id == id
        );
        if !matches {
            return;
        }
        if let Some(pending) = self.pending_join.take() {
            let _ = pending.reply.send(result);
        }
    }

    fn fail_pending(&mut self, error: ChannelError) {
        if let Some(pending) = self.pending_join.take() {
            let _ = pending.reply.send(Err(error));
        }
    }

    async fn redial(&mut self) -> Redial {
        let policy = self.reconnect.clone();
        let mut machine = RetryMachine::new(&policy);

        loop {
            let RetryState::Attempt { number } = machine.state() else {
                return Redial::Failed(ChannelError::Closed);
            };
            log::debug!("Reconnect attempt {number} to {}", self.url);

            let (url, token) = (self.url.clone(), self.token.clone());
            let Some(result) = detached(&mut self.commands, open(&url, &token, self.join_timeout)).await else {
                return Redial::Stopped;
            };
            let error = match result {
                Ok((connection_id, ws)) => {
                    machine.on_success();
                    return Redial::Restored(connection_id, ws);
                }
                Err(e) => e,
            };

            match machine.on_failure(error.is_transient()) {
                RetryState::RetryableConflict { delay, .. } => {
                    if detached(&mut self.commands, sleep(delay)).await.is_none() {
                        return Redial::Stopped;
                    }
                    machine.resume();
                }
                _ => return Redial::Failed(error),
            }
        }
    }
}

/// Drive `fut` while no socket is up. Joins are refused; `None` on stop.
async fn detached<F: Future>(commands: &mut mpsc::Receiver<Command>, fut: F) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            command = commands.recv() => match command {
                Some(Command::Join { reply, .. }) => {
                    let _ = reply.send(Err(ChannelError::JoinFailed("reconnecting".into())));
                }
                Some(Command::Stop) | None => return None,
            },
        }
    }
}

async fn send(ws: &mut WsStream, msg: &PushMessage) -> Result<(), String> {
    let bytes = msg.encode().map_err(|e| e.to_string())?;
    ws.send(Message::Binary(bytes.into())).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WsChannelConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:9090");
        assert_eq!(config.reconnect.attempts(), 5);
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        // Port 9 (discard) is not listening in test environments
        let channel = WsPushChannel::new(WsChannelConfig::for_testing("ws://127.0.0.1:9"));
        assert!(matches!(
            channel.connect("").await,
            Err(ChannelError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_join_without_connect_is_closed() {
        let channel = WsPushChannel::new(WsChannelConfig::for_testing("ws://127.0.0.1:9"));
        let result = channel
            .join_group(ConnectionId::new_v4(), &SessionId::from("S1"))
            .await;
        assert!(matches!(result, Err(ChannelError::Closed)));
    }
}
