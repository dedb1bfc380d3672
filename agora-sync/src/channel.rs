//! Client side of the push channel.
//!
//! A [`PushChannel`] opens a raw connection and then, as a separate step,
//! joins a session group. Connecting says nothing about membership: until
//! `join_group` succeeds the connection receives nothing.
//!
//! After `connect` the channel reports through an event stream:
//!
//! ```text
//! Notification(n)      a group notification
//! Reconnecting         transport lost the socket and is retrying
//! Reconnected(new_id)  transport is back under a new connection id;
//!                      group membership did not survive
//! Closed(reason)       channel is gone for good
//! ```
//!
//! [`LocalPushChannel`] runs in-process over a [`PushHub`] and can inject
//! faults. The WebSocket implementation lives in [`crate::transport`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use agora_core::{ChangeNotification, SessionId};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::{HubError, NotificationReceiver, PushHub};
use crate::protocol::{ConnectionId, ProtocolError};
use crate::storage::Transient;

/// Buffered events per channel before the producer waits.
pub const EVENT_BUFFER: usize = 256;

/// Something the channel reports after `connect`.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Notification(ChangeNotification),
    Reconnecting,
    Reconnected(ConnectionId),
    /// `None` for an orderly close
    Closed(Option<ChannelError>),
}

/// Receiving end of a channel's events.
pub type EventStream = mpsc::Receiver<ChannelEvent>;

/// Push channel errors.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Provider refused the connection for capacity reasons
    #[error("Connection limit reached")]
    ConnectionLimit,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Group join failed: {0}")]
    JoinFailed(String),
    #[error("Group join timed out")]
    JoinTimeout,
    #[error("Channel closed")]
    Closed,
    #[error("Token unavailable: {0}")]
    Token(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Transient for ChannelError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::ConnectFailed(_) | ChannelError::JoinTimeout | ChannelError::Closed
        )
    }
}

impl From<HubError> for ChannelError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::ConnectionLimit { .. } => ChannelError::ConnectionLimit,
            HubError::UnknownConnection(id) => ChannelError::JoinFailed(format!("unknown connection {id}")),
        }
    }
}

/// Connection to a push provider.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Open a connection. Does not join any group.
    async fn connect(&self, token: &str) -> Result<(ConnectionId, EventStream), ChannelError>;

    /// Join the session group with the given connection.
    async fn join_group(&self, connection_id: ConnectionId, session_id: &SessionId) -> Result<(), ChannelError>;

    /// Close the connection. No `Closed` event is emitted for a stop.
    async fn stop(&self);
}

/// Source of the auth token handed to `connect`.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, ChannelError>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, ChannelError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct LocalState {
    connection_id: Option<ConnectionId>,
    events: Option<mpsc::Sender<ChannelEvent>>,
    forwarder: Option<JoinHandle<()>>,
}

impl LocalState {
    fn stop_forwarding(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

/// In-process [`PushChannel`] over a shared [`PushHub`].
pub struct LocalPushChannel {
    hub: Arc<PushHub>,
    state: Mutex<LocalState>,
    failing_joins: AtomicU32,
}

impl LocalPushChannel {
    pub fn new(hub: Arc<PushHub>) -> Self {
        Self {
            hub,
            state: Mutex::new(LocalState::default()),
            failing_joins: AtomicU32::new(0),
        }
    }

    /// Make the next `count` joins fail.
    pub fn fail_next_joins(&self, count: u32) {
        self.failing_joins.store(count, Ordering::SeqCst);
    }

    pub async fn connection_id(&self) -> Option<ConnectionId> {
        self.state.lock().await.connection_id
    }

    /// Transport-initiated reconnect: `Reconnecting`, new connection id,
    /// `Reconnected`. Group membership is lost.
    pub async fn simulate_reconnect(&self) -> Result<ConnectionId, ChannelError> {
        let mut state = self.state.lock().await;
        let events = state.events.clone().ok_or(ChannelError::Closed)?;
        let _ = events.send(ChannelEvent::Reconnecting).await;

        state.stop_forwarding();
        if let Some(old) = state.connection_id.take() {
            self.hub.unregister_connection(&old).await;
        }
        match self.hub.register_connection().await {
            Ok(new_id) => {
                state.connection_id = Some(new_id);
                let _ = events.send(ChannelEvent::Reconnected(new_id)).await;
                Ok(new_id)
            }
            Err(e) => {
                let err = ChannelError::from(e);
                state.events = None;
                let _ = events.send(ChannelEvent::Closed(Some(err.clone()))).await;
                Err(err)
            }
        }
    }

    /// Transport gave up: `Reconnecting` then `Closed`.
    pub async fn simulate_reconnect_failure(&self) {
        let mut state = self.state.lock().await;
        if let Some(events) = state.events.take() {
            let _ = events.send(ChannelEvent::Reconnecting).await;
            let _ = events
                .send(ChannelEvent::Closed(Some(ChannelError::ConnectFailed("gave up".into()))))
                .await;
        }
        self.teardown(&mut state).await;
    }

    /// The provider closed the connection.
    pub async fn simulate_close(&self) {
        let mut state = self.state.lock().await;
        if let Some(events) = state.events.take() {
            let _ = events.send(ChannelEvent::Closed(None)).await;
        }
        self.teardown(&mut state).await;
    }

    async fn teardown(&self, state: &mut LocalState) {
        state.stop_forwarding();
        state.events = None;
        if let Some(id) = state.connection_id.take() {
            self.hub.unregister_connection(&id).await;
        }
    }
}

#[async_trait]
impl PushChannel for LocalPushChannel {
    async fn connect(&self, _token: &str) -> Result<(ConnectionId, EventStream), ChannelError> {
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await;

        let connection_id = self.hub.register_connection().await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        state.connection_id = Some(connection_id);
        state.events = Some(tx);
        Ok((connection_id, rx))
    }

    async fn join_group(&self, connection_id: ConnectionId, session_id: &SessionId) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.connection_id != Some(connection_id) {
            return Err(ChannelError::JoinFailed(format!("stale connection {connection_id}")));
        }
        let injected = self
            .failing_joins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ChannelError::JoinFailed("injected failure".into()));
        }
        let events = state.events.clone().ok_or(ChannelError::Closed)?;

        let rx = self.hub.join(&connection_id, session_id).await?;
        state.stop_forwarding();
        state.forwarder = Some(tokio::spawn(forward(
            self.hub.clone(),
            session_id.clone(),
            rx,
            events,
        )));
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await;
    }
}

/// Copy group notifications into the event stream until either side closes.
async fn forward(
    hub: Arc<PushHub>,
    session_id: SessionId,
    mut rx: NotificationReceiver,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(n) => {
                if events.send(ChannelEvent::Notification((*n).clone())).await.is_err() {
                    return;
                }
            }
            Err(RecvError::Lagged(count)) => hub.note_lagged(&session_id, count).await,
            Err(RecvError::Closed) => return,
        }
    }
}
