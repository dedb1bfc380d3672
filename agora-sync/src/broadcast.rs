//! Session-group fan-out of change notifications.
//!
//! Each session has one [`BroadcastGroup`]: a tokio broadcast channel plus
//! the set of member connections. A publish is one `send`, shared by all
//! members as an `Arc`. Members that fall more than `capacity` notifications
//! behind lose the oldest ones; those losses are counted, and receivers
//! recover through reconciliation, never through replay.
//!
//! [`PushHub`] owns the connection registry (bounded by `max_connections`)
//! and maps session ids to groups.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agora_core::{ChangeNotification, SessionId};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::ConnectionId;

/// Receiver half handed to a group member.
pub type NotificationReceiver = broadcast::Receiver<Arc<ChangeNotification>>;

/// Statistics for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub notifications_sent: u64,
    pub notifications_dropped: u64,
    pub active_members: usize,
}

#[derive(Default)]
struct AtomicGroupStats {
    notifications_sent: AtomicU64,
    notifications_dropped: AtomicU64,
}

/// Fan-out channel for one session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<ChangeNotification>>,
    members: RwLock<HashSet<ConnectionId>>,
    capacity: usize,
    atomic_stats: AtomicGroupStats,
}

impl BroadcastGroup {
    /// `capacity` notifications are buffered per member before the oldest
    /// are dropped for that member.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicGroupStats::default(),
        }
    }

    pub async fn add_member(&self, connection_id: ConnectionId) -> NotificationReceiver {
        self.members.write().await.insert(connection_id);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.write().await.remove(connection_id)
    }

    /// Send to every member. Returns how many receivers got it.
    pub fn publish(&self, notification: Arc<ChangeNotification>) -> usize {
        let count = self.sender.send(notification).unwrap_or(0);
        self.atomic_stats.notifications_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// A member reported `count` notifications lost to lag.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.notifications_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.read().await.contains(connection_id)
    }

    pub async fn members(&self) -> Vec<ConnectionId> {
        self.members.read().await.iter().copied().collect()
    }

    pub async fn stats(&self) -> GroupStats {
        GroupStats {
            notifications_sent: self.atomic_stats.notifications_sent.load(Ordering::Relaxed),
            notifications_dropped: self.atomic_stats.notifications_dropped.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Hub is at capacity
    #[error("Connection limit reached ({max} connections)")]
    ConnectionLimit { max: usize },
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Hub-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub groups: usize,
    pub notifications_published: u64,
    pub connections_rejected: u64,
}

/// Connection registry plus session groups.
pub struct PushHub {
    /// Connection -> the group it joined, if any
    connections: RwLock<HashMap<ConnectionId, Option<SessionId>>>,
    groups: RwLock<HashMap<SessionId, Arc<BroadcastGroup>>>,
    max_connections: usize,
    group_capacity: usize,
    published: AtomicU64,
    rejected: AtomicU64,
}

impl PushHub {
    pub fn new(max_connections: usize, group_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            max_connections,
            group_capacity,
            published: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Admit a new connection, or refuse it when the hub is full.
    pub async fn register_connection(&self) -> Result<ConnectionId, HubError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_connections {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Rejecting connection: limit of {} reached",
                self.max_connections
            );
            return Err(HubError::ConnectionLimit {
                max: self.max_connections,
            });
        }
        let connection_id = Uuid::new_v4();
        connections.insert(connection_id, None);
        log::debug!("Connection {connection_id} registered ({} total)", connections.len());
        Ok(connection_id)
    }

    /// Drop a connection and its group membership.
    pub async fn unregister_connection(&self, connection_id: &ConnectionId) {
        let joined = self.connections.write().await.remove(connection_id).flatten();
        if let Some(session_id) = joined {
            self.leave_group(connection_id, &session_id).await;
        }
    }

    /// Join the session group. A connection belongs to at most one group;
    /// joining another leaves the previous one.
    pub async fn join(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Result<NotificationReceiver, HubError> {
        let previous = {
            let mut connections = self.connections.write().await;
            let slot = connections
                .get_mut(connection_id)
                .ok_or(HubError::UnknownConnection(*connection_id))?;
            slot.replace(session_id.clone())
        };
        if let Some(previous) = previous.filter(|p| p != session_id) {
            self.leave_group(connection_id, &previous).await;
        }

        // Membership is added under the groups lock so `remove_if_empty`
        // cannot drop the group in between.
        let receiver = {
            let mut groups = self.groups.write().await;
            let group = groups
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(BroadcastGroup::new(self.group_capacity)));
            group.add_member(*connection_id).await
        };
        log::debug!("Connection {connection_id} joined session {session_id}");
        Ok(receiver)
    }

    /// Leave whatever group the connection joined.
    pub async fn leave(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        let session_id = self
            .connections
            .write()
            .await
            .get_mut(connection_id)
            .and_then(Option::take)?;
        self.leave_group(connection_id, &session_id).await;
        Some(session_id)
    }

    async fn leave_group(&self, connection_id: &ConnectionId, session_id: &SessionId) {
        if let Some(group) = self.group(session_id).await {
            group.remove_member(connection_id).await;
        }
        self.remove_if_empty(session_id).await;
    }

    /// Fan out to the notification's session group.
    pub async fn publish(&self, notification: &ChangeNotification) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        match self.group(&notification.session_id).await {
            Some(group) => {
                let count = group.publish(Arc::new(notification.clone()));
                log::trace!(
                    "Published {:?} for {} to {count} members",
                    notification.notification_type(),
                    notification.session_id
                );
                count
            }
            None => 0,
        }
    }

    /// A member of `session_id` lost `count` notifications to lag.
    pub async fn note_lagged(&self, session_id: &SessionId, count: u64) {
        log::warn!("Subscriber of session {session_id} lagged; {count} notifications dropped");
        if let Some(group) = self.group(session_id).await {
            group.record_dropped(count);
        }
    }

    pub async fn group(&self, session_id: &SessionId) -> Option<Arc<BroadcastGroup>> {
        self.groups.read().await.get(session_id).cloned()
    }

    async fn remove_if_empty(&self, session_id: &SessionId) -> bool {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get(session_id) {
            if group.member_count().await == 0 {
                groups.remove(session_id);
                return true;
            }
        }
        false
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connection_count().await,
            groups: self.group_count().await,
            notifications_published: self.published.load(Ordering::Relaxed),
            connections_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Where committed mutations announce themselves.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Best effort. Returns how many subscribers were reached.
    async fn publish(&self, notification: &ChangeNotification) -> Result<usize, HubError>;
}

#[async_trait]
impl NotificationSink for PushHub {
    async fn publish(&self, notification: &ChangeNotification) -> Result<usize, HubError> {
        Ok(PushHub::publish(self, notification).await)
    }
}
