//! Client connection lifecycle.
//!
//! One [`ConnectionManager`] per client and session. It owns the push
//! channel, runs connect + group join, follows transport reconnects and feeds
//! every notification through the [`Reconciler`] against the cached session.
//!
//! ```text
//!                 enable / force_refresh
//! NotConnected ─────────────────────────► Connecting
//!      ▲  ▲                                  │ connect ok + join ok
//!      │  │ close, join failure,             ▼
//!      │  └──── capacity rejection ──── Connected ◄────┐
//!      │                                    │          │ rejoin ok
//!      │ redial gave up / rejoin failed     ▼          │
//!      └──────────────────────────────  Reconnecting ──┘
//! ```
//!
//! A connection that never joined its group is `NotConnected`: it would miss
//! every notification. Alerts reach the UI only while live updates are
//! enabled; disabling stops the channel quietly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use agora_core::{ChangeNotification, Session, SessionId};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{ChannelError, ChannelEvent, PushChannel, TokenSource};
use crate::reconcile::{Action, Reconciler, DEFAULT_MAX_CONSECUTIVE_HINTS};

/// Connectivity of one client to its session group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    NotConnected,
}

/// Whether the provider refused us for capacity reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionLimitState {
    Exhausted,
    NotExhausted,
}

/// UI collaborator. Calls arrive on the manager's task and must not block.
pub trait UiSink: Send + Sync {
    /// Dismissible alert for `NotConnected` or `Reconnecting`.
    fn on_connectivity_alert(&self, state: ConnectionState);

    /// Connected again after an alert.
    fn on_connectivity_restored(&self) {}

    fn on_stale_hint(&self);

    fn on_full_refresh_required(&self);

    /// The cached session ended and was dropped.
    fn on_session_cleared(&self) {}
}

/// The client's cached session snapshot.
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    session: Option<Session>,
}

impl SessionCache {
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn replace(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn clear(&mut self) {
        self.session = None;
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Consecutive stale hints before a hint is escalated to a full refresh
    pub max_consecutive_hints: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_consecutive_hints: DEFAULT_MAX_CONSECUTIVE_HINTS,
        }
    }
}

type NotificationHandler = Box<dyn Fn(&ChangeNotification, Action) + Send + Sync>;

/// Transition bookkeeping. `generation` changes on every (re)start and on
/// disable; work started under an older generation is ignored.
struct Control {
    generation: u64,
    enabled: bool,
    alerted: bool,
    limit: ConnectionLimitState,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    session_id: SessionId,
    channel: Arc<dyn PushChannel>,
    tokens: Arc<dyn TokenSource>,
    ui: Arc<dyn UiSink>,
    state: watch::Sender<ConnectionState>,
    control: Mutex<Control>,
    cache: Mutex<SessionCache>,
    reconciler: Mutex<Reconciler>,
    handlers: RwLock<Vec<NotificationHandler>>,
    notifications: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        lock(&self.control).generation == generation
    }

    /// Apply a transition made under `generation`. Returns `false` if stale.
    fn transition(&self, generation: u64, state: ConnectionState) -> bool {
        let (alert, restored) = {
            let mut control = lock(&self.control);
            if control.generation != generation || !control.enabled {
                return false;
            }
            self.state.send_replace(state);
            match state {
                ConnectionState::NotConnected | ConnectionState::Reconnecting => {
                    control.alerted = true;
                    (true, false)
                }
                ConnectionState::Connected => (false, std::mem::take(&mut control.alerted)),
                ConnectionState::Connecting => (false, false),
            }
        };

        log::info!("Session {} live updates: {state:?}", self.session_id);
        if alert {
            self.ui.on_connectivity_alert(state);
        }
        if restored {
            self.ui.on_connectivity_restored();
        }
        true
    }

    fn fail(&self, generation: u64, error: &ChannelError) {
        if matches!(error, ChannelError::ConnectionLimit) {
            log::warn!("Push provider at capacity for session {}: {error}", self.session_id);
            let mut control = lock(&self.control);
            if control.generation == generation {
                control.limit = ConnectionLimitState::Exhausted;
            }
        } else {
            log::error!("Live updates failed for session {}: {error}", self.session_id);
        }
        self.transition(generation, ConnectionState::NotConnected);
    }

    /// Stop a connection that never made it into its group. A newer
    /// generation owns the channel and is left alone.
    async fn release(&self, generation: u64) {
        if self.is_current(generation) {
            self.channel.stop().await;
        }
    }

    fn dispatch(&self, notification: &ChangeNotification) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        let action = {
            let mut cache = lock(&self.cache);
            let mut reconciler = lock(&self.reconciler);
            let action = reconciler.observe(notification, cache.session());
            if action == Action::ClearSession {
                cache.clear();
                reconciler.reset();
            }
            action
        };
        log::debug!(
            "{:?} on session {} -> {action:?}",
            notification.notification_type(),
            notification.session_id
        );

        match action {
            Action::FullRefresh => self.ui.on_full_refresh_required(),
            Action::ShowStaleHint => self.ui.on_stale_hint(),
            Action::ClearSession => self.ui.on_session_cleared(),
            Action::ApplyNoop => {}
        }

        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        for handler in handlers.iter() {
            handler(notification, action);
        }
    }
}

/// Connect, join, then follow the channel until it closes or the
/// generation moves on.
async fn drive(inner: Arc<Inner>, generation: u64) {
    let token = match inner.tokens.token().await {
        Ok(token) => token,
        Err(e) => return inner.fail(generation, &e),
    };
    let (mut connection_id, mut events) = match inner.channel.connect(&token).await {
        Ok(connected) => connected,
        Err(e) => return inner.fail(generation, &e),
    };
    if !inner.is_current(generation) {
        return;
    }
    if let Err(e) = inner.channel.join_group(connection_id, &inner.session_id).await {
        inner.fail(generation, &e);
        inner.release(generation).await;
        return;
    }
    inner.transition(generation, ConnectionState::Connected);

    while let Some(event) = events.recv().await {
        if !inner.is_current(generation) {
            return;
        }
        match event {
            ChannelEvent::Notification(notification) => inner.dispatch(&notification),
            ChannelEvent::Reconnecting => {
                inner.transition(generation, ConnectionState::Reconnecting);
            }
            ChannelEvent::Reconnected(new_id) => {
                connection_id = new_id;
                match inner.channel.join_group(connection_id, &inner.session_id).await {
                    Ok(()) => {
                        inner.transition(generation, ConnectionState::Connected);
                    }
                    Err(e) => {
                        inner.fail(generation, &e);
                        inner.release(generation).await;
                        return;
                    }
                }
            }
            ChannelEvent::Closed(Some(e)) => return inner.fail(generation, &e),
            ChannelEvent::Closed(None) => {
                log::info!("Push channel for session {} closed", inner.session_id);
                inner.transition(generation, ConnectionState::NotConnected);
                return;
            }
        }
    }
    inner.transition(generation, ConnectionState::NotConnected);
}

/// Live-update connection for one session on one client.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        session_id: SessionId,
        channel: Arc<dyn PushChannel>,
        tokens: Arc<dyn TokenSource>,
        ui: Arc<dyn UiSink>,
        config: LifecycleConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::NotConnected);
        Self {
            inner: Arc::new(Inner {
                session_id,
                channel,
                tokens,
                ui,
                state,
                control: Mutex::new(Control {
                    generation: 0,
                    enabled: false,
                    alerted: false,
                    limit: ConnectionLimitState::NotExhausted,
                    task: None,
                }),
                cache: Mutex::new(SessionCache::default()),
                reconciler: Mutex::new(Reconciler::new(config.max_consecutive_hints)),
                handlers: RwLock::new(Vec::new()),
                notifications: AtomicU64::new(0),
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Enable: full connect + join from `Connecting`. Disable: stop the
    /// channel without raising an alert. Repeating the current setting does
    /// nothing.
    pub async fn set_live_updates_enabled(&self, enabled: bool) {
        if enabled {
            {
                let mut control = lock(&self.inner.control);
                if control.enabled {
                    return;
                }
                control.enabled = true;
            }
            self.restart().await;
            return;
        }

        let task = {
            let mut control = lock(&self.inner.control);
            if !control.enabled {
                return;
            }
            control.enabled = false;
            control.alerted = false;
            control.generation += 1;
            control.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.inner.channel.stop().await;
        self.inner.state.send_replace(ConnectionState::NotConnected);
        log::info!("Live updates disabled for session {}", self.inner.session_id);
    }

    pub fn is_live_updates_enabled(&self) -> bool {
        lock(&self.inner.control).enabled
    }

    /// Manual retry: restart the connect sequence unless already connected.
    /// Returns whether a restart happened.
    pub async fn force_refresh_connection(&self) -> bool {
        if !self.is_live_updates_enabled() || self.current_state() == ConnectionState::Connected {
            return false;
        }
        self.restart().await;
        true
    }

    async fn restart(&self) {
        let (generation, previous) = {
            let mut control = lock(&self.inner.control);
            control.generation += 1;
            control.limit = ConnectionLimitState::NotExhausted;
            (control.generation, control.task.take())
        };
        if let Some(task) = previous {
            task.abort();
        }
        self.inner.transition(generation, ConnectionState::Connecting);

        let handle = tokio::spawn(drive(self.inner.clone(), generation));
        let mut control = lock(&self.inner.control);
        if control.generation == generation {
            control.task = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Register a handler called with every notification and the action
    /// taken for it.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(&ChangeNotification, Action) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn connection_limit_state(&self) -> ConnectionLimitState {
        lock(&self.inner.control).limit
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Install a freshly fetched snapshot; pending hints are resolved.
    pub fn apply_snapshot(&self, session: Session) {
        lock(&self.inner.cache).replace(session);
        lock(&self.inner.reconciler).reset();
    }

    pub fn cached_session(&self) -> Option<Session> {
        lock(&self.inner.cache).session().cloned()
    }

    pub fn pending_hints(&self) -> u32 {
        lock(&self.inner.reconciler).pending_hints()
    }

    /// Notifications processed so far.
    pub fn notifications_seen(&self) -> u64 {
        self.inner.notifications.load(Ordering::Relaxed)
    }

    /// Stop following the session and wait until the channel is released.
    pub async fn close(self) {
        self.set_live_updates_enabled(false).await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut control = lock(&self.inner.control);
        control.generation += 1;
        if let Some(task) = control.task.take() {
            task.abort();
        }
        if !std::mem::take(&mut control.enabled) {
            return;
        }
        // Socket and group membership are released in the background
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let channel = self.inner.channel.clone();
                handle.spawn(async move { channel.stop().await });
            }
            Err(_) => log::warn!(
                "Connection manager for session {} dropped outside a runtime; channel left open",
                self.inner.session_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::PushHub;
    use crate::channel::{LocalPushChannel, StaticToken};
    use agora_core::{Author, Question};
    use tokio::time::{sleep, timeout, Duration};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum UiCall {
        Alert(ConnectionState),
        Restored,
        StaleHint,
        FullRefresh,
        Cleared,
    }

    #[derive(Default)]
    struct RecordingUi {
        calls: Mutex<Vec<UiCall>>,
    }

    impl RecordingUi {
        fn calls(&self) -> Vec<UiCall> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: UiCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl UiSink for RecordingUi {
        fn on_connectivity_alert(&self, state: ConnectionState) {
            self.record(UiCall::Alert(state));
        }
        fn on_connectivity_restored(&self) {
            self.record(UiCall::Restored);
        }
        fn on_stale_hint(&self) {
            self.record(UiCall::StaleHint);
        }
        fn on_full_refresh_required(&self) {
            self.record(UiCall::FullRefresh);
        }
        fn on_session_cleared(&self) {
            self.record(UiCall::Cleared);
        }
    }

    struct Fixture {
        hub: Arc<PushHub>,
        channel: Arc<LocalPushChannel>,
        ui: Arc<RecordingUi>,
        manager: ConnectionManager,
    }

    fn fixture_with(max_connections: usize, config: LifecycleConfig) -> Fixture {
        let hub = Arc::new(PushHub::new(max_connections, 64));
        let channel = Arc::new(LocalPushChannel::new(hub.clone()));
        let ui = Arc::new(RecordingUi::default());
        let manager = ConnectionManager::new(
            SessionId::from("S1"),
            channel.clone(),
            Arc::new(StaticToken::new("token")),
            ui.clone(),
            config,
        );
        Fixture { hub, channel, ui, manager }
    }

    fn fixture() -> Fixture {
        fixture_with(8, LifecycleConfig::default())
    }

    async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
        let mut rx = manager.subscribe_state();
        timeout(Duration::from_secs(1), rx.wait_for(|s| *s == target))
            .await
            .expect("state reached in time")
            .expect("state sender alive");
    }

    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn snapshot_with(question_ids: &[&str]) -> Session {
        let mut session = Session::empty("S1", "host");
        for id in question_ids {
            session.add_question(Question::with_id(*id, "S1", "content", Author::new("U9", "Nine")));
        }
        session
    }

    #[tokio::test]
    async fn test_enable_connects_and_joins() {
        let f = fixture();
        assert_eq!(f.manager.current_state(), ConnectionState::NotConnected);

        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        let conn = f.channel.connection_id().await.unwrap();
        let group = f.hub.group(&SessionId::from("S1")).await.unwrap();
        assert!(group.has_member(&conn).await);
        assert!(f.ui.calls().is_empty());
    }

    #[tokio::test]
    async fn test_join_failure_is_not_connected() {
        let f = fixture();
        f.channel.fail_next_joins(1);

        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::NotConnected).await;

        eventually(|| f.ui.calls() == vec![UiCall::Alert(ConnectionState::NotConnected)]).await;
        assert_eq!(f.manager.current_state(), ConnectionState::NotConnected);
        assert_eq!(f.manager.connection_limit_state(), ConnectionLimitState::NotExhausted);
        // The joinless connection was released
        for _ in 0..100 {
            if f.hub.connection_count().await == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_limit_sets_exhausted() {
        let f = fixture_with(0, LifecycleConfig::default());

        f.manager.set_live_updates_enabled(true).await;
        eventually(|| f.manager.connection_limit_state() == ConnectionLimitState::Exhausted).await;
        assert_eq!(f.manager.current_state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_disable_raises_no_alert() {
        let f = fixture();
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        f.manager.set_live_updates_enabled(false).await;
        assert_eq!(f.manager.current_state(), ConnectionState::NotConnected);
        assert_eq!(f.hub.connection_count().await, 0);
        sleep(Duration::from_millis(20)).await;
        assert!(f.ui.calls().is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_channel() {
        let f = fixture();
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;
        assert_eq!(f.hub.connection_count().await, 1);

        f.manager.close().await;
        assert_eq!(f.hub.connection_count().await, 0);
        assert!(f.hub.group(&SessionId::from("S1")).await.is_none());
        assert!(f.ui.calls().is_empty());
    }

    #[tokio::test]
    async fn test_drop_releases_channel() {
        let f = fixture();
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        let Fixture { hub, manager, .. } = f;
        drop(manager);
        for _ in 0..100 {
            if hub.connection_count().await == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_transport_reconnect_rejoins_with_new_identity() {
        let f = fixture();
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        let new_id = f.channel.simulate_reconnect().await.unwrap();
        eventually(|| f.ui.calls().contains(&UiCall::Restored)).await;

        assert_eq!(
            f.ui.calls(),
            vec![UiCall::Alert(ConnectionState::Reconnecting), UiCall::Restored]
        );
        assert_eq!(f.manager.current_state(), ConnectionState::Connected);
        let group = f.hub.group(&SessionId::from("S1")).await.unwrap();
        assert!(group.has_member(&new_id).await);
    }

    #[tokio::test]
    async fn test_rejoin_failure_after_reconnect() {
        let f = fixture();
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        f.channel.fail_next_joins(1);
        f.channel.simulate_reconnect().await.unwrap();
        wait_for_state(&f.manager, ConnectionState::NotConnected).await;
        eventually(|| f.ui.calls().len() == 2).await;
        assert_eq!(
            f.ui.calls(),
            vec![
                UiCall::Alert(ConnectionState::Reconnecting),
                UiCall::Alert(ConnectionState::NotConnected)
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_close_alerts() {
        let f = fixture();
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        f.channel.simulate_close().await;
        wait_for_state(&f.manager, ConnectionState::NotConnected).await;
        eventually(|| f.ui.calls() == vec![UiCall::Alert(ConnectionState::NotConnected)]).await;
    }

    #[tokio::test]
    async fn test_force_refresh_recovers() {
        let f = fixture();
        f.channel.fail_next_joins(1);
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::NotConnected).await;
        eventually(|| !f.ui.calls().is_empty()).await;

        assert!(f.manager.force_refresh_connection().await);
        wait_for_state(&f.manager, ConnectionState::Connected).await;
        eventually(|| f.ui.calls().contains(&UiCall::Restored)).await;

        // Already connected: nothing to do
        assert!(!f.manager.force_refresh_connection().await);
    }

    #[tokio::test]
    async fn test_force_refresh_ignored_when_disabled() {
        let f = fixture();
        assert!(!f.manager.force_refresh_connection().await);
        assert_eq!(f.manager.current_state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_notifications_reconcile_against_cache() {
        let f = fixture();
        f.manager.apply_snapshot(snapshot_with(&["Q2"]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.manager.on_notification(move |_, action| sink.lock().unwrap().push(action));

        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        f.hub.publish(&ChangeNotification::question_added("S1", "Q2")).await;
        f.hub.publish(&ChangeNotification::question_added("S1", "Q1")).await;
        f.hub.publish(&ChangeNotification::session_ended("S1")).await;
        eventually(|| seen.lock().unwrap().len() == 3).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Action::ApplyNoop, Action::ShowStaleHint, Action::ClearSession]
        );
        assert_eq!(f.ui.calls(), vec![UiCall::StaleHint, UiCall::Cleared]);
        assert!(f.manager.cached_session().is_none());
    }

    #[tokio::test]
    async fn test_hint_ceiling_escalates() {
        let config = LifecycleConfig {
            max_consecutive_hints: 2,
        };
        let f = fixture_with(8, config);
        f.manager.apply_snapshot(snapshot_with(&["Q9"]));
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        for id in ["Q1", "Q2", "Q3"] {
            f.hub.publish(&ChangeNotification::question_added("S1", id)).await;
        }
        eventually(|| f.manager.notifications_seen() == 3).await;

        assert_eq!(
            f.ui.calls(),
            vec![UiCall::StaleHint, UiCall::StaleHint, UiCall::FullRefresh]
        );
        assert_eq!(f.manager.pending_hints(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_resets_hints() {
        let f = fixture();
        f.manager.apply_snapshot(snapshot_with(&["Q9"]));
        f.manager.set_live_updates_enabled(true).await;
        wait_for_state(&f.manager, ConnectionState::Connected).await;

        f.hub.publish(&ChangeNotification::question_added("S1", "Q1")).await;
        eventually(|| f.manager.pending_hints() == 1).await;

        f.manager.apply_snapshot(snapshot_with(&["Q9", "Q1"]));
        assert_eq!(f.manager.pending_hints(), 0);
    }

    #[tokio::test]
    async fn test_reenable_resets_state() {
        let f = fixture_with(0, LifecycleConfig::default());
        f.manager.set_live_updates_enabled(true).await;
        eventually(|| f.manager.connection_limit_state() == ConnectionLimitState::Exhausted).await;

        f.manager.set_live_updates_enabled(false).await;
        f.manager.set_live_updates_enabled(true).await;
        // Reset on enable, then exhausted again by the same full hub
        eventually(|| f.manager.connection_limit_state() == ConnectionLimitState::Exhausted).await;
        assert!(f.manager.is_live_updates_enabled());
    }
}
