//! Per-session coalescing of outbound session-view updates.
//!
//! Every successful mutation calls [`UpdateScheduler::notify_mutated`]. The
//! scheduler turns bursts of those calls into few `emit`s, each of which loads
//! the latest [`SessionView`] and hands it to the message-update API.
//!
//! ```text
//! notify_mutated(S1) ──► [trigger slot S1] ──► worker S1 ──► load_view ──► push_session_update
//! notify_mutated(S2) ──► [trigger slot S2] ──► worker S2 ──► ...
//! ```
//!
//! Timing rules for one session:
//! - Leading edge: a trigger after a quiet period (no trigger for `interval`)
//!   and outside the cooldown emits at once.
//! - Otherwise the update is pending. It fires `interval` after the last
//!   trigger, but no later than `max_wait` after the first pending trigger.
//! - Never sooner than `post_cooldown` after the previous emit.
//!
//! One worker task per session runs its emits one at a time; sessions run in
//! parallel. A failed emit is logged and not retried; the next mutation
//! tries again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_core::{SessionId, SessionView};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::storage::PersistenceError;

/// Scheduler timing configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Quiet period that ends a burst
    pub interval: Duration,
    /// Longest a pending update may be held back by continuous triggers
    pub max_wait: Duration,
    /// Minimum gap between two emits for the same session
    pub post_cooldown: Duration,
    /// Unanswered questions included in the rendered view
    pub top_n: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(5),
            post_cooldown: Duration::from_secs(2),
            top_n: 5,
        }
    }
}

impl SchedulerConfig {
    /// Short windows for tests.
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_wait: Duration::from_millis(500),
            post_cooldown: Duration::from_millis(200),
            top_n: 5,
        }
    }
}

/// Errors from producing or delivering a session update.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("Session view unavailable: {0}")]
    View(#[from] PersistenceError),
    #[error("Message update rejected: {0}")]
    Rejected(String),
    #[error("Message update API unavailable: {0}")]
    Unavailable(String),
}

/// Where the latest view of a session comes from.
#[async_trait]
pub trait SessionViewSource: Send + Sync {
    async fn load_view(&self, session_id: &SessionId, top_n: usize) -> Result<SessionView, PublishError>;
}

/// The external message-update API. Re-sending an identical view is harmless.
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    async fn push_session_update(&self, session_id: &SessionId, view: SessionView) -> Result<(), PublishError>;
}

/// Coalescing state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdateTask {
    pub session_id: SessionId,
    /// When the last emit started
    pub last_emitted_at: Option<Instant>,
    /// When the pending update is due, if one is pending
    pub scheduled_at: Option<Instant>,
}

impl PendingUpdateTask {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            last_emitted_at: None,
            scheduled_at: None,
        }
    }
}

/// Counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub triggers: u64,
    pub emitted: u64,
    pub failed: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicSchedulerStats {
    triggers: AtomicU64,
    emitted: AtomicU64,
    failed: AtomicU64,
}

/// State shared by all session workers.
struct Shared {
    config: SchedulerConfig,
    source: Arc<dyn SessionViewSource>,
    publisher: Arc<dyn UpdatePublisher>,
    stats: AtomicSchedulerStats,
}

struct SessionEntry {
    /// Capacity-1 slot; a full slot already means "update pending"
    trigger: mpsc::Sender<()>,
    task: Arc<Mutex<PendingUpdateTask>>,
    _worker: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    workers: HashMap<SessionId, SessionEntry>,
    /// Forgotten sessions; their mutations are ignored from then on
    retired: HashSet<SessionId>,
}

/// Registry of per-session coalescing workers.
pub struct UpdateScheduler {
    shared: Arc<Shared>,
    sessions: Mutex<Registry>,
    shut_down: AtomicBool,
}

impl UpdateScheduler {
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn SessionViewSource>,
        publisher: Arc<dyn UpdatePublisher>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                source,
                publisher,
                stats: AtomicSchedulerStats::default(),
            }),
            sessions: Mutex::new(Registry::default()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Record a successful mutation of `session_id`. Must be called from
    /// within a tokio runtime.
    pub fn notify_mutated(&self, session_id: &SessionId) {
        if self.shut_down.load(Ordering::Acquire) {
            log::trace!("Scheduler shut down; ignoring mutation of {session_id}");
            return;
        }
        let Ok(mut sessions) = self.sessions.lock() else {
            log::error!("Scheduler registry poisoned; dropping update for {session_id}");
            return;
        };
        if sessions.retired.contains(session_id) {
            log::trace!("Session {session_id} was forgotten; ignoring mutation");
            return;
        }
        self.shared.stats.triggers.fetch_add(1, Ordering::Relaxed);

        let entry = sessions
            .workers
            .entry(session_id.clone())
            .or_insert_with(|| self.spawn_worker(session_id));

        if let Err(mpsc::error::TrySendError::Closed(())) = entry.trigger.try_send(()) {
            // Worker gone (panicked emit); start over
            log::warn!("Update worker for {session_id} stopped; restarting");
            let fresh = self.spawn_worker(session_id);
            // An empty capacity-1 slot always has room
            let _ = fresh.trigger.try_send(());
            sessions.workers.insert(session_id.clone(), fresh);
        }
    }

    fn spawn_worker(&self, session_id: &SessionId) -> SessionEntry {
        let (trigger, rx) = mpsc::channel(1);
        let task = Arc::new(Mutex::new(PendingUpdateTask::new(session_id.clone())));
        let worker = tokio::spawn(run_worker(self.shared.clone(), task.clone(), session_id.clone(), rx));
        SessionEntry {
            trigger,
            task,
            _worker: worker,
        }
    }

    /// Stop scheduling for a session for good. An update already pending is
    /// flushed once, still honouring the cooldown; an emit in flight
    /// completes. Returns whether the session had a worker.
    pub fn forget_session(&self, session_id: &SessionId) -> bool {
        match self.sessions.lock() {
            Ok(mut sessions) => {
                sessions.retired.insert(session_id.clone());
                sessions.workers.remove(session_id).is_some()
            }
            Err(_) => false,
        }
    }

    /// Stop scheduling for every session and ignore further mutations.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        if let Ok(mut sessions) = self.sessions.lock() {
            let count = sessions.workers.len();
            sessions.workers.clear();
            log::info!("Update scheduler shut down ({count} sessions)");
        }
    }

    /// Coalescing state of a session, if it has a worker.
    pub fn pending_task(&self, session_id: &SessionId) -> Option<PendingUpdateTask> {
        let sessions = self.sessions.lock().ok()?;
        let entry = sessions.workers.get(session_id)?;
        let task = entry.task.lock().ok()?;
        Some(task.clone())
    }

    pub fn stats(&self) -> SchedulerStats {
        let stats = &self.shared.stats;
        SchedulerStats {
            triggers: stats.triggers.load(Ordering::Relaxed),
            emitted: stats.emitted.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            active_sessions: self.sessions.lock().map(|s| s.workers.len()).unwrap_or(0),
        }
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One session's debounce loop. Exits when its trigger sender is dropped.
async fn run_worker(
    shared: Arc<Shared>,
    task: Arc<Mutex<PendingUpdateTask>>,
    session_id: SessionId,
    mut triggers: mpsc::Receiver<()>,
) {
    let config = &shared.config;
    let mut last_emitted: Option<Instant> = None;
    let mut last_trigger: Option<Instant> = None;
    // First trigger not yet covered by an emit
    let mut pending_since: Option<Instant> = None;

    loop {
        match pending_since {
            None => {
                if triggers.recv().await.is_none() {
                    return;
                }
                let now = Instant::now();
                let quiet = last_trigger.map_or(true, |t| now >= t + config.interval);
                let cooled = last_emitted.map_or(true, |t| now >= t + config.post_cooldown);
                last_trigger = Some(now);

                if quiet && cooled {
                    last_emitted = Some(emit(&shared, &task, &session_id).await);
                } else {
                    pending_since = Some(now);
                }
            }
            Some(since) => {
                let debounced = last_trigger.unwrap_or(since) + config.interval;
                let mut fire_at = debounced.min(since + config.max_wait);
                if let Some(emitted) = last_emitted {
                    fire_at = fire_at.max(emitted + config.post_cooldown);
                }
                set_scheduled(&task, Some(fire_at));

                tokio::select! {
                    biased;
                    trigger = triggers.recv() => match trigger {
                        Some(()) => last_trigger = Some(Instant::now()),
                        None => {
                            // Torn down with an update pending: flush it once, on schedule
                            sleep_until(fire_at).await;
                            emit(&shared, &task, &session_id).await;
                            return;
                        }
                    },
                    _ = sleep_until(fire_at) => {
                        last_emitted = Some(emit(&shared, &task, &session_id).await);
                        pending_since = None;
                    }
                }
            }
        }
    }
}

fn set_scheduled(task: &Mutex<PendingUpdateTask>, at: Option<Instant>) {
    if let Ok(mut task) = task.lock() {
        task.scheduled_at = at;
    }
}

/// Load and push the latest view. Returns when the emit started.
async fn emit(shared: &Shared, task: &Mutex<PendingUpdateTask>, session_id: &SessionId) -> Instant {
    let started = Instant::now();
    if let Ok(mut task) = task.lock() {
        task.last_emitted_at = Some(started);
        task.scheduled_at = None;
    }

    let result = async {
        let view = shared.source.load_view(session_id, shared.config.top_n).await?;
        shared.publisher.push_session_update(session_id, view).await
    }
    .await;

    match result {
        Ok(()) => {
            shared.stats.emitted.fetch_add(1, Ordering::Relaxed);
            log::debug!("Pushed session update for {session_id}");
        }
        Err(e) => {
            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("Session update for {session_id} failed: {e}");
        }
    }
    started
}
