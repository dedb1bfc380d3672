//! Reconciliation of incoming change notifications against the client's
//! cached session snapshot.
//!
//! Notifications arrive without sequence numbers and may be lost, duplicated
//! or reordered. Instead of tracking order, every decision compares the
//! notification with what the client already holds:
//!
//! ```text
//! notification ──┐
//!                ├── decide() ──► FullRefresh | ApplyNoop | ShowStaleHint | ClearSession
//! cached session ┘
//! ```
//!
//! [`decide`] is pure: the same inputs always give the same action, which is
//! what makes at-least-once delivery safe. [`Reconciler`] adds the only piece
//! of state, a bound on how long hints may pile up before a refresh is forced.

use agora_core::{ChangeNotification, NotificationKind, QuestionId, Session, UserId, VoteDirection};

/// What the client should do about a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Re-fetch the whole session
    FullRefresh,
    /// Local state already reflects the change
    ApplyNoop,
    /// Local state is behind; tell the user fresher data exists
    ShowStaleHint,
    /// The cached session ended; collapse to the ended state without refetching
    ClearSession,
}

/// Decide how to react to `notification` given the cached snapshot.
pub fn decide(notification: &ChangeNotification, cached: Option<&Session>) -> Action {
    // A notification for a session we don't hold means we may be behind by
    // an unknown amount.
    let session = match cached {
        Some(session) if session.id == notification.session_id => session,
        _ => return Action::FullRefresh,
    };

    match &notification.kind {
        NotificationKind::SessionCreated => Action::ApplyNoop,
        NotificationKind::SessionEnded => Action::ClearSession,
        NotificationKind::QuestionAdded { question_id } => decide_added(session, question_id),
        NotificationKind::QuestionUpvoted { question_id, user_id } => {
            decide_vote(session, question_id, user_id, VoteDirection::Up)
        }
        NotificationKind::QuestionDownvoted { question_id, user_id } => {
            decide_vote(session, question_id, user_id, VoteDirection::Down)
        }
        NotificationKind::QuestionAnswered { question_id } => {
            if session.has_answered(question_id) {
                Action::ApplyNoop
            } else {
                Action::ShowStaleHint
            }
        }
    }
}

fn decide_added(session: &Session, question_id: &QuestionId) -> Action {
    if session.unanswered_questions.is_empty() {
        // First question: a refresh is cheaper than a targeted fetch and
        // gets the ordering right.
        return Action::FullRefresh;
    }
    if session.find_question(question_id).is_some() {
        Action::ApplyNoop
    } else {
        Action::ShowStaleHint
    }
}

fn decide_vote(
    session: &Session,
    question_id: &QuestionId,
    user_id: &UserId,
    direction: VoteDirection,
) -> Action {
    let Some(question) = session.find_question(question_id) else {
        return Action::ShowStaleHint;
    };
    let expected_member = direction == VoteDirection::Up;
    if question.has_voter(user_id) == expected_member {
        Action::ApplyNoop
    } else {
        Action::ShowStaleHint
    }
}

/// Default number of consecutive hints tolerated before forcing a refresh.
pub const DEFAULT_MAX_CONSECUTIVE_HINTS: u32 = 10;

/// [`decide`] plus a staleness ceiling.
///
/// Hints are cheap but unbounded hints mean unbounded drift. After
/// `max_consecutive_hints` hints with no refresh in between, the next hint
/// becomes a `FullRefresh`.
#[derive(Debug, Clone)]
pub struct Reconciler {
    max_consecutive_hints: u32,
    pending_hints: u32,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_HINTS)
    }
}

impl Reconciler {
    /// `max_consecutive_hints == 0` disables hints entirely (every hint refreshes).
    pub fn new(max_consecutive_hints: u32) -> Self {
        Self {
            max_consecutive_hints,
            pending_hints: 0,
        }
    }

    /// Decide, applying the staleness ceiling.
    pub fn observe(&mut self, notification: &ChangeNotification, cached: Option<&Session>) -> Action {
        match decide(notification, cached) {
            Action::ShowStaleHint if self.pending_hints >= self.max_consecutive_hints => {
                log::debug!(
                    "Escalating stale hint to full refresh after {} hints (session {})",
                    self.pending_hints,
                    notification.session_id
                );
                self.pending_hints = 0;
                Action::FullRefresh
            }
            Action::ShowStaleHint => {
                self.pending_hints += 1;
                Action::ShowStaleHint
            }
            Action::FullRefresh => {
                self.pending_hints = 0;
                Action::FullRefresh
            }
            other => other,
        }
    }

    /// The client refreshed its snapshot; hints so far are resolved.
    pub fn reset(&mut self) {
        self.pending_hints = 0;
    }

    /// Hints emitted since the last refresh.
    pub fn pending_hints(&self) -> u32 {
        self.pending_hints
    }
}
