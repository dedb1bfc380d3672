//! Change notifications.
//!
//! A notification says "something changed in session X". It carries no
//! sequence number and may be dropped, duplicated or reordered in transit;
//! receivers compare it against their cached state instead of tracking order.

use serde::{Deserialize, Serialize};

use crate::ids::{QuestionId, SessionId, UserId};
use crate::session::VoteDirection;

/// Notification type tag, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    SessionCreated,
    SessionEnded,
    QuestionAdded,
    QuestionUpvoted,
    QuestionDownvoted,
    QuestionAnswered,
}

/// Notification type with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    SessionCreated,
    SessionEnded,
    QuestionAdded {
        question_id: QuestionId,
    },
    QuestionUpvoted {
        question_id: QuestionId,
        user_id: UserId,
    },
    QuestionDownvoted {
        question_id: QuestionId,
        user_id: UserId,
    },
    QuestionAnswered {
        question_id: QuestionId,
    },
}

/// A best-effort change event for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub session_id: SessionId,
    pub kind: NotificationKind,
}

impl ChangeNotification {
    pub fn new(session_id: impl Into<SessionId>, kind: NotificationKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
        }
    }

    pub fn session_created(session_id: impl Into<SessionId>) -> Self {
        Self::new(session_id, NotificationKind::SessionCreated)
    }

    pub fn session_ended(session_id: impl Into<SessionId>) -> Self {
        Self::new(session_id, NotificationKind::SessionEnded)
    }

    pub fn question_added(session_id: impl Into<SessionId>, question_id: impl Into<QuestionId>) -> Self {
        Self::new(
            session_id,
            NotificationKind::QuestionAdded {
                question_id: question_id.into(),
            },
        )
    }

    /// Vote change in the given direction.
    pub fn vote(
        session_id: impl Into<SessionId>,
        question_id: impl Into<QuestionId>,
        user_id: impl Into<UserId>,
        direction: VoteDirection,
    ) -> Self {
        let question_id = question_id.into();
        let user_id = user_id.into();
        let kind = match direction {
            VoteDirection::Up => NotificationKind::QuestionUpvoted { question_id, user_id },
            VoteDirection::Down => NotificationKind::QuestionDownvoted { question_id, user_id },
        };
        Self::new(session_id, kind)
    }

    pub fn question_answered(session_id: impl Into<SessionId>, question_id: impl Into<QuestionId>) -> Self {
        Self::new(
            session_id,
            NotificationKind::QuestionAnswered {
                question_id: question_id.into(),
            },
        )
    }

    pub fn notification_type(&self) -> NotificationType {
        match self.kind {
            NotificationKind::SessionCreated => NotificationType::SessionCreated,
            NotificationKind::SessionEnded => NotificationType::SessionEnded,
            NotificationKind::QuestionAdded { .. } => NotificationType::QuestionAdded,
            NotificationKind::QuestionUpvoted { .. } => NotificationType::QuestionUpvoted,
            NotificationKind::QuestionDownvoted { .. } => NotificationType::QuestionDownvoted,
            NotificationKind::QuestionAnswered { .. } => NotificationType::QuestionAnswered,
        }
    }

    /// The question this notification refers to, if any.
    pub fn question_id(&self) -> Option<&QuestionId> {
        match &self.kind {
            NotificationKind::SessionCreated | NotificationKind::SessionEnded => None,
            NotificationKind::QuestionAdded { question_id }
            | NotificationKind::QuestionAnswered { question_id }
            | NotificationKind::QuestionUpvoted { question_id, .. }
            | NotificationKind::QuestionDownvoted { question_id, .. } => Some(question_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_builds_directional_kind() {
        let up = ChangeNotification::vote("S1", "Q1", "U1", VoteDirection::Up);
        let down = ChangeNotification::vote("S1", "Q1", "U1", VoteDirection::Down);

        assert_eq!(up.notification_type(), NotificationType::QuestionUpvoted);
        assert_eq!(down.notification_type(), NotificationType::QuestionDownvoted);
        assert_eq!(up.question_id(), Some(&QuestionId::from("Q1")));
    }

    #[test]
    fn test_session_level_has_no_question() {
        let n = ChangeNotification::session_ended("S1");
        assert_eq!(n.notification_type(), NotificationType::SessionEnded);
        assert!(n.question_id().is_none());
    }
}
