//! Server-side mutation entry point.
//!
//! ```text
//! mutation ──► SessionRepository (retry + CAS)
//!                 │ committed
//!                 ├──► NotificationSink.publish   best effort, clients reconcile
//!                 └──► UpdateScheduler.notify     coalesced view push
//! ```
//!
//! Calls that change nothing (a vote under an ended session, a repeated
//! answer or end) announce nothing.

use std::sync::Arc;

use agora_core::{Author, ChangeNotification, Question, QuestionId, Session, SessionId, SessionInfo, UserId};

use crate::broadcast::NotificationSink;
use crate::scheduler::UpdateScheduler;
use crate::storage::{Changed, PersistenceError, SessionRepository, VoteOutcome};

/// Q&A mutations with their notifications and view updates.
pub struct QnaService {
    repository: SessionRepository,
    notifications: Arc<dyn NotificationSink>,
    scheduler: Arc<UpdateScheduler>,
}

impl QnaService {
    pub fn new(
        repository: SessionRepository,
        notifications: Arc<dyn NotificationSink>,
        scheduler: Arc<UpdateScheduler>,
    ) -> Self {
        Self {
            repository,
            notifications,
            scheduler,
        }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repository
    }

    pub fn scheduler(&self) -> &Arc<UpdateScheduler> {
        &self.scheduler
    }

    pub async fn create_session(
        &self,
        title: &str,
        description: &str,
        host_id: &UserId,
    ) -> Result<SessionInfo, PersistenceError> {
        let info = self.repository.create_session(title, description, host_id).await?;
        self.announce(ChangeNotification::session_created(info.id.clone())).await;
        Ok(info)
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<Session, PersistenceError> {
        self.repository.get_session(session_id).await
    }

    /// End the session, push its final view and stop scheduling for it.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<Changed<SessionInfo>, PersistenceError> {
        let outcome = self.repository.end_session(session_id).await?;
        if outcome.changed {
            self.announce(ChangeNotification::session_ended(session_id.clone())).await;
            self.scheduler.notify_mutated(session_id);
            self.scheduler.forget_session(session_id);
        }
        Ok(outcome)
    }

    pub async fn add_question(
        &self,
        session_id: &SessionId,
        content: &str,
        author: &Author,
    ) -> Result<Question, PersistenceError> {
        let question = self.repository.add_question(session_id, content, author).await?;
        self.announce(ChangeNotification::question_added(session_id.clone(), question.id.clone()))
            .await;
        self.scheduler.notify_mutated(session_id);
        Ok(question)
    }

    pub async fn toggle_vote(&self, question_id: &QuestionId, user_id: &UserId) -> Result<VoteOutcome, PersistenceError> {
        let outcome = self.repository.toggle_vote_outcome(question_id, user_id).await?;
        if let Some(direction) = outcome.change {
            let session_id = outcome.question.session_id.clone();
            self.announce(ChangeNotification::vote(
                session_id.clone(),
                question_id.clone(),
                user_id.clone(),
                direction,
            ))
            .await;
            self.scheduler.notify_mutated(&session_id);
        }
        Ok(outcome)
    }

    pub async fn mark_answered(&self, question_id: &QuestionId) -> Result<Changed<Question>, PersistenceError> {
        let outcome = self.repository.mark_answered(question_id).await?;
        if outcome.changed {
            let session_id = outcome.value.session_id.clone();
            self.announce(ChangeNotification::question_answered(session_id.clone(), question_id.clone()))
                .await;
            self.scheduler.notify_mutated(&session_id);
        }
        Ok(outcome)
    }

    async fn announce(&self, notification: ChangeNotification) {
        match self.notifications.publish(&notification).await {
            Ok(reached) => log::trace!(
                "{:?} for session {} reached {reached} subscribers",
                notification.notification_type(),
                notification.session_id
            ),
            Err(e) => log::warn!(
                "Could not announce {:?} for session {}: {e}",
                notification.notification_type(),
                notification.session_id
            ),
        }
    }
}
