//! Session and question operations over a [`DocumentStore`].
//!
//! Every operation runs inside [`with_retry`]. Mutations are optimistic: read
//! a document and its version, change it in memory, save with the version
//! that was read. A conflicting concurrent write makes the save fail and the
//! whole read-modify-write is redone from a fresh read.
//!
//! Questions of an ended session are frozen. Voting on or answering them is
//! a no-op reported as "no change", so late or duplicate client requests
//! stay harmless.

use std::sync::Arc;

use agora_core::{now_millis, Author, Question, QuestionId, Session, SessionId, SessionInfo, SessionView, UserId, VoteDirection};
use async_trait::async_trait;
use thiserror::Error;

use super::retry::{with_retry, RetryPolicy, Transient};
use super::{DocumentStore, StoreError, Versioned};
use crate::scheduler::{PublishError, SessionViewSource};

/// Repository errors.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Question not found: {0}")]
    QuestionNotFound(QuestionId),
    /// Ended sessions accept no new questions
    #[error("Session has ended: {0}")]
    SessionEnded(SessionId),
}

impl Transient for PersistenceError {
    fn is_transient(&self) -> bool {
        match self {
            PersistenceError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result of a vote toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOutcome {
    /// Question as stored after the call
    pub question: Question,
    /// Direction the vote moved, `None` if the session had ended
    pub change: Option<VoteDirection>,
}

/// A value plus whether the call changed stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changed<T> {
    pub value: T,
    pub changed: bool,
}

impl<T> Changed<T> {
    fn yes(value: T) -> Self {
        Self { value, changed: true }
    }

    fn no(value: T) -> Self {
        Self { value, changed: false }
    }
}

/// Sessions and questions with retrying, optimistic writes.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open a new active session.
    pub async fn create_session(
        &self,
        title: &str,
        description: &str,
        host_id: &UserId,
    ) -> Result<SessionInfo, PersistenceError> {
        let info = SessionInfo::new(title, description, host_id.clone());
        let store = &self.store;
        let info_ref = &info;
        with_retry(&self.policy, "create_session", move || async move {
            store.save_session(info_ref, None).await.map_err(PersistenceError::from)
        })
        .await?;
        log::info!("Session {} created by {}", info.id, info.host_id);
        Ok(info)
    }

    /// Full snapshot: header plus both ordered question collections.
    pub async fn get_session(&self, session_id: &SessionId) -> Result<Session, PersistenceError> {
        let this = self;
        with_retry(&self.policy, "get_session", move || this.try_get_session(session_id)).await
    }

    async fn try_get_session(&self, session_id: &SessionId) -> Result<Session, PersistenceError> {
        let info = self.load_info(session_id).await?.value;
        let questions = self.store.list_questions(session_id).await?;
        Ok(Session::from_info(info, questions))
    }

    /// Active sessions, newest first.
    pub async fn list_active_sessions(&self) -> Result<Vec<SessionInfo>, PersistenceError> {
        let store = &self.store;
        let mut sessions = with_retry(&self.policy, "list_sessions", move || async move {
            store.list_sessions().await.map_err(PersistenceError::from)
        })
        .await?;
        sessions.retain(|s| s.is_active);
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// End a session. Ending an ended session changes nothing.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<Changed<SessionInfo>, PersistenceError> {
        let this = self;
        let outcome = with_retry(&self.policy, "end_session", move || this.try_end_session(session_id)).await?;
        if outcome.changed {
            log::info!("Session {session_id} ended");
        }
        Ok(outcome)
    }

    async fn try_end_session(&self, session_id: &SessionId) -> Result<Changed<SessionInfo>, PersistenceError> {
        let mut current = self.load_info(session_id).await?;
        if !current.value.end(now_millis()) {
            return Ok(Changed::no(current.value));
        }
        self.store.save_session(&current.value, Some(current.version)).await?;
        Ok(Changed::yes(current.value))
    }

    /// Add a question to an active session.
    pub async fn add_question(
        &self,
        session_id: &SessionId,
        content: &str,
        author: &Author,
    ) -> Result<Question, PersistenceError> {
        let question = Question::new(session_id.clone(), content, author.clone());
        let this = self;
        let question_ref = &question;
        with_retry(&self.policy, "add_question", move || this.try_add_question(question_ref)).await?;
        log::debug!("Question {} added to session {session_id}", question.id);
        Ok(question)
    }

    async fn try_add_question(&self, question: &Question) -> Result<(), PersistenceError> {
        let session = self.load_info(&question.session_id).await?;
        if !session.value.is_active {
            return Err(PersistenceError::SessionEnded(question.session_id.clone()));
        }
        self.store.save_question(question, None, session.version).await?;
        Ok(())
    }

    /// Toggle `user_id`'s vote on a question and return the stored question.
    pub async fn toggle_vote(&self, question_id: &QuestionId, user_id: &UserId) -> Result<Question, PersistenceError> {
        Ok(self.toggle_vote_outcome(question_id, user_id).await?.question)
    }

    /// [`toggle_vote`](Self::toggle_vote), also reporting the direction moved.
    pub async fn toggle_vote_outcome(
        &self,
        question_id: &QuestionId,
        user_id: &UserId,
    ) -> Result<VoteOutcome, PersistenceError> {
        let this = self;
        with_retry(&self.policy, "toggle_vote", move || this.try_toggle_vote(question_id, user_id)).await
    }

    async fn try_toggle_vote(&self, question_id: &QuestionId, user_id: &UserId) -> Result<VoteOutcome, PersistenceError> {
        let mut current = self.load_question(question_id).await?;
        let session = self.load_info(&current.value.session_id).await?;
        if !session.value.is_active {
            return Ok(VoteOutcome {
                question: current.value,
                change: None,
            });
        }

        let direction = current.value.toggle_voter(user_id);
        self.store
            .save_question(&current.value, Some(current.version), session.version)
            .await?;
        log::trace!("Vote {direction:?} by {user_id} on {question_id}");
        Ok(VoteOutcome {
            question: current.value,
            change: Some(direction),
        })
    }

    /// Mark a question answered. One-way; repeated calls change nothing.
    pub async fn mark_answered(&self, question_id: &QuestionId) -> Result<Changed<Question>, PersistenceError> {
        let this = self;
        with_retry(&self.policy, "mark_answered", move || this.try_mark_answered(question_id)).await
    }

    async fn try_mark_answered(&self, question_id: &QuestionId) -> Result<Changed<Question>, PersistenceError> {
        let mut current = self.load_question(question_id).await?;
        if current.value.is_answered {
            return Ok(Changed::no(current.value));
        }
        let session = self.load_info(&current.value.session_id).await?;
        if !session.value.is_active {
            return Ok(Changed::no(current.value));
        }

        current.value.is_answered = true;
        self.store
            .save_question(&current.value, Some(current.version), session.version)
            .await?;
        Ok(Changed::yes(current.value))
    }

    async fn load_info(&self, session_id: &SessionId) -> Result<Versioned<SessionInfo>, PersistenceError> {
        self.store
            .load_session(session_id)
            .await?
            .ok_or_else(|| PersistenceError::SessionNotFound(session_id.clone()))
    }

    async fn load_question(&self, question_id: &QuestionId) -> Result<Versioned<Question>, PersistenceError> {
        self.store
            .load_question(question_id)
            .await?
            .ok_or_else(|| PersistenceError::QuestionNotFound(question_id.clone()))
    }
}

#[async_trait]
impl SessionViewSource for SessionRepository {
    async fn load_view(&self, session_id: &SessionId, top_n: usize) -> Result<SessionView, PublishError> {
        let session = self.get_session(session_id).await?;
        Ok(SessionView::render(&session, top_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::storage::MemoryStore;

    fn repository() -> (SessionRepository, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let repo = SessionRepository::with_policy(store.clone(), RetryPolicy::immediate(20));
        (repo, store)
    }

    async fn session_with_question(repo: &SessionRepository) -> (SessionInfo, Question) {
        let info = repo.create_session("Town hall", "", &UserId::from("H")).await.unwrap();
        let question = repo
            .add_question(&info.id, "When is the offsite?", &Author::new("U9", "Grace"))
            .await
            .unwrap();
        (info, question)
    }

    #[tokio::test]
    async fn test_toggle_vote_twice_restores_voters() {
        let (repo, _) = repository();
        let (_, q) = session_with_question(&repo).await;
        let user = UserId::from("U1");

        let once = repo.toggle_vote(&q.id, &user).await.unwrap();
        assert_eq!(once.voters.iter().map(|u| u.as_str()).collect::<Vec<_>>(), vec!["U1"]);

        let twice = repo.toggle_vote(&q.id, &user).await.unwrap();
        assert!(twice.voters.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_vote_reports_direction() {
        let (repo, _) = repository();
        let (_, q) = session_with_question(&repo).await;
        let user = UserId::from("U1");

        let up = repo.toggle_vote_outcome(&q.id, &user).await.unwrap();
        assert_eq!(up.change, Some(VoteDirection::Up));
        let down = repo.toggle_vote_outcome(&q.id, &user).await.unwrap();
        assert_eq!(down.change, Some(VoteDirection::Down));
    }

    #[tokio::test]
    async fn test_ended_session_freezes_questions() {
        let (repo, _) = repository();
        let (info, q) = session_with_question(&repo).await;
        repo.end_session(&info.id).await.unwrap();

        let outcome = repo.toggle_vote_outcome(&q.id, &UserId::from("U1")).await.unwrap();
        assert_eq!(outcome.change, None);
        assert!(outcome.question.voters.is_empty());

        let answered = repo.mark_answered(&q.id).await.unwrap();
        assert!(!answered.changed);
        assert!(!answered.value.is_answered);

        let err = repo
            .add_question(&info.id, "Too late?", &Author::new("U1", "Ada"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::SessionEnded(_)));
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let (repo, _) = repository();
        let info = repo.create_session("Retro", "", &UserId::from("H")).await.unwrap();

        let first = repo.end_session(&info.id).await.unwrap();
        assert!(first.changed);
        let ended_at = first.value.ended_at;

        let second = repo.end_session(&info.id).await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.value.ended_at, ended_at);
        assert!(repo.list_active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_answered_moves_question() {
        let (repo, _) = repository();
        let (info, q) = session_with_question(&repo).await;

        assert!(repo.mark_answered(&q.id).await.unwrap().changed);
        assert!(!repo.mark_answered(&q.id).await.unwrap().changed);

        let session = repo.get_session(&info.id).await.unwrap();
        assert!(session.has_answered(&q.id));
        assert!(session.unanswered_questions.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_fail_without_retry() {
        let (repo, store) = repository();
        let writes_before = store.write_count();

        let err = repo
            .toggle_vote(&QuestionId::from("missing"), &UserId::from("U1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::QuestionNotFound(_)));

        let err = repo.get_session(&SessionId::from("missing")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::SessionNotFound(_)));
        assert_eq!(store.write_count(), writes_before);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (repo, store) = repository();
        let (_, q) = session_with_question(&repo).await;

        store.inject_write_failures(3);
        let updated = repo.toggle_vote(&q.id, &UserId::from("U1")).await.unwrap();
        assert_eq!(updated.votes_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_store_error() {
        let store = Arc::new(MemoryStore::new());
        let repo = SessionRepository::with_policy(store.clone(), RetryPolicy::immediate(2));
        let (_, q) = session_with_question(&repo).await;

        store.inject_write_failures(5);
        let err = repo.toggle_vote(&q.id, &UserId::from("U1")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_toggles_converge() {
        let (repo, _) = repository();
        let repo = Arc::new(repo);
        let (_, q) = session_with_question(&repo).await;

        let mut handles = Vec::new();
        for i in 0..13 {
            let repo = repo.clone();
            let qid = q.id.clone();
            // Ten toggles by U1, three by U2
            let user = if i < 10 { UserId::from("U1") } else { UserId::from("U2") };
            handles.push(tokio::spawn(async move { repo.toggle_vote(&qid, &user).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let session = repo.get_session(&q.session_id).await.unwrap();
        let stored = session.find_question(&q.id).unwrap();
        assert!(!stored.has_voter(&UserId::from("U1")));
        assert!(stored.has_voter(&UserId::from("U2")));
        assert_eq!(stored.votes_count(), 1);
    }

    #[tokio::test]
    async fn test_get_session_orders_by_votes() {
        let (repo, _) = repository();
        let info = repo.create_session("AMA", "", &UserId::from("H")).await.unwrap();
        let author = Author::new("U9", "Grace");
        let first = repo.add_question(&info.id, "first", &author).await.unwrap();
        let second = repo.add_question(&info.id, "second", &author).await.unwrap();
        repo.toggle_vote(&second.id, &UserId::from("U1")).await.unwrap();

        let session = repo.get_session(&info.id).await.unwrap();
        let ids: Vec<_> = session.unanswered_questions.iter().map(|q| q.id.clone()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    /// Ends the session right after handing out the next session read, so
    /// the caller works from an active snapshot that is already stale.
    struct EndsAfterRead {
        inner: MemoryStore,
        armed: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for EndsAfterRead {
        async fn load_session(&self, id: &SessionId) -> Result<Option<Versioned<SessionInfo>>, StoreError> {
            let loaded = self.inner.load_session(id).await?;
            if let Some(read) = loaded.as_ref().filter(|_| self.armed.swap(false, Ordering::SeqCst)) {
                let mut ended = read.value.clone();
                ended.end(now_millis());
                self.inner.save_session(&ended, Some(read.version)).await?;
            }
            Ok(loaded)
        }

        async fn save_session(&self, info: &SessionInfo, expected_version: Option<u64>) -> Result<u64, StoreError> {
            self.inner.save_session(info, expected_version).await
        }

        async fn list_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
            self.inner.list_sessions().await
        }

        async fn load_question(&self, id: &QuestionId) -> Result<Option<Versioned<Question>>, StoreError> {
            self.inner.load_question(id).await
        }

        async fn save_question(
            &self,
            question: &Question,
            expected_version: Option<u64>,
            session_version: u64,
        ) -> Result<u64, StoreError> {
            self.inner.save_question(question, expected_version, session_version).await
        }

        async fn list_questions(&self, session_id: &SessionId) -> Result<Vec<Question>, StoreError> {
            self.inner.list_questions(session_id).await
        }
    }

    async fn racing_end() -> (SessionRepository, Arc<EndsAfterRead>, SessionInfo, Question) {
        let store = Arc::new(EndsAfterRead {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(false),
        });
        let repo = SessionRepository::with_policy(store.clone(), RetryPolicy::immediate(5));
        let (info, question) = session_with_question(&repo).await;
        store.armed.store(true, Ordering::SeqCst);
        (repo, store, info, question)
    }

    #[tokio::test]
    async fn test_toggle_racing_end_is_no_op() {
        let (repo, store, info, q) = racing_end().await;

        let outcome = repo.toggle_vote_outcome(&q.id, &UserId::from("U1")).await.unwrap();
        assert_eq!(outcome.change, None);
        assert!(outcome.question.voters.is_empty());

        let stored = store.inner.load_question(&q.id).await.unwrap().unwrap();
        assert!(stored.value.voters.is_empty());
        assert_eq!(stored.version, 1);
        assert!(!repo.get_session(&info.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_mark_answered_racing_end_is_no_op() {
        let (repo, store, _, q) = racing_end().await;

        let outcome = repo.mark_answered(&q.id).await.unwrap();
        assert!(!outcome.changed);
        assert!(!store.inner.load_question(&q.id).await.unwrap().unwrap().value.is_answered);
    }

    #[tokio::test]
    async fn test_add_question_racing_end_fails() {
        let (repo, store, info, _) = racing_end().await;

        let err = repo
            .add_question(&info.id, "Still open?", &Author::new("U1", "Ada"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::SessionEnded(_)));
        assert_eq!(store.inner.list_questions(&info.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_view_source_renders_top_questions() {
        let (repo, _) = repository();
        let (info, _) = session_with_question(&repo).await;

        let view = repo.load_view(&info.id, 5).await.unwrap();
        assert_eq!(view.title, "Town hall");
        assert_eq!(view.top_questions.len(), 1);
        assert_eq!(view.top_questions[0].author_name, "Grace");
    }
}
