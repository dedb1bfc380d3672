//! In-memory document store.
//!
//! Same compare-and-set semantics as [`RocksStore`](super::RocksStore), kept
//! in hash maps. Failures can be injected to exercise retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use agora_core::{Question, QuestionId, SessionId, SessionInfo};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{next_version, DocumentStore, StoreError, Versioned};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Versioned<SessionInfo>>>,
    questions: RwLock<HashMap<QuestionId, Versioned<Question>>>,
    /// Upcoming writes that will fail with `Unavailable`
    failing_writes: AtomicU32,
    /// Successful writes so far
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a transient error.
    pub fn inject_write_failures(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn take_injected_failure(&self) -> Result<(), StoreError> {
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_session(&self, id: &SessionId) -> Result<Option<Versioned<SessionInfo>>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save_session(&self, info: &SessionInfo, expected_version: Option<u64>) -> Result<u64, StoreError> {
        self.take_injected_failure()?;
        let mut sessions = self.sessions.write().await;
        let actual = sessions.get(&info.id).map(|v| v.version);
        let version = next_version(info.id.as_str(), actual, expected_version)?;
        sessions.insert(
            info.id.clone(),
            Versioned {
                value: info.clone(),
                version,
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(version)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .map(|v| v.value.clone())
            .collect())
    }

    async fn load_question(&self, id: &QuestionId) -> Result<Option<Versioned<Question>>, StoreError> {
        Ok(self.questions.read().await.get(id).cloned())
    }

    async fn save_question(
        &self,
        question: &Question,
        expected_version: Option<u64>,
        session_version: u64,
    ) -> Result<u64, StoreError> {
        self.take_injected_failure()?;
        // Held until the question is written so the session cannot end in between
        let sessions = self.sessions.read().await;
        let session_actual = sessions.get(&question.session_id).map(|v| v.version);
        next_version(question.session_id.as_str(), session_actual, Some(session_version))?;

        let mut questions = self.questions.write().await;
        let actual = questions.get(&question.id).map(|v| v.version);
        let version = next_version(question.id.as_str(), actual, expected_version)?;
        questions.insert(
            question.id.clone(),
            Versioned {
                value: question.clone(),
                version,
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(version)
    }

    async fn list_questions(&self, session_id: &SessionId) -> Result<Vec<Question>, StoreError> {
        Ok(self
            .questions
            .read()
            .await
            .values()
            .filter(|v| &v.value.session_id == session_id)
            .map(|v| v.value.clone())
            .collect())
    }
}
