//! Persistence layer for sessions and questions.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  read-modify-write  ┌────────────────┐
//! │ SessionRepository│ ──────────────────► │ DocumentStore  │
//! │ (retry + CAS)    │   expected version  │ (trait)        │
//! └────────┬─────────┘                     └───────┬────────┘
//!          │ conflict / unavailable                │
//!          ▼                                       ├── MemoryStore (tests, fault injection)
//! ┌──────────────────┐                             └── RocksStore  (column families)
//! │ RetryPolicy      │
//! │ (bounded backoff)│
//! └──────────────────┘
//! ```
//!
//! Every document carries a version. A save names the version it read;
//! the store refuses the save if someone else wrote in between, and the
//! repository redoes the whole read-modify-write. Sessions and questions are
//! separate documents, so votes on different questions never conflict. A
//! question save also names the session version it was checked against, so
//! ending a session invalidates question writes still in flight.

pub mod memory;
pub mod repository;
pub mod retry;
pub mod rocks;

pub use memory::MemoryStore;
pub use repository::{Changed, PersistenceError, SessionRepository, VoteOutcome};
pub use retry::{with_retry, RetryMachine, RetryPolicy, RetryState, Transient};
pub use rocks::{RocksStore, StoreConfig};

use agora_core::{Question, QuestionId, SessionId, SessionInfo};
use async_trait::async_trait;
use thiserror::Error;

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed
    #[error("Version conflict on {key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    /// Backend temporarily unable to serve the request
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Unavailable(_))
    }
}

/// Versioned document storage.
///
/// `expected_version` on a save is the version the caller read, or `None`
/// if the caller expects the document not to exist yet. Saves return the new
/// version. Versions start at 1 and grow by one per save.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_session(&self, id: &SessionId) -> Result<Option<Versioned<SessionInfo>>, StoreError>;

    async fn save_session(&self, info: &SessionInfo, expected_version: Option<u64>) -> Result<u64, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, StoreError>;

    async fn load_question(&self, id: &QuestionId) -> Result<Option<Versioned<Question>>, StoreError>;

    /// Save a question. Besides its own version check, the owning session
    /// must still be at `session_version`: a session ended after it was read
    /// makes the save fail with `Conflict`.
    async fn save_question(
        &self,
        question: &Question,
        expected_version: Option<u64>,
        session_version: u64,
    ) -> Result<u64, StoreError>;

    /// All questions of a session, in no particular order.
    async fn list_questions(&self, session_id: &SessionId) -> Result<Vec<Question>, StoreError>;
}

/// Compare-and-set check shared by the stores. Returns the version to write.
pub(crate) fn next_version(key: &str, actual: Option<u64>, expected: Option<u64>) -> Result<u64, StoreError> {
    if actual != expected {
        return Err(StoreError::Conflict {
            key: key.to_string(),
            expected,
            actual,
        });
    }
    Ok(actual.map_or(1, |v| v + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version() {
        assert_eq!(next_version("q", None, None).unwrap(), 1);
        assert_eq!(next_version("q", Some(3), Some(3)).unwrap(), 4);
        assert!(matches!(
            next_version("q", Some(4), Some(3)),
            Err(StoreError::Conflict { actual: Some(4), .. })
        ));
        assert!(next_version("q", Some(1), None).is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("busy".into()).is_transient());
        assert!(next_version("q", Some(2), Some(1)).unwrap_err().is_transient());
        assert!(!StoreError::Database("corrupt".into()).is_transient());
    }
}
