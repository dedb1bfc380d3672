//! Sessions and questions.
//!
//! A [`Session`] is the full client-facing snapshot: header fields plus two
//! ordered question collections. Storage keeps the header ([`SessionInfo`])
//! and each [`Question`] as separate documents so that votes on different
//! questions never contend with each other; [`Session::from_info`] assembles
//! the snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ids::{QuestionId, SessionId, UserId};
use crate::now_millis;

/// Who asked a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
}

impl Author {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Direction of a vote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteDirection {
    Up,
    Down,
}

/// A question asked during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub session_id: SessionId,
    pub content: String,
    pub author: Author,
    /// Creation time (ms since epoch)
    pub created_at: u64,
    pub is_answered: bool,
    /// Users who upvoted; a set, so never duplicated
    pub voters: BTreeSet<UserId>,
}

impl Question {
    pub fn new(session_id: SessionId, content: impl Into<String>, author: Author) -> Self {
        Self {
            id: QuestionId::generate(),
            session_id,
            content: content.into(),
            author,
            created_at: now_millis(),
            is_answered: false,
            voters: BTreeSet::new(),
        }
    }

    /// Create with an explicit id (fixtures, tests).
    pub fn with_id(
        id: impl Into<QuestionId>,
        session_id: impl Into<SessionId>,
        content: impl Into<String>,
        author: Author,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            content: content.into(),
            author,
            created_at: now_millis(),
            is_answered: false,
            voters: BTreeSet::new(),
        }
    }

    pub fn votes_count(&self) -> usize {
        self.voters.len()
    }

    pub fn has_voter(&self, user_id: &UserId) -> bool {
        self.voters.contains(user_id)
    }

    /// Add the user's vote if absent, remove it if present.
    ///
    /// Returns the direction the vote moved in.
    pub fn toggle_voter(&mut self, user_id: &UserId) -> VoteDirection {
        if self.voters.remove(user_id) {
            VoteDirection::Down
        } else {
            self.voters.insert(user_id.clone());
            VoteDirection::Up
        }
    }
}

/// Session header as persisted, without its questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub title: String,
    pub description: String,
    pub is_active: bool,
    pub host_id: UserId,
    /// Creation time (ms since epoch)
    pub created_at: u64,
    /// Set once, when the host ends the session
    pub ended_at: Option<u64>,
}

impl SessionInfo {
    pub fn new(title: impl Into<String>, description: impl Into<String>, host_id: UserId) -> Self {
        Self {
            id: SessionId::generate(),
            title: title.into(),
            description: description.into(),
            is_active: true,
            host_id,
            created_at: now_millis(),
            ended_at: None,
        }
    }

    /// Mark the session ended. Returns `false` if it was already ended.
    pub fn end(&mut self, at: u64) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.ended_at = Some(at);
        true
    }
}

/// Full session snapshot as held by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub description: String,
    pub is_active: bool,
    pub host_id: UserId,
    pub created_at: u64,
    pub ended_at: Option<u64>,
    /// Answered questions, oldest first
    pub answered_questions: Vec<Question>,
    /// Unanswered questions, most votes first, then oldest first
    pub unanswered_questions: Vec<Question>,
}

impl Session {
    /// An empty active session with the given id (fixtures, tests).
    pub fn empty(id: impl Into<SessionId>, host_id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: String::new(),
            is_active: true,
            host_id: host_id.into(),
            created_at: now_millis(),
            ended_at: None,
            answered_questions: Vec::new(),
            unanswered_questions: Vec::new(),
        }
    }

    /// Assemble a snapshot from the stored header and questions.
    ///
    /// Questions belonging to other sessions are ignored.
    pub fn from_info(info: SessionInfo, questions: Vec<Question>) -> Self {
        let (mut answered, mut unanswered): (Vec<_>, Vec<_>) = questions
            .into_iter()
            .filter(|q| q.session_id == info.id)
            .partition(|q| q.is_answered);

        answered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        unanswered.sort_by(|a, b| {
            b.votes_count()
                .cmp(&a.votes_count())
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        Self {
            id: info.id,
            title: info.title,
            description: info.description,
            is_active: info.is_active,
            host_id: info.host_id,
            created_at: info.created_at,
            ended_at: info.ended_at,
            answered_questions: answered,
            unanswered_questions: unanswered,
        }
    }

    /// The header fields of this snapshot.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            is_active: self.is_active,
            host_id: self.host_id.clone(),
            created_at: self.created_at,
            ended_at: self.ended_at,
        }
    }

    /// Look a question up in either collection.
    pub fn find_question(&self, question_id: &QuestionId) -> Option<&Question> {
        self.unanswered_questions
            .iter()
            .chain(self.answered_questions.iter())
            .find(|q| &q.id == question_id)
    }

    pub fn has_unanswered(&self, question_id: &QuestionId) -> bool {
        self.unanswered_questions.iter().any(|q| &q.id == question_id)
    }

    pub fn has_answered(&self, question_id: &QuestionId) -> bool {
        self.answered_questions.iter().any(|q| &q.id == question_id)
    }

    /// Append a new unanswered question. Ignored if the id is already present.
    pub fn add_question(&mut self, question: Question) -> bool {
        if self.find_question(&question.id).is_some() {
            return false;
        }
        if question.is_answered {
            self.answered_questions.push(question);
        } else {
            self.unanswered_questions.push(question);
        }
        true
    }

    /// Move a question from unanswered to answered.
    ///
    /// One-way: returns `false` if the question is unknown or already answered.
    pub fn mark_answered(&mut self, question_id: &QuestionId) -> bool {
        let Some(pos) = self
            .unanswered_questions
            .iter()
            .position(|q| &q.id == question_id)
        else {
            return false;
        };
        let mut question = self.unanswered_questions.remove(pos);
        question.is_answered = true;
        self.answered_questions.push(question);
        true
    }

    pub fn question_count(&self) -> usize {
        self.answered_questions.len() + self.unanswered_questions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str, session: &str, votes: &[&str]) -> Question {
        let mut q = Question::with_id(id, session, format!("question {id}"), Author::new("U0", "Ada"));
        for v in votes {
            q.voters.insert(UserId::from(*v));
        }
        q
    }

    #[test]
    fn test_toggle_voter_is_idempotent_pairwise() {
        let mut q = question("Q1", "S1", &[]);
        let user = UserId::from("U1");

        assert_eq!(q.toggle_voter(&user), VoteDirection::Up);
        assert_eq!(q.votes_count(), 1);
        assert!(q.has_voter(&user));

        assert_eq!(q.toggle_voter(&user), VoteDirection::Down);
        assert_eq!(q.votes_count(), 0);
    }

    #[test]
    fn test_from_info_partitions_and_orders() {
        let info = SessionInfo {
            id: SessionId::from("S1"),
            title: "All hands".into(),
            description: String::new(),
            is_active: true,
            host_id: UserId::from("H"),
            created_at: 0,
            ended_at: None,
        };
        let mut answered = question("Q3", "S1", &[]);
        answered.is_answered = true;
        let questions = vec![
            question("Q1", "S1", &["a"]),
            question("Q2", "S1", &["a", "b"]),
            answered,
            question("Q9", "S2", &[]),
        ];

        let session = Session::from_info(info, questions);
        let order: Vec<&str> = session.unanswered_questions.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(order, vec!["Q2", "Q1"]);
        assert_eq!(session.answered_questions.len(), 1);
        assert_eq!(session.question_count(), 3);
        assert!(session.find_question(&QuestionId::from("Q9")).is_none());
    }

    #[test]
    fn test_mark_answered_is_one_way() {
        let mut session = Session::empty("S1", "H");
        session.add_question(question("Q1", "S1", &[]));

        assert!(session.mark_answered(&QuestionId::from("Q1")));
        assert!(session.has_answered(&QuestionId::from("Q1")));
        assert!(!session.has_unanswered(&QuestionId::from("Q1")));

        // Second call changes nothing
        assert!(!session.mark_answered(&QuestionId::from("Q1")));
        assert_eq!(session.question_count(), 1);
    }

    #[test]
    fn test_add_question_rejects_duplicates() {
        let mut session = Session::empty("S1", "H");
        assert!(session.add_question(question("Q1", "S1", &[])));
        assert!(!session.add_question(question("Q1", "S1", &[])));
        assert_eq!(session.unanswered_questions.len(), 1);
    }

    #[test]
    fn test_session_info_end_once() {
        let mut info = SessionInfo::new("Town hall", "", UserId::from("H"));
        assert!(info.end(42));
        assert!(!info.is_active);
        assert_eq!(info.ended_at, Some(42));
        assert!(!info.end(99));
        assert_eq!(info.ended_at, Some(42));
    }
}
