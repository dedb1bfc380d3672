//! Server-side session view.
//!
//! The data handed to the message-update collaborator whenever a session
//! changes. Card/template formatting happens downstream; this is only the
//! content, so re-sending an identical view is harmless.

use serde::{Deserialize, Serialize};

use crate::ids::{QuestionId, SessionId};
use crate::session::Session;

/// One unanswered question as shown in the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSummary {
    pub id: QuestionId,
    pub content: String,
    pub author_name: String,
    pub votes: usize,
}

/// Latest renderable state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub title: String,
    pub description: String,
    pub is_active: bool,
    /// Most-voted unanswered questions
    pub top_questions: Vec<QuestionSummary>,
    pub unanswered_count: usize,
    pub answered_count: usize,
}

impl SessionView {
    /// Build the view, keeping at most `top_n` unanswered questions.
    pub fn render(session: &Session, top_n: usize) -> Self {
        let top_questions = session
            .unanswered_questions
            .iter()
            .take(top_n)
            .map(|q| QuestionSummary {
                id: q.id.clone(),
                content: q.content.clone(),
                author_name: q.author.name.clone(),
                votes: q.votes_count(),
            })
            .collect();

        Self {
            session_id: session.id.clone(),
            title: session.title.clone(),
            description: session.description.clone(),
            is_active: session.is_active,
            top_questions,
            unanswered_count: session.unanswered_questions.len(),
            answered_count: session.answered_questions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Author, Question};

    #[test]
    fn test_render_truncates_to_top_n() {
        let mut session = Session::empty("S1", "H");
        for i in 0..5 {
            session.add_question(Question::with_id(
                format!("Q{i}").as_str(),
                "S1",
                "why?",
                Author::new("U1", "Ada"),
            ));
        }
        session.mark_answered(&QuestionId::from("Q0"));

        let view = SessionView::render(&session, 3);
        assert_eq!(view.top_questions.len(), 3);
        assert_eq!(view.unanswered_count, 4);
        assert_eq!(view.answered_count, 1);
        assert_eq!(view.top_questions[0].author_name, "Ada");
    }
}
