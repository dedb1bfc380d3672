//! # agora-core: shared model for live Q&A sessions
//!
//! Plain data types used by every other crate in the workspace:
//!
//! - [`ids`]: string-backed identifiers (`SessionId`, `QuestionId`, `UserId`)
//! - [`session`]: `Session`, `SessionInfo`, `Question` and their invariants
//! - [`notification`]: `ChangeNotification`, the best-effort change event
//! - [`view`]: `SessionView`, the data pushed to the message-update API
//!
//! Nothing in here performs I/O. Mutators keep the model invariants
//! (a question lives in exactly one collection, voters are unique).

pub mod ids;
pub mod notification;
pub mod session;
pub mod view;

pub use ids::{QuestionId, SessionId, UserId};
pub use notification::{ChangeNotification, NotificationKind, NotificationType};
pub use session::{Author, Question, Session, SessionInfo, VoteDirection};
pub use view::{QuestionSummary, SessionView};

use std::time::SystemTime;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
