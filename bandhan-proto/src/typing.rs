//! Typing indicator signals exchanged with the backend.

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationId;
use crate::message::{Timestamp, UserId};

/// Whether a peer started or stopped typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingAction {
    /// The peer began (or continues) typing.
    Started,
    /// The peer stopped typing (send, cleared input, or blur).
    Stopped,
}

impl std::fmt::Display for TypingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A typing signal for one user in one conversation.
///
/// Stop signals can be lost (app killed mid-type), so receivers must
/// expire a `Started` signal on their own after a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    /// The conversation being typed in.
    pub conversation_id: ConversationId,
    /// The user who is typing (or stopped).
    pub user_id: UserId,
    /// Start or stop.
    pub action: TypingAction,
    /// When the signal was emitted.
    pub sent_at: Timestamp,
}
