//! Conversation types for the Bandhan messaging backend.
//!
//! Conversations are created server-side when two profiles match; the
//! client only ever reads and refreshes them.

use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, Timestamp, UserId};

/// Identifies a conversation between exactly two participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a server-assigned conversation identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversation as returned by the backend list endpoint.
///
/// `last_message` is denormalized for list rendering; unread counts are
/// NOT carried here — the client derives them from the message list and
/// `last_read` (the backend's counter lags optimistic local reads).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Server-assigned identifier.
    pub id: ConversationId,
    /// The two participants. Order is not significant.
    pub participants: [UserId; 2],
    /// Most recent message, if any.
    pub last_message: Option<ChatMessage>,
    /// Timestamp of the most recent activity.
    pub last_activity: Timestamp,
    /// When the local user last read this conversation.
    pub last_read: Timestamp,
}

impl Conversation {
    /// Returns the participant that is not `me`, if `me` is a participant.
    #[must_use]
    pub fn other_participant(&self, me: &UserId) -> Option<&UserId> {
        let [a, b] = &self.participants;
        if a == me {
            Some(b)
        } else if b == me {
            Some(a)
        } else {
            None
        }
    }
}
