//! Conversation list aggregation: previews, derived unread counts, and
//! ordering for the list view.
//!
//! Unread counts are derived locally — count of messages from the other
//! participant newer than the last-read timestamp — rather than trusted
//! from the backend, whose counter lags optimistic local reads.

use std::collections::HashMap;

use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{ChatMessage, MessageBody, Timestamp, UserId};

/// Default preview truncation length in characters.
pub const DEFAULT_PREVIEW_CHARS: usize = 48;

/// Fixed preview for voice messages.
const VOICE_PLACEHOLDER: &str = "Voice message";

/// Fixed preview for system notices.
const SYSTEM_PLACEHOLDER: &str = "Activity update";

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationPreview {
    /// The conversation.
    pub conversation_id: ConversationId,
    /// The other participant.
    pub peer: Option<UserId>,
    /// Truncated last-message text or a type placeholder.
    pub snippet: String,
    /// Most recent activity, used for ordering.
    pub last_activity: Timestamp,
    /// Derived unread count.
    pub unread: usize,
}

/// Aggregates conversations into list-view rows.
pub struct ConversationIndex {
    self_id: UserId,
    preview_chars: usize,
    conversations: HashMap<ConversationId, Conversation>,
    /// Optimistic read marks, ahead of the backend until it catches up.
    local_read: HashMap<ConversationId, Timestamp>,
    /// Known (sender, created_at) pairs per conversation, the basis for
    /// unread derivation.
    recent: HashMap<ConversationId, Vec<(UserId, Timestamp)>>,
}

impl ConversationIndex {
    /// Creates an index for the given local user.
    #[must_use]
    pub fn new(self_id: UserId, preview_chars: usize) -> Self {
        Self {
            self_id,
            preview_chars,
            conversations: HashMap::new(),
            local_read: HashMap::new(),
            recent: HashMap::new(),
        }
    }

    /// Applies a fresh list snapshot from the poll cycle.
    ///
    /// Optimistic read marks survive the snapshot until the backend's
    /// own `last_read` catches up to them.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Conversation>) {
        self.conversations = snapshot
            .into_iter()
            .map(|conv| (conv.id.clone(), conv))
            .collect();
        self.local_read
            .retain(|id, local| match self.conversations.get(id) {
                Some(conv) => conv.last_read < *local,
                None => false,
            });
        self.recent
            .retain(|id, _| self.conversations.contains_key(id));
    }

    /// Records the messages currently known for a conversation, as the
    /// basis for unread derivation.
    pub fn note_messages(&mut self, id: &ConversationId, messages: &[ChatMessage]) {
        let basis = messages
            .iter()
            .map(|m| (m.sender_id.clone(), m.created_at))
            .collect();
        self.recent.insert(id.clone(), basis);
    }

    /// Marks a conversation read locally, zeroing its unread count
    /// immediately without waiting for backend confirmation.
    pub fn mark_read(&mut self, id: &ConversationId, now: Timestamp) {
        let mark = self.local_read.entry(id.clone()).or_insert(now);
        *mark = (*mark).max(now);
    }

    /// Derived unread count for one conversation.
    ///
    /// Falls back to the denormalized last message when no message basis
    /// has been recorded yet.
    #[must_use]
    pub fn unread_count(&self, id: &ConversationId) -> usize {
        let Some(conv) = self.conversations.get(id) else {
            return 0;
        };
        let last_read = self.effective_last_read(conv);
        match self.recent.get(id) {
            Some(basis) => basis
                .iter()
                .filter(|(sender, at)| *sender != self.self_id && *at > last_read)
                .count(),
            None => usize::from(conv.last_message.as_ref().is_some_and(|m| {
                m.sender_id != self.self_id && m.created_at > last_read
            })),
        }
    }

    /// Sum of unread counts across all conversations.
    #[must_use]
    pub fn total_unread(&self) -> usize {
        self.conversations
            .keys()
            .map(|id| self.unread_count(id))
            .sum()
    }

    /// List rows, most recent activity first.
    #[must_use]
    pub fn previews(&self) -> Vec<ConversationPreview> {
        let mut rows: Vec<ConversationPreview> = self
            .conversations
            .values()
            .map(|conv| ConversationPreview {
                conversation_id: conv.id.clone(),
                peer: conv.other_participant(&self.self_id).cloned(),
                snippet: self.snippet_for(conv),
                last_activity: conv.last_activity,
                unread: self.unread_count(&conv.id),
            })
            .collect();
        rows.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        rows
    }

    /// Number of conversations held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Returns `true` when no conversations are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    fn effective_last_read(&self, conv: &Conversation) -> Timestamp {
        self.local_read
            .get(&conv.id)
            .copied()
            .map_or(conv.last_read, |local| local.max(conv.last_read))
    }

    fn snippet_for(&self, conv: &Conversation) -> String {
        conv.last_message
            .as_ref()
            .map_or_else(String::new, |message| match &message.body {
                MessageBody::Text { text } => truncate_chars(text, self.preview_chars),
                MessageBody::Voice { .. } => VOICE_PLACEHOLDER.to_string(),
                MessageBody::System { .. } => SYSTEM_PLACEHOLDER.to_string(),
            })
    }
}

/// Truncates at a char boundary, appending an ellipsis when shortened.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            let mut out = text[..byte_idx].to_string();
            out.push('…');
            out
        }
        None => text.to_string(),
    }
}
