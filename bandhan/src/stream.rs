//! Ordered message list for one conversation.
//!
//! Owns ordering by server timestamp, history pagination, de-duplication
//! of overlapping poll windows, and the viewport bookkeeping that keeps
//! the visually anchored message in place when older history is spliced
//! in at the head.
//!
//! Heights are abstract pixels: each entry carries an estimated height
//! until the UI reports a measured one. All anchor math adjusts
//! `scroll_top` by exactly the height introduced above the anchor, so
//! the on-screen position of the first visible message never moves.

use bandhan_proto::conversation::ConversationId;
use bandhan_proto::message::{
    ChatMessage, MessageBody, MessageId, MessagePage, MessageRef, PageCursor, TempId, Timestamp,
};

/// Window for matching a poll message to an unreconciled optimistic send
/// by content (ms).
const CONTENT_MATCH_WINDOW_MS: u64 = 60_000;

/// Viewport tuning for one stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Height assumed for an entry until the UI measures it.
    pub default_row_height: u32,
    /// Distance from the bottom within which appends auto-scroll.
    pub near_bottom_threshold: u64,
    /// Distance from the top within which older history is wanted.
    pub top_threshold: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            default_row_height: 56,
            near_bottom_threshold: 120,
            top_threshold: 80,
        }
    }
}

#[derive(Debug)]
struct Entry {
    message: ChatMessage,
    height: u32,
}

/// What a poll merge did.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Messages newly inserted, in arrival order.
    pub appended: Vec<ChatMessage>,
    /// Optimistic sends matched to their server message.
    pub reconciled: usize,
    /// Messages already present (overlapping poll window).
    pub duplicates: usize,
}

/// What a history prepend did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PrependOutcome {
    /// Older messages spliced in.
    pub added: usize,
    /// Total height introduced, already applied to the scroll offset.
    pub height_delta: u64,
}

/// The ordered, viewport-aware message list for one open conversation.
pub struct MessageStream {
    conversation_id: ConversationId,
    entries: Vec<Entry>,
    config: StreamConfig,
    scroll_top: u64,
    viewport_height: u64,
    unseen: usize,
    older_cursor: Option<PageCursor>,
    has_more: bool,
}

impl MessageStream {
    /// Creates an empty stream for one conversation.
    #[must_use]
    pub fn new(conversation_id: ConversationId, config: StreamConfig) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            config,
            scroll_top: 0,
            viewport_height: 0,
            unseen: 0,
            older_cursor: None,
            has_more: false,
        }
    }

    /// The conversation this stream renders.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Loads the initial (newest) page and scrolls to the tail.
    pub fn seed(&mut self, page: MessagePage) {
        let height = self.config.default_row_height;
        self.entries = page
            .messages
            .into_iter()
            .map(|message| Entry { height, message })
            .collect();
        self.entries
            .sort_by(|a, b| Self::sort_key(&a.message).cmp(&Self::sort_key(&b.message)));
        self.has_more = page.next.is_some();
        self.older_cursor = page.next;
        self.unseen = 0;
        self.scroll_to_bottom();
    }

    /// Messages in render order.
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Number of messages held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no messages are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cursor for the next older page, if more history exists.
    #[must_use]
    pub const fn older_cursor(&self) -> Option<&PageCursor> {
        self.older_cursor.as_ref()
    }

    // --- viewport ---

    /// Sets the viewport height reported by the UI.
    pub fn set_viewport_height(&mut self, height: u64) {
        self.viewport_height = height;
        self.clamp_scroll();
    }

    /// Applies a user scroll. Reaching the bottom clears the unseen
    /// counter.
    pub fn set_scroll_top(&mut self, scroll_top: u64) {
        self.scroll_top = scroll_top.min(self.max_scroll_top());
        if self.scroll_top == self.max_scroll_top() {
            self.unseen = 0;
        }
    }

    /// Current scroll offset.
    #[must_use]
    pub const fn scroll_top(&self) -> u64 {
        self.scroll_top
    }

    /// Total content height.
    #[must_use]
    pub fn content_height(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.height)).sum()
    }

    /// Whether the viewport sits within the near-bottom threshold.
    #[must_use]
    pub fn is_near_bottom(&self) -> bool {
        self.max_scroll_top() - self.scroll_top <= self.config.near_bottom_threshold
    }

    /// Whether the viewport is close enough to the top to want older
    /// history, and more history exists.
    #[must_use]
    pub fn wants_older(&self) -> bool {
        self.has_more && self.scroll_top <= self.config.top_threshold
    }

    /// Messages that arrived at the tail while the user was scrolled up.
    #[must_use]
    pub const fn unseen_count(&self) -> usize {
        self.unseen
    }

    /// Jumps to the tail and clears the unseen counter.
    pub fn scroll_to_bottom(&mut self) {
        self.scroll_top = self.max_scroll_top();
        self.unseen = 0;
    }

    /// The message whose rendered box contains the first visible pixel.
    #[must_use]
    pub fn first_visible(&self) -> Option<&ChatMessage> {
        let idx = self.first_visible_index()?;
        Some(&self.entries[idx].message)
    }

    /// Records the height the UI measured for an entry.
    ///
    /// If the entry sits fully above the anchor, the scroll offset moves
    /// by the height change so the visible content does not shift.
    pub fn set_measured_height(&mut self, id: &MessageRef, height: u32) {
        let Some(idx) = self.position_of(id) else {
            return;
        };
        let old = self.entries[idx].height;
        if old == height {
            return;
        }
        let anchor = self.first_visible_index().unwrap_or(0);
        self.entries[idx].height = height;
        if idx < anchor {
            let grown = u64::from(height) > u64::from(old);
            let delta = u64::from(height.abs_diff(old));
            if grown {
                self.scroll_top = self.scroll_top.saturating_add(delta);
            } else {
                self.scroll_top = self.scroll_top.saturating_sub(delta);
            }
        }
        self.clamp_scroll();
    }

    // --- growth ---

    /// Appends an optimistic send at its ordered position (the tail, for
    /// a freshly minted temp id).
    pub fn optimistic_append(&mut self, message: ChatMessage) {
        self.insert_sorted(message);
    }

    /// Merges a newest-page poll snapshot.
    ///
    /// De-duplication, in order: match by server id; match an optimistic
    /// entry through the reconciliation map (`resolve`); match an
    /// optimistic entry by sender + content within a short time window.
    /// Anything unmatched is inserted at its ordered position.
    pub fn merge_updates(
        &mut self,
        incoming: &[ChatMessage],
        resolve: impl Fn(&TempId) -> Option<MessageId>,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for message in incoming {
            let Some(server_id) = message.id.server_id() else {
                // Poll responses always carry server ids; skip anything else.
                tracing::debug!(id = %message.id, "poll message without server id skipped");
                continue;
            };
            if self.contains_server_id(server_id) {
                outcome.duplicates += 1;
                continue;
            }
            if let Some(idx) = self.match_reconciled(server_id, &resolve) {
                self.swap_id_in_place(idx, message);
                outcome.reconciled += 1;
                continue;
            }
            if let Some(idx) = self.match_by_content(message) {
                self.swap_id_in_place(idx, message);
                outcome.reconciled += 1;
                continue;
            }
            self.insert_sorted(message.clone());
            outcome.appended.push(message.clone());
        }
        outcome
    }

    /// Splices an older-history page in at the head.
    ///
    /// The scroll offset is adjusted by exactly the height introduced
    /// above the anchor, so the previously visible message keeps its
    /// on-screen position. Entries that arrived at the tail mid-fetch do
    /// not disturb the math: every splice position is computed against
    /// the list as it is now.
    pub fn prepend_older(
        &mut self,
        page: MessagePage,
        resolve: impl Fn(&TempId) -> Option<MessageId>,
    ) -> PrependOutcome {
        let mut outcome = PrependOutcome::default();
        for message in page.messages {
            let Some(server_id) = message.id.server_id() else {
                continue;
            };
            if self.contains_server_id(server_id) || self.match_reconciled(server_id, &resolve).is_some()
            {
                continue;
            }
            let height = self.insert_sorted(message);
            outcome.added += 1;
            outcome.height_delta += u64::from(height);
        }
        self.has_more = page.next.is_some();
        self.older_cursor = page.next;
        outcome
    }

    /// Swaps a confirmed send's temp id for its server id in place.
    ///
    /// Position and fields are untouched; only the identifier changes
    /// (and, for voice, the placeholder attachment adopts the uploaded
    /// reference).
    pub fn reconcile_send(&mut self, temp: &TempId, confirmed: &ChatMessage) {
        let key = MessageRef::Temp(temp.clone());
        if let Some(idx) = self.position_of(&key) {
            self.swap_id_in_place(idx, confirmed);
        }
    }

    /// Index of the entry currently holding `id`.
    #[must_use]
    pub fn position_of(&self, id: &MessageRef) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == *id)
    }

    /// Rendered y-offset of the entry holding `id`.
    #[must_use]
    pub fn offset_of(&self, id: &MessageRef) -> Option<u64> {
        let idx = self.position_of(id)?;
        Some(self.offset_of_index(idx))
    }

    // --- internals ---

    fn sort_key(message: &ChatMessage) -> (Timestamp, &str) {
        let id = match &message.id {
            MessageRef::Server(id) => id.as_str(),
            MessageRef::Temp(id) => id.as_str(),
        };
        (message.created_at, id)
    }

    fn contains_server_id(&self, id: &MessageId) -> bool {
        self.entries
            .iter()
            .any(|e| e.message.id.server_id() == Some(id))
    }

    fn match_reconciled(
        &self,
        server_id: &MessageId,
        resolve: impl Fn(&TempId) -> Option<MessageId>,
    ) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.message
                .id
                .temp_id()
                .is_some_and(|temp| resolve(temp).as_ref() == Some(server_id))
        })
    }

    fn match_by_content(&self, incoming: &ChatMessage) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.message.id.is_temp()
                && e.message.sender_id == incoming.sender_id
                && bodies_match(&e.message.body, &incoming.body)
                && within_window(e.message.created_at, incoming.created_at)
        })
    }

    /// Renames the entry at `idx` to the server id without moving it.
    fn swap_id_in_place(&mut self, idx: usize, confirmed: &ChatMessage) {
        let entry = &mut self.entries[idx];
        entry.message.id = confirmed.id.clone();
        if let (MessageBody::Voice { attachment, .. }, MessageBody::Voice { attachment: real, .. }) =
            (&mut entry.message.body, &confirmed.body)
        {
            *attachment = real.clone();
        }
    }

    /// Inserts at the ordered position, preserving the anchor for
    /// insertions above it and applying the near-bottom rule for tail
    /// arrivals. Returns the height used.
    fn insert_sorted(&mut self, message: ChatMessage) -> u32 {
        let height = self.config.default_row_height;
        let key = Self::sort_key(&message);
        let idx = self
            .entries
            .partition_point(|e| Self::sort_key(&e.message) <= key);

        if idx == self.entries.len() {
            let near = self.is_near_bottom();
            self.entries.push(Entry { message, height });
            if near {
                self.scroll_to_bottom();
            } else {
                self.unseen += 1;
            }
            return height;
        }

        let anchor = self.first_visible_index().unwrap_or(0);
        self.entries.insert(idx, Entry { message, height });
        if idx <= anchor {
            self.scroll_top = self.scroll_top.saturating_add(u64::from(height));
        }
        height
    }

    fn max_scroll_top(&self) -> u64 {
        self.content_height().saturating_sub(self.viewport_height)
    }

    fn clamp_scroll(&mut self) {
        self.scroll_top = self.scroll_top.min(self.max_scroll_top());
    }

    fn offset_of_index(&self, idx: usize) -> u64 {
        self.entries[..idx]
            .iter()
            .map(|e| u64::from(e.height))
            .sum()
    }

    fn first_visible_index(&self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mut offset = 0u64;
        for (idx, entry) in self.entries.iter().enumerate() {
            let end = offset + u64::from(entry.height);
            if self.scroll_top < end {
                return Some(idx);
            }
            offset = end;
        }
        Some(self.entries.len() - 1)
    }
}

fn bodies_match(a: &MessageBody, b: &MessageBody) -> bool {
    match (a, b) {
        (MessageBody::Text { text: ta }, MessageBody::Text { text: tb })
        | (MessageBody::System { text: ta }, MessageBody::System { text: tb }) => ta == tb,
        (
            MessageBody::Voice {
                duration_secs: da, ..
            },
            MessageBody::Voice {
                duration_secs: db, ..
            },
        ) => da == db,
        _ => false,
    }
}

fn within_window(a: Timestamp, b: Timestamp) -> bool {
    a.as_millis().abs_diff(b.as_millis()) <= CONTENT_MATCH_WINDOW_MS
}
