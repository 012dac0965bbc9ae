//! Message types for the Bandhan messaging backend.
//!
//! A message carries either a server-assigned [`MessageId`] or a
//! client-minted [`TempId`] while an optimistic send is in flight; the
//! [`MessageRef`] union guarantees exactly one of the two is current.
//! Delivery lifecycle is tracked by [`DeliveryState`], whose transitions
//! are enforced by [`DeliveryState::advance`].

use serde::{Deserialize, Serialize};

/// Maximum allowed text message size in bytes (4 KiB).
pub const MAX_TEXT_SIZE: usize = 4 * 1024;

/// Server-assigned unique identifier for a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-assigned identifier string.
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

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-minted provisional identifier for an optimistic send.
///
/// Formatted as `tmp-<epochMillis>`. Use [`TempIdMinter`] to create these;
/// it guarantees uniqueness within a process even for sends landing in the
/// same millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId(String);

impl TempId {
    /// Creates a temp id directly from epoch milliseconds.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self(format!("tmp-{millis}"))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the embedded epoch milliseconds, if the format is intact.
    #[must_use]
    pub fn millis(&self) -> Option<u64> {
        self.0.strip_prefix("tmp-")?.parse().ok()
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mints [`TempId`]s that are unique within the process.
///
/// Two sends in the same millisecond would otherwise produce the same
/// `tmp-<epochMillis>` string; the minter bumps the embedded value past
/// the last one handed out.
#[derive(Debug, Default)]
pub struct TempIdMinter {
    last_millis: u64,
}

impl TempIdMinter {
    /// Creates a fresh minter.
    #[must_use]
    pub const fn new() -> Self {
        Self { last_millis: 0 }
    }

    /// Mints a temp id for the given wall-clock instant.
    pub fn mint(&mut self, now: Timestamp) -> TempId {
        let millis = now.as_millis().max(self.last_millis + 1);
        self.last_millis = millis;
        TempId::from_millis(millis)
    }
}

/// The current identifier of a logical message.
///
/// Exactly one variant is current at any time: reconciliation swaps
/// `Temp` for `Server` atomically, preserving every other field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageRef {
    /// Server-assigned authoritative id.
    Server(MessageId),
    /// Client-minted provisional id, current only while a send is in flight.
    Temp(TempId),
}

impl MessageRef {
    /// Returns `true` while the message still carries a provisional id.
    #[must_use]
    pub const fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    /// Returns the server id, if reconciliation has happened.
    #[must_use]
    pub const fn server_id(&self) -> Option<&MessageId> {
        match self {
            Self::Server(id) => Some(id),
            Self::Temp(_) => None,
        }
    }

    /// Returns the temp id, if the message is still provisional.
    #[must_use]
    pub const fn temp_id(&self) -> Option<&TempId> {
        match self {
            Self::Temp(id) => Some(id),
            Self::Server(_) => None,
        }
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Temp(id) => write!(f, "{id}"),
        }
    }
}

/// Identifies a user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Wraps a user identifier string.
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

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self`, saturating at zero.
    #[must_use]
    pub const fn millis_since(&self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Reference to an uploaded voice attachment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentRef(String);

impl AttachmentRef {
    /// Wraps an attachment reference string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Coarse message category, used for gating and previews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// Voice recording.
    Voice,
    /// Server-generated notice (match made, profile hidden, etc.).
    System,
}

/// Content of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Plain text content.
    Text {
        /// The message text.
        text: String,
    },
    /// A voice recording, referenced by its uploaded attachment.
    Voice {
        /// Backend reference to the uploaded audio.
        attachment: AttachmentRef,
        /// Recording length in seconds.
        duration_secs: u32,
    },
    /// A server-generated notice.
    System {
        /// The notice text.
        text: String,
    },
}

impl MessageBody {
    /// Returns the coarse category of this body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Voice { .. } => MessageKind::Voice,
            Self::System { .. } => MessageKind::System,
        }
    }
}

/// Error returned when a message fails client-side validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Text content is empty.
    #[error("message text is empty")]
    Empty,
    /// Text content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Voice body has a zero duration.
    #[error("voice message has zero duration")]
    ZeroDuration,
}

/// A chat message as held by the client and exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Current identifier (server-assigned or provisional).
    pub id: MessageRef,
    /// Which conversation this message belongs to.
    pub conversation_id: crate::conversation::ConversationId,
    /// Who sent this message.
    pub sender_id: UserId,
    /// The message content.
    pub body: MessageBody,
    /// Server timestamp (client clock until reconciliation).
    pub created_at: Timestamp,
}

impl ChatMessage {
    /// Validates this message for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] for empty text,
    /// [`ValidationError::TooLarge`] for text over [`MAX_TEXT_SIZE`], or
    /// [`ValidationError::ZeroDuration`] for a voice body with no length.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.body {
            MessageBody::Text { text } | MessageBody::System { text } => {
                if text.trim().is_empty() {
                    return Err(ValidationError::Empty);
                }
                let size = text.len();
                if size > MAX_TEXT_SIZE {
                    return Err(ValidationError::TooLarge {
                        size,
                        max: MAX_TEXT_SIZE,
                    });
                }
            }
            MessageBody::Voice { duration_secs, .. } => {
                if *duration_secs == 0 {
                    return Err(ValidationError::ZeroDuration);
                }
            }
        }
        Ok(())
    }
}

/// An opaque pagination cursor handed back by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageCursor(String);

impl PageCursor {
    /// Wraps a cursor string.
    #[must_use]
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    /// Returns the cursor as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of messages returned by a history fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    /// Messages in this page, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Cursor for the next (older) page, if more history exists.
    pub next: Option<PageCursor>,
}

/// Delivery lifecycle of a message from the sender's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    /// Optimistically inserted, network send in flight.
    Sending,
    /// Accepted by the backend.
    Sent,
    /// Delivered to the recipient's device.
    Delivered,
    /// Seen by the recipient (receipt observed).
    Read,
    /// Send failed; content retained so the user can retry.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
}

impl DeliveryState {
    /// Position along the forward `Sending -> Sent -> Delivered -> Read`
    /// progression. `Failed` sits outside the progression.
    #[must_use]
    const fn rank(&self) -> u8 {
        match self {
            Self::Sending | Self::Failed { .. } => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// Attempts to move this state to `next`, enforcing monotonicity.
    ///
    /// Forward moves apply; stale moves (at-or-behind the current state)
    /// are idempotent no-ops; anything else is rejected. The only back
    /// edge is the retry cycle: `Sending -> Failed` and `Failed -> Sending`.
    pub fn advance(&mut self, next: Self) -> Transition {
        let outcome = match (&*self, &next) {
            (Self::Failed { .. }, Self::Failed { .. }) => Transition::Ignored,
            // Failure is reachable from Sending only.
            (Self::Sending, Self::Failed { .. }) => Transition::Applied,
            (_, Self::Failed { .. }) => Transition::Rejected,
            // Retry: a failed message goes back to Sending; anything else
            // never moves backward to Sending.
            (Self::Failed { .. }, Self::Sending) => Transition::Applied,
            // A failed message must be retried before progressing.
            (Self::Failed { .. }, _) => Transition::Rejected,
            (cur, nxt) if nxt.rank() > cur.rank() => Transition::Applied,
            _ => Transition::Ignored,
        };
        if outcome == Transition::Applied {
            *self = next;
        }
        outcome
    }

    /// Returns `true` once the state is at or past `other` on the forward
    /// progression. `Failed` is never "at or past" anything but itself.
    #[must_use]
    pub fn is_at_least(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Failed { .. }, Self::Failed { .. }) => true,
            (Self::Failed { .. }, _) | (_, Self::Failed { .. }) => false,
            _ => self.rank() >= other.rank(),
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sending => write!(f, "sending"),
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Read => write!(f, "read"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Outcome of a [`DeliveryState::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state moved forward.
    Applied,
    /// The move was stale; state unchanged (idempotent).
    Ignored,
    /// The move was backward or otherwise illegal; state unchanged.
    Rejected,
}
