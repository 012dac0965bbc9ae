//! External service boundaries the messaging core is built against.
//!
//! The backend is an opaque collaborator reached over REST; these traits
//! capture its behavioral contract only. [`memory::InMemoryBackend`]
//! implements all of them for tests and the demo harness.

pub mod memory;

use std::future::Future;

use tokio::sync::mpsc;

use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{ChatMessage, MessageId, MessageKind, MessagePage, PageCursor, UserId};
use bandhan_proto::receipt::{Receipt, ReceiptStatus};
use bandhan_proto::typing::TypingSignal;

use crate::gate::Tier;
use crate::voice::{UploadProgress, VoiceClip};

pub use memory::InMemoryBackend;

/// Errors surfaced by the backend services.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// Transient transport failure; safe to retry on the next tick.
    #[error("network error: {0}")]
    Network(String),

    /// The resource no longer exists (HTTP 404 class). Repeated
    /// occurrences mean the conversation itself is unreachable.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend understood and refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    /// Returns `true` for the 404 class of failure.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Message history and sending.
pub trait MessageService: Send + Sync {
    /// Fetches a page of messages. `None` cursor returns the newest page;
    /// the returned cursor walks toward older history. Messages within a
    /// page are oldest first.
    fn list_messages(
        &self,
        conversation: &ConversationId,
        cursor: Option<&PageCursor>,
    ) -> impl Future<Output = Result<MessagePage, ServiceError>> + Send;

    /// Sends a text message; returns the server-assigned message.
    fn send_message(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> impl Future<Output = Result<ChatMessage, ServiceError>> + Send;

    /// Uploads a voice clip and sends it as a message. Progress is
    /// reported over `progress` as bytes go out; the clip is borrowed so
    /// a failed upload can be retried without re-recording.
    fn send_voice_message(
        &self,
        conversation: &ConversationId,
        clip: &VoiceClip,
        progress: &mpsc::Sender<UploadProgress>,
    ) -> impl Future<Output = Result<ChatMessage, ServiceError>> + Send;
}

/// Conversation listing and read-state.
pub trait ConversationService: Send + Sync {
    /// Lists the user's conversations.
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<Conversation>, ServiceError>> + Send;

    /// Records that the user has read the conversation up to now.
    fn mark_read(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// Typing signal exchange.
pub trait TypingService: Send + Sync {
    /// Broadcasts a local typing signal.
    fn send_typing_signal(
        &self,
        signal: &TypingSignal,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Fetches typing signals from the other participant since the last
    /// poll.
    fn poll_typing_signals(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<Vec<TypingSignal>, ServiceError>> + Send;
}

/// Delivery/read receipt exchange.
///
/// The canonical send shape is one receipt per call; the backend has no
/// batch endpoint.
pub trait DeliveryService: Send + Sync {
    /// Reports that a received message reached the given stage.
    fn send_receipt(
        &self,
        message: &MessageId,
        status: ReceiptStatus,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Fetches receipts for our sent messages since the last poll.
    fn poll_receipts(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<Vec<Receipt>, ServiceError>> + Send;
}

/// Block-list lookups.
pub trait SafetyService: Send + Sync {
    /// Returns `true` if messaging between the local user and `user` is
    /// blocked in either direction.
    fn is_blocked(&self, user: &UserId) -> impl Future<Output = Result<bool, ServiceError>> + Send;
}

/// Subscription tier and usage accounting.
pub trait SubscriptionService: Send + Sync {
    /// The local user's current tier.
    fn current_tier(&self) -> impl Future<Output = Result<Tier, ServiceError>> + Send;

    /// Sends already counted against today's quota period.
    fn usage_today(&self) -> impl Future<Output = Result<u32, ServiceError>> + Send;

    /// Records one use of a messaging feature after a confirmed send.
    fn record_usage(
        &self,
        feature: MessageKind,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// Everything the messaging core needs from the backend, as one bound.
pub trait ChatBackend:
    MessageService
    + ConversationService
    + TypingService
    + DeliveryService
    + SafetyService
    + SubscriptionService
{
}

impl<T> ChatBackend for T where
    T: MessageService
        + ConversationService
        + TypingService
        + DeliveryService
        + SafetyService
        + SubscriptionService
{
}
