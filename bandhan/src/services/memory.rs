//! In-memory backend for tests and the demo harness.
//!
//! Implements every service trait against process-local state, with
//! failure injection for the error paths and inspection helpers so
//! tests can assert on what the client sent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};

use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{
    AttachmentRef, ChatMessage, MessageBody, MessageId, MessageKind, MessagePage, MessageRef,
    PageCursor, Timestamp, UserId,
};
use bandhan_proto::receipt::{Receipt, ReceiptStatus};
use bandhan_proto::typing::TypingSignal;

use crate::gate::Tier;
use crate::voice::{UploadProgress, VoiceClip};

use super::{
    ConversationService, DeliveryService, MessageService, SafetyService, ServiceError,
    SubscriptionService, TypingService,
};

/// Number of progress chunks a simulated upload reports.
const UPLOAD_CHUNKS: u64 = 4;

#[derive(Debug, Default)]
struct State {
    conversations: Vec<Conversation>,
    /// Messages per conversation, oldest first.
    messages: HashMap<ConversationId, Vec<ChatMessage>>,
    /// Conversations that now answer 404.
    gone: HashSet<ConversationId>,
    pending_typing: HashMap<ConversationId, Vec<TypingSignal>>,
    pending_receipts: HashMap<ConversationId, Vec<Receipt>>,
    sent_typing: Vec<TypingSignal>,
    sent_receipts: Vec<(MessageId, ReceiptStatus)>,
    blocked: HashSet<UserId>,
    usage_today: u32,
    usage_recorded: Vec<MessageKind>,
}

/// Process-local backend with scripted peer behavior.
pub struct InMemoryBackend {
    state: Mutex<State>,
    tier: Mutex<Tier>,
    self_user: UserId,
    fail_sends: AtomicBool,
    fail_polls: AtomicBool,
    next_seq: AtomicU64,
    page_size: usize,
}

impl InMemoryBackend {
    /// Creates an empty backend with the given history page size. Sent
    /// messages are attributed to `self_user`.
    #[must_use]
    pub fn new(page_size: usize, self_user: UserId) -> Self {
        Self {
            state: Mutex::new(State::default()),
            tier: Mutex::new(Tier::Premium),
            self_user,
            fail_sends: AtomicBool::new(false),
            fail_polls: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            page_size,
        }
    }

    /// Registers a conversation.
    pub async fn seed_conversation(&self, conversation: Conversation) {
        let mut state = self.state.lock().await;
        state
            .messages
            .entry(conversation.id.clone())
            .or_default();
        state.conversations.push(conversation);
    }

    /// Appends a message as if the peer (or another device) sent it.
    pub async fn push_remote_message(&self, message: ChatMessage) {
        let mut state = self.state.lock().await;
        if let Some(conv) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        {
            conv.last_activity = message.created_at;
            conv.last_message = Some(message.clone());
        }
        state
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    /// Queues a typing signal for the next poll.
    pub async fn push_typing(&self, signal: TypingSignal) {
        self.state
            .lock()
            .await
            .pending_typing
            .entry(signal.conversation_id.clone())
            .or_default()
            .push(signal);
    }

    /// Queues a receipt for the next poll.
    pub async fn push_receipt(&self, conversation: &ConversationId, receipt: Receipt) {
        self.state
            .lock()
            .await
            .pending_receipts
            .entry(conversation.clone())
            .or_default()
            .push(receipt);
    }

    /// Sets the local user's subscription tier.
    pub async fn set_tier(&self, tier: Tier) {
        *self.tier.lock().await = tier;
    }

    /// Seeds today's backend-side usage count.
    pub async fn set_usage_today(&self, count: u32) {
        self.state.lock().await.usage_today = count;
    }

    /// Marks messaging with `user` as blocked.
    pub async fn block_user(&self, user: UserId) {
        self.state.lock().await.blocked.insert(user);
    }

    /// Makes every send fail with a network error while `fail` is set.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes every poll fail with a network error while `fail` is set.
    pub fn set_fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    /// Makes the conversation answer 404 from now on.
    pub async fn remove_conversation(&self, conversation: &ConversationId) {
        self.state.lock().await.gone.insert(conversation.clone());
    }

    /// Typing signals the client has broadcast.
    pub async fn sent_typing(&self) -> Vec<TypingSignal> {
        self.state.lock().await.sent_typing.clone()
    }

    /// Receipts the client has issued.
    pub async fn sent_receipts(&self) -> Vec<(MessageId, ReceiptStatus)> {
        self.state.lock().await.sent_receipts.clone()
    }

    /// Usage the client has recorded.
    pub async fn recorded_usage(&self) -> Vec<MessageKind> {
        self.state.lock().await.usage_recorded.clone()
    }

    /// Number of stored messages in a conversation.
    pub async fn message_count(&self, conversation: &ConversationId) -> usize {
        self.state
            .lock()
            .await
            .messages
            .get(conversation)
            .map_or(0, Vec::len)
    }

    fn next_id(&self, prefix: &str) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}_{seq:04}")
    }

    fn check_poll(&self) -> Result<(), ServiceError> {
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(ServiceError::Network("poll failed".into()));
        }
        Ok(())
    }

    fn check_gone(state: &State, conversation: &ConversationId) -> Result<(), ServiceError> {
        if state.gone.contains(conversation) {
            return Err(ServiceError::NotFound(format!(
                "conversation {conversation}"
            )));
        }
        Ok(())
    }

    async fn store_sent(&self, conversation: &ConversationId, body: MessageBody) -> ChatMessage {
        let message = ChatMessage {
            id: MessageRef::Server(MessageId::new(self.next_id("m"))),
            conversation_id: conversation.clone(),
            sender_id: self.self_user.clone(),
            body,
            created_at: Timestamp::now(),
        };
        self.push_remote_message(message.clone()).await;
        message
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(20, UserId::new("u_self"))
    }
}

impl MessageService for InMemoryBackend {
    async fn list_messages(
        &self,
        conversation: &ConversationId,
        cursor: Option<&PageCursor>,
    ) -> Result<MessagePage, ServiceError> {
        self.check_poll()?;
        let state = self.state.lock().await;
        Self::check_gone(&state, conversation)?;

        let all = state
            .messages
            .get(conversation)
            .map_or(&[][..], Vec::as_slice);
        let end = match cursor {
            None => all.len(),
            Some(cursor) => cursor
                .as_str()
                .parse::<usize>()
                .map_err(|_| ServiceError::Rejected(format!("bad cursor {}", cursor.as_str())))?
                .min(all.len()),
        };
        let start = end.saturating_sub(self.page_size);
        let next = (start > 0).then(|| PageCursor::new(start.to_string()));

        Ok(MessagePage {
            messages: all[start..end].to_vec(),
            next,
        })
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<ChatMessage, ServiceError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ServiceError::Network("send failed".into()));
        }
        {
            let state = self.state.lock().await;
            Self::check_gone(&state, conversation)?;
        }
        let body = MessageBody::Text { text: text.into() };
        Ok(self.store_sent(conversation, body).await)
    }

    async fn send_voice_message(
        &self,
        conversation: &ConversationId,
        clip: &VoiceClip,
        progress: &mpsc::Sender<UploadProgress>,
    ) -> Result<ChatMessage, ServiceError> {
        let total = u64::try_from(clip.audio.len()).unwrap_or(u64::MAX);
        for chunk in 1..=UPLOAD_CHUNKS {
            let _ = progress
                .send(UploadProgress {
                    bytes_sent: total * chunk / UPLOAD_CHUNKS,
                    total_bytes: total,
                })
                .await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ServiceError::Network("upload failed".into()));
        }
        {
            let state = self.state.lock().await;
            Self::check_gone(&state, conversation)?;
        }
        let body = MessageBody::Voice {
            attachment: AttachmentRef::new(self.next_id("a")),
            duration_secs: clip.duration_secs(),
        };
        Ok(self.store_sent(conversation, body).await)
    }
}

impl ConversationService for InMemoryBackend {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ServiceError> {
        self.check_poll()?;
        Ok(self.state.lock().await.conversations.clone())
    }

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), ServiceError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ServiceError::Network("mark read failed".into()));
        }
        let mut state = self.state.lock().await;
        Self::check_gone(&state, conversation)?;
        match state
            .conversations
            .iter_mut()
            .find(|c| c.id == *conversation)
        {
            Some(conv) => {
                conv.last_read = Timestamp::now();
                Ok(())
            }
            None => Err(ServiceError::NotFound(format!(
                "conversation {conversation}"
            ))),
        }
    }
}

impl TypingService for InMemoryBackend {
    async fn send_typing_signal(&self, signal: &TypingSignal) -> Result<(), ServiceError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ServiceError::Network("typing signal failed".into()));
        }
        self.state.lock().await.sent_typing.push(signal.clone());
        Ok(())
    }

    async fn poll_typing_signals(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<TypingSignal>, ServiceError> {
        self.check_poll()?;
        let mut state = self.state.lock().await;
        Self::check_gone(&state, conversation)?;
        Ok(state
            .pending_typing
            .get_mut(conversation)
            .map(std::mem::take)
            .unwrap_or_default())
    }
}

impl DeliveryService for InMemoryBackend {
    async fn send_receipt(
        &self,
        message: &MessageId,
        status: ReceiptStatus,
    ) -> Result<(), ServiceError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ServiceError::Network("receipt failed".into()));
        }
        self.state
            .lock()
            .await
            .sent_receipts
            .push((message.clone(), status));
        Ok(())
    }

    async fn poll_receipts(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<Receipt>, ServiceError> {
        self.check_poll()?;
        let mut state = self.state.lock().await;
        Self::check_gone(&state, conversation)?;
        Ok(state
            .pending_receipts
            .get_mut(conversation)
            .map(std::mem::take)
            .unwrap_or_default())
    }
}

impl SafetyService for InMemoryBackend {
    async fn is_blocked(&self, user: &UserId) -> Result<bool, ServiceError> {
        Ok(self.state.lock().await.blocked.contains(user))
    }
}

impl SubscriptionService for InMemoryBackend {
    async fn current_tier(&self) -> Result<Tier, ServiceError> {
        Ok(*self.tier.lock().await)
    }

    async fn usage_today(&self) -> Result<u32, ServiceError> {
        Ok(self.state.lock().await.usage_today)
    }

    async fn record_usage(&self, feature: MessageKind) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        state.usage_today = state.usage_today.saturating_add(1);
        state.usage_recorded.push(feature);
        Ok(())
    }
}
