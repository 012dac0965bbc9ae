//! Conversation orchestration: the send pipeline, the polling loops,
//! and the single surface the UI layer consumes.
//!
//! One controller owns one open conversation view. All shared state
//! lives behind `tokio::sync::Mutex` and is only touched from the
//! cooperative runtime; mutation paths tolerate re-entrant poll
//! responses racing user sends (the stream's merge is idempotent).
//! Background polling is scoped by [`PollTasks`]: dropping it aborts
//! every loop, and the shared active flag makes any in-flight result
//! against a torn-down view a discard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{
    AttachmentRef, ChatMessage, DeliveryState, MessageBody, MessageId, MessageKind, MessageRef,
    TempId, TempIdMinter, Timestamp, Transition, UserId, ValidationError,
};
use bandhan_proto::receipt::ReceiptStatus;
use bandhan_proto::typing::{TypingAction, TypingSignal};

use crate::config::ClientConfig;
use crate::delivery::DeliveryTracker;
use crate::gate::{ConversationFacts, DenyReason, PeriodKey, SendVerdict, UsageQuota, can_send};
use crate::index::{ConversationIndex, ConversationPreview};
use crate::services::{ChatBackend, ServiceError};
use crate::stream::MessageStream;
use crate::typing::TypingCoordinator;
use crate::voice::{AudioSource, UploadProgress, VoiceCapture, VoiceError};

/// Events emitted to the UI layer.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A message from the peer arrived.
    MessageReceived {
        /// The received message.
        message: ChatMessage,
    },
    /// A message's delivery state changed.
    DeliveryChanged {
        /// The message's current identifier.
        id: MessageRef,
        /// The new state.
        state: DeliveryState,
    },
    /// A peer started or stopped typing (including expiry).
    TypingChanged {
        /// The peer whose indicator changed.
        user_id: UserId,
        /// Whether they now show as typing.
        typing: bool,
    },
    /// Messages arrived at the tail while the user was scrolled up.
    NewMessagesBelow {
        /// How many are waiting below the viewport.
        count: usize,
    },
    /// The conversation list snapshot was refreshed.
    IndexRefreshed {
        /// Total derived unread count across conversations.
        total_unread: usize,
    },
    /// Repeated 404s: the conversation itself is gone. The view should
    /// surface a retry control.
    ConversationUnreachable,
}

/// Errors surfaced directly to a send caller.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The gate denied the send; nothing was mutated.
    #[error("{0}")]
    NotPermitted(DenyReason),

    /// The draft failed validation; nothing was mutated.
    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// Voice capture was not in an uploadable state.
    #[error(transparent)]
    Voice(#[from] VoiceError),

    /// A pre-send lookup (tier, block list) failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// No failed message with that id to retry.
    #[error("message is not in a retryable state")]
    NotRetryable,
}

/// Outcome of a send attempt. A failed network send is not an error at
/// this level: the message stays in the list, marked retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// The message's current identifier.
    pub id: MessageRef,
    /// Its delivery state after the attempt.
    pub state: DeliveryState,
}

/// A message with its delivery state, for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    /// The message.
    pub message: ChatMessage,
    /// Delivery state, for own sent messages.
    pub delivery: Option<DeliveryState>,
}

/// The local user is not a participant of the conversation.
#[derive(Debug, thiserror::Error)]
#[error("local user is not a participant in conversation {0}")]
pub struct NotParticipant(pub ConversationId);

/// Scope handle for the background polling loops.
///
/// Dropping (or calling [`shutdown`](Self::shutdown)) aborts every loop
/// and deactivates the owning view, so no orphaned timer survives a
/// navigation away and no stale result is applied.
pub struct PollTasks {
    handles: Vec<JoinHandle<()>>,
    active: Arc<AtomicBool>,
}

impl PollTasks {
    /// Stops all polling and marks the view inactive.
    pub fn shutdown(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        for handle in &self.handles {
            handle.abort();
        }
        self.handles.clear();
    }
}

impl Drop for PollTasks {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Orchestrates one open conversation against the backend services.
pub struct ChatController<B: ChatBackend + 'static> {
    backend: Arc<B>,
    config: ClientConfig,
    self_id: UserId,
    peer_id: UserId,
    conversation_id: ConversationId,
    stream: Mutex<MessageStream>,
    delivery: Mutex<DeliveryTracker>,
    typing: Mutex<TypingCoordinator>,
    quota: Mutex<UsageQuota>,
    minter: Mutex<TempIdMinter>,
    index: Mutex<ConversationIndex>,
    events: mpsc::Sender<ChatEvent>,
    active: Arc<AtomicBool>,
    blocked: AtomicBool,
    consecutive_not_found: AtomicU32,
    unreachable_reported: AtomicBool,
}

impl<B: ChatBackend + 'static> ChatController<B> {
    /// Creates a controller for one conversation view.
    ///
    /// Returns the controller and the receiver for [`ChatEvent`]s that
    /// the UI layer should consume.
    ///
    /// # Errors
    ///
    /// Returns [`NotParticipant`] if `self_id` is not one of the
    /// conversation's participants.
    pub fn new(
        backend: Arc<B>,
        config: ClientConfig,
        self_id: UserId,
        conversation: &Conversation,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ChatEvent>), NotParticipant> {
        let peer_id = conversation
            .other_participant(&self_id)
            .ok_or_else(|| NotParticipant(conversation.id.clone()))?
            .clone();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let stream = MessageStream::new(conversation.id.clone(), config.stream_config());
        let typing = TypingCoordinator::new(config.typing_debounce, config.typing_expiry);
        let index = ConversationIndex::new(self_id.clone(), config.preview_chars);
        let controller = Arc::new(Self {
            backend,
            self_id,
            peer_id,
            conversation_id: conversation.id.clone(),
            stream: Mutex::new(stream),
            delivery: Mutex::new(DeliveryTracker::new()),
            typing: Mutex::new(typing),
            quota: Mutex::new(UsageQuota::new(PeriodKey::today())),
            minter: Mutex::new(TempIdMinter::new()),
            index: Mutex::new(index),
            events: event_tx,
            active: Arc::new(AtomicBool::new(true)),
            blocked: AtomicBool::new(false),
            consecutive_not_found: AtomicU32::new(0),
            unreachable_reported: AtomicBool::new(false),
            config,
        });
        Ok((controller, event_rx))
    }

    /// Loads the initial state: block flag, today's usage, and the
    /// newest message page.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] if the initial history fetch fails; the
    /// view should surface a retry control on `NotFound`.
    pub async fn open(&self) -> Result<(), ServiceError> {
        let blocked = match self.backend.is_blocked(&self.peer_id).await {
            Ok(blocked) => blocked,
            Err(err) => {
                tracing::warn!(error = %err, "block lookup failed, assuming not blocked");
                false
            }
        };
        self.blocked.store(blocked, Ordering::SeqCst);

        match self.backend.usage_today().await {
            Ok(count) => {
                *self.quota.lock().await = UsageQuota::with_count(PeriodKey::today(), count);
            }
            Err(err) => tracing::warn!(error = %err, "usage lookup failed, starting from zero"),
        }

        let page = self
            .backend
            .list_messages(&self.conversation_id, None)
            .await?;
        let own_ids: Vec<MessageId> = page
            .messages
            .iter()
            .filter(|m| m.sender_id == self.self_id)
            .filter_map(|m| m.id.server_id().cloned())
            .collect();
        {
            let mut delivery = self.delivery.lock().await;
            for id in own_ids {
                delivery.observe_sent(id);
            }
            self.stream.lock().await.seed(page);
        }
        Ok(())
    }

    /// Whether the composer should accept input at all. A blocked
    /// conversation disables the composer rather than erroring per send.
    #[must_use]
    pub fn composer_enabled(&self) -> bool {
        !self.blocked.load(Ordering::SeqCst)
    }

    /// The conversation this controller orchestrates.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    // --- send pipeline ---

    /// Sends a text message through the full pipeline: gate check,
    /// optimistic insert, network send, reconcile-or-fail, usage
    /// recording, typing stop.
    ///
    /// # Errors
    ///
    /// [`SendError::NotPermitted`] or [`SendError::Invalid`] before any
    /// state is mutated. A network failure is NOT an error: the message
    /// stays in the list marked `Failed`, retryable.
    pub async fn send_text(&self, text: &str) -> Result<SendOutcome, SendError> {
        if let SendVerdict::Deny(reason) = self.gate_check(MessageKind::Text).await? {
            return Err(SendError::NotPermitted(reason));
        }

        let now = Timestamp::now();
        let temp = self.minter.lock().await.mint(now);
        let message = ChatMessage {
            id: MessageRef::Temp(temp.clone()),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.self_id.clone(),
            body: MessageBody::Text { text: text.into() },
            created_at: now,
        };
        message.validate()?;

        self.insert_optimistic(&temp, message).await;
        let result = self
            .backend
            .send_message(&self.conversation_id, text)
            .await
            .map_err(|e| e.to_string());
        let outcome = self.finish_send(&temp, result, MessageKind::Text).await;
        self.stop_typing().await;
        Ok(outcome)
    }

    /// Sends the clip currently held by `capture` as a voice message.
    ///
    /// The optimistic entry carries a placeholder attachment that is
    /// swapped for the uploaded reference on reconciliation. On upload
    /// failure the clip stays inside `capture` for one retry.
    ///
    /// # Errors
    ///
    /// [`SendError::NotPermitted`] before any state is mutated, or
    /// [`SendError::Voice`] when no clip is ready.
    pub async fn send_voice<S: AudioSource>(
        &self,
        capture: &mut VoiceCapture<S>,
        progress: &mpsc::Sender<UploadProgress>,
    ) -> Result<SendOutcome, SendError> {
        if let SendVerdict::Deny(reason) = self.gate_check(MessageKind::Voice).await? {
            return Err(SendError::NotPermitted(reason));
        }
        let duration = capture.clip_duration().ok_or(VoiceError::NothingToUpload)?;

        let now = Timestamp::now();
        let temp = self.minter.lock().await.mint(now);
        let message = ChatMessage {
            id: MessageRef::Temp(temp.clone()),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.self_id.clone(),
            body: MessageBody::Voice {
                attachment: AttachmentRef::new("pending"),
                duration_secs: whole_seconds(duration),
            },
            created_at: now,
        };

        self.insert_optimistic(&temp, message).await;
        let result = capture
            .upload(self.backend.as_ref(), &self.conversation_id, progress)
            .await
            .map_err(|e| e.to_string());
        let outcome = self.finish_send(&temp, result, MessageKind::Voice).await;
        self.stop_typing().await;
        Ok(outcome)
    }

    /// Retries a failed text send, reusing the retained content.
    ///
    /// # Errors
    ///
    /// [`SendError::NotRetryable`] if no failed message holds that id.
    pub async fn retry_text(&self, temp: &TempId) -> Result<SendOutcome, SendError> {
        let text = {
            let stream = self.stream.lock().await;
            stream
                .messages()
                .find(|m| m.id.temp_id() == Some(temp))
                .and_then(|m| match &m.body {
                    MessageBody::Text { text } => Some(text.clone()),
                    _ => None,
                })
        }
        .ok_or(SendError::NotRetryable)?;

        self.begin_retry(temp).await?;
        let result = self
            .backend
            .send_message(&self.conversation_id, &text)
            .await
            .map_err(|e| e.to_string());
        Ok(self.finish_send(temp, result, MessageKind::Text).await)
    }

    /// Retries a failed voice send with the clip retained by `capture`.
    ///
    /// # Errors
    ///
    /// [`SendError::NotRetryable`] if the message is not failed, or
    /// [`SendError::Voice`] once the retained clip has been discarded.
    pub async fn retry_voice<S: AudioSource>(
        &self,
        temp: &TempId,
        capture: &mut VoiceCapture<S>,
        progress: &mpsc::Sender<UploadProgress>,
    ) -> Result<SendOutcome, SendError> {
        self.begin_retry(temp).await?;
        let result = capture
            .upload(self.backend.as_ref(), &self.conversation_id, progress)
            .await
            .map_err(|e| e.to_string());
        Ok(self.finish_send(temp, result, MessageKind::Voice).await)
    }

    // --- history, read state, typing ---

    /// Fetches and splices in the next older history page. Returns the
    /// number of messages added; zero when history is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] if the fetch itself fails.
    pub async fn load_older(&self) -> Result<usize, ServiceError> {
        let Some(cursor) = self.stream.lock().await.older_cursor().cloned() else {
            return Ok(0);
        };
        let page = self
            .backend
            .list_messages(&self.conversation_id, Some(&cursor))
            .await?;
        if !self.is_active() {
            return Ok(0);
        }
        let mut delivery = self.delivery.lock().await;
        let mut stream = self.stream.lock().await;
        let own_ids: Vec<MessageId> = page
            .messages
            .iter()
            .filter(|m| m.sender_id == self.self_id)
            .filter_map(|m| m.id.server_id().cloned())
            .collect();
        let outcome = stream.prepend_older(page, |t| delivery.resolve(t).cloned());
        for id in own_ids {
            delivery.observe_sent(id);
        }
        Ok(outcome.added)
    }

    /// Marks the conversation read: the local unread count zeroes
    /// immediately; backend confirmation is best-effort.
    pub async fn mark_conversation_read(&self) {
        let now = Timestamp::now();
        self.index.lock().await.mark_read(&self.conversation_id, now);
        if let Err(err) = self.backend.mark_read(&self.conversation_id).await {
            tracing::warn!(error = %err, "mark-read not confirmed by backend");
        }
    }

    /// Issues read receipts for peer messages the UI reports as having
    /// entered the viewport.
    pub async fn note_viewed(&self, ids: &[MessageId]) {
        let peer_ids: Vec<MessageId> = {
            let stream = self.stream.lock().await;
            ids.iter()
                .filter(|id| {
                    stream
                        .messages()
                        .any(|m| m.id.server_id() == Some(id) && m.sender_id != self.self_id)
                })
                .cloned()
                .collect()
        };
        for id in peer_ids {
            if let Err(err) = self.backend.send_receipt(&id, ReceiptStatus::Read).await {
                tracing::debug!(id = %id, error = %err, "read receipt not delivered");
            }
        }
    }

    /// The composer content changed; broadcasts a typing signal when the
    /// debounce window allows.
    pub async fn composer_input(&self) {
        let action = self.typing.lock().await.on_input(Timestamp::now());
        if let Some(action) = action {
            self.broadcast_typing(action).await;
        }
    }

    /// The composer was cleared or lost focus.
    pub async fn composer_idle(&self) {
        self.stop_typing().await;
    }

    // --- reads ---

    /// Messages with their delivery states, in render order.
    pub async fn current_messages(&self) -> Vec<MessageView> {
        let delivery = self.delivery.lock().await;
        let stream = self.stream.lock().await;
        stream
            .messages()
            .map(|message| MessageView {
                message: message.clone(),
                delivery: delivery.state(&message.id).cloned(),
            })
            .collect()
    }

    /// Whether the peer currently shows as typing.
    pub async fn peer_is_typing(&self) -> bool {
        self.typing.lock().await.peer_typing(&self.peer_id)
    }

    /// Delivery state for one message.
    pub async fn current_delivery_state(&self, id: &MessageRef) -> Option<DeliveryState> {
        self.delivery.lock().await.state(id).cloned()
    }

    /// Conversation list rows, most recent first.
    pub async fn conversation_previews(&self) -> Vec<ConversationPreview> {
        self.index.lock().await.previews()
    }

    /// Reports viewport geometry from the UI.
    pub async fn update_viewport(&self, height: u64, scroll_top: u64) {
        let mut stream = self.stream.lock().await;
        stream.set_viewport_height(height);
        stream.set_scroll_top(scroll_top);
    }

    /// Whether the viewport is near the top and more history exists.
    pub async fn wants_older(&self) -> bool {
        self.stream.lock().await.wants_older()
    }

    /// Current scroll offset, after any anchor adjustments.
    pub async fn scroll_top(&self) -> u64 {
        self.stream.lock().await.scroll_top()
    }

    /// The message at the top of the viewport.
    pub async fn first_visible(&self) -> Option<ChatMessage> {
        self.stream.lock().await.first_visible().cloned()
    }

    // --- polling ---

    /// Spawns the two polling loops: a fast one for the open
    /// conversation (messages, receipts, typing) and a slow one for the
    /// conversation list. The returned scope owns both; drop it on
    /// navigation away.
    pub fn spawn_poll_tasks(self: &Arc<Self>) -> PollTasks {
        let fast = {
            let ctl = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(ctl.config.conversation_poll_interval);
                loop {
                    tick.tick().await;
                    if !ctl.is_active() {
                        break;
                    }
                    ctl.poll_conversation_tick().await;
                }
            })
        };
        let slow = {
            let ctl = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(ctl.config.index_poll_interval);
                loop {
                    tick.tick().await;
                    if !ctl.is_active() {
                        break;
                    }
                    ctl.poll_index_tick().await;
                }
            })
        };
        PollTasks {
            handles: vec![fast, slow],
            active: Arc::clone(&self.active),
        }
    }

    /// Marks the view inactive: in-flight results will be discarded.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// One fast-loop tick. Public so a UI can force an immediate
    /// refresh (pull-to-refresh).
    pub async fn poll_conversation_tick(&self) {
        self.poll_messages().await;
        self.poll_receipts().await;
        self.poll_typing().await;
    }

    /// One slow-loop tick over the conversation list.
    pub async fn poll_index_tick(&self) {
        match self.backend.list_conversations().await {
            Ok(snapshot) => {
                if !self.is_active() {
                    return;
                }
                let total = {
                    let mut index = self.index.lock().await;
                    index.apply_snapshot(snapshot);
                    index.total_unread()
                };
                self.emit(ChatEvent::IndexRefreshed {
                    total_unread: total,
                });
            }
            Err(err) => {
                tracing::debug!(error = %err, "conversation list poll failed, will retry");
            }
        }
    }

    async fn poll_messages(&self) {
        match self
            .backend
            .list_messages(&self.conversation_id, None)
            .await
        {
            Ok(page) => {
                self.consecutive_not_found.store(0, Ordering::SeqCst);
                self.unreachable_reported.store(false, Ordering::SeqCst);
                if !self.is_active() {
                    return;
                }
                let (appended, unseen, basis) = {
                    let mut delivery = self.delivery.lock().await;
                    let mut stream = self.stream.lock().await;
                    let outcome =
                        stream.merge_updates(&page.messages, |t| delivery.resolve(t).cloned());
                    // Own messages from another device enter at the Sent
                    // baseline.
                    for message in &outcome.appended {
                        if message.sender_id == self.self_id
                            && let Some(id) = message.id.server_id()
                        {
                            delivery.observe_sent(id.clone());
                        }
                    }
                    let basis: Vec<ChatMessage> = stream.messages().cloned().collect();
                    (outcome.appended, stream.unseen_count(), basis)
                };
                self.index
                    .lock()
                    .await
                    .note_messages(&self.conversation_id, &basis);

                for message in appended {
                    if message.sender_id == self.self_id {
                        continue;
                    }
                    if let Some(id) = message.id.server_id()
                        && let Err(err) = self.backend.send_receipt(id, ReceiptStatus::Delivered).await
                    {
                        tracing::debug!(id = %id, error = %err, "delivered receipt not sent");
                    }
                    self.emit(ChatEvent::MessageReceived { message });
                }
                if unseen > 0 {
                    self.emit(ChatEvent::NewMessagesBelow { count: unseen });
                }
            }
            Err(err) => self.note_poll_failure(&err),
        }
    }

    async fn poll_receipts(&self) {
        match self.backend.poll_receipts(&self.conversation_id).await {
            Ok(receipts) => {
                if !self.is_active() {
                    return;
                }
                let mut delivery = self.delivery.lock().await;
                for receipt in receipts {
                    let outcome = match receipt.status {
                        ReceiptStatus::Delivered => delivery.mark_delivered(&receipt.message_id),
                        ReceiptStatus::Read => delivery.mark_read(&receipt.message_id),
                    };
                    if outcome == Transition::Applied {
                        self.emit(ChatEvent::DeliveryChanged {
                            id: MessageRef::Server(receipt.message_id),
                            state: receipt.status.as_delivery_state(),
                        });
                    }
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "receipt poll failed, will retry");
            }
        }
    }

    async fn poll_typing(&self) {
        match self.backend.poll_typing_signals(&self.conversation_id).await {
            Ok(signals) => {
                if !self.is_active() {
                    return;
                }
                let now = Timestamp::now();
                let changes = {
                    let mut typing = self.typing.lock().await;
                    let mut changes: Vec<(UserId, bool)> = Vec::new();
                    for signal in &signals {
                        if signal.user_id == self.self_id {
                            continue;
                        }
                        if typing.apply_signal(signal, now) {
                            changes.push((
                                signal.user_id.clone(),
                                signal.action == TypingAction::Started,
                            ));
                        }
                    }
                    for user in typing.sweep_expired(now) {
                        changes.push((user, false));
                    }
                    changes
                };
                for (user_id, is_typing) in changes {
                    self.emit(ChatEvent::TypingChanged {
                        user_id,
                        typing: is_typing,
                    });
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "typing poll failed, will retry");
            }
        }
    }

    // --- internals ---

    async fn gate_check(&self, kind: MessageKind) -> Result<SendVerdict, SendError> {
        let tier = self.backend.current_tier().await?;
        let blocked = self.backend.is_blocked(&self.peer_id).await?;
        self.blocked.store(blocked, Ordering::SeqCst);
        let has_any_message = !self.stream.lock().await.is_empty();
        let facts = ConversationFacts {
            blocked,
            has_any_message,
        };
        let quota = *self.quota.lock().await;
        Ok(can_send(
            tier,
            kind,
            facts,
            &quota,
            PeriodKey::today(),
            self.config.daily_free_limit,
        ))
    }

    async fn insert_optimistic(&self, temp: &TempId, message: ChatMessage) {
        {
            let mut delivery = self.delivery.lock().await;
            let mut stream = self.stream.lock().await;
            delivery.begin_send(temp.clone());
            stream.optimistic_append(message);
        }
        self.emit(ChatEvent::DeliveryChanged {
            id: MessageRef::Temp(temp.clone()),
            state: DeliveryState::Sending,
        });
    }

    async fn begin_retry(&self, temp: &TempId) -> Result<(), SendError> {
        if self.delivery.lock().await.retry(temp) != Transition::Applied {
            return Err(SendError::NotRetryable);
        }
        self.emit(ChatEvent::DeliveryChanged {
            id: MessageRef::Temp(temp.clone()),
            state: DeliveryState::Sending,
        });
        Ok(())
    }

    /// Applies the result of a network send: reconcile on success, mark
    /// failed (content retained) on failure. A result landing after the
    /// view was torn down is discarded.
    async fn finish_send(
        &self,
        temp: &TempId,
        result: Result<ChatMessage, String>,
        kind: MessageKind,
    ) -> SendOutcome {
        match result {
            Ok(confirmed) => {
                let Some(server_id) = confirmed.id.server_id().cloned() else {
                    // A backend answering without a server id is a
                    // contract violation; treat as a failed send.
                    return self.apply_send_failure(temp, "backend returned no id").await;
                };
                if !self.is_active() {
                    tracing::debug!(temp = %temp, "send confirmed after teardown, discarded");
                    return SendOutcome {
                        id: MessageRef::Server(server_id),
                        state: DeliveryState::Sent,
                    };
                }
                {
                    let mut delivery = self.delivery.lock().await;
                    let mut stream = self.stream.lock().await;
                    delivery.confirm_sent(temp, server_id.clone());
                    stream.reconcile_send(temp, &confirmed);
                }
                self.quota.lock().await.record(PeriodKey::today());
                if let Err(err) = self.backend.record_usage(kind).await {
                    tracing::warn!(error = %err, "usage not recorded");
                }
                self.emit(ChatEvent::DeliveryChanged {
                    id: MessageRef::Server(server_id.clone()),
                    state: DeliveryState::Sent,
                });
                SendOutcome {
                    id: MessageRef::Server(server_id),
                    state: DeliveryState::Sent,
                }
            }
            Err(reason) => self.apply_send_failure(temp, &reason).await,
        }
    }

    async fn apply_send_failure(&self, temp: &TempId, reason: &str) -> SendOutcome {
        if self.is_active() {
            self.delivery.lock().await.mark_failed(temp, reason);
            self.emit(ChatEvent::DeliveryChanged {
                id: MessageRef::Temp(temp.clone()),
                state: DeliveryState::Failed {
                    reason: reason.to_string(),
                },
            });
        }
        SendOutcome {
            id: MessageRef::Temp(temp.clone()),
            state: DeliveryState::Failed {
                reason: reason.to_string(),
            },
        }
    }

    async fn stop_typing(&self) {
        let action = self.typing.lock().await.on_stop();
        if let Some(action) = action {
            self.broadcast_typing(action).await;
        }
    }

    async fn broadcast_typing(&self, action: TypingAction) {
        let signal = TypingSignal {
            conversation_id: self.conversation_id.clone(),
            user_id: self.self_id.clone(),
            action,
            sent_at: Timestamp::now(),
        };
        // Fire and forget: a lost typing signal self-heals via expiry.
        if let Err(err) = self.backend.send_typing_signal(&signal).await {
            tracing::debug!(error = %err, "typing signal not delivered");
        }
    }

    fn note_poll_failure(&self, err: &ServiceError) {
        if err.is_not_found() {
            let seen = self.consecutive_not_found.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.config.unreachable_threshold
                && !self.unreachable_reported.swap(true, Ordering::SeqCst)
            {
                tracing::warn!(
                    conversation = %self.conversation_id,
                    consecutive = seen,
                    "conversation unreachable"
                );
                self.emit(ChatEvent::ConversationUnreachable);
            }
        } else {
            tracing::debug!(error = %err, "message poll failed, will retry");
        }
    }

    fn emit(&self, event: ChatEvent) {
        // Best-effort: a full UI channel drops the event rather than
        // blocking the pipeline.
        let _ = self.events.try_send(event);
    }
}

/// Duration to whole seconds, rounded to nearest.
fn whole_seconds(duration: std::time::Duration) -> u32 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    u32::try_from((millis + 500) / 1000).unwrap_or(u32::MAX)
}
