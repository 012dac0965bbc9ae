//! Integration tests for the send pipeline: tier gating, the daily
//! quota, optimistic insert, temp-id reconciliation, and failure retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use bandhan::config::ClientConfig;
use bandhan::controller::{ChatController, ChatEvent, SendError};
use bandhan::gate::{DenyReason, Tier};
use bandhan::services::InMemoryBackend;
use bandhan::voice::{FixedSource, VoiceCapture};
use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{
    ChatMessage, DeliveryState, MessageBody, MessageId, MessageRef, Timestamp, UserId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn me() -> UserId {
    UserId::new("u_asha")
}

fn peer() -> UserId {
    UserId::new("u_rohan")
}

fn demo_conversation() -> Conversation {
    Conversation {
        id: ConversationId::new("c_1"),
        participants: [me(), peer()],
        last_message: None,
        last_activity: Timestamp::from_millis(0),
        last_read: Timestamp::from_millis(0),
    }
}

fn peer_message(id: &str, millis: u64, text: &str) -> ChatMessage {
    ChatMessage {
        id: MessageRef::Server(MessageId::new(id)),
        conversation_id: ConversationId::new("c_1"),
        sender_id: peer(),
        body: MessageBody::Text { text: text.into() },
        created_at: Timestamp::from_millis(millis),
    }
}

/// Backend plus opened controller, with one prior peer message so that
/// free-tier sends are not initiating.
async fn setup() -> (
    Arc<InMemoryBackend>,
    Arc<ChatController<InMemoryBackend>>,
    mpsc::Receiver<ChatEvent>,
) {
    let backend = Arc::new(InMemoryBackend::new(50, me()));
    let conv = demo_conversation();
    backend.seed_conversation(conv.clone()).await;
    backend
        .push_remote_message(peer_message("m_opener", 1_000, "hello"))
        .await;

    let (controller, events) =
        ChatController::new(Arc::clone(&backend), ClientConfig::default(), me(), &conv).unwrap();
    controller.open().await.unwrap();
    (backend, controller, events)
}

fn ready_capture() -> VoiceCapture<FixedSource> {
    let mut capture = VoiceCapture::new(FixedSource::new(vec![7u8; 2_048]));
    capture.start(Timestamp::from_millis(0)).unwrap();
    capture.stop(Timestamp::from_millis(4_000)).unwrap();
    capture
}

// ---------------------------------------------------------------------------
// Quota (free tier)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn free_tier_sends_exactly_the_daily_limit() {
    let (backend, controller, _events) = setup().await;
    backend.set_tier(Tier::Free).await;

    for i in 0..5 {
        let outcome = controller.send_text(&format!("message {i}")).await.unwrap();
        assert_eq!(outcome.state, DeliveryState::Sent);
    }

    let err = controller.send_text("one too many").await.unwrap_err();
    assert!(matches!(
        err,
        SendError::NotPermitted(DenyReason::QuotaExceeded { limit: 5 })
    ));

    // Zero state mutation on the denied attempt: the list still shows
    // the opener plus exactly five sent messages, and usage was not
    // incremented past the limit.
    assert_eq!(controller.current_messages().await.len(), 6);
    assert_eq!(backend.recorded_usage().await.len(), 5);
}

#[tokio::test]
async fn backend_usage_count_is_honored_at_open() {
    let backend = Arc::new(InMemoryBackend::new(50, me()));
    let conv = demo_conversation();
    backend.seed_conversation(conv.clone()).await;
    backend
        .push_remote_message(peer_message("m_opener", 1_000, "hello"))
        .await;
    backend.set_tier(Tier::Free).await;
    backend.set_usage_today(5).await;

    let (controller, _events) =
        ChatController::new(Arc::clone(&backend), ClientConfig::default(), me(), &conv).unwrap();
    controller.open().await.unwrap();

    let err = controller.send_text("already spent").await.unwrap_err();
    assert!(matches!(
        err,
        SendError::NotPermitted(DenyReason::QuotaExceeded { .. })
    ));
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmed_send_swaps_temp_for_server_id_in_place() {
    let (_backend, controller, _events) = setup().await;

    controller.send_text("sent and confirmed").await.unwrap();

    let views = controller.current_messages().await;
    assert_eq!(views.len(), 2);
    let mine = &views[1];
    // Same position, server id, identical content.
    assert!(matches!(mine.message.id, MessageRef::Server(_)));
    assert_eq!(
        mine.message.body,
        MessageBody::Text {
            text: "sent and confirmed".into()
        }
    );
    assert_eq!(mine.delivery, Some(DeliveryState::Sent));
}

#[tokio::test]
async fn failed_send_keeps_temp_id_and_content_for_retry() {
    let (backend, controller, _events) = setup().await;
    backend.set_fail_sends(true);

    let outcome = controller.send_text("try me again").await.unwrap();
    let MessageRef::Temp(temp) = outcome.id.clone() else {
        panic!("failed send keeps its temp id");
    };
    assert!(matches!(outcome.state, DeliveryState::Failed { .. }));

    let views = controller.current_messages().await;
    assert_eq!(views.len(), 2);
    assert!(views[1].message.id.is_temp());
    assert!(matches!(
        views[1].delivery,
        Some(DeliveryState::Failed { .. })
    ));
    // Usage is only recorded on a confirmed send.
    assert!(backend.recorded_usage().await.is_empty());

    backend.set_fail_sends(false);
    let retried = controller.retry_text(&temp).await.unwrap();
    assert_eq!(retried.state, DeliveryState::Sent);

    let views = controller.current_messages().await;
    assert_eq!(views.len(), 2, "retry reuses the optimistic entry");
    assert!(matches!(views[1].message.id, MessageRef::Server(_)));
    assert_eq!(backend.recorded_usage().await.len(), 1);
}

#[tokio::test]
async fn poll_overlap_after_confirmation_does_not_duplicate() {
    let (_backend, controller, _events) = setup().await;
    controller.send_text("seen twice by the poll").await.unwrap();

    // The poll window re-returns everything, including our own send.
    controller.poll_conversation_tick().await;
    controller.poll_conversation_tick().await;

    assert_eq!(controller.current_messages().await.len(), 2);
}

// ---------------------------------------------------------------------------
// Voice
// ---------------------------------------------------------------------------

#[tokio::test]
async fn free_tier_voice_is_denied_without_touching_the_clip() {
    let (backend, controller, _events) = setup().await;
    backend.set_tier(Tier::Free).await;

    let mut capture = ready_capture();
    let (progress_tx, _progress_rx) = mpsc::channel(16);

    let err = controller
        .send_voice(&mut capture, &progress_tx)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SendError::NotPermitted(DenyReason::UpgradeRequiredForVoice)
    ));
    // Nothing inserted, clip still ready for after an upgrade.
    assert_eq!(controller.current_messages().await.len(), 1);
    assert_eq!(capture.clip_duration(), Some(Duration::from_secs(4)));
}

#[tokio::test]
async fn premium_voice_uploads_with_progress_and_reconciles() {
    let (_backend, controller, _events) = setup().await;

    let mut capture = ready_capture();
    let (progress_tx, mut progress_rx) = mpsc::channel(16);

    let outcome = controller
        .send_voice(&mut capture, &progress_tx)
        .await
        .unwrap();
    assert_eq!(outcome.state, DeliveryState::Sent);

    let mut last_percent = 0;
    while let Ok(progress) = progress_rx.try_recv() {
        assert!(progress.percent() >= last_percent);
        last_percent = progress.percent();
    }
    assert_eq!(last_percent, 100);

    let views = controller.current_messages().await;
    let MessageBody::Voice {
        attachment,
        duration_secs,
    } = &views[1].message.body
    else {
        panic!("expected a voice body");
    };
    assert_eq!(*duration_secs, 4);
    // The placeholder was swapped for the uploaded reference.
    assert_ne!(attachment.as_str(), "pending");
}
