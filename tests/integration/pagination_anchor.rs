//! Integration tests for older-history pagination and scroll-anchor
//! preservation, end to end through the controller.

use std::sync::Arc;

use bandhan::config::ClientConfig;
use bandhan::controller::ChatController;
use bandhan::services::InMemoryBackend;
use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{
    ChatMessage, MessageBody, MessageId, MessageRef, Timestamp, UserId,
};

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

fn numbered_message(n: u64) -> ChatMessage {
    ChatMessage {
        id: MessageRef::Server(MessageId::new(format!("m_{n:04}"))),
        conversation_id: ConversationId::new("c_1"),
        sender_id: peer(),
        body: MessageBody::Text {
            text: format!("message {n}"),
        },
        created_at: Timestamp::from_millis(100_000 + n * 1_000),
    }
}

/// Seeds `total` messages behind a backend paging `page_size` at a time
/// and opens the conversation.
async fn setup(
    total: u64,
    page_size: usize,
) -> (Arc<InMemoryBackend>, Arc<ChatController<InMemoryBackend>>) {
    let backend = Arc::new(InMemoryBackend::new(page_size, me()));
    let conv = demo_conversation();
    backend.seed_conversation(conv.clone()).await;
    for n in 0..total {
        backend.push_remote_message(numbered_message(n)).await;
    }
    let (controller, _events) =
        ChatController::new(Arc::clone(&backend), ClientConfig::default(), me(), &conv).unwrap();
    controller.open().await.unwrap();
    (backend, controller)
}

#[tokio::test]
async fn open_loads_the_newest_page_only() {
    let (_backend, controller) = setup(70, 50).await;

    let views = controller.current_messages().await;
    assert_eq!(views.len(), 50);
    assert_eq!(views[0].message.id, MessageRef::Server(MessageId::new("m_0020")));
    assert_eq!(
        views.last().unwrap().message.id,
        MessageRef::Server(MessageId::new("m_0069"))
    );
}

#[tokio::test]
async fn load_older_splices_at_the_head_in_order() {
    let (_backend, controller) = setup(70, 50).await;

    controller.update_viewport(400, 0).await;
    assert!(controller.wants_older().await);

    let added = controller.load_older().await.unwrap();
    assert_eq!(added, 20);

    let views = controller.current_messages().await;
    assert_eq!(views.len(), 70);
    assert_eq!(views[0].message.id, MessageRef::Server(MessageId::new("m_0000")));
    // Strictly ascending by timestamp.
    for pair in views.windows(2) {
        assert!(pair[0].message.created_at < pair[1].message.created_at);
    }
}

#[tokio::test]
async fn anchored_message_keeps_its_screen_position() {
    let (_backend, controller) = setup(70, 50).await;

    controller.update_viewport(400, 0).await;
    let anchored = controller.first_visible().await.unwrap();
    let scroll_before = controller.scroll_top().await;
    assert_eq!(scroll_before, 0);

    controller.load_older().await.unwrap();

    // The anchor did not move: the same message is first visible, and
    // the scroll offset grew by exactly the spliced-in height.
    let after = controller.first_visible().await.unwrap();
    assert_eq!(after.id, anchored.id);
    assert_eq!(
        controller.scroll_top().await,
        20 * u64::from(ClientConfig::default().row_height_px)
    );
}

#[tokio::test]
async fn anchor_survives_a_tail_append_landing_mid_fetch() {
    let (backend, controller) = setup(70, 50).await;

    controller.update_viewport(400, 0).await;
    let anchored = controller.first_visible().await.unwrap();

    // A new message lands and is merged before the older page applies.
    backend.push_remote_message(numbered_message(999)).await;
    controller.poll_conversation_tick().await;

    controller.load_older().await.unwrap();

    assert_eq!(controller.first_visible().await.unwrap().id, anchored.id);
    assert_eq!(controller.current_messages().await.len(), 71);
}

#[tokio::test]
async fn history_exhaustion_stops_wanting_older() {
    let (_backend, controller) = setup(70, 50).await;

    controller.update_viewport(400, 0).await;
    assert_eq!(controller.load_older().await.unwrap(), 20);
    assert_eq!(controller.load_older().await.unwrap(), 0);
    assert!(!controller.wants_older().await);
}

#[tokio::test]
async fn load_older_with_no_history_is_a_noop() {
    let (_backend, controller) = setup(10, 50).await;
    controller.update_viewport(400, 0).await;
    assert_eq!(controller.load_older().await.unwrap(), 0);
    assert!(!controller.wants_older().await);
}
