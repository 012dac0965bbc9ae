//! Integration tests for the conversation list: previews, derived
//! unread counts, ordering, and optimistic mark-read.

use std::sync::Arc;

use tokio::sync::mpsc;

use bandhan::config::ClientConfig;
use bandhan::controller::{ChatController, ChatEvent};
use bandhan::services::InMemoryBackend;
use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{
    AttachmentRef, ChatMessage, MessageBody, MessageId, MessageRef, Timestamp, UserId,
};

fn me() -> UserId {
    UserId::new("u_asha")
}

fn peer(n: u32) -> UserId {
    UserId::new(format!("u_peer{n}"))
}

fn conversation_with(id: &str, other: &UserId, last: Option<ChatMessage>) -> Conversation {
    let last_activity = last
        .as_ref()
        .map_or(Timestamp::from_millis(0), |m| m.created_at);
    Conversation {
        id: ConversationId::new(id),
        participants: [me(), other.clone()],
        last_message: last,
        last_activity,
        last_read: Timestamp::from_millis(0),
    }
}

fn text_from(conv: &str, sender: &UserId, millis: u64, text: &str) -> ChatMessage {
    ChatMessage {
        id: MessageRef::Server(MessageId::new(format!("m_{conv}_{millis}"))),
        conversation_id: ConversationId::new(conv),
        sender_id: sender.clone(),
        body: MessageBody::Text { text: text.into() },
        created_at: Timestamp::from_millis(millis),
    }
}

async fn setup(
    conversations: Vec<Conversation>,
) -> (
    Arc<InMemoryBackend>,
    Arc<ChatController<InMemoryBackend>>,
    mpsc::Receiver<ChatEvent>,
) {
    let backend = Arc::new(InMemoryBackend::new(20, me()));
    let open_conv = conversations[0].clone();
    for conv in conversations {
        backend.seed_conversation(conv).await;
    }
    let (controller, events) = ChatController::new(
        Arc::clone(&backend),
        ClientConfig::default(),
        me(),
        &open_conv,
    )
    .unwrap();
    controller.open().await.unwrap();
    (backend, controller, events)
}

#[tokio::test]
async fn previews_are_sorted_by_recent_activity() {
    let p1 = peer(1);
    let p2 = peer(2);
    let p3 = peer(3);
    let (_backend, controller, _events) = setup(vec![
        conversation_with("c_old", &p1, Some(text_from("c_old", &p1, 1_000, "first"))),
        conversation_with("c_new", &p2, Some(text_from("c_new", &p2, 9_000, "latest"))),
        conversation_with("c_mid", &p3, Some(text_from("c_mid", &p3, 5_000, "middle"))),
    ])
    .await;

    controller.poll_index_tick().await;

    let previews = controller.conversation_previews().await;
    let order: Vec<&str> = previews
        .iter()
        .map(|p| p.conversation_id.as_str())
        .collect();
    assert_eq!(order, vec!["c_new", "c_mid", "c_old"]);
    assert_eq!(previews[0].peer, Some(p2));
    assert_eq!(previews[0].snippet, "latest");
}

#[tokio::test]
async fn index_refresh_reports_total_unread() {
    let p1 = peer(1);
    let p2 = peer(2);
    let (_backend, controller, mut events) = setup(vec![
        conversation_with("c_1", &p1, Some(text_from("c_1", &p1, 1_000, "one"))),
        conversation_with("c_2", &p2, Some(text_from("c_2", &p2, 2_000, "two"))),
    ])
    .await;

    controller.poll_index_tick().await;

    let mut totals = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ChatEvent::IndexRefreshed { total_unread } = event {
            totals.push(total_unread);
        }
    }
    assert_eq!(totals, vec![2]);
}

#[tokio::test]
async fn unread_derives_from_known_messages_not_backend_counts() {
    let p1 = peer(1);
    let (backend, controller, _events) = setup(vec![conversation_with("c_1", &p1, None)]).await;

    // Three peer messages and one of ours land in the open conversation.
    for (millis, text) in [(1_000, "a"), (2_000, "b"), (3_000, "c")] {
        backend
            .push_remote_message(text_from("c_1", &p1, millis, text))
            .await;
    }
    controller.send_text("my reply").await.unwrap();
    controller.poll_conversation_tick().await;
    controller.poll_index_tick().await;

    let previews = controller.conversation_previews().await;
    // Own messages never count as unread.
    assert_eq!(previews[0].unread, 3);
}

#[tokio::test]
async fn mark_read_zeroes_unread_immediately() {
    let p1 = peer(1);
    let (backend, controller, _events) = setup(vec![conversation_with("c_1", &p1, None)]).await;

    backend
        .push_remote_message(text_from("c_1", &p1, 1_000, "unread"))
        .await;
    controller.poll_conversation_tick().await;
    controller.poll_index_tick().await;
    assert_eq!(controller.conversation_previews().await[0].unread, 1);

    controller.mark_conversation_read().await;
    // Zeroed locally without waiting for the next snapshot.
    assert_eq!(controller.conversation_previews().await[0].unread, 0);
}

#[tokio::test]
async fn optimistic_read_survives_a_stale_snapshot() {
    let p1 = peer(1);
    let (backend, controller, _events) = setup(vec![conversation_with("c_1", &p1, None)]).await;

    backend
        .push_remote_message(text_from("c_1", &p1, 1_000, "unread"))
        .await;
    controller.poll_conversation_tick().await;
    controller.poll_index_tick().await;

    // The backend drops the mark-read call, so its snapshot still
    // carries the old read mark; the local optimistic mark must win.
    backend.set_fail_sends(true);
    controller.mark_conversation_read().await;
    backend.set_fail_sends(false);

    controller.poll_index_tick().await;
    assert_eq!(controller.conversation_previews().await[0].unread, 0);
}

#[tokio::test]
async fn voice_and_system_messages_use_placeholders() {
    let p1 = peer(1);
    let p2 = peer(2);
    let mut voice_last = text_from("c_voice", &p1, 2_000, "");
    voice_last.body = MessageBody::Voice {
        attachment: AttachmentRef::new("a_9"),
        duration_secs: 12,
    };
    let mut system_last = text_from("c_system", &p2, 1_000, "");
    system_last.body = MessageBody::System {
        text: "You matched with Rohan".into(),
    };

    let (_backend, controller, _events) = setup(vec![
        conversation_with("c_voice", &p1, Some(voice_last)),
        conversation_with("c_system", &p2, Some(system_last)),
    ])
    .await;
    controller.poll_index_tick().await;

    let previews = controller.conversation_previews().await;
    let snippet = |id: &str| {
        previews
            .iter()
            .find(|p| p.conversation_id.as_str() == id)
            .map(|p| p.snippet.clone())
            .unwrap_or_default()
    };
    assert_eq!(snippet("c_voice"), "Voice message");
    assert_eq!(snippet("c_system"), "Activity update");
}

#[tokio::test]
async fn long_text_previews_truncate() {
    let p1 = peer(1);
    let long = "This is a very long opening message that should certainly not fit in a list row";
    let (_backend, controller, _events) = setup(vec![conversation_with(
        "c_1",
        &p1,
        Some(text_from("c_1", &p1, 1_000, long)),
    )])
    .await;
    controller.poll_index_tick().await;

    let snippet = controller.conversation_previews().await[0].snippet.clone();
    assert!(snippet.ends_with('…'));
    assert_eq!(snippet.chars().count(), 49);
}
