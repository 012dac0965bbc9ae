//! Bandhan messaging core — demo harness.
//!
//! Runs a scripted two-user exchange against the in-memory backend and
//! prints the event stream the UI layer would consume. Configuration via
//! CLI flags, environment variables, or config file
//! (`~/.config/bandhan/config.toml`).
//!
//! ```bash
//! cargo run --bin bandhan
//! cargo run --bin bandhan -- --user-id u_asha --peer-id u_rohan
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use bandhan::config::{CliArgs, ClientConfig};
use bandhan::controller::{ChatController, ChatEvent};
use bandhan::services::InMemoryBackend;
use bandhan::voice::{FixedSource, VoiceCapture};
use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{ChatMessage, MessageBody, MessageId, MessageRef, Timestamp, UserId};
use bandhan_proto::receipt::{Receipt, ReceiptStatus};
use bandhan_proto::typing::{TypingAction, TypingSignal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("bandhan demo starting");

    let me = UserId::new(config.user_id.clone().unwrap_or_else(|| "u_asha".into()));
    let peer = UserId::new(config.peer_id.clone().unwrap_or_else(|| "u_rohan".into()));

    let conversation = Conversation {
        id: ConversationId::new("c_demo"),
        participants: [me.clone(), peer.clone()],
        last_message: None,
        last_activity: Timestamp::now(),
        last_read: Timestamp::from_millis(0),
    };

    let backend = Arc::new(InMemoryBackend::new(20, me.clone()));
    backend.seed_conversation(conversation.clone()).await;

    // The peer has already written before we open the view.
    backend
        .push_remote_message(ChatMessage {
            id: MessageRef::Server(MessageId::new("m_hello")),
            conversation_id: conversation.id.clone(),
            sender_id: peer.clone(),
            body: MessageBody::Text {
                text: "Hi! I liked your profile.".into(),
            },
            created_at: Timestamp::now(),
        })
        .await;

    let (controller, mut events) =
        ChatController::new(Arc::clone(&backend), config, me.clone(), &conversation)?;
    controller.open().await?;
    let _polling = controller.spawn_poll_tasks();

    println!("== opening conversation with {peer} ==");
    controller.poll_conversation_tick().await;
    drain(&mut events);

    println!("== typing and replying ==");
    controller.composer_input().await;
    controller.send_text("Thank you! Tell me about yourself?").await?;
    drain(&mut events);

    println!("== peer starts typing ==");
    backend
        .push_typing(TypingSignal {
            conversation_id: conversation.id.clone(),
            user_id: peer.clone(),
            action: TypingAction::Started,
            sent_at: Timestamp::now(),
        })
        .await;
    controller.poll_conversation_tick().await;
    drain(&mut events);
    println!("peer typing: {}", controller.peer_is_typing().await);

    println!("== peer reads our message ==");
    if let Some(sent) = controller
        .current_messages()
        .await
        .iter()
        .rev()
        .find(|v| v.message.sender_id == me)
        && let Some(id) = sent.message.id.server_id()
    {
        backend
            .push_receipt(
                &conversation.id,
                Receipt {
                    message_id: id.clone(),
                    status: ReceiptStatus::Read,
                    observed_at: Timestamp::now(),
                },
            )
            .await;
    }
    controller.poll_conversation_tick().await;
    drain(&mut events);

    println!("== sending a voice note ==");
    let mut capture = VoiceCapture::new(FixedSource::new(vec![0u8; 4096]));
    let started = Timestamp::now();
    capture.start(started)?;
    capture.stop(Timestamp::from_millis(started.as_millis() + 4_000))?;
    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    let outcome = controller.send_voice(&mut capture, &progress_tx).await?;
    while let Ok(p) = progress_rx.try_recv() {
        println!("upload {}%", p.percent());
    }
    println!("voice message {} is {}", outcome.id, outcome.state);
    drain(&mut events);

    controller.mark_conversation_read().await;
    controller.poll_index_tick().await;
    drain(&mut events);

    tracing::info!("bandhan demo exiting");
    Ok(())
}

fn drain(events: &mut mpsc::Receiver<ChatEvent>) {
    while let Ok(event) = events.try_recv() {
        println!("  event: {event:?}");
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file rather than stdout so the demo's printed event
/// stream stays readable.
fn init_logging(level: &str, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let path = log_file.map_or_else(
        || std::env::temp_dir().join("bandhan.log"),
        Path::to_path_buf,
    );
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .ok()?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}
