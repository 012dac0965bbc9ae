//! Integration tests for voice capture and upload: short-clip
//! rejection, microphone release on every exit path, the one-retry
//! failure policy, and upload progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use bandhan::config::ClientConfig;
use bandhan::controller::{ChatController, SendError};
use bandhan::services::InMemoryBackend;
use bandhan::voice::{
    AudioSource, CapturePhase, CaptureStream, VoiceCapture, VoiceError,
};
use bandhan_proto::conversation::{Conversation, ConversationId};
use bandhan_proto::message::{MessageBody, Timestamp, UserId};

// ---------------------------------------------------------------------------
// A microphone stub that counts open capture streams.
// ---------------------------------------------------------------------------

struct CountingMic {
    open: Arc<AtomicUsize>,
}

impl CountingMic {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let open = Arc::new(AtomicUsize::new(0));
        (
            Self {
                open: Arc::clone(&open),
            },
            open,
        )
    }
}

struct CountingStream {
    audio: Vec<u8>,
    open: Arc<AtomicUsize>,
}

impl AudioSource for CountingMic {
    type Stream = CountingStream;

    fn open(&mut self) -> Result<Self::Stream, VoiceError> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(CountingStream {
            audio: vec![1u8; 1_024],
            open: Arc::clone(&self.open),
        })
    }
}

impl CaptureStream for CountingStream {
    fn take_audio(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.audio)
    }
}

impl Drop for CountingStream {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn me() -> UserId {
    UserId::new("u_asha")
}

fn demo_conversation() -> Conversation {
    Conversation {
        id: ConversationId::new("c_1"),
        participants: [me(), UserId::new("u_rohan")],
        last_message: None,
        last_activity: Timestamp::from_millis(0),
        last_read: Timestamp::from_millis(0),
    }
}

async fn setup() -> (Arc<InMemoryBackend>, Arc<ChatController<InMemoryBackend>>) {
    let backend = Arc::new(InMemoryBackend::new(20, me()));
    let conv = demo_conversation();
    backend.seed_conversation(conv.clone()).await;
    let (controller, _events) =
        ChatController::new(Arc::clone(&backend), ClientConfig::default(), me(), &conv).unwrap();
    controller.open().await.unwrap();
    (backend, controller)
}

fn at(millis: u64) -> Timestamp {
    Timestamp::from_millis(millis)
}

// ---------------------------------------------------------------------------
// Short-clip rejection (never reaches the network)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clip_under_one_second_never_uploads() {
    let (backend, controller) = setup().await;
    let (mic, open) = CountingMic::new();
    let mut capture = VoiceCapture::new(mic);

    capture.start(at(0)).unwrap();
    let err = capture.stop(at(600)).unwrap_err();
    assert!(matches!(err, VoiceError::TooShort { millis: 600, .. }));
    assert_eq!(capture.phase(), CapturePhase::Idle);
    assert_eq!(open.load(Ordering::SeqCst), 0);

    // Attempting to send anyway finds nothing to upload; no network
    // call, no message.
    let (progress_tx, _progress_rx) = mpsc::channel(4);
    let err = controller
        .send_voice(&mut capture, &progress_tx)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SendError::Voice(VoiceError::NothingToUpload)
    ));
    assert_eq!(
        backend.message_count(&ConversationId::new("c_1")).await,
        0
    );
    assert!(controller.current_messages().await.is_empty());
}

// ---------------------------------------------------------------------------
// Microphone release discipline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn microphone_released_on_stop_cancel_and_teardown() {
    // Stop.
    let (mic, open) = CountingMic::new();
    let mut capture = VoiceCapture::new(mic);
    capture.start(at(0)).unwrap();
    assert_eq!(open.load(Ordering::SeqCst), 1);
    capture.stop(at(2_000)).unwrap();
    assert_eq!(open.load(Ordering::SeqCst), 0);

    // Cancel.
    let (mic, open) = CountingMic::new();
    let mut capture = VoiceCapture::new(mic);
    capture.start(at(0)).unwrap();
    capture.cancel();
    assert_eq!(open.load(Ordering::SeqCst), 0);

    // Teardown mid-recording (conversation view dropped).
    let (mic, open) = CountingMic::new();
    let mut capture = VoiceCapture::new(mic);
    capture.start(at(0)).unwrap();
    assert_eq!(open.load(Ordering::SeqCst), 1);
    drop(capture);
    assert_eq!(open.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn recording_auto_stops_at_the_ceiling() {
    let (mic, open) = CountingMic::new();
    let mut capture = VoiceCapture::with_limits(
        mic,
        Duration::from_millis(1_000),
        Duration::from_secs(300),
    );
    capture.start(at(0)).unwrap();

    assert_eq!(capture.tick(at(299_000)), None);
    assert_eq!(capture.tick(at(300_000)), Some(Duration::from_secs(300)));
    assert_eq!(capture.phase(), CapturePhase::Ready);
    assert_eq!(open.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Upload failure and retry policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_failure_retains_clip_for_exactly_one_retry() {
    let (backend, controller) = setup().await;
    let (mic, _open) = CountingMic::new();
    let mut capture = VoiceCapture::new(mic);
    capture.start(at(0)).unwrap();
    capture.stop(at(3_000)).unwrap();

    backend.set_fail_sends(true);
    let (progress_tx, _progress_rx) = mpsc::channel(16);

    // First attempt fails; the clip is retained.
    let outcome = controller
        .send_voice(&mut capture, &progress_tx)
        .await
        .unwrap();
    assert!(matches!(
        outcome.state,
        bandhan_proto::message::DeliveryState::Failed { .. }
    ));
    assert_eq!(capture.phase(), CapturePhase::Failed);
    assert_eq!(capture.clip_duration(), Some(Duration::from_secs(3)));

    // The retry also fails; now the clip is discarded.
    let temp = match &outcome.id {
        bandhan_proto::message::MessageRef::Temp(temp) => temp.clone(),
        bandhan_proto::message::MessageRef::Server(_) => panic!("failed send keeps a temp id"),
    };
    let retried = controller
        .retry_voice(&temp, &mut capture, &progress_tx)
        .await
        .unwrap();
    assert!(matches!(
        retried.state,
        bandhan_proto::message::DeliveryState::Failed { .. }
    ));
    assert_eq!(capture.clip_duration(), None);

    // A further retry cannot resurrect the recording.
    backend.set_fail_sends(false);
    let gone = controller
        .retry_voice(&temp, &mut capture, &progress_tx)
        .await
        .unwrap();
    assert!(matches!(
        gone.state,
        bandhan_proto::message::DeliveryState::Failed { .. }
    ));
    assert_eq!(backend.message_count(&ConversationId::new("c_1")).await, 0);
}

#[tokio::test]
async fn retry_after_failure_succeeds_and_sends_one_message() {
    let (backend, controller) = setup().await;
    let (mic, _open) = CountingMic::new();
    let mut capture = VoiceCapture::new(mic);
    capture.start(at(0)).unwrap();
    capture.stop(at(5_000)).unwrap();

    backend.set_fail_sends(true);
    let (progress_tx, _progress_rx) = mpsc::channel(16);
    let outcome = controller
        .send_voice(&mut capture, &progress_tx)
        .await
        .unwrap();
    let temp = match &outcome.id {
        bandhan_proto::message::MessageRef::Temp(temp) => temp.clone(),
        bandhan_proto::message::MessageRef::Server(_) => panic!("failed send keeps a temp id"),
    };

    backend.set_fail_sends(false);
    let retried = controller
        .retry_voice(&temp, &mut capture, &progress_tx)
        .await
        .unwrap();
    assert_eq!(retried.state, bandhan_proto::message::DeliveryState::Sent);
    assert_eq!(capture.phase(), CapturePhase::Sent);

    let views = controller.current_messages().await;
    assert_eq!(views.len(), 1);
    let MessageBody::Voice { duration_secs, .. } = &views[0].message.body else {
        panic!("expected a voice body");
    };
    assert_eq!(*duration_secs, 5);
    assert_eq!(backend.message_count(&ConversationId::new("c_1")).await, 1);
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_reports_monotonic_progress_to_completion() {
    let (_backend, controller) = setup().await;
    let (mic, _open) = CountingMic::new();
    let mut capture = VoiceCapture::new(mic);
    capture.start(at(0)).unwrap();
    capture.stop(at(2_000)).unwrap();

    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    controller
        .send_voice(&mut capture, &progress_tx)
        .await
        .unwrap();

    let mut last = 0u64;
    let mut total = 0u64;
    let mut reports = 0;
    while let Ok(progress) = progress_rx.try_recv() {
        assert!(progress.bytes_sent >= last);
        last = progress.bytes_sent;
        total = progress.total_bytes;
        reports += 1;
    }
    assert!(reports > 0);
    assert_eq!(last, total);
    assert_eq!(total, 1_024);
}
