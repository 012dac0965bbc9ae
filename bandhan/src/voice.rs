//! Voice message capture and upload.
//!
//! Owns the record -> validate -> upload state machine. The microphone
//! is acquired through [`AudioSource`] and held as an RAII stream value:
//! dropping the stream releases the device, so stop, cancel, error, and
//! view teardown all close the capture without leaking it.

use std::time::Duration;

use tokio::sync::mpsc;

use bandhan_proto::conversation::ConversationId;
use bandhan_proto::message::{ChatMessage, Timestamp};

use crate::services::{MessageService, ServiceError};

/// Recording ceiling; capture auto-stops here to bound resource usage.
pub const MAX_RECORDING: Duration = Duration::from_secs(300);

/// Clips shorter than this are rejected client-side, before any upload.
pub const MIN_RECORDING: Duration = Duration::from_millis(1000);

/// Failure retains the clip for this many upload attempts in total.
const MAX_UPLOAD_ATTEMPTS: u8 = 2;

/// Errors from the capture/upload state machine.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Permission denied or hardware fault while acquiring the device.
    #[error("microphone unavailable: {0}")]
    CaptureUnavailable(String),

    /// A recording or upload is already in progress.
    #[error("capture is busy")]
    Busy,

    /// Stop called with no active recording.
    #[error("no active recording")]
    NotRecording,

    /// The clip was shorter than the minimum and was discarded.
    #[error("recording too short: {millis} ms (minimum {min_millis} ms)")]
    TooShort {
        /// Recorded length in milliseconds.
        millis: u64,
        /// Minimum accepted length in milliseconds.
        min_millis: u64,
    },

    /// No stopped clip is ready to upload.
    #[error("no recording ready to upload")]
    NothingToUpload,

    /// The clip was discarded after the retry attempt also failed.
    #[error("recording discarded after repeated upload failures")]
    Discarded,

    /// The upload itself failed; the clip is retained for one retry.
    #[error("upload failed: {0}")]
    Upload(#[from] ServiceError),
}

/// Provides access to the audio capture device.
pub trait AudioSource: Send {
    /// The open capture stream type.
    type Stream: CaptureStream;

    /// Acquires the microphone and begins capturing.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::CaptureUnavailable`] on permission denial or
    /// hardware fault.
    fn open(&mut self) -> Result<Self::Stream, VoiceError>;
}

/// An open microphone stream.
///
/// Implementations must release the underlying capture device when the
/// value is dropped; [`VoiceCapture`] relies on this for every exit path.
pub trait CaptureStream: Send {
    /// Takes the audio captured so far. Called once, at stop.
    fn take_audio(&mut self) -> Vec<u8>;
}

/// A finished recording awaiting upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceClip {
    /// Encoded audio bytes.
    pub audio: Vec<u8>,
    /// Recorded length.
    pub duration: Duration,
}

impl VoiceClip {
    /// Duration in whole seconds, rounded to nearest.
    #[must_use]
    pub fn duration_secs(&self) -> u32 {
        let millis = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX);
        u32::try_from((millis + 500) / 1000).unwrap_or(u32::MAX)
    }
}

/// Upload progress for percentage rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    /// Bytes transmitted so far.
    pub bytes_sent: u64,
    /// Total bytes to transmit.
    pub total_bytes: u64,
}

impl UploadProgress {
    /// Progress as a 0-100 percentage.
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let pct = self.bytes_sent.saturating_mul(100) / self.total_bytes;
        u8::try_from(pct.min(100)).unwrap_or(100)
    }
}

/// Public view of the capture state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    /// Nothing recorded, device closed.
    Idle,
    /// Microphone open, audio accumulating.
    Recording,
    /// A clip is stopped and ready to upload.
    Ready,
    /// Upload in flight.
    Uploading,
    /// Upload confirmed by the backend.
    Sent,
    /// Upload failed; the clip may still be retained for a retry.
    Failed,
}

enum Phase<St> {
    Idle,
    Recording { stream: St, started_at: Timestamp },
    Ready { clip: VoiceClip, attempts: u8 },
    Uploading,
    Sent,
    Failed { clip: Option<VoiceClip>, attempts: u8 },
}

/// The record -> validate -> upload state machine for voice messages.
///
/// Owned by the conversation view; dropping it mid-recording drops the
/// stream and thus releases the microphone.
pub struct VoiceCapture<S: AudioSource> {
    source: S,
    phase: Phase<S::Stream>,
    min_duration: Duration,
    max_duration: Duration,
}

impl<S: AudioSource> VoiceCapture<S> {
    /// Creates a capture with the default duration limits.
    pub fn new(source: S) -> Self {
        Self::with_limits(source, MIN_RECORDING, MAX_RECORDING)
    }

    /// Creates a capture with explicit duration limits.
    pub fn with_limits(source: S, min_duration: Duration, max_duration: Duration) -> Self {
        Self {
            source,
            phase: Phase::Idle,
            min_duration,
            max_duration,
        }
    }

    /// Current phase, for UI state.
    #[must_use]
    pub const fn phase(&self) -> CapturePhase {
        match self.phase {
            Phase::Idle => CapturePhase::Idle,
            Phase::Recording { .. } => CapturePhase::Recording,
            Phase::Ready { .. } => CapturePhase::Ready,
            Phase::Uploading => CapturePhase::Uploading,
            Phase::Sent => CapturePhase::Sent,
            Phase::Failed { .. } => CapturePhase::Failed,
        }
    }

    /// Acquires the microphone and starts recording.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Busy`] unless idle; [`VoiceError::CaptureUnavailable`]
    /// if the device cannot be acquired (the phase stays `Idle`).
    pub fn start(&mut self, now: Timestamp) -> Result<(), VoiceError> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(VoiceError::Busy);
        }
        let stream = self.source.open()?;
        self.phase = Phase::Recording {
            stream,
            started_at: now,
        };
        Ok(())
    }

    /// Timer-driven check; enforces the recording ceiling.
    ///
    /// Returns the clip duration if the ceiling was hit and the recording
    /// auto-stopped.
    pub fn tick(&mut self, now: Timestamp) -> Option<Duration> {
        let Phase::Recording { started_at, .. } = &self.phase else {
            return None;
        };
        let elapsed = Duration::from_millis(now.millis_since(*started_at));
        if elapsed < self.max_duration {
            return None;
        }
        tracing::info!(limit_secs = self.max_duration.as_secs(), "recording hit ceiling, auto-stopping");
        // Ceiling far exceeds the minimum, so this cannot reject.
        self.finish_recording(now).ok()
    }

    /// Stops recording, releasing the microphone.
    ///
    /// # Errors
    ///
    /// [`VoiceError::NotRecording`] with no active recording;
    /// [`VoiceError::TooShort`] when the clip is under the minimum — the
    /// clip is discarded and the phase returns to `Idle`, never
    /// `Uploading`.
    pub fn stop(&mut self, now: Timestamp) -> Result<Duration, VoiceError> {
        if !matches!(self.phase, Phase::Recording { .. }) {
            return Err(VoiceError::NotRecording);
        }
        self.finish_recording(now)
    }

    /// Discards any recording or clip and returns to idle. The stream, if
    /// open, is dropped and the microphone released.
    pub fn cancel(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Duration of the retained clip, if one is ready or failed-retained.
    #[must_use]
    pub const fn clip_duration(&self) -> Option<Duration> {
        match &self.phase {
            Phase::Ready { clip, .. }
            | Phase::Failed {
                clip: Some(clip), ..
            } => Some(clip.duration),
            _ => None,
        }
    }

    /// Uploads the stopped clip as a voice message.
    ///
    /// On failure the clip is retained for exactly one retry (call
    /// `upload` again); a second failure discards it.
    ///
    /// # Errors
    ///
    /// [`VoiceError::NothingToUpload`] when no clip is ready,
    /// [`VoiceError::Discarded`] when the retry allowance is used up, or
    /// [`VoiceError::Upload`] when the service call fails.
    pub async fn upload<M: MessageService>(
        &mut self,
        service: &M,
        conversation: &ConversationId,
        progress: &mpsc::Sender<UploadProgress>,
    ) -> Result<ChatMessage, VoiceError> {
        let (clip, attempts) = match std::mem::replace(&mut self.phase, Phase::Uploading) {
            Phase::Ready { clip, attempts }
            | Phase::Failed {
                clip: Some(clip),
                attempts,
            } => (clip, attempts),
            Phase::Failed {
                clip: None,
                attempts,
            } => {
                self.phase = Phase::Failed {
                    clip: None,
                    attempts,
                };
                return Err(VoiceError::Discarded);
            }
            other => {
                self.phase = other;
                return Err(VoiceError::NothingToUpload);
            }
        };

        match service.send_voice_message(conversation, &clip, progress).await {
            Ok(message) => {
                self.phase = Phase::Sent;
                Ok(message)
            }
            Err(err) => {
                let attempts = attempts + 1;
                let retained = attempts < MAX_UPLOAD_ATTEMPTS;
                tracing::warn!(error = %err, attempts, retained, "voice upload failed");
                self.phase = Phase::Failed {
                    clip: retained.then_some(clip),
                    attempts,
                };
                Err(VoiceError::Upload(err))
            }
        }
    }

    fn finish_recording(&mut self, now: Timestamp) -> Result<Duration, VoiceError> {
        let Phase::Recording {
            mut stream,
            started_at,
        } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return Err(VoiceError::NotRecording);
        };
        let millis = now.millis_since(started_at);
        let audio = stream.take_audio();
        // Dropping the stream here releases the device.
        drop(stream);

        if millis < u64::try_from(self.min_duration.as_millis()).unwrap_or(u64::MAX) {
            return Err(VoiceError::TooShort {
                millis,
                min_millis: u64::try_from(self.min_duration.as_millis()).unwrap_or(u64::MAX),
            });
        }
        let duration = Duration::from_millis(millis);
        self.phase = Phase::Ready {
            clip: VoiceClip { audio, duration },
            attempts: 0,
        };
        Ok(duration)
    }
}

/// Capture source yielding a fixed prerecorded buffer.
///
/// Stands in for the platform microphone in tests and the offline demo.
/// Tracks how many streams are currently open so callers can verify the
/// device is released on every exit path.
pub struct FixedSource {
    audio: Vec<u8>,
    fail_open: bool,
    open_streams: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl FixedSource {
    /// A source that captures the given bytes.
    #[must_use]
    pub fn new(audio: Vec<u8>) -> Self {
        Self {
            audio,
            fail_open: false,
            open_streams: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    /// A source whose acquisition always fails (permission denied).
    #[must_use]
    pub fn denied() -> Self {
        Self {
            audio: Vec::new(),
            fail_open: true,
            open_streams: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    /// Number of capture streams currently open.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl AudioSource for FixedSource {
    type Stream = FixedStream;

    fn open(&mut self) -> Result<Self::Stream, VoiceError> {
        if self.fail_open {
            return Err(VoiceError::CaptureUnavailable("permission denied".into()));
        }
        self.open_streams
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(FixedStream {
            audio: self.audio.clone(),
            open_streams: std::sync::Arc::clone(&self.open_streams),
        })
    }
}

/// Stream produced by [`FixedSource`]; releases its slot on drop.
pub struct FixedStream {
    audio: Vec<u8>,
    open_streams: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl CaptureStream for FixedStream {
    fn take_audio(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.audio)
    }
}

impl Drop for FixedStream {
    fn drop(&mut self) {
        self.open_streams
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}
