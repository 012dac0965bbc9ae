//! Configuration for the Bandhan messaging core.
//!
//! Layered with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/bandhan/config.toml`)
//! 4. Compiled defaults
//!
//! A missing config file is not an error (defaults are used). An
//! explicit `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::gate::DEFAULT_DAILY_FREE_LIMIT;
use crate::index::DEFAULT_PREVIEW_CHARS;
use crate::stream::StreamConfig;
use crate::typing::{DEFAULT_DEBOUNCE, DEFAULT_EXPIRY};
use crate::voice::{MAX_RECORDING, MIN_RECORDING};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    profile: ProfileFileConfig,
    polling: PollingFileConfig,
    typing: TypingFileConfig,
    voice: VoiceFileConfig,
    limits: LimitsFileConfig,
    stream: StreamFileConfig,
    events: EventsFileConfig,
}

/// `[profile]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ProfileFileConfig {
    user_id: Option<String>,
    peer_id: Option<String>,
}

/// `[polling]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PollingFileConfig {
    conversation_interval_secs: Option<u64>,
    index_interval_secs: Option<u64>,
    unreachable_threshold: Option<u32>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    debounce_secs: Option<u64>,
    expiry_secs: Option<u64>,
}

/// `[voice]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct VoiceFileConfig {
    max_duration_secs: Option<u64>,
    min_duration_ms: Option<u64>,
}

/// `[limits]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LimitsFileConfig {
    daily_free_messages: Option<u32>,
}

/// `[stream]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StreamFileConfig {
    row_height_px: Option<u32>,
    near_bottom_px: Option<u64>,
    top_threshold_px: Option<u64>,
    preview_chars: Option<usize>,
}

/// `[events]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EventsFileConfig {
    buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Profile --
    /// Local user identity (demo harness).
    pub user_id: Option<String>,
    /// Peer identity to converse with (demo harness).
    pub peer_id: Option<String>,

    // -- Polling --
    /// Refresh interval for the open conversation.
    pub conversation_poll_interval: Duration,
    /// Refresh interval for the conversation list.
    pub index_poll_interval: Duration,
    /// Consecutive 404 polls before the conversation is declared
    /// unreachable.
    pub unreachable_threshold: u32,

    // -- Typing --
    /// Minimum gap between outbound typing refreshes.
    pub typing_debounce: Duration,
    /// Lifetime of a remote typing signal with no refresh.
    pub typing_expiry: Duration,

    // -- Voice --
    /// Recording auto-stop ceiling.
    pub max_recording: Duration,
    /// Minimum accepted clip length.
    pub min_recording: Duration,

    // -- Limits --
    /// Free-tier daily send allowance.
    pub daily_free_limit: u32,

    // -- Stream / list view --
    /// Estimated row height until the UI measures one.
    pub row_height_px: u32,
    /// Near-bottom auto-scroll threshold.
    pub near_bottom_px: u64,
    /// Top threshold that triggers older-history loading.
    pub top_threshold_px: u64,
    /// Preview truncation length in characters.
    pub preview_chars: usize,

    // -- Events --
    /// Buffer size of the UI event channel.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            peer_id: None,
            conversation_poll_interval: Duration::from_secs(10),
            index_poll_interval: Duration::from_secs(30),
            unreachable_threshold: 3,
            typing_debounce: DEFAULT_DEBOUNCE,
            typing_expiry: DEFAULT_EXPIRY,
            max_recording: MAX_RECORDING,
            min_recording: MIN_RECORDING,
            daily_free_limit: DEFAULT_DAILY_FREE_LIMIT,
            row_height_px: 56,
            near_bottom_px: 120,
            top_threshold_px: 80,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            event_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. If no `--config` is given, the default path
    /// (`~/.config/bandhan/config.toml`) is tried and silently ignored
    /// if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be
    /// read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            user_id: cli.user_id.clone().or_else(|| file.profile.user_id.clone()),
            peer_id: cli.peer_id.clone().or_else(|| file.profile.peer_id.clone()),
            conversation_poll_interval: file
                .polling
                .conversation_interval_secs
                .map_or(defaults.conversation_poll_interval, Duration::from_secs),
            index_poll_interval: file
                .polling
                .index_interval_secs
                .map_or(defaults.index_poll_interval, Duration::from_secs),
            unreachable_threshold: file
                .polling
                .unreachable_threshold
                .unwrap_or(defaults.unreachable_threshold),
            typing_debounce: file
                .typing
                .debounce_secs
                .map_or(defaults.typing_debounce, Duration::from_secs),
            typing_expiry: file
                .typing
                .expiry_secs
                .map_or(defaults.typing_expiry, Duration::from_secs),
            max_recording: file
                .voice
                .max_duration_secs
                .map_or(defaults.max_recording, Duration::from_secs),
            min_recording: file
                .voice
                .min_duration_ms
                .map_or(defaults.min_recording, Duration::from_millis),
            daily_free_limit: file
                .limits
                .daily_free_messages
                .unwrap_or(defaults.daily_free_limit),
            row_height_px: file.stream.row_height_px.unwrap_or(defaults.row_height_px),
            near_bottom_px: file.stream.near_bottom_px.unwrap_or(defaults.near_bottom_px),
            top_threshold_px: file
                .stream
                .top_threshold_px
                .unwrap_or(defaults.top_threshold_px),
            preview_chars: file.stream.preview_chars.unwrap_or(defaults.preview_chars),
            event_buffer: file.events.buffer.unwrap_or(defaults.event_buffer),
        }
    }

    /// The stream viewport tuning derived from this configuration.
    #[must_use]
    pub const fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            default_row_height: self.row_height_px,
            near_bottom_threshold: self.near_bottom_px,
            top_threshold: self.top_threshold_px,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Bandhan messaging core demo")]
pub struct CliArgs {
    /// Local user identity.
    #[arg(long, env = "BANDHAN_USER")]
    pub user_id: Option<String>,

    /// Peer to converse with.
    #[arg(long, env = "BANDHAN_PEER")]
    pub peer_id: Option<String>,

    /// Path to config file (default: `~/.config/bandhan/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BANDHAN_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/bandhan.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir available — use defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("bandhan").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
