//! Error types and handling
//!
//! Error taxonomy for the recording pipeline. Configuration errors are fatal
//! and raised before any acquisition starts; everything else is scoped to a
//! single frame or a single channel.

use crate::source::ChannelId;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Recording is already running")]
    AlreadyRunning,
}

/// Problems detected while validating a run before it starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no destination directory for channel {0}")]
    MissingDestination(ChannelId),

    #[error("more channels ({channels}) than destination directories ({destinations})")]
    TooManyChannels { channels: usize, destinations: usize },

    #[error("channel {0} is configured more than once")]
    DuplicateChannel(ChannelId),

    #[error("at least one persistence worker is required")]
    NoWorkers,

    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("at least one concurrent save must be allowed")]
    ZeroConcurrentSaves,

    #[error("no channels configured")]
    NoChannels,

    #[error("capture target missing: set frameCount or both fps and durationSecs")]
    MissingTarget,

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Misuse of the frame queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed to new entries")]
    Closed,

    #[error("mark_done called for channel {0} with no pending entry")]
    NothingPending(ChannelId),
}

/// Failures raised by a frame source (device errors)
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("device {channel} failed to {operation}: {reason}")]
    Device {
        channel: ChannelId,
        operation: &'static str,
        reason: String,
    },

    #[error("source {0} is not acquiring")]
    NotAcquiring(ChannelId),
}

/// Failures raised while persisting a frame
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {path:?}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("frame {sequence_id} cannot be saved: {reason}")]
    Unsupported { sequence_id: u64, reason: String },

    #[error("no destination directory for channel {0}")]
    NoDestination(ChannelId),

    #[error("save task aborted: {0}")]
    Aborted(String),
}

/// Failures that end one channel's acquisition
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type alias for source operations
pub type SourceResult<T> = Result<T, SourceError>;
