//! Shared utilities

pub mod error;

pub use error::{
    ChannelError, ConfigError, PipelineError, PipelineResult, QueueError, SinkError, SourceError,
    SourceResult,
};
