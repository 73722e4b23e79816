//! Frame source trait definitions
//!
//! Hardware-agnostic capability every acquisition channel drives.

use super::frame::Frame;
use crate::utils::error::SourceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a hardware source (usually the camera serial)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// How a source participates in hardware triggering
///
/// Secondary sources follow the trigger line of a primary and must be
/// acquiring before the primary starts emitting triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerRole {
    #[default]
    Primary,
    Secondary,
}

/// A device that yields frames for one channel
#[async_trait]
pub trait FrameSource: Send {
    /// Channel this source feeds
    fn channel_id(&self) -> &ChannelId;

    /// Trigger wiring of the device
    fn trigger_role(&self) -> TriggerRole {
        TriggerRole::Primary
    }

    /// Acquire the device handle
    async fn open(&mut self) -> SourceResult<()>;

    /// Start streaming frames
    async fn begin(&mut self) -> SourceResult<()>;

    /// Wait for the next frame from the device buffer
    async fn next_frame(&mut self) -> SourceResult<Frame>;

    /// Stop streaming frames
    async fn end(&mut self) -> SourceResult<()>;

    /// Release the device handle
    async fn close(&mut self) -> SourceResult<()>;
}
