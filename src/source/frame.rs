//! Captured frame and its lifetime
//!
//! A [`Frame`] is owned by exactly one pipeline stage at a time. Its
//! underlying device buffer is handed back through an optional release hook
//! that runs exactly once, when the frame is dropped: after a save (successful
//! or not), when it is discarded as incomplete, or when it is abandoned in a
//! queue that is torn down.

use std::fmt;

type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

/// Transfer status reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    Incomplete { description: String },
}

/// One captured image with its sequence identifier
pub struct Frame {
    sequence_id: u64,
    status: FrameStatus,
    payload: Vec<u8>,
    dimensions: Option<(u32, u32)>,
    release: Option<ReleaseHook>,
}

impl Frame {
    /// Create a fully received frame
    pub fn new(sequence_id: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence_id,
            status: FrameStatus::Complete,
            payload,
            dimensions: None,
            release: None,
        }
    }

    /// Create a frame whose transfer was not fully received
    pub fn incomplete(sequence_id: u64, payload: Vec<u8>, description: impl Into<String>) -> Self {
        Self {
            sequence_id,
            status: FrameStatus::Incomplete {
                description: description.into(),
            },
            payload,
            dimensions: None,
            release: None,
        }
    }

    /// Attach image dimensions (mono8, one byte per pixel)
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some((width, height));
        self
    }

    /// Run `hook` with the sequence id once this frame is released
    pub fn on_release(mut self, hook: impl FnOnce(u64) + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn is_complete(&self) -> bool {
        self.status == FrameStatus::Complete
    }

    pub fn status(&self) -> &FrameStatus {
        &self.status
    }

    /// Human-readable transfer status
    pub fn status_description(&self) -> &str {
        match &self.status {
            FrameStatus::Complete => "complete",
            FrameStatus::Incomplete { description } => description,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.sequence_id);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence_id", &self.sequence_id)
            .field("status", &self.status)
            .field("payload_len", &self.payload.len())
            .field("dimensions", &self.dimensions)
            .finish()
    }
}
