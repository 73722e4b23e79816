//! Scripted frame source
//!
//! Stands in for a camera when no hardware bindings are linked in. Frames are
//! produced on demand with a configurable pacing, and the script can inject
//! the faults the pipeline has to survive: incomplete transfers, dropped
//! sequence ids, device failures and refusals to open or begin.

use super::frame::Frame;
use super::traits::{ChannelId, FrameSource, TriggerRole};
use crate::utils::error::{SourceError, SourceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle call observed on a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    Begin,
    End,
    Close,
}

/// Ordered record of lifecycle calls, shareable between sources
pub type LifecycleLog = Arc<Mutex<Vec<(ChannelId, Lifecycle)>>>;

/// Counters a test (or the demo binary) can inspect after the source moved
#[derive(Debug, Clone, Default)]
pub struct SimulatedHandle {
    log: LifecycleLog,
    delivered: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
}

impl SimulatedHandle {
    /// Frames handed out by `next_frame`
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Frames whose buffers went back to the device
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> Vec<(ChannelId, Lifecycle)> {
        self.log.lock().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Closed,
    Opened,
    Acquiring,
}

/// A camera stand-in driven by a frame script
pub struct SimulatedSource {
    channel: ChannelId,
    role: TriggerRole,
    state: DeviceState,
    script: Box<dyn Iterator<Item = u64> + Send>,
    dropped: HashSet<u64>,
    incomplete: HashSet<u64>,
    fail_after: Option<u64>,
    fail_open: bool,
    fail_begin: bool,
    frame_interval: Option<Duration>,
    dimensions: (u32, u32),
    handle: SimulatedHandle,
}

impl SimulatedSource {
    /// Source emitting consecutive ids starting at 1
    pub fn new(channel: impl Into<ChannelId>) -> Self {
        Self {
            channel: channel.into(),
            role: TriggerRole::Primary,
            state: DeviceState::Closed,
            script: Box::new(1u64..),
            dropped: HashSet::new(),
            incomplete: HashSet::new(),
            fail_after: None,
            fail_open: false,
            fail_begin: false,
            frame_interval: None,
            dimensions: (16, 16),
            handle: SimulatedHandle::default(),
        }
    }

    /// Emit exactly these ids first, then continue consecutively after the last
    pub fn with_sequence(mut self, ids: Vec<u64>) -> Self {
        let next = ids.last().map_or(1, |last| last + 1);
        self.script = Box::new(ids.into_iter().chain(next..));
        self
    }

    pub fn with_role(mut self, role: TriggerRole) -> Self {
        self.role = role;
        self
    }

    /// Ids the device loses before they reach the host
    pub fn drop_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.dropped.extend(ids);
        self
    }

    /// Ids delivered with an incomplete transfer
    pub fn incomplete_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.incomplete.extend(ids);
        self
    }

    /// Fail `next_frame` once this many frames were delivered
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn fail_on_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn fail_on_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    /// Pace frames like an exposure clock
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = (width, height);
        self
    }

    /// Record lifecycle calls into a log shared with other sources
    pub fn with_log(mut self, log: LifecycleLog) -> Self {
        self.handle.log = log;
        self
    }

    pub fn handle(&self) -> SimulatedHandle {
        self.handle.clone()
    }

    fn record(&self, call: Lifecycle) {
        self.handle.log.lock().push((self.channel.clone(), call));
    }

    fn device_error(&self, operation: &'static str, reason: &str) -> SourceError {
        SourceError::Device {
            channel: self.channel.clone(),
            operation,
            reason: reason.to_string(),
        }
    }

    fn next_id(&mut self) -> Option<u64> {
        let dropped = &self.dropped;
        self.script.find(|id| !dropped.contains(id))
    }

    fn render(&self, sequence_id: u64) -> Frame {
        let (width, height) = self.dimensions;
        let payload = vec![(sequence_id % 256) as u8; frame_len(width, height)];
        let frame = if self.incomplete.contains(&sequence_id) {
            Frame::incomplete(sequence_id, payload, "IMAGE_DATA_INCOMPLETE")
        } else {
            Frame::new(sequence_id, payload)
        };
        let released = self.handle.released.clone();
        frame
            .with_dimensions(width, height)
            .on_release(move |_| {
                released.fetch_add(1, Ordering::SeqCst);
            })
    }
}

#[async_trait]
impl FrameSource for SimulatedSource {
    fn channel_id(&self) -> &ChannelId {
        &self.channel
    }

    fn trigger_role(&self) -> TriggerRole {
        self.role
    }

    async fn open(&mut self) -> SourceResult<()> {
        self.record(Lifecycle::Open);
        if self.fail_open {
            return Err(self.device_error("open", "simulated open failure"));
        }
        self.state = DeviceState::Opened;
        Ok(())
    }

    async fn begin(&mut self) -> SourceResult<()> {
        self.record(Lifecycle::Begin);
        if self.fail_begin {
            return Err(self.device_error("begin", "simulated begin failure"));
        }
        if self.state == DeviceState::Closed {
            return Err(self.device_error("begin", "device not open"));
        }
        self.state = DeviceState::Acquiring;
        Ok(())
    }

    async fn next_frame(&mut self) -> SourceResult<Frame> {
        if self.state != DeviceState::Acquiring {
            return Err(SourceError::NotAcquiring(self.channel.clone()));
        }
        if let Some(limit) = self.fail_after {
            if self.handle.delivered() >= limit {
                return Err(self.device_error("grab frame", "simulated device failure"));
            }
        }
        if let Some(interval) = self.frame_interval {
            tokio::time::sleep(interval).await;
        }

        let sequence_id = self
            .next_id()
            .ok_or_else(|| self.device_error("grab frame", "frame script exhausted"))?;
        self.handle.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(self.render(sequence_id))
    }

    async fn end(&mut self) -> SourceResult<()> {
        self.record(Lifecycle::End);
        if self.state == DeviceState::Acquiring {
            self.state = DeviceState::Opened;
        }
        Ok(())
    }

    async fn close(&mut self) -> SourceResult<()> {
        self.record(Lifecycle::Close);
        self.state = DeviceState::Closed;
        Ok(())
    }
}

/// Payload bytes of one mono8 frame, computed without 32-bit overflow
fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize
}
