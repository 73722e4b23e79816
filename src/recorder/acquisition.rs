//! Per-channel acquisition
//!
//! Pulls frames from one source, screens out incomplete transfers, reports
//! sequence gaps and pushes everything else into the shared queue. The loop
//! does as little work per frame as possible so the device buffer never
//! backs up behind it.

use super::queue::{BoundedFrameQueue, QueueEntry};
use super::state::{ChannelCounters, ChannelOutcome, PipelineEvent};
use crate::source::{ChannelId, Frame, FrameSource};
use crate::utils::error::ChannelError;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Result of comparing a frame id with its predecessor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    Gap { expected: u64, actual: u64, lost: u64 },
}

/// Tracks the last sequence id seen on a channel
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
    expected_first: Option<u64>,
}

impl SequenceTracker {
    /// The first frame sets the baseline
    pub fn new() -> Self {
        Self::default()
    }

    /// The first frame must carry `first`
    pub fn starting_at(first: u64) -> Self {
        Self {
            last: None,
            expected_first: Some(first),
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Check `sequence_id` against its predecessor and record it
    pub fn observe(&mut self, sequence_id: u64) -> SequenceCheck {
        let expected = match self.last {
            Some(last) => Some(last.wrapping_add(1)),
            None => self.expected_first,
        };
        self.last = Some(sequence_id);

        match expected {
            Some(expected) if expected != sequence_id => SequenceCheck::Gap {
                expected,
                actual: sequence_id,
                lost: sequence_id.saturating_sub(expected),
            },
            _ => SequenceCheck::InOrder,
        }
    }

    /// Record `sequence_id` without checking it
    pub fn skip_to(&mut self, sequence_id: u64) {
        self.last = Some(sequence_id);
    }
}

/// Why the acquisition loop ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionEnd {
    Completed,
    Stopped,
}

/// Handed back to the coordinator once a channel is done
pub struct AcquisitionReport {
    pub channel: ChannelId,
    pub source: Box<dyn FrameSource>,
    pub outcome: ChannelOutcome,
}

/// Drives one source for a fixed number of frames
pub struct AcquisitionTask {
    channel: ChannelId,
    source: Box<dyn FrameSource>,
    queue: Arc<BoundedFrameQueue>,
    target: u64,
    tracker: SequenceTracker,
    counters: Arc<ChannelCounters>,
    events: broadcast::Sender<PipelineEvent>,
    stop: CancellationToken,
}

impl AcquisitionTask {
    /// `source` must already be acquiring
    pub fn new(source: Box<dyn FrameSource>, queue: Arc<BoundedFrameQueue>, target: u64) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            channel: source.channel_id().clone(),
            source,
            queue,
            target,
            tracker: SequenceTracker::new(),
            counters: Arc::new(ChannelCounters::default()),
            events,
            stop: CancellationToken::new(),
        }
    }

    pub fn with_counters(mut self, counters: Arc<ChannelCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = events;
        self
    }

    /// End the loop early once `stop` is cancelled
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_first_sequence_id(mut self, first: Option<u64>) -> Self {
        self.tracker = match first {
            Some(first) => SequenceTracker::starting_at(first),
            None => SequenceTracker::new(),
        };
        self
    }

    /// Acquire, wait for this channel's frames to be persisted, then stop the device
    pub async fn run(mut self) -> AcquisitionReport {
        tracing::info!("[{}] Acquisition started ({} frames)", self.channel, self.target);

        // A panicking source must not take the device handle down with the task
        let outcome = match AssertUnwindSafe(self.acquire()).catch_unwind().await {
            Ok(Ok(AcquisitionEnd::Completed)) => ChannelOutcome::Completed,
            Ok(Ok(AcquisitionEnd::Stopped)) => ChannelOutcome::Stopped,
            Ok(Err(e)) => self.fail(e.to_string()),
            Err(panic) => self.fail(format!("acquisition panicked: {}", panic_message(&*panic))),
        };

        self.queue.join_channel(&self.channel).await;

        let outcome = match self.source.end().await {
            Ok(()) => outcome,
            Err(e) if outcome.is_failed() => {
                tracing::warn!("[{}] Failed to end acquisition: {}", self.channel, e);
                outcome
            }
            Err(e) => self.fail(format!("end acquisition: {e}")),
        };

        let counts = self.counters.snapshot();
        tracing::info!(
            "[{}] Acquisition {}: {} acquired, {} enqueued, {} incomplete, {} gaps",
            self.channel,
            outcome,
            counts.acquired,
            counts.enqueued,
            counts.incomplete,
            counts.sequence_gaps
        );
        let _ = self.events.send(PipelineEvent::ChannelFinished {
            channel: self.channel.clone(),
            outcome: outcome.clone(),
        });

        AcquisitionReport {
            channel: self.channel,
            source: self.source,
            outcome,
        }
    }

    /// The acquisition loop alone; does not wait for persistence
    pub async fn acquire(&mut self) -> Result<AcquisitionEnd, ChannelError> {
        for _ in 0..self.target {
            if self.stop.is_cancelled() {
                tracing::info!("[{}] Stop requested, ending acquisition", self.channel);
                return Ok(AcquisitionEnd::Stopped);
            }

            let frame = self.source.next_frame().await?;
            self.counters.add_acquired();
            self.accept(frame).await?;
        }
        Ok(AcquisitionEnd::Completed)
    }

    async fn accept(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let sequence_id = frame.sequence_id();

        if !frame.is_complete() {
            tracing::warn!(
                "[{}] Frame {} incomplete with status {}",
                self.channel,
                sequence_id,
                frame.status_description()
            );
            self.counters.add_incomplete();
            let _ = self.events.send(PipelineEvent::IncompleteFrame {
                channel: self.channel.clone(),
                sequence_id,
                status: frame.status_description().to_string(),
            });
            self.tracker.skip_to(sequence_id);
            return Ok(());
        }

        if let SequenceCheck::Gap {
            expected,
            actual,
            lost,
        } = self.tracker.observe(sequence_id)
        {
            tracing::warn!(
                "[{}] Sequence gap: expected {}, got {}",
                self.channel,
                expected,
                actual
            );
            self.counters.add_gap(lost);
            let _ = self.events.send(PipelineEvent::SequenceGap {
                channel: self.channel.clone(),
                expected,
                actual,
            });
        }

        self.queue
            .enqueue(QueueEntry::new(frame, self.channel.clone()))
            .await?;
        self.counters.add_enqueued();
        tracing::debug!(
            "[{}] Acquired frame {} (queue size {})",
            self.channel,
            sequence_id,
            self.queue.len()
        );

        tokio::task::yield_now().await;
        Ok(())
    }

    fn fail(&self, reason: String) -> ChannelOutcome {
        tracing::error!("[{}] Acquisition failed: {}", self.channel, reason);
        let _ = self.events.send(PipelineEvent::ChannelFailed {
            channel: self.channel.clone(),
            reason: reason.clone(),
        });
        ChannelOutcome::Failed { reason }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
