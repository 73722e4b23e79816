//! Recording state management
//!
//! Run lifecycle, per-channel counters, live events and the end-of-run
//! summary. Everything here lives for one acquisition run.

use super::queue::QueueStats;
use crate::source::{ChannelId, TriggerRole};
use crate::storage::FileNaming;
use crate::utils::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Current phase of the recording pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No run in progress
    #[default]
    Idle,
    /// Sources are producing frames
    Acquiring,
    /// Acquisition finished, waiting for the queue to drain
    Draining,
    /// Run finished and resources released
    Complete,
}

/// Tunables for one run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames pulled from every source, incomplete ones included
    pub frames_per_channel: u64,

    /// Persistence workers draining the queue
    pub num_workers: usize,

    /// Maximum unconsumed entries before producers are suspended
    pub queue_capacity: usize,

    /// File naming shared by all channels
    pub naming: FileNaming,

    /// Sequence id the first frame must carry; `None` takes the first frame as baseline
    pub first_sequence_id: Option<u64>,

    /// Interval between progress log lines; `None` disables them
    pub progress_interval: Option<std::time::Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frames_per_channel: 1000,
            num_workers: 4,
            queue_capacity: 256,
            naming: FileNaming::default(),
            first_sequence_id: None,
            progress_interval: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Live counters for one channel, shared between its acquisition task and the workers
#[derive(Debug, Default)]
pub struct ChannelCounters {
    acquired: AtomicU64,
    enqueued: AtomicU64,
    incomplete: AtomicU64,
    sequence_gaps: AtomicU64,
    frames_lost: AtomicU64,
    saved: AtomicU64,
    save_failures: AtomicU64,
}

impl ChannelCounters {
    pub fn add_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_incomplete(&self) {
        self.incomplete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_gap(&self, lost: u64) {
        self.sequence_gaps.fetch_add(1, Ordering::Relaxed);
        self.frames_lost.fetch_add(lost, Ordering::Relaxed);
    }

    pub fn add_saved(&self) {
        self.saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_save_failure(&self) {
        self.save_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelCounts {
        ChannelCounts {
            acquired: self.acquired.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            incomplete: self.incomplete.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            frames_lost: self.frames_lost.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a channel's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCounts {
    pub acquired: u64,
    pub enqueued: u64,
    pub incomplete: u64,
    pub sequence_gaps: u64,
    pub frames_lost: u64,
    pub saved: u64,
    pub save_failures: u64,
}

/// Counters for every active channel; the set of channels is fixed at setup
#[derive(Debug, Default)]
pub struct StatsRegistry {
    channels: HashMap<ChannelId, Arc<ChannelCounters>>,
}

impl StatsRegistry {
    pub fn new(channels: &[ChannelId]) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|c| (c.clone(), Arc::new(ChannelCounters::default())))
                .collect(),
        }
    }

    pub fn get(&self, channel: &ChannelId) -> Option<&Arc<ChannelCounters>> {
        self.channels.get(channel)
    }

    pub fn snapshot(&self, channel: &ChannelId) -> ChannelCounts {
        self.get(channel).map(|c| c.snapshot()).unwrap_or_default()
    }
}

/// How a channel's acquisition ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChannelOutcome {
    /// Pulled every requested frame
    Completed,
    /// Ended early because the run was asked to stop
    Stopped,
    /// Device failure; other channels were unaffected
    Failed { reason: String },
}

impl ChannelOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ChannelOutcome::Failed { .. })
    }
}

impl fmt::Display for ChannelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOutcome::Completed => f.write_str("completed"),
            ChannelOutcome::Stopped => f.write_str("stopped"),
            ChannelOutcome::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Events emitted while a run is in progress
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Acquisition and persistence tasks are running
    Started { channels: usize, workers: usize },
    /// A frame arrived with an incomplete transfer and was discarded
    IncompleteFrame {
        channel: ChannelId,
        sequence_id: u64,
        status: String,
    },
    /// A frame's id did not follow its predecessor
    SequenceGap {
        channel: ChannelId,
        expected: u64,
        actual: u64,
    },
    /// A frame was written to disk
    FrameSaved {
        channel: ChannelId,
        sequence_id: u64,
        path: PathBuf,
    },
    /// A save attempt failed; the frame is lost
    SaveFailed {
        channel: ChannelId,
        sequence_id: u64,
        path: Option<PathBuf>,
        reason: String,
    },
    /// A channel finished acquiring and all its frames were persisted
    ChannelFinished {
        channel: ChannelId,
        outcome: ChannelOutcome,
    },
    /// A channel hit a device failure
    ChannelFailed { channel: ChannelId, reason: String },
    /// A stop was requested before all frames were acquired
    StopRequested,
    /// Every enqueued frame has been processed
    Drained,
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Started { channels, workers } => {
                write!(f, "started {channels} channels with {workers} workers")
            }
            PipelineEvent::IncompleteFrame {
                channel,
                sequence_id,
                status,
            } => write!(f, "[{channel}] frame {sequence_id} incomplete with status {status}"),
            PipelineEvent::SequenceGap {
                channel,
                expected,
                actual,
            } => write!(f, "[{channel}] sequence gap: expected {expected}, got {actual}"),
            PipelineEvent::FrameSaved {
                channel,
                sequence_id,
                path,
            } => write!(f, "[{channel}] saved frame {sequence_id} to {}", path.display()),
            PipelineEvent::SaveFailed {
                channel,
                sequence_id,
                path,
                reason,
            } => match path {
                Some(path) => write!(
                    f,
                    "[{channel}] failed to save frame {sequence_id} to {}: {reason}",
                    path.display()
                ),
                None => write!(f, "[{channel}] failed to save frame {sequence_id}: {reason}"),
            },
            PipelineEvent::ChannelFinished { channel, outcome } => {
                write!(f, "[{channel}] acquisition {outcome}")
            }
            PipelineEvent::ChannelFailed { channel, reason } => {
                write!(f, "[{channel}] channel failed: {reason}")
            }
            PipelineEvent::StopRequested => f.write_str("stop requested"),
            PipelineEvent::Drained => f.write_str("queue drained"),
        }
    }
}

/// Final report for one channel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub channel: ChannelId,
    pub trigger_role: TriggerRole,
    pub requested: u64,
    pub outcome: ChannelOutcome,
    #[serde(flatten)]
    pub counts: ChannelCounts,
}

/// Persistence worker totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub worker: usize,
    pub saved: u64,
    pub failed: u64,
}

/// Result of a completed run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub num_workers: usize,
    pub queue: QueueStats,
    pub channels: Vec<ChannelSummary>,
    pub workers: Vec<WorkerReport>,
}

impl RunSummary {
    pub fn channel(&self, channel: &ChannelId) -> Option<&ChannelSummary> {
        self.channels.iter().find(|c| &c.channel == channel)
    }

    pub fn total_saved(&self) -> u64 {
        self.channels.iter().map(|c| c.counts.saved).sum()
    }

    pub fn total_save_failures(&self) -> u64 {
        self.channels.iter().map(|c| c.counts.save_failures).sum()
    }

    pub fn failed_channels(&self) -> Vec<&ChannelId> {
        self.channels
            .iter()
            .filter(|c| c.outcome.is_failed())
            .map(|c| &c.channel)
            .collect()
    }

    /// No channel failed and every save succeeded
    pub fn is_clean(&self) -> bool {
        self.failed_channels().is_empty() && self.total_save_failures() == 0
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Write the summary to the log
    pub fn log(&self) {
        tracing::info!(
            "Run {} finished in {}ms: {} saved, {} save failures, queue high water {}/{}",
            self.run_id,
            self.duration_ms(),
            self.total_saved(),
            self.total_save_failures(),
            self.queue.high_water,
            self.queue.capacity
        );
        for c in &self.channels {
            let line = format!(
                "[{}] {}: requested {}, acquired {}, incomplete {}, gaps {} ({} frames lost), saved {}, save failures {}",
                c.channel,
                c.outcome,
                c.requested,
                c.counts.acquired,
                c.counts.incomplete,
                c.counts.sequence_gaps,
                c.counts.frames_lost,
                c.counts.saved,
                c.counts.save_failures
            );
            if c.outcome.is_failed() || c.counts.save_failures > 0 {
                tracing::warn!("{}", line);
            } else {
                tracing::info!("{}", line);
            }
        }
    }
}
