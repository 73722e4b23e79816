//! Recording system module
//!
//! This module implements the acquisition-to-disk pipeline:
//! - BoundedFrameQueue shared by every channel, with backpressure and drain tracking
//! - AcquisitionTask driving one source per channel
//! - PersistenceWorkerPool saving frames on a bounded offload pool
//! - RecordingCoordinator to orchestrate a whole run

pub mod acquisition;
pub mod coordinator;
pub mod persistence;
pub mod queue;
pub mod state;

pub use acquisition::{AcquisitionReport, AcquisitionTask, SequenceCheck, SequenceTracker};
pub use coordinator::{
    default_concurrent_saves, PipelineContext, RecordingCoordinator, StopHandle,
};
pub use persistence::{OffloadError, OffloadPool, PersistenceWorkerPool, SaveContext};
pub use queue::{BoundedFrameQueue, QueueEntry, QueueStats, TryEnqueueError};
pub use state::{
    ChannelCounts, ChannelOutcome, ChannelSummary, PipelineConfig, PipelineEvent, RecordingState,
    RunSummary, StatsRegistry, WorkerReport,
};
