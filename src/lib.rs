//! Multicam Recorder - multi-camera frame acquisition straight to disk.
//!
//! Frames from several synchronized cameras are pulled on a cooperative
//! executor, pushed through one bounded queue and written by a pool of
//! persistence workers whose blocking saves run on a bounded offload pool.
//! A slow disk suspends acquisition instead of growing memory.

pub mod config;
pub mod recorder;
pub mod source;
pub mod storage;
pub mod utils;

pub use config::{ChannelConfig, RunConfig};
pub use recorder::{PipelineConfig, PipelineContext, RecordingCoordinator, RunSummary};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the default directive.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multicam_recorder=info,multicam_record=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
