//! Run configuration files
//!
//! A run is described by a JSON document naming the channels, where each one
//! writes, how many frames to take and how the pipeline is sized:
//!
//! ```json
//! {
//!   "channels": [
//!     { "id": "20400920", "destination": "/data/top", "role": "primary" },
//!     { "id": "20400921", "destination": "/data/side", "role": "secondary" }
//!   ],
//!   "fps": 30,
//!   "durationSecs": 10,
//!   "numWorkers": 6,
//!   "sink": "png"
//! }
//! ```

use crate::recorder::{default_concurrent_saves, PipelineConfig};
use crate::source::{ChannelId, TriggerRole};
use crate::storage::{DestinationMap, FileNaming, FilenameScheme, SinkKind};
use crate::utils::error::{ConfigError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_num_workers() -> usize {
    PipelineConfig::default().num_workers
}

fn default_queue_capacity() -> usize {
    PipelineConfig::default().queue_capacity
}

/// One camera and the directory its frames go to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub id: ChannelId,
    pub destination: PathBuf,
    #[serde(default)]
    pub role: TriggerRole,
}

/// Configuration for one recording run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub channels: Vec<ChannelConfig>,

    /// Capture rate; with `duration_secs` gives the frame count
    pub fps: Option<f64>,

    pub duration_secs: Option<f64>,

    /// Frames per channel; overrides `fps * duration_secs`
    pub frame_count: Option<u64>,

    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Blocking saves allowed at once; defaults to the available parallelism
    pub max_concurrent_saves: Option<usize>,

    /// File extension; defaults to the sink's own
    pub extension: Option<String>,

    #[serde(default)]
    pub filename_scheme: FilenameScheme,

    /// Sequence id the first frame of every channel must carry.
    ///
    /// When unset the first frame becomes the baseline and only later
    /// discontinuities are reported. Set it to 1 to also flag cameras whose
    /// frame counter did not start from a fresh reset.
    pub first_sequence_id: Option<u64>,

    #[serde(default)]
    pub sink: SinkKind,

    /// Seconds between progress log lines
    pub progress_secs: Option<f64>,
}

impl RunConfig {
    /// Read a configuration file
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&content)?;

        tracing::debug!(
            "Loaded run configuration with {} channels from {:?}",
            config.channels.len(),
            path
        );
        Ok(config)
    }

    /// Frames each channel acquires
    pub fn target_frame_count(&self) -> Result<u64, ConfigError> {
        if let Some(count) = self.frame_count {
            return Ok(count);
        }
        match (self.fps, self.duration_secs) {
            (Some(fps), Some(duration)) => {
                if !(fps.is_finite() && fps > 0.0) {
                    return Err(ConfigError::Invalid {
                        field: "fps",
                        reason: format!("must be positive, got {fps}"),
                    });
                }
                if !(duration.is_finite() && duration >= 0.0) {
                    return Err(ConfigError::Invalid {
                        field: "durationSecs",
                        reason: format!("must not be negative, got {duration}"),
                    });
                }
                Ok((fps * duration).round() as u64)
            }
            _ => Err(ConfigError::MissingTarget),
        }
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|c| c.id.clone()).collect()
    }

    pub fn concurrent_saves(&self) -> Result<usize, ConfigError> {
        match self.max_concurrent_saves {
            Some(0) => Err(ConfigError::ZeroConcurrentSaves),
            Some(n) => Ok(n),
            None => Ok(default_concurrent_saves()),
        }
    }

    fn naming(&self) -> FileNaming {
        let extension = self
            .extension
            .as_deref()
            .unwrap_or_else(|| self.sink.default_extension());
        FileNaming::new(self.filename_scheme, extension)
    }

    fn progress_interval(&self) -> Result<Option<Duration>, ConfigError> {
        match self.progress_secs {
            None => Ok(None),
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                Ok(Some(Duration::from_secs_f64(secs)))
            }
            Some(secs) => Err(ConfigError::Invalid {
                field: "progressSecs",
                reason: format!("must be positive, got {secs}"),
            }),
        }
    }

    /// Pipeline settings and destinations for this run
    pub fn pipeline_config(&self) -> Result<(PipelineConfig, DestinationMap), ConfigError> {
        let config = PipelineConfig {
            frames_per_channel: self.target_frame_count()?,
            num_workers: self.num_workers,
            queue_capacity: self.queue_capacity,
            naming: self.naming(),
            first_sequence_id: self.first_sequence_id,
            progress_interval: self.progress_interval()?,
        };
        config.validate()?;
        self.concurrent_saves()?;

        let mut destinations = DestinationMap::new();
        for channel in &self.channels {
            destinations.insert(channel.id.clone(), channel.destination.clone());
        }
        destinations.validate(&self.channel_ids())?;

        Ok((config, destinations))
    }
}
