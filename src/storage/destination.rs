//! Destination directories and file naming
//!
//! Every channel writes into its own directory. A run refuses to start unless
//! each active channel has one.

use crate::source::ChannelId;
use crate::utils::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// How a saved frame's file name is formed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilenameScheme {
    /// `<sequence_id><extension>`
    #[default]
    Sequence,
    /// `<channel_id>_<sequence_id><extension>`
    ChannelPrefixed,
}

/// File name convention shared by all workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNaming {
    scheme: FilenameScheme,
    extension: String,
}

impl FileNaming {
    /// `extension` may be given with or without the leading dot
    pub fn new(scheme: FilenameScheme, extension: &str) -> Self {
        let extension = match extension.trim() {
            "" => String::new(),
            ext if ext.starts_with('.') => ext.to_string(),
            ext => format!(".{ext}"),
        };
        Self { scheme, extension }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn file_name(&self, channel: &ChannelId, sequence_id: u64) -> String {
        match self.scheme {
            FilenameScheme::Sequence => format!("{}{}", sequence_id, self.extension),
            FilenameScheme::ChannelPrefixed => {
                format!("{}_{}{}", channel, sequence_id, self.extension)
            }
        }
    }
}

impl Default for FileNaming {
    fn default() -> Self {
        Self::new(FilenameScheme::Sequence, ".raw")
    }
}

/// Mapping from channel to the directory its frames are written to
#[derive(Debug, Clone, Default)]
pub struct DestinationMap {
    dirs: HashMap<ChannelId, PathBuf>,
}

impl DestinationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair channels with directories in order.
    ///
    /// Surplus directories are allowed; surplus channels are not.
    pub fn zip(channels: &[ChannelId], dirs: &[PathBuf]) -> Result<Self, ConfigError> {
        if channels.len() > dirs.len() {
            return Err(ConfigError::TooManyChannels {
                channels: channels.len(),
                destinations: dirs.len(),
            });
        }
        let dirs = channels.iter().cloned().zip(dirs.iter().cloned()).collect();
        Ok(Self { dirs })
    }

    pub fn insert(&mut self, channel: impl Into<ChannelId>, dir: impl Into<PathBuf>) {
        self.dirs.insert(channel.into(), dir.into());
    }

    pub fn directory_for(&self, channel: &ChannelId) -> Option<&Path> {
        self.dirs.get(channel).map(PathBuf::as_path)
    }

    /// Full path a frame of `channel` is saved to
    pub fn path_for(
        &self,
        channel: &ChannelId,
        sequence_id: u64,
        naming: &FileNaming,
    ) -> Option<PathBuf> {
        self.directory_for(channel)
            .map(|dir| dir.join(naming.file_name(channel, sequence_id)))
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Check that every active channel has a destination
    pub fn validate(&self, active: &[ChannelId]) -> Result<(), ConfigError> {
        if active.is_empty() {
            return Err(ConfigError::NoChannels);
        }

        let mut seen = HashSet::new();
        for channel in active {
            if !seen.insert(channel) {
                return Err(ConfigError::DuplicateChannel(channel.clone()));
            }
        }

        if active.len() > self.dirs.len() {
            return Err(ConfigError::TooManyChannels {
                channels: active.len(),
                destinations: self.dirs.len(),
            });
        }

        match active.iter().find(|c| !self.dirs.contains_key(*c)) {
            Some(missing) => Err(ConfigError::MissingDestination(missing.clone())),
            None => Ok(()),
        }
    }

    /// Create every destination directory that does not exist yet
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for (channel, dir) in &self.dirs {
            fs::create_dir_all(dir)?;
            tracing::debug!("Destination for {} ready at {:?}", channel, dir);
        }
        Ok(())
    }
}
