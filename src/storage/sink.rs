//! Frame sinks
//!
//! A sink performs the blocking write of one frame. It runs on the offload
//! pool, so it should do as little CPU work as possible and leave the bytes
//! as the device produced them.

use crate::source::Frame;
use crate::utils::error::SinkError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Blocking save capability
pub trait FrameSink: Send + Sync + 'static {
    fn save(&self, frame: &Frame, path: &Path) -> Result<(), SinkError>;
}

/// Sink selection for configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Raw,
    Png,
}

impl SinkKind {
    /// Extension used when the configuration does not name one
    pub fn default_extension(&self) -> &'static str {
        match self {
            SinkKind::Raw => ".raw",
            SinkKind::Png => ".png",
        }
    }

    pub fn build(&self) -> Box<dyn FrameSink> {
        match self {
            SinkKind::Raw => Box::new(RawFileSink),
            SinkKind::Png => Box::new(PngSink),
        }
    }
}

/// Writes the frame payload verbatim
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFileSink;

impl FrameSink for RawFileSink {
    fn save(&self, frame: &Frame, path: &Path) -> Result<(), SinkError> {
        let io_err = |source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::create(path).map_err(io_err)?;
        file.write_all(frame.payload()).map_err(io_err)?;
        Ok(())
    }
}

/// Writes mono8 frames as 8-bit grayscale PNG
#[derive(Debug, Clone, Copy, Default)]
pub struct PngSink;

impl FrameSink for PngSink {
    fn save(&self, frame: &Frame, path: &Path) -> Result<(), SinkError> {
        let (width, height) = frame.dimensions().ok_or_else(|| SinkError::Unsupported {
            sequence_id: frame.sequence_id(),
            reason: "frame has no dimensions".to_string(),
        })?;
        let expected = width as usize * height as usize;
        if frame.payload().len() != expected {
            return Err(SinkError::Unsupported {
                sequence_id: frame.sequence_id(),
                reason: format!(
                    "payload is {} bytes, expected {} for {}x{} mono8",
                    frame.payload().len(),
                    expected,
                    width,
                    height
                ),
            });
        }

        let file = File::create(path).map_err(|source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let encode_err = |e: png::EncodingError| SinkError::Encode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let mut encoder = png::Encoder::new(BufWriter::new(file), width, height);
        encoder.set_color(png::ColorType::Grayscale);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().map_err(encode_err)?;
        writer.write_image_data(frame.payload()).map_err(encode_err)?;
        writer.finish().map_err(encode_err)?;
        Ok(())
    }
}
