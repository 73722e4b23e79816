//! Frame persistence targets
//!
//! Where frames go (per-channel directories and file naming) and how they
//! are written (sinks).

pub mod destination;
pub mod sink;

pub use destination::{DestinationMap, FileNaming, FilenameScheme};
pub use sink::{FrameSink, PngSink, RawFileSink, SinkKind};
