//! Frame sources
//!
//! The capability the pipeline acquires from. Real camera bindings live
//! outside this crate; they implement [`FrameSource`] and hand out [`Frame`]s
//! that return their device buffer on release.

pub mod frame;
pub mod simulated;
pub mod traits;

pub use frame::{Frame, FrameStatus};
pub use simulated::{Lifecycle, LifecycleLog, SimulatedHandle, SimulatedSource};
pub use traits::{ChannelId, FrameSource, TriggerRole};
