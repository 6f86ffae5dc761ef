//! Utility functions.
//!
//! Time source and formatting helpers shared across the crate.

pub mod clock;
pub mod format;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use format::{format_bytes, format_duration};
