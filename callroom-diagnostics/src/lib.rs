//! # Callroom Diagnostics
//!
//! Debugging and diagnostic tools for callroom.
//! Provides structured logging setup and a per-session connection timeline.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod connection_analyzer;
pub mod debug_logger;

// Re-export main types
pub use connection_analyzer::{ConnectionSummary, ConnectionTimeline, TimelineEntry, TimelineEvent};
pub use debug_logger::{init_logging, DebugLogger};
