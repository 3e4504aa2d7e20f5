//! Log Monitoring Module
//!
//! Follows and interprets the nested runner's output.
//!
//! # Components
//!
//! - [`LogTail`]: Line-by-line follower of the growing log file
//! - [`parse_line`]: Classification of one log line into a [`LogEvent`]
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts

pub mod log_line;
pub mod tail;
pub mod timeline;

pub use log_line::{parse_line, EventKind, LifecycleMarker, LogEvent, MarkerKind, RawLine};
pub use tail::{LogTail, TailStart};
pub use timeline::{ExecutionTimeline, TimelineEvent, TimelineMark};
