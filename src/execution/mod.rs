//! Stage Execution Module
//!
//! Drives one stage of the nested run: signalling the step processes,
//! following their progress in the runner log, and publishing results
//! to the enclosing job.
//!
//! # Architecture
//!
//! - [`engine`]: Stage entry point, launching and tailing the nested runner
//! - [`coordinator`]: Per-stage event handling and step release
//! - [`table`]: Fixed table of step records and their dependency graph
//! - [`step`]: Per-step record and status line formatting
//! - [`publisher`]: Transcripts, outputs and the stage verdict

pub mod coordinator;
pub mod engine;
pub mod publisher;
pub mod step;
pub mod table;

pub use coordinator::{StageCoordinator, StageOutcome};
pub use engine::Engine;
pub use publisher::{publish_results, stage_verdict};
pub use step::{StepCommands, StepRecord};
pub use table::StepTable;
