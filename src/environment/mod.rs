//! Environment Integration Module
//!
//! Handles the two environments the orchestrator lives between: the
//! enclosing job it reports to, and the nested runner it drives.

pub mod act;
pub mod actions;

pub use act::GH_ACT_VERSION;
pub use actions::{CommandFiles, GithubContext, JobContext};
