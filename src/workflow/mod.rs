//! Step Definition Module
//!
//! Provides data structures and utilities for declaring, parsing, and
//! validating the steps, and for rendering them as a nested workflow.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Stage, StepConfig, StepDefinition)
//! - [`parser`]: YAML parsing of the steps input
//! - [`validator`]: Identifier rules and dependency checking
//! - [`document`]: Nested workflow rendering and position mapping
//! - [`ledger`]: Failed step record shared across stages

pub mod document;
pub mod ledger;
pub mod model;
pub mod parser;
pub mod validator;

pub use document::{
    build_workflow_document, DocumentMap, DocumentOptions, StepLocation, WorkflowDocument,
};
pub use ledger::ErrorLedger;
pub use model::{
    job_id, parse_job_index, Stage, StepConfig, StepDefinition, StepOutcome, StepReference,
    StepStatus,
};
pub use parser::parse_steps_input;
pub use validator::ValidationError;
