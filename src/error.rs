//! Error types shared across the crate.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::workflow::ValidationError;

/// Errors of the trigger-file mailbox.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Timed out after {seconds}s waiting for trigger {name}")]
    Timeout { name: String, seconds: u64 },

    #[error("Unexpected trigger message '{message}' in {name}")]
    UnknownMessage { name: String, message: String },

    #[error("Trigger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Mailbox unavailable while accessing {name}: a writer panicked")]
    Poisoned { name: String },
}

/// Errors that settle a stage as failed.
#[derive(Debug, Error)]
pub enum StageError {
    /// A fatal error reported by the nested runner.
    #[error("{error} - {message}")]
    Runner { error: String, message: String },

    /// The nested workflow document was rejected because of a user step.
    #[error("Invalid steps input - {0}")]
    InvalidSteps(String),

    /// At least one step concluded with a failure.
    #[error("Steps failed: {0:?}")]
    StepsFailed(Vec<usize>),

    #[error("Unexpected step index in job id '{0}'")]
    UnknownJob(String),

    #[error("Unexpected step end. Step was already completed: {0}")]
    AlreadyCompleted(usize),

    #[error("Log stream ended before all steps completed")]
    Unsettled,

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reading the process environment into a configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Input required and not supplied: {0}")]
    MissingInput(String),

    #[error("{0}")]
    MissingVariable(String),

    #[error("Invalid value for {name}: {message}")]
    Invalid { name: String, message: String },
}

/// Top level error of a runner invocation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to build nested workflow: {0}")]
    Document(#[from] serde_yaml::Error),

    #[error("Failed to launch nested runner: {0}")]
    Launch(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
