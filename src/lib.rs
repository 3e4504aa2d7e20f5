//! steps-runner - Isolated Step Orchestration
//!
//! Runs a list of user steps as isolated jobs of a nested workflow runner
//! (`gh act`), while the enclosing job sees them as its own Pre, Main and
//! Post stages. Steps declare dependencies with `needs`; independent
//! steps run concurrently.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`workflow`]: Steps input parsing, validation and nested workflow rendering
//! - [`execution`]: Stage engine, coordinator and result publishing
//! - [`monitoring`]: Log tailing, line classification and execution timeline
//! - [`sync`]: Trigger mailbox shared with the step processes
//! - [`environment`]: Enclosing job commands and nested runner integration
//! - [`interceptor`]: Step-side hooks holding each step at the stage checkpoints
//! - [`config`]: Environment-driven configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use steps_runner::environment::GithubContext;
//! use steps_runner::workflow::Stage;
//! use steps_runner::{Engine, RunnerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(RunnerConfig::from_env()?);
//!     let mut context = GithubContext::from_env();
//!
//!     engine.run_stage(Stage::Pre, &mut context).await?;
//!     engine.run_stage(Stage::Main, &mut context).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod execution;
pub mod interceptor;
pub mod monitoring;
pub mod sync;
pub mod workflow;

// Re-export commonly used types
pub use config::RunnerConfig;
pub use error::RunnerError;
pub use execution::engine::Engine;
pub use workflow::parser::parse_steps_input;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "steps-runner";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Stage;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "steps-runner");
    }

    #[test]
    fn test_module_exports_parser() {
        let steps = parse_steps_input("- id: build\n  run: make\n- run: make test\n  needs: build", 4)
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].needs, vec![0]);
    }

    #[test]
    fn test_module_exports_stage() {
        assert_eq!("main".parse::<Stage>().unwrap(), Stage::Main);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
