//! Stage Execution Engine
//!
//! Runs one stage of the orchestrated steps:
//! - Pre launches the nested runner and follows its log from the start
//! - Main and Post follow the log from its current end
//! - Every line is fed to the [`StageCoordinator`] until the stage settles
//!
//! Stages run as separate invocations and share only the temp directory:
//! the log file, the trigger files, and the failed step ledger.

use std::fs;
use std::path::PathBuf;

use log::{debug, info};

use super::coordinator::StageCoordinator;
use crate::config::{RunnerConfig, RUNNER_PID_STATE};
use crate::environment::{act, JobContext};
use crate::error::RunnerError;
use crate::monitoring::{LogTail, TailStart};
use crate::sync::{FileMailbox, Mailbox};
use crate::workflow::{
    build_workflow_document, parse_steps_input, DocumentMap, ErrorLedger, Stage, StepDefinition,
};

/// Stage execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use steps_runner::config::RunnerConfig;
/// use steps_runner::environment::GithubContext;
/// use steps_runner::execution::Engine;
/// use steps_runner::workflow::Stage;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(RunnerConfig::from_env()?);
///     let mut context = GithubContext::from_env();
///
///     engine.run_stage(Stage::Main, &mut context).await?;
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: RunnerConfig,
    mailbox: Box<dyn Mailbox>,
    executable: Option<PathBuf>,
}

impl Engine {
    /// Creates an engine signalling through trigger files in the temp directory.
    pub fn new(config: RunnerConfig) -> Self {
        let mailbox = Box::new(FileMailbox::new(&config.temp_dir));
        Self {
            config,
            mailbox,
            executable: None,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Replaces the mailbox used to signal the step processes.
    pub fn set_mailbox(&mut self, mailbox: Box<dyn Mailbox>) {
        self.mailbox = mailbox;
    }

    /// Sets the executable the interceptor action calls back into.
    ///
    /// Defaults to the current executable.
    pub fn set_executable(&mut self, path: impl Into<PathBuf>) {
        self.executable = Some(path.into());
    }

    /// Parses and validates the configured steps.
    pub fn load_steps(&self) -> Result<Vec<StepDefinition>, RunnerError> {
        Ok(parse_steps_input(
            &self.config.steps_input,
            self.config.max_parallel_steps,
        )?)
    }

    /// Runs a stage to completion.
    ///
    /// This function:
    /// 1. Validates the steps
    /// 2. In Pre, renders the nested workflow and launches the runner
    /// 3. Follows the runner log, feeding every line to the coordinator
    /// 4. Returns once all steps completed, or on the first fatal error
    ///
    /// Main and Post are skipped when Pre never produced a log.
    pub async fn run_stage(
        &self,
        stage: Stage,
        context: &mut dyn JobContext,
    ) -> Result<(), RunnerError> {
        let steps = self.load_steps()?;
        fs::create_dir_all(&self.config.temp_dir)?;

        let log_path = self.config.log_path();
        let mut document_map = None;

        if stage == Stage::Pre {
            document_map = Some(self.launch_runner(&steps, context)?);
        } else if !log_path.exists() {
            debug!("Skipping {} stage", stage);
            return Ok(());
        }

        let start = match stage {
            Stage::Pre => TailStart::Beginning,
            _ => TailStart::End,
        };
        let mut tail = LogTail::open(&log_path, start).await?;
        let result = self
            .coordinate(stage, &steps, document_map, &mut tail, context)
            .await;

        if stage == Stage::Post {
            if let Some(pid) = self.config.runner_pid {
                act::terminate(pid);
            }
        }
        result
    }

    /// Prepares the temp directory and starts the nested runner.
    fn launch_runner(
        &self,
        steps: &[StepDefinition],
        context: &mut dyn JobContext,
    ) -> Result<DocumentMap, RunnerError> {
        ErrorLedger::new(&self.config.temp_dir).reset()?;
        fs::write(self.config.log_path(), "")?;

        let document = build_workflow_document(steps, &self.config.document_options())?;
        fs::write(self.config.workflow_path(), &document.yaml)?;

        let executable = match &self.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        act::write_interceptor_action(&self.config.interceptor_dir(), &executable)?;

        let pid = act::launch(&self.config, steps.len())?;
        context.save_state(RUNNER_PID_STATE, &pid.to_string())?;
        Ok(document.map)
    }

    async fn coordinate(
        &self,
        stage: Stage,
        steps: &[StepDefinition],
        document_map: Option<DocumentMap>,
        tail: &mut LogTail,
        context: &mut dyn JobContext,
    ) -> Result<(), RunnerError> {
        let mut coordinator =
            StageCoordinator::new(stage, steps, &self.config, &*self.mailbox, context);
        if let Some(map) = document_map {
            coordinator = coordinator.with_document_map(map);
        }

        if stage != Stage::Pre {
            coordinator.apply_ledger()?;
        }
        coordinator.start_stage()?;

        while coordinator.is_pending() {
            let line = tail.next_line().await?;
            coordinator.process_line(&line);
        }

        coordinator.finish()?;
        info!("{} stage succeeded", stage);
        Ok(())
    }
}
