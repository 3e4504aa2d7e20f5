//! Stage Coordinator
//!
//! Consumes the nested runner's log one line at a time and drives every
//! step of the current stage through `Queued → InProgress → Completed`.
//!
//! # Responsibilities
//!
//! - Correlating log lines with steps through their job id
//! - Accumulating step commands and transcripts
//! - Releasing dependents in Main, with a continue or skip decision
//! - Settling the stage once every step is completed, or on a fatal error
//!
//! Lines are handled strictly in order; a line's trigger writes are done
//! before the next line is looked at.

use std::collections::HashSet;
use std::time::Duration;

use colored::Colorize;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use super::publisher::{publish_results, stage_verdict};
use super::step::{end_glyph, line_prefix, start_glyph, status_prefix, StepRecord};
use super::table::StepTable;
use crate::config::RunnerConfig;
use crate::environment::JobContext;
use crate::error::StageError;
use crate::monitoring::{
    parse_line, EventKind, ExecutionTimeline, LifecycleMarker, LogEvent, MarkerKind,
};
use crate::sync::{Mailbox, TriggerKey, TriggerMessage};
use crate::workflow::document::MAIN_STEP_ID;
use crate::workflow::{
    job_id, DocumentMap, ErrorLedger, Stage, StepDefinition, StepOutcome, StepStatus,
};

/// Runner error that does not affect the stage.
const IGNORED_ERROR: &str = "repository does not exist";

/// Runner error raised when the rendered document is rejected.
const INVALID_WORKFLOW_ERROR: &str = "workflow is not valid";

/// Message prefix of a transient action fetch failure.
const FETCH_FAILURE_PREFIX: &str = "failed to fetch ";

/// Title of the group holding the interleaved live output.
const CONCURRENT_GROUP_TITLE: &str = "Concurrent logs";

static WORKFLOW_POSITION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Failed to match run-step: Line: (?<line>\d+) Column (?<column>\d+): (?<msg>.*)$")
        .expect("valid regex")
});

static FETCH_FAILURE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"GoGitActionCache (?<msg>failed to fetch \S+ with ref \S+)").expect("valid regex")
});

static COMMAND_PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(::[^:]+::)").expect("valid regex"));

/// Single-assignment outcome of a stage.
#[derive(Debug, Default)]
pub enum StageOutcome {
    #[default]
    Pending,
    Resolved,
    Rejected(StageError),
}

impl StageOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, StageOutcome::Pending)
    }

    fn resolve(&mut self) {
        if self.is_pending() {
            *self = StageOutcome::Resolved;
        }
    }

    fn reject(&mut self, error: StageError) {
        if self.is_pending() {
            *self = StageOutcome::Rejected(error);
        }
    }
}

/// State machine of one stage invocation.
pub struct StageCoordinator<'a> {
    stage: Stage,
    table: StepTable,
    config: &'a RunnerConfig,
    mailbox: &'a dyn Mailbox,
    context: &'a mut dyn JobContext,
    ledger: ErrorLedger,
    /// Failures already in the ledger
    recorded_failures: HashSet<usize>,
    concurrent_group: bool,
    timeline: ExecutionTimeline,
    document_map: Option<DocumentMap>,
    outcome: StageOutcome,
}

impl<'a> StageCoordinator<'a> {
    pub fn new(
        stage: Stage,
        steps: &[StepDefinition],
        config: &'a RunnerConfig,
        mailbox: &'a dyn Mailbox,
        context: &'a mut dyn JobContext,
    ) -> Self {
        Self {
            stage,
            table: StepTable::new(steps),
            config,
            mailbox,
            context,
            ledger: ErrorLedger::new(&config.temp_dir),
            recorded_failures: HashSet::new(),
            concurrent_group: false,
            timeline: ExecutionTimeline::new(),
            document_map: None,
            outcome: StageOutcome::Pending,
        }
    }

    /// Sets the map used to attribute document validation errors to steps.
    pub fn with_document_map(mut self, map: DocumentMap) -> Self {
        self.document_map = Some(map);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn table(&self) -> &StepTable {
        &self.table
    }

    pub fn is_pending(&self) -> bool {
        self.outcome.is_pending()
    }

    /// Ends every step recorded as failed by an earlier stage.
    pub fn apply_ledger(&mut self) -> Result<(), StageError> {
        self.ledger.ensure_exists()?;
        for index in self.ledger.load()? {
            if self.table.get(index).is_none() {
                warn!("Ignoring unknown step {} in failed step ledger", index);
                continue;
            }
            self.recorded_failures.insert(index);
            if !self.table.get(index).is_some_and(StepRecord::is_completed) {
                self.end_step(index, Some(StepOutcome::Failure))?;
            }
        }
        Ok(())
    }

    /// Announces the stage to the step processes.
    ///
    /// In Main, also releases every step without dependencies.
    pub fn start_stage(&mut self) -> Result<(), StageError> {
        self.mailbox
            .signal(&TriggerKey::stage(self.stage), TriggerMessage::Continue)?;
        info!("{} stage started for {} steps", self.stage, self.table.len());

        if self.stage == Stage::Main {
            for index in self.table.roots() {
                if !self.table.mark_triggered(index) {
                    continue;
                }
                let decision = if self.table.get(index).is_some_and(StepRecord::is_completed) {
                    TriggerMessage::Skip
                } else {
                    TriggerMessage::Continue
                };
                self.mailbox
                    .signal(&TriggerKey::step(Stage::Main, job_id(index)), decision)?;
            }
        }
        Ok(())
    }

    /// Handles one raw log line. A fatal error rejects the stage.
    pub fn process_line(&mut self, line: &str) {
        if !self.is_pending() || line.is_empty() {
            return;
        }

        if self.config.is_trace() {
            self.concurrent_log(&line.cyan().to_string());
        }

        if let Err(error) = self.handle_event(parse_line(line)) {
            debug!("Rejecting {} stage: {}", self.stage, error);
            self.outcome.reject(error);
        }
    }

    /// Consumes the coordinator and returns the settled outcome.
    pub fn finish(mut self) -> Result<(), StageError> {
        self.close_concurrent_group();
        match std::mem::take(&mut self.outcome) {
            StageOutcome::Pending => Err(StageError::Unsettled),
            StageOutcome::Resolved => Ok(()),
            StageOutcome::Rejected(error) => Err(error),
        }
    }

    fn handle_event(&mut self, event: LogEvent) -> Result<(), StageError> {
        if let Some(error) = event.error.as_deref() {
            if error != IGNORED_ERROR {
                return Err(self.fatal_error(error, &event.msg));
            }
        }

        let Some(job) = event.job_id.as_deref() else {
            return Ok(());
        };
        let index = self
            .table
            .resolve_job(job)
            .ok_or_else(|| StageError::UnknownJob(job.to_string()))?;

        if event.step_slot() == Some(MAIN_STEP_ID) {
            return self.handle_step_event(index, &event);
        }

        if event.raw_output {
            if let Some(marker) = LifecycleMarker::parse(&event.msg) {
                debug!("Step {}: {}", index, marker);
                // Post lines are not reliably ordered, Post ends on the job result
                if marker.kind == MarkerKind::End
                    && marker.stage == self.stage
                    && self.stage != Stage::Post
                {
                    self.end_step(index, None)?;
                }
            }
        } else if event.job_result.is_some() {
            let completed = self.table.get(index).is_some_and(StepRecord::is_completed);
            if !completed {
                let outcome = match self.stage {
                    Stage::Post => None,
                    _ => Some(StepOutcome::Failure),
                };
                self.end_step(index, outcome)?;
            }
        }
        Ok(())
    }

    fn handle_step_event(&mut self, index: usize, event: &LogEvent) -> Result<(), StageError> {
        if event.raw_output {
            self.record_raw_output(index, &event.msg)?;
            return Ok(());
        }

        match event.event {
            EventKind::Start => self.start_step(index)?,
            EventKind::ContinueOnError => {
                self.step_mut(index)?.continue_on_error = true;
            }
            EventKind::End => {
                let step = self.step_mut(index)?;
                if let Some(time) = event.execution_time {
                    step.execution_time = Some(Duration::from_nanos(time));
                }
                if let Some(result) = event.step_result.as_deref() {
                    step.outcome = Some(StepOutcome::from_result(result));
                }
            }
            EventKind::Command => self.handle_command(index, event)?,
            EventKind::Log => {
                if event.level == "error" && event.msg.starts_with(FETCH_FAILURE_PREFIX) {
                    self.record_fetch_failure(index, &event.msg)?;
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, index: usize, event: &LogEvent) -> Result<(), StageError> {
        let command = event.command.as_deref().unwrap_or_default();
        let name = event.name.clone().unwrap_or_default();
        let arg = event.arg.clone().unwrap_or_default();
        let raw = event.raw_text().to_string();

        match command {
            "group" => {
                let title = format!("▼ {}", arg);
                self.step_log(index, &title);
                let step = self.step_mut(index)?;
                step.append(&title);
                step.grouped = true;
            }
            "endgroup" => self.step_mut(index)?.grouped = false,
            "add-matcher" | "remove-matcher" => self.step_mut(index)?.append(&raw),
            "set-output" => self.step_mut(index)?.commands.set_output(name, arg),
            "set-env" => {
                // Injected variables are already set in the enclosing job
                if !self.config.is_injected(&name) {
                    self.step_mut(index)?.commands.set_env(name, arg);
                }
            }
            "add-path" => self.step_mut(index)?.commands.path.push(arg),
            "summary" => {
                let content = event.content.clone().unwrap_or_default();
                self.step_mut(index)?.commands.summary.push(content);
            }
            "add-mask" => self.step_mut(index)?.commands.masks.push(arg),
            "warning" | "error" | "debug" | "notice" => {
                let message = COMMAND_PREFIX_PATTERN.replace(&raw, "").into_owned();
                let message = match command {
                    "warning" => message.yellow().to_string(),
                    "error" => message.red().to_string(),
                    "debug" => message.bright_black().to_string(),
                    _ => message,
                };
                let step = self.step_mut(index)?;
                let echoed = step.indent(&message);
                let line = if step.grouped {
                    COMMAND_PREFIX_PATTERN.replace(&raw, "${1}  ").into_owned()
                } else {
                    raw
                };
                step.append(&line);
                self.step_log(index, &echoed);
            }
            _ => {
                warn!("Unsupported command: {}", command);
                self.step_log(index, &raw);
                self.step_mut(index)?.append(&raw);
            }
        }
        Ok(())
    }

    fn record_raw_output(&mut self, index: usize, msg: &str) -> Result<(), StageError> {
        let text = match msg.strip_prefix("[command]") {
            Some(command) => command.blue().to_string(),
            None => msg.to_string(),
        };
        let step = self.step_mut(index)?;
        let line = step.indent(&text);
        step.append(&line);
        self.step_log(index, &line);
        Ok(())
    }

    fn record_fetch_failure(&mut self, index: usize, msg: &str) -> Result<(), StageError> {
        let message = FETCH_FAILURE_PATTERN
            .captures(msg)
            .map(|caps| caps["msg"].to_string())
            .unwrap_or_else(|| msg.to_string());

        let step = self.step_mut(index)?;
        let echoed = step.indent(&message.red().to_string());
        let line = format!("::error::{}", step.indent(&message));
        step.append(&line);
        self.step_log(index, &echoed);
        self.end_step(index, Some(StepOutcome::Failure))
    }

    fn start_step(&mut self, index: usize) -> Result<(), StageError> {
        let stage = self.stage;
        let step = self.step_mut(index)?;
        if step.status != StepStatus::Queued {
            debug!("Step {} already started, ignoring start", index);
            return Ok(());
        }
        step.status = StepStatus::InProgress;
        let line = format!("{}{}", status_prefix(start_glyph(), index), step.headline(stage));

        debug!("Step {} started", index);
        self.timeline.step_started(index);
        self.concurrent_log(&line);
        Ok(())
    }

    /// Completes a step; `outcome` overrides what the log reported.
    ///
    /// A step that never reported an outcome is skipped. A failed step is
    /// appended to the ledger once, unless `continue-on-error` absorbed the
    /// failure. When this was the
    /// last step the stage settles; otherwise, in Main, its dependents are
    /// released.
    fn end_step(&mut self, index: usize, outcome: Option<StepOutcome>) -> Result<(), StageError> {
        let stage = self.stage;
        let step = self.step_mut(index)?;
        if step.is_completed() {
            if stage == Stage::Main {
                warn!("Step {} was already completed, ignoring end", index);
                return Ok(());
            }
            return Err(StageError::AlreadyCompleted(index));
        }

        if outcome.is_some() {
            step.outcome = outcome;
        }
        let final_outcome = *step.outcome.get_or_insert(StepOutcome::Skipped);
        let failed = step.conclusion() == Some(StepOutcome::Failure);
        let previous = step.status;
        step.status = StepStatus::Completed;
        let status_line = (previous == StepStatus::InProgress).then(|| {
            format!(
                "{}{}",
                status_prefix(end_glyph(Some(final_outcome)), index),
                step.headline(stage)
            )
        });

        if failed && self.recorded_failures.insert(index) {
            self.ledger.record(index)?;
        }
        if let Some(line) = status_line {
            self.concurrent_log(&line);
        }
        debug!("Step {} completed: {}", index, final_outcome);
        self.timeline.step_ended(index, Some(final_outcome));

        if self.table.all_completed() {
            self.complete_stage()
        } else if stage == Stage::Main {
            self.release_dependents(index)
        } else {
            Ok(())
        }
    }

    fn release_dependents(&mut self, index: usize) -> Result<(), StageError> {
        for (dependent, decision) in self.table.ready_dependents(index) {
            self.table.mark_triggered(dependent);
            info!("Releasing step {} ({})", dependent, decision);
            self.mailbox
                .signal(&TriggerKey::step(Stage::Main, job_id(dependent)), decision)?;
        }
        Ok(())
    }

    fn complete_stage(&mut self) -> Result<(), StageError> {
        self.close_concurrent_group();
        debug!("{}", self.timeline.gantt_chart());

        publish_results(self.stage, &self.table, &mut *self.context)?;
        match stage_verdict(&self.table) {
            Ok(()) => self.outcome.resolve(),
            Err(error) => self.outcome.reject(error),
        }
        info!("{} stage completed", self.stage);
        Ok(())
    }

    fn fatal_error(&self, error: &str, msg: &str) -> StageError {
        if error != INVALID_WORKFLOW_ERROR {
            return StageError::Runner {
                error: error.to_string(),
                message: msg.to_string(),
            };
        }

        let Some(caps) = WORKFLOW_POSITION_PATTERN.captures(msg) else {
            return StageError::InvalidSteps(msg.to_string());
        };
        let line: usize = caps["line"].parse().unwrap_or_default();
        let column: usize = caps["column"].parse().unwrap_or_default();
        let detail = &caps["msg"];

        let located = self
            .document_map
            .as_ref()
            .and_then(|map| map.locate(line, column));
        StageError::InvalidSteps(match located {
            Some(location) => format!("{}: {}", location, detail),
            None => format!("Line: {} Column {}: {}", line, column, detail),
        })
    }

    fn step_mut(&mut self, index: usize) -> Result<&mut StepRecord, StageError> {
        self.table
            .get_mut(index)
            .ok_or_else(|| StageError::UnknownJob(job_id(index)))
    }

    /// Writes a step line to the live log.
    fn step_log(&mut self, index: usize, text: &str) {
        let line = format!("{}{}", line_prefix(index), text);
        self.concurrent_log(&line);
    }

    fn concurrent_log(&mut self, line: &str) {
        if !self.concurrent_group {
            self.context.start_group(CONCURRENT_GROUP_TITLE);
            self.concurrent_group = true;
        }
        self.context.write_line(line);
    }

    fn close_concurrent_group(&mut self) {
        if self.concurrent_group {
            self.context.end_group();
            self.context.write_line("");
            self.concurrent_group = false;
        }
    }
}
