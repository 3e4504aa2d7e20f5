//! Step Runtime State
//!
//! Per-stage state of a single step:
//! - Lifecycle status and outcome
//! - Commands accumulated from its log (outputs, env, path, ...)
//! - The transcript published once the stage completes
//!
//! Also holds the helpers that render step status lines.

use std::time::Duration;

use chrono::TimeDelta;
use colored::{ColoredString, Colorize};

use crate::workflow::{Stage, StepDefinition, StepOutcome, StepStatus};

/// Commands a step issued, in issue order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCommands {
    pub outputs: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
    pub path: Vec<String>,
    pub summary: Vec<String>,
    pub masks: Vec<String>,
}

impl StepCommands {
    /// Sets an output; a repeated name keeps its position and takes the new value.
    pub fn set_output(&mut self, name: impl Into<String>, value: impl Into<String>) {
        upsert(&mut self.outputs, name.into(), value.into());
    }

    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        upsert(&mut self.env, name.into(), value.into());
    }
}

fn upsert(entries: &mut Vec<(String, String)>, name: String, value: String) {
    match entries.iter_mut().find(|(key, _)| *key == name) {
        Some(entry) => entry.1 = value,
        None => entries.push((name, value)),
    }
}

/// Runtime state of one step within one stage.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub definition: StepDefinition,
    pub status: StepStatus,
    pub outcome: Option<StepOutcome>,
    /// Learned from the log, not from the declaration
    pub continue_on_error: bool,
    pub commands: StepCommands,
    /// Output published in the step's group
    pub transcript: String,
    /// Inside a `::group::` of the step's own output
    pub grouped: bool,
    pub execution_time: Option<Duration>,
}

impl StepRecord {
    pub fn new(definition: StepDefinition) -> Self {
        Self {
            definition,
            status: StepStatus::Queued,
            outcome: None,
            continue_on_error: false,
            commands: StepCommands::default(),
            transcript: String::new(),
            grouped: false,
            execution_time: None,
        }
    }

    pub fn index(&self) -> usize {
        self.definition.index
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Outcome after `continue-on-error` absorption.
    pub fn conclusion(&self) -> Option<StepOutcome> {
        match self.outcome {
            Some(StepOutcome::Failure) if self.continue_on_error => Some(StepOutcome::Success),
            outcome => outcome,
        }
    }

    /// Appends a line to the transcript.
    pub fn append(&mut self, line: &str) {
        self.transcript.push_str(line);
        self.transcript.push('\n');
    }

    /// Indents `text` when inside a step group.
    pub fn indent(&self, text: &str) -> String {
        if self.grouped {
            format!("  {}", text)
        } else {
            text.to_string()
        }
    }

    /// Status line text: `[<Stage> ]Run <name>[ [duration]]`.
    pub fn headline(&self, stage: Stage) -> String {
        let mut headline = String::new();
        if stage != Stage::Main {
            headline.push_str(&format!("{} ", stage));
        }
        headline.push_str(&format!("Run {}", self.definition.display_name()));

        if let Some(time) = self.execution_time.filter(|time| !time.is_zero()) {
            let duration = format!(" [{}]", format_duration(time));
            headline.push_str(&duration.bright_black().to_string());
        }
        headline
    }
}

/// Glyph of a step start line.
pub fn start_glyph() -> ColoredString {
    "❯ ".bright_black()
}

/// Glyph of a step end line, coloured by outcome.
pub fn end_glyph(outcome: Option<StepOutcome>) -> ColoredString {
    match outcome {
        None | Some(StepOutcome::Success) => "⬤ ".bright_black(),
        Some(StepOutcome::Failure) => "⬤ ".red(),
        Some(StepOutcome::Skipped) => "⬤ ".yellow(),
    }
}

/// Prefix of a line in the concurrent log: padding plus step indicator.
pub fn line_prefix(index: usize) -> String {
    format!("{}{}", "  ".bright_black(), format!("[{}] ", index).bright_black())
}

/// Prefix of a status line: glyph plus step indicator.
pub fn status_prefix(glyph: ColoredString, index: usize) -> String {
    format!("{}{}", glyph, format!("[{}] ", index).bright_black())
}

/// Formats a duration as `1h 2m 3s`, omitting zero hours and minutes.
pub fn format_duration(duration: Duration) -> String {
    let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
    let hours = delta.num_hours();
    let minutes = delta.num_minutes() % 60;
    let seconds = delta.num_seconds() % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    parts.push(format!("{}s", seconds));
    parts.join(" ")
}
