//! Enclosing Job Context
//!
//! Everything the orchestrator hands back to the job it runs in: log
//! lines, collapsible groups, outputs, environment variables, path
//! entries, summaries, masks and saved state.
//!
//! [`GithubContext`] speaks the GitHub Actions runner protocol:
//!
//! - Command files (`GITHUB_OUTPUT`, `GITHUB_ENV`, ...) receive
//!   `name<<delimiter` blocks
//! - Workflow commands (`::group::`, `::add-mask::`, ...) go to stdout
//! - Without a command file, the legacy stdout command is used instead

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;

/// Sink for results and output of the orchestrated steps.
pub trait JobContext {
    /// Writes a line to the job log.
    fn write_line(&mut self, line: &str);

    fn start_group(&mut self, title: &str);

    fn end_group(&mut self);

    fn set_output(&mut self, name: &str, value: &str) -> io::Result<()>;

    fn export_variable(&mut self, name: &str, value: &str) -> io::Result<()>;

    /// Prepends a directory to `PATH` for the following steps.
    fn add_path(&mut self, path: &str) -> io::Result<()>;

    /// Appends a markdown fragment to the job summary.
    fn append_summary(&mut self, content: &str) -> io::Result<()>;

    /// Masks a value in all further log output.
    fn set_secret(&mut self, secret: &str);

    /// Saves a value readable as `STATE_<name>` by later stages.
    fn save_state(&mut self, name: &str, value: &str) -> io::Result<()>;
}

/// Paths of the runner's command files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFiles {
    pub output: Option<PathBuf>,
    pub env: Option<PathBuf>,
    pub path: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub state: Option<PathBuf>,
}

impl CommandFiles {
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let file = |name: &str| {
            vars.get(name)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };
        Self {
            output: file("GITHUB_OUTPUT"),
            env: file("GITHUB_ENV"),
            path: file("GITHUB_PATH"),
            summary: file("GITHUB_STEP_SUMMARY"),
            state: file("GITHUB_STATE"),
        }
    }

    pub fn from_env() -> Self {
        Self::from_vars(&std::env::vars().collect())
    }
}

/// Job context of a GitHub Actions runner.
#[derive(Debug, Clone, Default)]
pub struct GithubContext {
    files: CommandFiles,
}

impl GithubContext {
    pub fn new(files: CommandFiles) -> Self {
        Self { files }
    }

    pub fn from_env() -> Self {
        Self::new(CommandFiles::from_env())
    }

    fn issue(&mut self, command: &str, properties: &[(&str, &str)], message: &str) {
        let properties = properties
            .iter()
            .map(|(key, value)| format!("{}={}", key, escape_property(value)))
            .collect::<Vec<_>>()
            .join(",");
        let separator = if properties.is_empty() { "" } else { " " };
        println!(
            "::{}{}{}::{}",
            command,
            separator,
            properties,
            escape_data(message)
        );
    }
}

impl JobContext for GithubContext {
    fn write_line(&mut self, line: &str) {
        println!("{}", line);
    }

    fn start_group(&mut self, title: &str) {
        self.issue("group", &[], title);
    }

    fn end_group(&mut self) {
        self.issue("endgroup", &[], "");
    }

    fn set_output(&mut self, name: &str, value: &str) -> io::Result<()> {
        match &self.files.output {
            Some(path) => append_key_value(path, name, value),
            None => {
                self.issue("set-output", &[("name", name)], value);
                Ok(())
            }
        }
    }

    fn export_variable(&mut self, name: &str, value: &str) -> io::Result<()> {
        match &self.files.env {
            Some(path) => append_key_value(path, name, value),
            None => {
                self.issue("set-env", &[("name", name)], value);
                Ok(())
            }
        }
    }

    fn add_path(&mut self, path: &str) -> io::Result<()> {
        match &self.files.path {
            Some(file) => append_line(file, path),
            None => {
                self.issue("add-path", &[], path);
                Ok(())
            }
        }
    }

    fn append_summary(&mut self, content: &str) -> io::Result<()> {
        match &self.files.summary {
            Some(file) => append_line(file, content),
            None => {
                debug!("No step summary file, dropping summary fragment");
                Ok(())
            }
        }
    }

    fn set_secret(&mut self, secret: &str) {
        self.issue("add-mask", &[], secret);
    }

    fn save_state(&mut self, name: &str, value: &str) -> io::Result<()> {
        match &self.files.state {
            Some(path) => append_key_value(path, name, value),
            None => {
                self.issue("save-state", &[("name", name)], value);
                Ok(())
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

/// Appends a `name<<delimiter` block to a command file.
fn append_key_value(path: &Path, name: &str, value: &str) -> io::Result<()> {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let delimiter = format!("ghadelimiter_{}", nanos);
    if name.contains(&delimiter) || value.contains(&delimiter) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Value of '{}' contains the delimiter {}", name, delimiter),
        ));
    }

    append_line(
        path,
        &format!("{}<<{}\n{}\n{}", name, delimiter, value, delimiter),
    )
}

fn escape_data(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn escape_property(value: &str) -> String {
    escape_data(value).replace(':', "%3A").replace(',', "%2C")
}

/// One call recorded by [`RecordingContext`].
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Line(String),
    GroupStart(String),
    GroupEnd,
    Output(String, String),
    Variable(String, String),
    Path(String),
    Summary(String),
    Secret(String),
    State(String, String),
}

/// In-memory job context for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingContext {
    pub records: Vec<Recorded>,
}

#[cfg(test)]
impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<(String, String)> {
        self.records
            .iter()
            .filter_map(|record| match record {
                Recorded::Output(name, value) => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn output(&self, name: &str) -> Option<String> {
        self.outputs()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn lines(&self) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|record| match record {
                Recorded::Line(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn group_titles(&self) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|record| match record {
                Recorded::GroupStart(title) => Some(title.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, record: &Recorded) -> bool {
        self.records.contains(record)
    }
}

#[cfg(test)]
impl JobContext for RecordingContext {
    fn write_line(&mut self, line: &str) {
        self.records.push(Recorded::Line(line.to_string()));
    }

    fn start_group(&mut self, title: &str) {
        self.records.push(Recorded::GroupStart(title.to_string()));
    }

    fn end_group(&mut self) {
        self.records.push(Recorded::GroupEnd);
    }

    fn set_output(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.records
            .push(Recorded::Output(name.to_string(), value.to_string()));
        Ok(())
    }

    fn export_variable(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.records
            .push(Recorded::Variable(name.to_string(), value.to_string()));
        Ok(())
    }

    fn add_path(&mut self, path: &str) -> io::Result<()> {
        self.records.push(Recorded::Path(path.to_string()));
        Ok(())
    }

    fn append_summary(&mut self, content: &str) -> io::Result<()> {
        self.records.push(Recorded::Summary(content.to_string()));
        Ok(())
    }

    fn set_secret(&mut self, secret: &str) {
        self.records.push(Recorded::Secret(secret.to_string()));
    }

    fn save_state(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.records
            .push(Recorded::State(name.to_string(), value.to_string()));
        Ok(())
    }
}
