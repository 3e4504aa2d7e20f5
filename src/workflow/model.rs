//! Step Data Model
//!
//! Core data structures describing the declared steps, the stages they
//! pass through, and the lifecycle values tracked for each of them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! - id: build
//!   run: cargo build --release
//!
//! - id: lint
//!   uses: actions/some-linter@v1
//!
//! - name: Package
//!   run: ./package.sh
//!   needs: [build, lint]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// One of the three phases every step passes through, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Pre,
    Main,
    Post,
}

impl Stage {
    /// Returns the canonical capitalized name used in file names and markers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pre => "Pre",
            Stage::Main => "Main",
            Stage::Post => "Post",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pre" => Ok(Stage::Pre),
            "main" => Ok(Stage::Main),
            "post" => Ok(Stage::Post),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Lifecycle status of a step within one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Waiting to be started by the nested runner
    Queued,
    /// Start event observed
    InProgress,
    /// Terminal
    Completed,
}

/// Result of a step as reported by the nested runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
}

impl StepOutcome {
    /// Maps a nested runner result string onto an outcome.
    ///
    /// Anything that is neither `success` nor `skipped` (`failure`, `error`,
    /// `cancelled`, ...) counts as a failure.
    pub fn from_result(result: &str) -> Self {
        match result {
            "success" => StepOutcome::Success,
            "skipped" => StepOutcome::Skipped,
            _ => StepOutcome::Failure,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
            StepOutcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to another step in a `needs` list, either by position or by id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StepReference {
    Index(usize),
    Id(String),
}

impl fmt::Display for StepReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepReference::Index(index) => write!(f, "{}", index),
            StepReference::Id(id) => f.write_str(id),
        }
    }
}

/// A step exactly as declared in the steps input.
///
/// Only the fields the orchestrator reads are typed; everything else
/// (`with`, `shell`, `working-directory`, ...) passes through untouched
/// into the nested workflow document.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StepConfig {
    /// Optional user-assigned identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Action reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    /// Shell script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    /// Step condition expression
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Prerequisite steps
    #[serde(deserialize_with = "single_or_vec", default, skip_serializing)]
    pub needs: Vec<StepReference>,

    /// Environment overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Value>,

    /// Remaining keys, passed through verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Deserializes either a single reference or a list of references.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<StepReference>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items.into_iter().map(reference_from_value).collect(),
        other => Ok(vec![reference_from_value(other)?]),
    }
}

fn reference_from_value<E: de::Error>(value: Value) -> Result<StepReference, E> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(|n| StepReference::Index(n as usize))
            .ok_or_else(|| E::custom(format!("Invalid step index: {}", n))),
        Value::String(s) => Ok(StepReference::Id(s)),
        _ => Err(E::custom("Expected step index or id in needs")),
    }
}

impl StepConfig {
    /// Creates a shell step.
    pub fn run(script: impl Into<String>) -> Self {
        Self {
            run: Some(script.into()),
            ..Self::default()
        }
    }

    /// Creates an action step.
    pub fn uses(action: impl Into<String>) -> Self {
        Self {
            uses: Some(action.into()),
            ..Self::default()
        }
    }

    /// Sets the identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a dependency on another step.
    pub fn needs(mut self, reference: StepReference) -> Self {
        self.needs.push(reference);
        self
    }

    /// Human readable name: `name`, else `uses`, else first line of `run`.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(uses) = &self.uses {
            return uses.clone();
        }
        if let Some(run) = &self.run {
            return run.lines().next().unwrap_or_default().to_string();
        }
        "INVALID STEP".to_string()
    }
}

/// A validated step with its dependencies resolved to indices.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    /// Position in the steps input; correlation key with the nested runner
    pub index: usize,
    pub config: StepConfig,
    /// Indices of prerequisite steps
    pub needs: Vec<usize>,
}

impl StepDefinition {
    pub fn new(index: usize, config: StepConfig, needs: Vec<usize>) -> Self {
        Self {
            index,
            config,
            needs,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    /// Job identifier of this step inside the nested workflow.
    pub fn job_id(&self) -> String {
        job_id(self.index)
    }

    pub fn display_name(&self) -> String {
        self.config.display_name()
    }
}

/// Builds the nested job identifier for a step index.
pub fn job_id(index: usize) -> String {
    format!("Step{}", index)
}

/// Extracts the step index embedded in a nested job identifier.
///
/// Leading non-digit characters are skipped, so `Step12` yields `12`.
pub fn parse_job_index(job_id: &str) -> Option<usize> {
    job_id
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_and_display() {
        assert_eq!("pre".parse::<Stage>().unwrap(), Stage::Pre);
        assert_eq!("Main".parse::<Stage>().unwrap(), Stage::Main);
        assert_eq!("POST".parse::<Stage>().unwrap(), Stage::Post);
        assert!("later".parse::<Stage>().is_err());
        assert_eq!(Stage::Main.to_string(), "Main");
    }

    #[test]
    fn test_outcome_from_result() {
        assert_eq!(StepOutcome::from_result("success"), StepOutcome::Success);
        assert_eq!(StepOutcome::from_result("skipped"), StepOutcome::Skipped);
        assert_eq!(StepOutcome::from_result("failure"), StepOutcome::Failure);
        assert_eq!(StepOutcome::from_result("error"), StepOutcome::Failure);
    }

    #[test]
    fn test_config_deserialize_passes_through_extra_keys() {
        let yaml = r#"
id: build
uses: actions/setup-node@v4
with:
  node-version: 20
continue-on-error: true
"#;
        let config: StepConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.id.as_deref(), Some("build"));
        assert_eq!(config.uses.as_deref(), Some("actions/setup-node@v4"));
        assert!(config.extra.contains_key("with"));
        assert!(config.extra.contains_key("continue-on-error"));
        assert!(config.needs.is_empty());
    }

    #[test]
    fn test_needs_single_or_list() {
        let single: StepConfig = serde_yaml::from_str("run: echo\nneeds: build").unwrap();
        assert_eq!(single.needs, vec![StepReference::Id("build".to_string())]);

        let list: StepConfig = serde_yaml::from_str("run: echo\nneeds: [0, lint]").unwrap();
        assert_eq!(
            list.needs,
            vec![StepReference::Index(0), StepReference::Id("lint".to_string())]
        );
    }

    #[test]
    fn test_needs_not_serialized() {
        let config = StepConfig::run("echo hi").needs(StepReference::Index(0));
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("needs"));
        assert!(yaml.contains("run: echo hi"));
    }

    #[test]
    fn test_display_name_priority() {
        assert_eq!(StepConfig::run("echo 1\necho 2").display_name(), "echo 1");
        assert_eq!(StepConfig::uses("a/b@v1").display_name(), "a/b@v1");
        assert_eq!(
            StepConfig::run("echo").with_name("Say hi").display_name(),
            "Say hi"
        );
        assert_eq!(StepConfig::default().display_name(), "INVALID STEP");
    }

    #[test]
    fn test_job_id_roundtrip() {
        assert_eq!(job_id(3), "Step3");
        assert_eq!(parse_job_index("Step12"), Some(12));
        assert_eq!(parse_job_index("Step"), None);
        assert_eq!(parse_job_index("build"), None);
    }
}
