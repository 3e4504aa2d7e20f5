//! Nested Workflow Document
//!
//! Renders the declared steps as a workflow for the nested runner: one job
//! `Step<i>` per step, each wrapping the user step between two interceptor
//! steps that hold it at the stage checkpoints.
//!
//! ```yaml
//! on: push
//! jobs:
//!   Step0:
//!     runs-on: host
//!     steps:
//!     - id: pre
//!       uses: __/steps-interceptor@local
//!       with: { step: Pre, ... }
//!     - id: main
//!       if: env.STEPS_RUNNER_SKIP != 'true'
//!       run: make
//!     - id: post
//!       if: always()
//!       uses: __/steps-interceptor@local
//!       with: { step: Post, ... }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use serde_yaml::{Mapping, Value};

use super::model::{Stage, StepDefinition};

/// Reference of the local interceptor action inside the nested runner.
pub const INTERCEPTOR_ACTION: &str = "__/steps-interceptor@local";

/// Id of the user step inside each nested job.
pub const MAIN_STEP_ID: &str = "main";

/// Environment variable the interceptor exports to skip the user step.
pub const SKIP_GUARD_VARIABLE: &str = "STEPS_RUNNER_SKIP";

/// Values of the enclosing job the document is parameterized with.
#[derive(Debug, Clone, Default)]
pub struct DocumentOptions {
    /// Event name of the enclosing workflow (`on:`)
    pub event_name: String,
    /// Action name used to derive the per-step `GITHUB_ACTION`
    pub action_name: String,
    /// Directory shared with the step processes
    pub temp_dir: PathBuf,
    /// Working directory of the enclosing job
    pub working_dir: PathBuf,
    /// Environment forwarded to each nested job
    pub host_env: BTreeMap<String, String>,
    /// Bound of a step process waiting on the Pre stage, `None` for unbounded
    pub trigger_timeout: Option<Duration>,
}

/// Position of one user step inside the rendered document.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StepPosition {
    /// 1-based line of the `- id: main` entry
    line: usize,
    /// 0-based column where the step's keys start
    column: usize,
    /// Top-level keys of the rendered entry with their 1-based lines
    keys: Vec<(usize, String)>,
}

/// A document position attributed to a user step.
///
/// The rendered entry orders its keys differently from the declared step,
/// so the key, not the line, is what points back into the user's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLocation {
    /// Index of the user step
    pub step: usize,
    /// Top-level key of the step the position falls in
    pub key: Option<String>,
    /// 1-based line within the rendered entry
    pub line: usize,
    /// 1-based column within the rendered entry
    pub column: usize,
}

impl fmt::Display for StepLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "Step {} key '{}'", self.step, key),
            None => write!(
                f,
                "Step {} line {} column {} of the rendered step",
                self.step, self.line, self.column
            ),
        }
    }
}

/// Maps positions in the rendered document back to user steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMap {
    positions: Vec<StepPosition>,
}

impl DocumentMap {
    /// Scans a rendered document for the user step entries, in job order.
    pub fn from_rendered(yaml: &str) -> Self {
        let marker = format!("- id: {}", MAIN_STEP_ID);
        let mut positions: Vec<StepPosition> = Vec::new();
        let mut open = false;

        for (i, line) in yaml.lines().enumerate() {
            let trimmed = line.trim_start();
            let indent = line.len() - trimmed.len();
            if trimmed == marker {
                positions.push(StepPosition {
                    line: i + 1,
                    column: indent + 2,
                    keys: vec![(i + 1, "id".to_string())],
                });
                open = true;
                continue;
            }

            let Some(position) = positions.last_mut().filter(|_| open) else {
                continue;
            };
            if trimmed.is_empty() || indent > position.column {
                continue;
            }
            if indent < position.column {
                open = false;
                continue;
            }
            if let Some((key, _)) = trimmed.split_once(':') {
                let key = key.trim_matches(|c| c == '\'' || c == '"');
                position.keys.push((i + 1, key.to_string()));
            }
        }
        Self { positions }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Attributes a 1-based document position to a user step. Positions
    /// before the first user step, or left of its keys, yield `None`.
    pub fn locate(&self, line: usize, column: usize) -> Option<StepLocation> {
        let (step, position) = self
            .positions
            .iter()
            .enumerate()
            .rev()
            .find(|(_, position)| position.line <= line)?;

        let relative_column = column.checked_sub(position.column)?;
        let key = position
            .keys
            .iter()
            .rev()
            .find(|(key_line, _)| *key_line <= line)
            .map(|(_, key)| key.clone());

        Some(StepLocation {
            step,
            key,
            line: line - position.line + 1,
            column: relative_column.max(1),
        })
    }
}

/// A rendered nested workflow together with its position map.
#[derive(Debug, Clone)]
pub struct WorkflowDocument {
    pub yaml: String,
    pub map: DocumentMap,
}

/// Builds the nested workflow for the given steps.
pub fn build_workflow_document(
    steps: &[StepDefinition],
    options: &DocumentOptions,
) -> Result<WorkflowDocument, serde_yaml::Error> {
    let mut jobs = Mapping::new();
    for step in steps {
        jobs.insert(Value::from(step.job_id()), build_job(step, options)?);
    }

    let mut workflow = Mapping::new();
    workflow.insert("on".into(), Value::from(options.event_name.clone()));
    workflow.insert("jobs".into(), Value::Mapping(jobs));

    let yaml = serde_yaml::to_string(&Value::Mapping(workflow))?;
    let map = DocumentMap::from_rendered(&yaml);
    debug!("Rendered nested workflow with {} jobs", map.len());

    Ok(WorkflowDocument { yaml, map })
}

fn build_job(step: &StepDefinition, options: &DocumentOptions) -> Result<Value, serde_yaml::Error> {
    let steps = vec![
        interceptor_step(Stage::Pre, step, options)?,
        main_step(step, options)?,
        interceptor_step(Stage::Post, step, options)?,
    ];

    let mut job = Mapping::new();
    // Refers to the `--platform host=-self-hosted` launch argument
    job.insert("runs-on".into(), "host".into());
    job.insert("steps".into(), Value::Sequence(steps));
    Ok(Value::Mapping(job))
}

fn interceptor_step(
    stage: Stage,
    step: &StepDefinition,
    options: &DocumentOptions,
) -> Result<Value, serde_yaml::Error> {
    let timeout = options
        .trigger_timeout
        .map(|timeout| timeout.as_secs())
        .unwrap_or(0);

    let mut with = Mapping::new();
    with.insert("step".into(), stage.as_str().into());
    with.insert(
        "temp-dir".into(),
        options.temp_dir.to_string_lossy().into_owned().into(),
    );
    with.insert("job-id".into(), step.job_id().into());

    if stage == Stage::Pre {
        with.insert("timeout".into(), timeout.to_string().into());
        let host_env = serde_json::to_string(&options.host_env)
            .map_err(|e| <serde_yaml::Error as serde::ser::Error>::custom(e.to_string()))?;
        with.insert(
            "host-working-directory".into(),
            options.working_dir.to_string_lossy().into_owned().into(),
        );
        with.insert("host-env".into(), host_env.into());
    }

    let mut entry = Mapping::new();
    entry.insert("id".into(), stage.as_str().to_ascii_lowercase().into());
    if stage == Stage::Post {
        entry.insert("if".into(), "always()".into());
    }
    entry.insert("uses".into(), INTERCEPTOR_ACTION.into());
    entry.insert("with".into(), Value::Mapping(with));
    Ok(Value::Mapping(entry))
}

fn main_step(step: &StepDefinition, options: &DocumentOptions) -> Result<Value, serde_yaml::Error> {
    let Value::Mapping(declared) = serde_yaml::to_value(&step.config)? else {
        return Err(<serde_yaml::Error as serde::ser::Error>::custom(
            "step did not serialize to a mapping",
        ));
    };

    let mut entry = Mapping::new();
    entry.insert("id".into(), MAIN_STEP_ID.into());
    entry.insert(
        "if".into(),
        skip_guard(step.config.condition.as_deref()).into(),
    );

    for (key, value) in declared {
        match key.as_str() {
            Some("id") | Some("if") | Some("env") | Some("needs") => {}
            _ => {
                entry.insert(key, value);
            }
        }
    }

    // The nested runner refuses to override GITHUB_ACTION from outside the step
    let action = format!("{}__step_{}", options.action_name, step.index);
    let mut env: Mapping = step
        .config
        .env
        .iter()
        .map(|(key, value)| (Value::from(key.clone()), value.clone()))
        .collect();
    env.insert("GITHUB_ACTION".into(), action.clone().into());
    env.insert("X_GITHUB_ACTION".into(), action.into());
    entry.insert("env".into(), Value::Mapping(env));

    Ok(Value::Mapping(entry))
}

/// Combines the skip guard with the step's own condition.
fn skip_guard(condition: Option<&str>) -> String {
    let guard = format!("env.{} != 'true'", SKIP_GUARD_VARIABLE);
    let condition = condition.map(|condition| {
        let condition = condition.trim();
        condition
            .strip_prefix("${{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .unwrap_or(condition)
            .trim()
            .to_string()
    });

    match condition {
        Some(condition) if !condition.is_empty() => format!("{} && ({})", guard, condition),
        _ => guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::StepConfig;

    fn options() -> DocumentOptions {
        let mut host_env = BTreeMap::new();
        host_env.insert("GITHUB_REPOSITORY".to_string(), "acme/app".to_string());
        DocumentOptions {
            event_name: "push".to_string(),
            action_name: "run_steps".to_string(),
            temp_dir: PathBuf::from("/tmp/run_steps"),
            working_dir: PathBuf::from("/work/app"),
            host_env,
            trigger_timeout: Some(Duration::from_secs(30)),
        }
    }

    fn steps() -> Vec<StepDefinition> {
        let mut second: StepConfig =
            serde_yaml::from_str("id: test\nrun: make test\nif: ${{ github.ref == 'main' }}\nenv:\n  CI: 'true'\nwith:\n  a: 1")
                .unwrap();
        second.needs.clear();
        vec![
            StepDefinition::new(0, StepConfig::run("make").with_id("build"), vec![]),
            StepDefinition::new(1, second, vec![0]),
        ]
    }

    fn job_steps(document: &WorkflowDocument, job: &str) -> Vec<Value> {
        let parsed: Value = serde_yaml::from_str(&document.yaml).unwrap();
        parsed["jobs"][job]["steps"].as_sequence().unwrap().clone()
    }

    #[test]
    fn test_document_has_one_job_per_step() {
        let document = build_workflow_document(&steps(), &options()).unwrap();
        let parsed: Value = serde_yaml::from_str(&document.yaml).unwrap();

        assert_eq!(parsed["on"], Value::from("push"));
        let jobs = parsed["jobs"].as_mapping().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(parsed["jobs"]["Step0"]["runs-on"], Value::from("host"));
    }

    #[test]
    fn test_interceptor_steps_wrap_user_step() {
        let document = build_workflow_document(&steps(), &options()).unwrap();
        let steps = job_steps(&document, "Step1");

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0]["id"], Value::from("pre"));
        assert_eq!(steps[0]["uses"], Value::from(INTERCEPTOR_ACTION));
        assert_eq!(steps[0]["with"]["step"], Value::from("Pre"));
        assert_eq!(steps[0]["with"]["job-id"], Value::from("Step1"));
        assert_eq!(steps[0]["with"]["timeout"], Value::from("30"));
        assert_eq!(steps[0]["with"]["host-working-directory"], Value::from("/work/app"));
        assert_eq!(
            steps[0]["with"]["host-env"],
            Value::from(r#"{"GITHUB_REPOSITORY":"acme/app"}"#)
        );

        assert_eq!(steps[2]["id"], Value::from("post"));
        assert_eq!(steps[2]["if"], Value::from("always()"));
        assert_eq!(steps[2]["with"]["step"], Value::from("Post"));
        assert!(steps[2]["with"].get("host-env").is_none());
        assert!(steps[2]["with"].get("timeout").is_none());
    }

    #[test]
    fn test_user_step_is_rewritten() {
        let document = build_workflow_document(&steps(), &options()).unwrap();
        let steps = job_steps(&document, "Step1");
        let main = &steps[1];

        assert_eq!(main["id"], Value::from("main"));
        assert_eq!(
            main["if"],
            Value::from("env.STEPS_RUNNER_SKIP != 'true' && (github.ref == 'main')")
        );
        assert_eq!(main["run"], Value::from("make test"));
        assert_eq!(main["with"]["a"], Value::from(1));
        assert_eq!(main["env"]["CI"], Value::from("true"));
        assert_eq!(main["env"]["GITHUB_ACTION"], Value::from("run_steps__step_1"));
        assert_eq!(main["env"]["X_GITHUB_ACTION"], Value::from("run_steps__step_1"));
        assert!(main.get("needs").is_none());
    }

    #[test]
    fn test_skip_guard_without_condition() {
        assert_eq!(skip_guard(None), "env.STEPS_RUNNER_SKIP != 'true'");
        assert_eq!(skip_guard(Some("  ")), "env.STEPS_RUNNER_SKIP != 'true'");
        assert_eq!(
            skip_guard(Some("always()")),
            "env.STEPS_RUNNER_SKIP != 'true' && (always())"
        );
    }

    #[test]
    fn test_document_map_records_each_user_step() {
        let document = build_workflow_document(&steps(), &options()).unwrap();
        assert_eq!(document.map.len(), 2);

        let lines: Vec<&str> = document.yaml.lines().collect();
        for position in &document.map.positions {
            assert!(lines[position.line - 1].trim_start().starts_with("- id: main"));
        }
    }

    #[test]
    fn test_document_map_locate() {
        let yaml = "jobs:\n  Step0:\n    steps:\n    - id: main\n      run: a\n  Step1:\n    steps:\n    - id: main\n      run: b\n      bad: x\n";
        let map = DocumentMap::from_rendered(yaml);

        let located = map.locate(10, 7).unwrap();
        assert_eq!((located.step, located.line, located.column), (1, 3, 1));
        assert_eq!(located.key.as_deref(), Some("bad"));
        assert_eq!(located.to_string(), "Step 1 key 'bad'");

        let located = map.locate(5, 9).unwrap();
        assert_eq!((located.step, located.key.as_deref()), (0, Some("run")));
        assert_eq!(map.locate(2, 3), None);
    }

    #[test]
    fn test_document_map_names_declared_keys() {
        let document = build_workflow_document(&steps(), &options()).unwrap();
        let lines: Vec<&str> = document.yaml.lines().collect();

        let with_line = document.map.positions[1]
            .keys
            .iter()
            .find(|(_, key)| key == "with")
            .map(|(line, _)| *line)
            .unwrap();
        assert!(lines[with_line - 1].trim_start().starts_with("with:"));

        // A nested value is attributed to its top-level key
        let located = document.map.locate(with_line + 1, 12).unwrap();
        assert_eq!(located.step, 1);
        assert_eq!(located.key.as_deref(), Some("with"));

        // Keys of the following interceptor entry are not part of the step
        let keys: Vec<&str> = document.map.positions[1]
            .keys
            .iter()
            .map(|(_, key)| key.as_str())
            .collect();
        assert!(!keys.contains(&"uses"));
        assert!(keys.contains(&"env"));
    }
}
