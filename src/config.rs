//! Runner Configuration
//!
//! Built once from the process environment at startup and passed by
//! reference from then on. Both configurations can be built from an
//! explicit variable map, which is how the tests drive them.
//!
//! # Orchestrator Variables
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `RUNNER_TEMP`, `GITHUB_ACTION` / `X_GITHUB_ACTION` | Temp directory `<RUNNER_TEMP>/<action>` |
//! | `INPUT_STEPS` | Steps YAML (required) |
//! | `INPUT_TOKEN` | Token for the nested runner (required) |
//! | `RUNNER_DEBUG` | `1` debug, `2` trace |
//! | `STATE_runner_pid` | Nested runner pid saved by the Pre stage |
//! | `STEPS_RUNNER_TRIGGER_TIMEOUT` | Seconds a step waits for the Pre stage, `0` for no bound |

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use log::LevelFilter;

use crate::error::ConfigError;
use crate::sync::DEFAULT_TRIGGER_TIMEOUT;
use crate::workflow::DocumentOptions;

/// Name of the nested runner log file inside the temp directory.
pub const LOG_FILE_NAME: &str = "act.log";

/// Name of the rendered nested workflow inside the temp directory.
pub const WORKFLOW_FILE_NAME: &str = "steps-workflow.yaml";

/// Directory of the interceptor action inside the temp directory.
pub const INTERCEPTOR_DIR_NAME: &str = "steps-interceptor";

/// State key of the nested runner pid.
pub const RUNNER_PID_STATE: &str = "runner_pid";

const TRIGGER_TIMEOUT_VARIABLE: &str = "STEPS_RUNNER_TRIGGER_TIMEOUT";

/// Variables that belong to the enclosing job only.
const LOCAL_VARIABLES: &[&str] = &[
    "RUNNER_TEMP",
    "GITHUB_WORKSPACE",
    "GITHUB_OUTPUT",
    "GITHUB_ENV",
    "GITHUB_PATH",
    "GITHUB_STEP_SUMMARY",
    "GITHUB_STATE",
];

/// Verbosity requested through `RUNNER_DEBUG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Normal,
    Debug,
    /// Debug, plus every raw log line echoed
    Trace,
}

impl Verbosity {
    fn from_flag(flag: Option<&str>) -> Self {
        match flag {
            Some("1") => Verbosity::Debug,
            Some("2") => Verbosity::Trace,
            _ => Verbosity::Normal,
        }
    }

    /// Reads `RUNNER_DEBUG` from the process environment.
    pub fn from_env() -> Self {
        Self::from_flag(std::env::var("RUNNER_DEBUG").ok().as_deref())
    }

    pub fn level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Normal => LevelFilter::Info,
            Verbosity::Debug => LevelFilter::Debug,
            Verbosity::Trace => LevelFilter::Trace,
        }
    }
}

/// Configuration of the orchestrator process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory shared by all stages and step processes
    pub temp_dir: PathBuf,
    /// Action name, used to derive per-step action names
    pub action_name: String,
    /// Raw steps YAML
    pub steps_input: String,
    pub token: String,
    pub verbosity: Verbosity,
    pub event_name: String,
    pub event_path: Option<String>,
    pub actor: Option<String>,
    pub working_dir: PathBuf,
    /// Variables forwarded to the nested runner and its jobs
    pub injected_env: BTreeMap<String, String>,
    /// Nested runner pid saved by the Pre stage
    pub runner_pid: Option<u32>,
    /// Upper bound on the number of steps
    pub max_parallel_steps: usize,
    /// Bound of a step process waiting on the Pre stage
    pub trigger_timeout: Option<Duration>,
}

impl RunnerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let mut config = Self::from_vars(&vars)?;
        if let Ok(dir) = std::env::current_dir() {
            config.working_dir = dir;
        }
        Ok(config)
    }

    /// Builds the configuration from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).filter(|value| !value.is_empty()).cloned();

        let runner_temp = get("RUNNER_TEMP");
        let action_name = get("X_GITHUB_ACTION").or_else(|| get("GITHUB_ACTION"));
        let (Some(runner_temp), Some(action_name)) = (runner_temp, action_name) else {
            return Err(ConfigError::MissingVariable(
                "RUNNER_TEMP and GITHUB_ACTION environment variables are required \
                 to create a temporary directory for an action."
                    .to_string(),
            ));
        };

        let input = |name: &str| {
            vars.get(&format!("INPUT_{}", name.to_uppercase()))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ConfigError::MissingInput(name.to_string()))
        };

        let runner_pid = get(&format!("STATE_{}", RUNNER_PID_STATE))
            .map(|pid| {
                pid.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
                    name: RUNNER_PID_STATE.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            temp_dir: PathBuf::from(runner_temp).join(&action_name),
            action_name,
            steps_input: input("steps")?,
            token: input("token")?,
            verbosity: Verbosity::from_flag(vars.get("RUNNER_DEBUG").map(String::as_str)),
            event_name: get("GITHUB_EVENT_NAME").unwrap_or_else(|| "push".to_string()),
            event_path: get("GITHUB_EVENT_PATH"),
            actor: get("GITHUB_ACTOR"),
            working_dir: get("GITHUB_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            injected_env: injected_env(vars),
            runner_pid,
            max_parallel_steps: num_cpus::get(),
            trigger_timeout: parse_timeout(TRIGGER_TIMEOUT_VARIABLE, get(TRIGGER_TIMEOUT_VARIABLE))?,
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.temp_dir.join(LOG_FILE_NAME)
    }

    pub fn workflow_path(&self) -> PathBuf {
        self.temp_dir.join(WORKFLOW_FILE_NAME)
    }

    pub fn interceptor_dir(&self) -> PathBuf {
        self.temp_dir.join(INTERCEPTOR_DIR_NAME)
    }

    pub fn is_trace(&self) -> bool {
        self.verbosity == Verbosity::Trace
    }

    /// Whether a variable was injected by the orchestrator.
    pub fn is_injected(&self, name: &str) -> bool {
        self.injected_env.contains_key(name)
    }

    /// Sets the step limit.
    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = max;
        self
    }

    /// Parameters of the nested workflow document.
    pub fn document_options(&self) -> DocumentOptions {
        DocumentOptions {
            event_name: self.event_name.clone(),
            action_name: self.action_name.clone(),
            temp_dir: self.temp_dir.clone(),
            working_dir: self.working_dir.clone(),
            host_env: self.injected_env.clone(),
            trigger_timeout: self.trigger_timeout,
        }
    }
}

/// Collects the `GITHUB_*` and `RUNNER_*` variables forwarded to the nested runner.
fn injected_env(vars: &HashMap<String, String>) -> BTreeMap<String, String> {
    vars.iter()
        .filter(|(key, _)| key.starts_with("GITHUB_") || key.starts_with("RUNNER_"))
        .filter(|(key, _)| !LOCAL_VARIABLES.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Parses a timeout in seconds; missing means the default, `0` means none.
fn parse_timeout(name: &str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = value else {
        return Ok(Some(DEFAULT_TRIGGER_TIMEOUT));
    };
    let seconds = value.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    Ok((seconds > 0).then(|| Duration::from_secs(seconds)))
}

/// Configuration of the step-side interceptor, read from its action inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptorConfig {
    /// Interceptor slot, `Pre` or `Post`
    pub step: String,
    pub temp_dir: PathBuf,
    pub job_id: String,
    pub timeout: Option<Duration>,
    pub host_working_dir: Option<PathBuf>,
    pub host_env: BTreeMap<String, String>,
}

impl InterceptorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let optional = |name: &str| {
            vars.get(&format!("INPUT_{}", name.to_uppercase()))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required =
            |name: &str| optional(name).ok_or_else(|| ConfigError::MissingInput(name.to_string()));

        let host_env = match optional("host-env") {
            Some(json) => serde_json::from_str(&json).map_err(|e| ConfigError::Invalid {
                name: "host-env".to_string(),
                message: e.to_string(),
            })?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            step: required("step")?,
            temp_dir: PathBuf::from(required("temp-dir")?),
            job_id: required("job-id")?,
            timeout: parse_timeout("timeout", optional("timeout"))?,
            host_working_dir: optional("host-working-directory").map(PathBuf::from),
            host_env,
        })
    }
}
