//! Nested Runner Log Lines
//!
//! Parses one line of the nested runner's combined output into a
//! normalized [`LogEvent`].
//!
//! # Line Formats
//!
//! Recognized in this order:
//!
//! 1. A JSON object (the `--json` log protocol)
//! 2. `level=<lvl> msg=<text>`
//! 3. `Error: <summary>. <detail>`, optionally ending in
//!    `for job:<jobID> step:<n>`
//! 4. Anything else, kept as an unstructured error
//!
//! The shape is then classified: a `command` makes a Command event; on
//! non-raw lines a `⭐ Run ` message starts a step, a step or job result
//! ends one, and the continue-on-error notice marks it.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::workflow::Stage;

/// Message prefix of a step start.
pub const START_PREFIX: &str = "⭐ Run ";

/// Message logged when a failing step has `continue-on-error` set.
pub const CONTINUE_ON_ERROR_MESSAGE: &str = "Failed but continue next step";

static KEY_VALUE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^level=(?<level>[\w-]+)\smsg=(?<msg>.*)").expect("valid regex"));

static ERROR_SUMMARY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Error: (?<error>.*?)\. (?<msg>.*)").expect("valid regex"));

static JOB_SUFFIX_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?<msg>.*)for job:(?<job>\w+) step:(?<step>\d+)$").expect("valid regex")
});

static MARKER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^__::Interceptor::(?<stage>[^:]+)::(?<kind>[^:]+)::").expect("valid regex")
});

/// Classification of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    Start,
    End,
    Command,
    ContinueOnError,
    #[default]
    Log,
}

/// Normalized record derived from one log line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEvent {
    pub event: EventKind,
    pub level: String,
    pub msg: String,
    pub raw: Option<String>,
    pub error: Option<String>,
    pub job_id: Option<String>,
    pub step_id: Vec<String>,
    pub step_result: Option<String>,
    pub job_result: Option<String>,
    pub raw_output: bool,
    /// Step duration in nanoseconds
    pub execution_time: Option<u64>,
    pub command: Option<String>,
    pub arg: Option<String>,
    pub name: Option<String>,
    pub content: Option<String>,
}

impl LogEvent {
    /// Reads the known fields of a JSON log object.
    ///
    /// Every field is optional and read leniently: a value of an unexpected
    /// type is converted when it has an obvious text or number form and
    /// dropped otherwise, so any object yields an event.
    pub fn from_json(object: &Map<String, Value>) -> Self {
        let text = |key: &str| object.get(key).and_then(json_text);

        Self {
            event: EventKind::default(),
            level: text("level").unwrap_or_default(),
            msg: text("msg").unwrap_or_default(),
            raw: text("raw"),
            error: text("error"),
            job_id: text("jobID"),
            step_id: match object.get("stepID") {
                Some(Value::Array(items)) => items.iter().filter_map(json_text).collect(),
                Some(value) => json_text(value).into_iter().collect(),
                None => Vec::new(),
            },
            step_result: text("stepResult"),
            job_result: text("jobResult"),
            raw_output: object.get("raw_output").is_some_and(json_truthy),
            execution_time: object.get("executionTime").and_then(json_nanos),
            command: text("command"),
            arg: text("arg"),
            name: text("name"),
            content: text("content"),
        }
    }

    /// Id of the step slot inside the nested job, if any.
    pub fn step_slot(&self) -> Option<&str> {
        self.step_id.first().map(String::as_str)
    }

    /// Raw text of the line, falling back to the message.
    pub fn raw_text(&self) -> &str {
        self.raw.as_deref().unwrap_or(&self.msg)
    }
}

/// A line recognized by its outer shape, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawLine {
    Json(LogEvent),
    KeyValue {
        level: String,
        msg: String,
    },
    ErrorSummary {
        error: String,
        msg: String,
        job_id: Option<String>,
        step: Option<String>,
    },
    Unstructured(String),
}

impl RawLine {
    /// Recognizes the shape of a line, trying each format in precedence order.
    pub fn recognize(line: &str) -> Self {
        if let Some(event) = parse_json(line) {
            return RawLine::Json(event);
        }

        if let Some(caps) = KEY_VALUE_PATTERN.captures(line) {
            return RawLine::KeyValue {
                level: caps["level"].to_string(),
                msg: caps["msg"].to_string(),
            };
        }

        if let Some(caps) = ERROR_SUMMARY_PATTERN.captures(line) {
            let error = caps["error"].to_string();
            let detail = &caps["msg"];
            return match JOB_SUFFIX_PATTERN.captures(detail) {
                Some(suffix) => RawLine::ErrorSummary {
                    error,
                    msg: suffix["msg"].to_string(),
                    job_id: Some(suffix["job"].to_string()),
                    step: Some(suffix["step"].to_string()),
                },
                None => RawLine::ErrorSummary {
                    error,
                    msg: detail.to_string(),
                    job_id: None,
                    step: None,
                },
            };
        }

        RawLine::Unstructured(line.to_string())
    }

    fn into_event(self) -> LogEvent {
        match self {
            RawLine::Json(event) => event,
            RawLine::KeyValue { level, msg } => LogEvent {
                level,
                msg,
                ..LogEvent::default()
            },
            RawLine::ErrorSummary {
                error,
                msg,
                job_id,
                step,
            } => LogEvent {
                level: "error".to_string(),
                error: Some(error),
                msg,
                job_id,
                step_id: step.into_iter().collect(),
                ..LogEvent::default()
            },
            RawLine::Unstructured(line) => LogEvent {
                level: "error".to_string(),
                error: Some(line),
                ..LogEvent::default()
            },
        }
    }
}

fn parse_json(line: &str) -> Option<LogEvent> {
    match serde_json::from_str::<Value>(line).ok()? {
        Value::Object(object) => Some(LogEvent::from_json(&object)),
        _ => None,
    }
}

/// Text form of a scalar; structured values keep their JSON text.
fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

fn json_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Non-negative duration in nanoseconds, from an integer, float or numeric string.
fn json_nanos(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64().or_else(|| number.as_f64().and_then(float_nanos)),
        Value::String(text) => text.trim().parse::<f64>().ok().and_then(float_nanos),
        _ => None,
    }
}

fn float_nanos(value: f64) -> Option<u64> {
    (value.is_finite() && value >= 0.0).then(|| value.round() as u64)
}

/// Parses one log line into a classified, normalized event.
///
/// Never fails: unrecognized lines become an event carrying the whole
/// line as `error`, which the coordinator treats as fatal.
pub fn parse_line(line: &str) -> LogEvent {
    let mut event = RawLine::recognize(line).into_event();

    event.event = if event.command.is_some() {
        EventKind::Command
    } else if event.raw_output {
        EventKind::Log
    } else if event.msg.starts_with(START_PREFIX) {
        EventKind::Start
    } else if event.step_result.is_some() || event.job_result.is_some() {
        EventKind::End
    } else if event.msg.trim_end() == CONTINUE_ON_ERROR_MESSAGE {
        EventKind::ContinueOnError
    } else {
        EventKind::Log
    };

    if event.level == "warn" {
        event.level = "warning".to_string();
    }
    event.msg = event.msg.trim_end().to_string();
    if let Some(raw) = event.raw.as_mut() {
        if raw.ends_with('\n') {
            raw.pop();
        }
    }

    event
}

/// Boundary of a stage within a nested job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Start,
    End,
}

impl MarkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerKind::Start => "Start",
            MarkerKind::End => "End",
        }
    }
}

/// Sentinel printed by the interceptor steps: `__::Interceptor::<Stage>::<Kind>::`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleMarker {
    pub stage: Stage,
    pub kind: MarkerKind,
}

impl LifecycleMarker {
    pub fn new(stage: Stage, kind: MarkerKind) -> Self {
        Self { stage, kind }
    }

    /// Recognizes a marker at the start of a raw output message.
    pub fn parse(msg: &str) -> Option<Self> {
        let caps = MARKER_PATTERN.captures(msg)?;
        let stage = caps["stage"].parse().ok()?;
        let kind = match &caps["kind"] {
            "Start" => MarkerKind::Start,
            "End" => MarkerKind::End,
            _ => return None,
        };
        Some(Self { stage, kind })
    }
}

impl fmt::Display for LifecycleMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "__::Interceptor::{}::{}::", self.stage, self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_start() {
        let event = parse_line(
            r#"{"jobID":"Step0","stepID":["main"],"level":"info","msg":"⭐ Run Main make  "}"#,
        );
        assert_eq!(event.event, EventKind::Start);
        assert_eq!(event.job_id.as_deref(), Some("Step0"));
        assert_eq!(event.step_slot(), Some("main"));
        assert_eq!(event.msg, "⭐ Run Main make");
    }

    #[test]
    fn test_parse_json_end() {
        let event = parse_line(
            r#"{"jobID":"Step1","stepID":["main"],"level":"info","msg":"  ✅  Success - Main make","stepResult":"success","executionTime":1500000000}"#,
        );
        assert_eq!(event.event, EventKind::End);
        assert_eq!(event.step_result.as_deref(), Some("success"));
        assert_eq!(event.execution_time, Some(1_500_000_000));

        let event = parse_line(r#"{"jobID":"Step1","level":"info","msg":"🏁  Job succeeded","jobResult":"success"}"#);
        assert_eq!(event.event, EventKind::End);
        assert!(event.step_id.is_empty());
    }

    #[test]
    fn test_command_takes_precedence() {
        let event = parse_line(
            r#"{"jobID":"Step0","stepID":["main"],"level":"info","msg":"⭐ Run x","command":"set-output","name":"a","arg":"1","raw":"::set-output name=a::1\n"}"#,
        );
        assert_eq!(event.event, EventKind::Command);
        assert_eq!(event.raw.as_deref(), Some("::set-output name=a::1"));
    }

    #[test]
    fn test_raw_output_is_never_reclassified() {
        let event = parse_line(
            r#"{"jobID":"Step0","stepID":["main"],"level":"info","raw_output":true,"msg":"⭐ Run not a start\n","stepResult":"success"}"#,
        );
        assert_eq!(event.event, EventKind::Log);
        assert_eq!(event.msg, "⭐ Run not a start");
    }

    #[test]
    fn test_continue_on_error() {
        let event = parse_line(
            r#"{"jobID":"Step0","stepID":["main"],"level":"info","msg":"Failed but continue next step"}"#,
        );
        assert_eq!(event.event, EventKind::ContinueOnError);
    }

    #[test]
    fn test_key_value_line() {
        let event = parse_line("level=warn msg=something odd   ");
        assert_eq!(event.event, EventKind::Log);
        assert_eq!(event.level, "warning");
        assert_eq!(event.msg, "something odd");
        assert!(event.error.is_none());
    }

    #[test]
    fn test_error_summary_line() {
        let event = parse_line("Error: workflow is not valid. 'steps-workflow.yaml': Failed to match run-step: Line: 12 Column 7: Unknown Property foo");
        assert_eq!(event.level, "error");
        assert_eq!(event.error.as_deref(), Some("workflow is not valid"));
        assert!(event.msg.starts_with("'steps-workflow.yaml'"));
        assert!(event.job_id.is_none());
    }

    #[test]
    fn test_error_summary_with_job_suffix() {
        let event = parse_line("Error: failed to run. something broke for job:Step3 step:1");
        assert_eq!(event.error.as_deref(), Some("failed to run"));
        assert_eq!(event.msg, "something broke");
        assert_eq!(event.job_id.as_deref(), Some("Step3"));
        assert_eq!(event.step_id, vec!["1".to_string()]);
    }

    #[test]
    fn test_unstructured_line() {
        let event = parse_line("panic: runtime error");
        assert_eq!(event.error.as_deref(), Some("panic: runtime error"));
        assert_eq!(event.level, "error");
        assert_eq!(event.msg, "");

        assert!(matches!(RawLine::recognize("[1, 2]"), RawLine::Unstructured(_)));
    }

    #[test]
    fn test_json_with_float_execution_time() {
        let event = parse_line(
            r#"{"jobID":"Step0","stepID":["main"],"level":"info","msg":"done","stepResult":"success","executionTime":2.5e9}"#,
        );
        assert_eq!(event.event, EventKind::End);
        assert!(event.error.is_none());
        assert_eq!(event.execution_time, Some(2_500_000_000));

        let event = parse_line(r#"{"jobID":"Step0","msg":"x","executionTime":-1}"#);
        assert_eq!(event.execution_time, None);
        assert!(event.error.is_none());
    }

    #[test]
    fn test_json_with_null_step_id() {
        let event = parse_line(r#"{"jobID":"Step2","stepID":null,"level":"info","msg":"Job done","jobResult":"success"}"#);
        assert!(event.error.is_none());
        assert!(event.step_id.is_empty());
        assert_eq!(event.job_id.as_deref(), Some("Step2"));
        assert_eq!(event.event, EventKind::End);

        let event = parse_line(r#"{"jobID":"Step2","stepID":"main","msg":"⭐ Run Main make"}"#);
        assert_eq!(event.step_slot(), Some("main"));
    }

    #[test]
    fn test_json_with_string_raw_output() {
        let event = parse_line(
            r#"{"jobID":"Step0","stepID":["post"],"level":"info","raw_output":"true","msg":"__::Interceptor::Main::End::\n"}"#,
        );
        assert!(event.error.is_none());
        assert!(event.raw_output);
        assert_eq!(event.event, EventKind::Log);
        assert_eq!(event.msg, "__::Interceptor::Main::End::");

        let event = parse_line(r#"{"jobID":"Step0","raw_output":0,"msg":"⭐ Run Main make"}"#);
        assert!(!event.raw_output);
        assert_eq!(event.event, EventKind::Start);
    }

    #[test]
    fn test_json_with_unexpected_field_types() {
        let event = parse_line(r#"{"jobID":3,"level":["info"],"msg":{"text":"hi"},"error":null}"#);
        assert!(event.error.is_none());
        assert_eq!(event.job_id.as_deref(), Some("3"));
        assert_eq!(event.msg, r#"{"text":"hi"}"#);
        assert!(matches!(RawLine::recognize("{}"), RawLine::Json(_)));
    }

    #[test]
    fn test_marker_roundtrip() {
        let marker = LifecycleMarker::new(Stage::Main, MarkerKind::End);
        assert_eq!(marker.to_string(), "__::Interceptor::Main::End::");
        assert_eq!(LifecycleMarker::parse(&marker.to_string()), Some(marker));
        assert_eq!(LifecycleMarker::parse("__::Interceptor::Pre::Start::"),
            Some(LifecycleMarker::new(Stage::Pre, MarkerKind::Start)));
        assert_eq!(LifecycleMarker::parse("__::Interceptor::Main::Later::"), None);
        assert_eq!(LifecycleMarker::parse("hello"), None);
    }
}
