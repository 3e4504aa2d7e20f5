//! Result Publishing
//!
//! Flushes what every step accumulated during a stage to the enclosing
//! job once all steps are completed, in step order:
//!
//! 1. The step transcript, as a collapsible group
//! 2. Outputs, under the plain key and under `<id>--<key>`
//! 3. Environment variables, path entries, summaries and masks
//! 4. In Main, `<id>--outcome` and `<id>--conclusion`

use log::debug;

use super::step::{end_glyph, StepRecord};
use super::table::StepTable;
use crate::environment::JobContext;
use crate::error::StageError;
use crate::workflow::{Stage, StepOutcome};

/// Publishes the results of every step of a completed stage.
pub fn publish_results(
    stage: Stage,
    table: &StepTable,
    context: &mut dyn JobContext,
) -> Result<(), StageError> {
    for step in table.iter() {
        publish_transcript(stage, step, context);
        publish_commands(stage, step, context)?;
    }
    Ok(())
}

fn publish_transcript(stage: Stage, step: &StepRecord, context: &mut dyn JobContext) {
    // Pre and Post only show steps that actually have a stage hook
    if stage != Stage::Main && step.outcome == Some(StepOutcome::Skipped) {
        return;
    }

    let title = format!(
        " {}{}",
        end_glyph(step.outcome),
        step.headline(stage)
    );
    context.start_group(&title);
    let transcript = step.transcript.strip_suffix('\n').unwrap_or(&step.transcript);
    if !transcript.is_empty() {
        context.write_line(transcript);
    }
    context.end_group();
    context.write_line("");
}

fn publish_commands(
    stage: Stage,
    step: &StepRecord,
    context: &mut dyn JobContext,
) -> Result<(), StageError> {
    let id = step.definition.id();
    let commands = &step.commands;

    for (key, value) in &commands.outputs {
        debug!("Set output: {}={}", key, value);
        context.set_output(key, value)?;
        if let Some(id) = id {
            context.set_output(&format!("{}--{}", id, key), value)?;
        }
    }
    for (key, value) in &commands.env {
        debug!("Set env: {}={}", key, value);
        context.export_variable(key, value)?;
    }
    for path in &commands.path {
        debug!("Add path: {}", path);
        context.add_path(path)?;
    }
    for summary in &commands.summary {
        context.append_summary(summary)?;
    }
    for secret in &commands.masks {
        debug!("Add mask: ***");
        context.set_secret(secret);
    }

    if stage == Stage::Main {
        if let Some(id) = id {
            let outcome = step.outcome.unwrap_or(StepOutcome::Skipped);
            let conclusion = step.conclusion().unwrap_or(StepOutcome::Skipped);
            context.set_output(&format!("{}--outcome", id), outcome.as_str())?;
            context.set_output(&format!("{}--conclusion", id), conclusion.as_str())?;
        }
    }
    Ok(())
}

/// Settles a completed stage: success unless some step concluded with a failure.
pub fn stage_verdict(table: &StepTable) -> Result<(), StageError> {
    let failed = table.failed_steps();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(StageError::StepsFailed(failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::actions::{Recorded, RecordingContext};
    use crate::workflow::{StepConfig, StepDefinition, StepStatus};

    fn completed_table() -> StepTable {
        let mut table = StepTable::new(&[
            StepDefinition::new(0, StepConfig::run("a").with_id("first"), vec![]),
            StepDefinition::new(1, StepConfig::run("b"), vec![]),
        ]);
        for index in 0..2 {
            let step = table.get_mut(index).unwrap();
            step.status = StepStatus::Completed;
            step.outcome = Some(StepOutcome::Success);
        }
        table
    }

    #[test]
    fn test_outputs_flat_and_namespaced() {
        let mut table = completed_table();
        table.get_mut(0).unwrap().commands.set_output("version", "1.2.3");
        table.get_mut(1).unwrap().commands.set_output("size", "42");

        let mut context = RecordingContext::new();
        publish_results(Stage::Main, &table, &mut context).unwrap();

        assert_eq!(context.output("version").as_deref(), Some("1.2.3"));
        assert_eq!(context.output("first--version").as_deref(), Some("1.2.3"));
        assert_eq!(context.output("size").as_deref(), Some("42"));
        assert_eq!(context.output("first--outcome").as_deref(), Some("success"));
        assert_eq!(context.output("first--conclusion").as_deref(), Some("success"));
    }

    #[test]
    fn test_outcome_outputs_only_in_main() {
        let table = completed_table();
        let mut context = RecordingContext::new();
        publish_results(Stage::Post, &table, &mut context).unwrap();
        assert!(context.output("first--outcome").is_none());
    }

    #[test]
    fn test_commands_published() {
        let mut table = completed_table();
        {
            let step = table.get_mut(1).unwrap();
            step.commands.set_env("TOOL_HOME", "/opt/tool");
            step.commands.path.push("/opt/tool/bin".to_string());
            step.commands.summary.push("## Done".to_string());
            step.commands.masks.push("hunter2".to_string());
        }

        let mut context = RecordingContext::new();
        publish_results(Stage::Main, &table, &mut context).unwrap();

        assert!(context.contains(&Recorded::Variable("TOOL_HOME".into(), "/opt/tool".into())));
        assert!(context.contains(&Recorded::Path("/opt/tool/bin".into())));
        assert!(context.contains(&Recorded::Summary("## Done".into())));
        assert!(context.contains(&Recorded::Secret("hunter2".into())));
    }

    #[test]
    fn test_transcript_group() {
        let mut table = completed_table();
        table.get_mut(0).unwrap().append("hello");

        let mut context = RecordingContext::new();
        publish_results(Stage::Main, &table, &mut context).unwrap();

        let titles = context.group_titles();
        assert_eq!(titles.len(), 2);
        assert!(titles[0].contains("Run a"));
        assert!(context.lines().contains(&"hello".to_string()));
    }

    #[test]
    fn test_skipped_hidden_outside_main() {
        let mut table = completed_table();
        table.get_mut(1).unwrap().outcome = Some(StepOutcome::Skipped);

        let mut context = RecordingContext::new();
        publish_results(Stage::Pre, &table, &mut context).unwrap();
        assert_eq!(context.group_titles().len(), 1);

        let mut context = RecordingContext::new();
        publish_results(Stage::Main, &table, &mut context).unwrap();
        assert_eq!(context.group_titles().len(), 2);
    }

    #[test]
    fn test_stage_verdict() {
        let mut table = completed_table();
        assert!(stage_verdict(&table).is_ok());

        table.get_mut(1).unwrap().outcome = Some(StepOutcome::Failure);
        assert!(matches!(stage_verdict(&table), Err(StageError::StepsFailed(ref f)) if f == &vec![1]));

        table.get_mut(1).unwrap().continue_on_error = true;
        assert!(stage_verdict(&table).is_ok());
    }
}
