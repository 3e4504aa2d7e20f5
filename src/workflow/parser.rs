//! Steps Input Parser
//!
//! Turns the raw YAML steps input into validated [`StepDefinition`]s.

use log::{debug, info};
use serde_yaml::Value;

use super::model::{StepConfig, StepDefinition};
use super::validator::{
    check_acyclic, check_step_limit, resolve_needs, validate_identifiers, ValidationError,
};

/// Parses and validates the steps input.
///
/// This function:
/// 1. Parses the YAML and requires a non-empty sequence
/// 2. Enforces the parallel step limit
/// 3. Validates identifiers
/// 4. Resolves `needs` references to indices
/// 5. Rejects dependency cycles
///
/// # Example
///
/// ```
/// use steps_runner::workflow::parse_steps_input;
///
/// let steps = parse_steps_input("- id: build\n  run: make\n- run: make test\n  needs: build", 4)
///     .unwrap();
/// assert_eq!(steps[1].needs, vec![0]);
/// ```
pub fn parse_steps_input(
    input: &str,
    max_steps: usize,
) -> Result<Vec<StepDefinition>, ValidationError> {
    let document: Value =
        serde_yaml::from_str(input).map_err(|e| ValidationError::InvalidYaml(e.to_string()))?;

    let Value::Sequence(items) = document else {
        return Err(ValidationError::NotAnArray);
    };

    if items.is_empty() {
        return Err(ValidationError::Empty);
    }

    check_step_limit(items.len(), max_steps)?;

    let configs = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_yaml::from_value::<StepConfig>(item).map_err(|e| {
                ValidationError::InvalidStep {
                    index,
                    message: e.to_string(),
                }
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    debug!("Steps input parsed ({} steps)", configs.len());

    validate_identifiers(&configs)?;
    let needs = resolve_needs(&configs)?;
    check_acyclic(&needs)?;

    let steps: Vec<StepDefinition> = configs
        .into_iter()
        .zip(needs)
        .enumerate()
        .map(|(index, (config, needs))| StepDefinition::new(index, config, needs))
        .collect();

    info!("Loaded {} steps", steps.len());
    Ok(steps)
}
