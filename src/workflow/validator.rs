//! Steps Validation
//!
//! Validation rules applied to the steps input before anything is spawned:
//! - Identifier syntax and uniqueness
//! - Parallelism limit
//! - Dependency reference integrity
//! - Dependency graph acyclicity

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::model::{StepConfig, StepReference};

static STEP_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]{1,100}$").expect("STEP_ID_PATTERN must compile")
});

/// Configuration errors in the steps input.
///
/// All of them are fatal before any stage runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid steps input - Invalid YAML - {0}")]
    InvalidYaml(String),

    #[error("Invalid steps input - Must be an YAML array")]
    NotAnArray,

    #[error("Invalid steps input - Must contain at least one step")]
    Empty,

    #[error("Invalid steps input - Step {index}: {message}")]
    InvalidStep { index: usize, message: String },

    #[error("Invalid steps input - Parallel steps are limited to the number of available CPUs ({limit})")]
    TooManySteps { count: usize, limit: usize },

    #[error("Invalid steps input - The identifier '{0}' is invalid. IDs may only contain alphanumeric characters, '_', and '-'. IDs must start with a letter or '_' and must be less than 100 characters.")]
    InvalidId(String),

    #[error("Invalid steps input - The identifier '{0}' may not be used more than once within the same scope.")]
    DuplicateId(String),

    #[error("Invalid steps input - Step {step} needs unknown step '{reference}'")]
    UnknownReference { step: usize, reference: String },

    #[error("Invalid steps input - Step {0} may not need itself")]
    SelfReference(usize),

    #[error("Invalid steps input - Step {step} needs step '{reference}' more than once")]
    DuplicateReference { step: usize, reference: String },

    #[error("Invalid steps input - Steps {0:?} depend on each other in a loop")]
    CyclicDependency(Vec<usize>),
}

/// Checks that the number of steps fits the parallelism limit.
pub fn check_step_limit(count: usize, limit: usize) -> Result<(), ValidationError> {
    if count > limit {
        return Err(ValidationError::TooManySteps { count, limit });
    }
    Ok(())
}

/// Validates identifier syntax and uniqueness.
pub fn validate_identifiers(steps: &[StepConfig]) -> Result<(), ValidationError> {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in steps {
        let Some(id) = step.id.as_deref() else {
            continue;
        };
        if !STEP_ID_PATTERN.is_match(id) {
            return Err(ValidationError::InvalidId(id.to_string()));
        }
        if !seen_ids.insert(id) {
            return Err(ValidationError::DuplicateId(id.to_string()));
        }
    }
    Ok(())
}

/// Resolves each step's `needs` references into step indices.
///
/// References may name a step by position or by id. Unknown, self and
/// repeated references are rejected.
pub fn resolve_needs(steps: &[StepConfig]) -> Result<Vec<Vec<usize>>, ValidationError> {
    let ids: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .filter_map(|(index, step)| step.id.as_deref().map(|id| (id, index)))
        .collect();

    let mut resolved = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        let mut needs = Vec::with_capacity(step.needs.len());
        for reference in &step.needs {
            let target = match reference {
                StepReference::Index(target) if *target < steps.len() => Some(*target),
                StepReference::Index(_) => None,
                StepReference::Id(id) => ids.get(id.as_str()).copied(),
            };
            let Some(target) = target else {
                return Err(ValidationError::UnknownReference {
                    step: index,
                    reference: reference.to_string(),
                });
            };
            if target == index {
                return Err(ValidationError::SelfReference(index));
            }
            if needs.contains(&target) {
                return Err(ValidationError::DuplicateReference {
                    step: index,
                    reference: reference.to_string(),
                });
            }
            needs.push(target);
        }

        if needs.is_empty() {
            debug!("Step {} is a root step (no dependencies)", index);
        }
        resolved.push(needs);
    }

    Ok(resolved)
}

/// Rejects dependency graphs containing a cycle, using Kahn's algorithm.
///
/// A cycle would leave its steps queued forever because none of them
/// could ever be triggered.
pub fn check_acyclic(needs: &[Vec<usize>]) -> Result<(), ValidationError> {
    let mut in_degree: Vec<usize> = needs.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); needs.len()];
    for (index, step_needs) in needs.iter().enumerate() {
        for &need in step_needs {
            dependents[need].push(index);
        }
    }

    let mut queue: VecDeque<usize> = (0..needs.len())
        .filter(|&index| in_degree[index] == 0)
        .collect();
    let mut visited = 0;

    while let Some(current) = queue.pop_front() {
        visited += 1;
        for &successor in &dependents[current] {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                queue.push_back(successor);
            }
        }
    }

    if visited != needs.len() {
        let cycle: Vec<usize> = (0..needs.len())
            .filter(|&index| in_degree[index] > 0)
            .collect();
        return Err(ValidationError::CyclicDependency(cycle));
    }

    info!("Dependency graph validated: {} steps", needs.len());
    Ok(())
}
