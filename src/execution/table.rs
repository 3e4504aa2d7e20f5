//! Step Table
//!
//! Registry of the steps of one stage and their dependency graph. Built
//! once per stage invocation; the nested runner's job ids are resolved
//! against it by index.

use log::debug;

use super::step::StepRecord;
use crate::sync::TriggerMessage;
use crate::workflow::{parse_job_index, StepDefinition, StepOutcome, StepStatus};

#[derive(Debug, Clone)]
pub struct StepTable {
    steps: Vec<StepRecord>,
    /// Direct dependents of each step
    dependents: Vec<Vec<usize>>,
    /// Steps already handed a Main trigger
    triggered: Vec<bool>,
}

impl StepTable {
    pub fn new(definitions: &[StepDefinition]) -> Self {
        let mut dependents = vec![Vec::new(); definitions.len()];
        for definition in definitions {
            for &need in &definition.needs {
                if let Some(list) = dependents.get_mut(need) {
                    list.push(definition.index);
                }
            }
        }

        Self {
            steps: definitions.iter().cloned().map(StepRecord::new).collect(),
            dependents,
            triggered: vec![false; definitions.len()],
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StepRecord> {
        self.steps.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut StepRecord> {
        self.steps.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter()
    }

    /// Resolves a nested job id to the index of a known step.
    pub fn resolve_job(&self, job_id: &str) -> Option<usize> {
        parse_job_index(job_id).filter(|&index| index < self.steps.len())
    }

    /// Steps without dependencies.
    pub fn roots(&self) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|step| step.definition.needs.is_empty())
            .map(StepRecord::index)
            .collect()
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        self.dependents
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn all_completed(&self) -> bool {
        self.steps.iter().all(StepRecord::is_completed)
    }

    /// Marks a step as triggered; returns false if it already was.
    pub fn mark_triggered(&mut self, index: usize) -> bool {
        match self.triggered.get_mut(index) {
            Some(flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    /// Decides the dependents of `index` that can be released now.
    ///
    /// A dependent is released once it is still queued, not yet triggered,
    /// and every one of its dependencies is completed. It is skipped when
    /// any dependency did not conclude with success.
    pub fn ready_dependents(&self, index: usize) -> Vec<(usize, TriggerMessage)> {
        self.dependents(index)
            .iter()
            .copied()
            .filter(|&dependent| {
                self.triggered.get(dependent) == Some(&false)
                    && self.steps[dependent].status == StepStatus::Queued
            })
            .filter_map(|dependent| {
                let needs = &self.steps[dependent].definition.needs;
                if !needs.iter().all(|&need| self.steps[need].is_completed()) {
                    return None;
                }

                let all_succeeded = needs
                    .iter()
                    .all(|&need| self.steps[need].conclusion() == Some(StepOutcome::Success));
                let decision = if all_succeeded {
                    TriggerMessage::Continue
                } else {
                    TriggerMessage::Skip
                };
                debug!("Step {} is ready: {}", dependent, decision);
                Some((dependent, decision))
            })
            .collect()
    }

    /// Indices of steps whose conclusion is a failure.
    pub fn failed_steps(&self) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|step| step.conclusion() == Some(StepOutcome::Failure))
            .map(StepRecord::index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepConfig;

    /// 0 and 1 are roots, 2 needs both, 3 needs 2.
    fn diamond() -> StepTable {
        StepTable::new(&[
            StepDefinition::new(0, StepConfig::run("a"), vec![]),
            StepDefinition::new(1, StepConfig::run("b"), vec![]),
            StepDefinition::new(2, StepConfig::run("c"), vec![0, 1]),
            StepDefinition::new(3, StepConfig::run("d"), vec![2]),
        ])
    }

    fn complete(table: &mut StepTable, index: usize, outcome: StepOutcome) {
        let step = table.get_mut(index).unwrap();
        step.status = StepStatus::Completed;
        step.outcome = Some(outcome);
    }

    #[test]
    fn test_roots_and_dependents() {
        let table = diamond();
        assert_eq!(table.roots(), vec![0, 1]);
        assert_eq!(table.dependents(0), &[2]);
        assert_eq!(table.dependents(2), &[3]);
        assert!(table.dependents(3).is_empty());
        assert!(table.dependents(9).is_empty());
    }

    #[test]
    fn test_resolve_job() {
        let table = diamond();
        assert_eq!(table.resolve_job("Step3"), Some(3));
        assert_eq!(table.resolve_job("Step4"), None);
        assert_eq!(table.resolve_job("bogus"), None);
    }

    #[test]
    fn test_dependent_waits_for_all_needs() {
        let mut table = diamond();
        complete(&mut table, 0, StepOutcome::Success);
        assert!(table.ready_dependents(0).is_empty());

        complete(&mut table, 1, StepOutcome::Success);
        assert_eq!(table.ready_dependents(1), vec![(2, TriggerMessage::Continue)]);
    }

    #[test]
    fn test_dependent_skipped_on_failed_need() {
        let mut table = diamond();
        complete(&mut table, 0, StepOutcome::Failure);
        complete(&mut table, 1, StepOutcome::Success);
        assert_eq!(table.ready_dependents(1), vec![(2, TriggerMessage::Skip)]);
    }

    #[test]
    fn test_dependent_skipped_on_skipped_need() {
        let mut table = diamond();
        complete(&mut table, 0, StepOutcome::Success);
        complete(&mut table, 1, StepOutcome::Skipped);
        assert_eq!(table.ready_dependents(0), vec![(2, TriggerMessage::Skip)]);
    }

    #[test]
    fn test_continue_on_error_need_counts_as_success() {
        let mut table = diamond();
        complete(&mut table, 0, StepOutcome::Failure);
        table.get_mut(0).unwrap().continue_on_error = true;
        complete(&mut table, 1, StepOutcome::Success);
        assert_eq!(table.ready_dependents(0), vec![(2, TriggerMessage::Continue)]);
    }

    #[test]
    fn test_triggered_dependent_not_released_twice() {
        let mut table = diamond();
        complete(&mut table, 0, StepOutcome::Success);
        complete(&mut table, 1, StepOutcome::Success);

        assert!(table.mark_triggered(2));
        assert!(!table.mark_triggered(2));
        assert!(table.ready_dependents(1).is_empty());
    }

    #[test]
    fn test_failed_steps_and_completion() {
        let mut table = diamond();
        assert!(!table.all_completed());
        for index in 0..4 {
            complete(&mut table, index, StepOutcome::Success);
        }
        table.get_mut(3).unwrap().outcome = Some(StepOutcome::Failure);

        assert!(table.all_completed());
        assert_eq!(table.failed_steps(), vec![3]);
    }
}
