//! Stage Timeline
//!
//! Records when each step starts and ends within one stage, as observed
//! by the orchestrator, and renders them as a Gantt chart for debug logs.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::workflow::StepOutcome;

/// Kind of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineMark {
    Started,
    /// Ended, with the outcome known at that time
    Ended(Option<StepOutcome>),
}

/// A single observation in the timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step: usize,
    pub mark: TimelineMark,
    pub timestamp: Instant,
}

/// Tracks step start/end times of one stage.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn step_started(&mut self, step: usize) {
        self.push(step, TimelineMark::Started);
    }

    pub fn step_ended(&mut self, step: usize, outcome: Option<StepOutcome>) {
        self.push(step, TimelineMark::Ended(outcome));
    }

    fn push(&mut self, step: usize, mark: TimelineMark) {
        self.events.push(TimelineEvent {
            step,
            mark,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns `(start, end)` offsets of every step that both started and ended.
    fn spans(&self) -> BTreeMap<usize, (Duration, Duration, Option<StepOutcome>)> {
        let mut starts = BTreeMap::new();
        let mut spans = BTreeMap::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time);
            match event.mark {
                TimelineMark::Started => {
                    starts.insert(event.step, offset);
                }
                TimelineMark::Ended(outcome) => {
                    if let Some(start) = starts.get(&event.step) {
                        spans.insert(event.step, (*start, offset, outcome));
                    }
                }
            }
        }
        spans
    }

    /// Step durations, for steps that ran.
    pub fn durations(&self) -> BTreeMap<usize, Duration> {
        self.spans()
            .into_iter()
            .map(|(step, (start, end, _))| (step, end.saturating_sub(start)))
            .collect()
    }

    /// Renders an ASCII Gantt chart, one row per step that ran.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nStage Timeline:\n\n");

        let total = self.elapsed().as_millis();
        if total == 0 {
            return output;
        }

        let scale = 50.0 / total as f64;
        let mut rows: Vec<_> = self.spans().into_iter().collect();
        rows.sort_by_key(|(_, (start, _, _))| *start);

        for (step, (start, end, outcome)) in rows {
            let start_pos = (start.as_millis() as f64 * scale) as usize;
            let width = ((end - start).as_millis() as f64 * scale).max(1.0) as usize;
            let fill = match outcome {
                Some(StepOutcome::Failure) => "x",
                Some(StepOutcome::Skipped) => "-",
                _ => "#",
            };

            output.push_str(&format!(
                "[{:>3}] |{}{}| ({} ms)\n",
                step,
                " ".repeat(start_pos),
                fill.repeat(width),
                (end - start).as_millis()
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_durations_only_for_ended_steps() {
        let mut timeline = ExecutionTimeline::new();
        timeline.step_started(0);
        timeline.step_started(1);
        thread::sleep(Duration::from_millis(20));
        timeline.step_ended(0, Some(StepOutcome::Success));

        let durations = timeline.durations();
        assert!(durations[&0] >= Duration::from_millis(20));
        assert!(!durations.contains_key(&1));
        assert_eq!(timeline.events().len(), 3);
    }

    #[test]
    fn test_end_without_start_is_ignored() {
        let mut timeline = ExecutionTimeline::new();
        timeline.step_ended(2, Some(StepOutcome::Skipped));
        assert!(timeline.durations().is_empty());
    }

    #[test]
    fn test_gantt_chart() {
        let mut timeline = ExecutionTimeline::new();
        timeline.step_started(0);
        thread::sleep(Duration::from_millis(30));
        timeline.step_ended(0, Some(StepOutcome::Success));
        timeline.step_started(1);
        thread::sleep(Duration::from_millis(30));
        timeline.step_ended(1, Some(StepOutcome::Failure));

        let chart = timeline.gantt_chart();
        assert!(chart.contains("[  0]"));
        assert!(chart.contains("[  1]"));
        assert!(chart.contains('x'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::default().gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains('|'));
    }
}
