//! Deterministic stand-in for the live event channel.
//!
//! [`SimulatedSchedule`] yields the same [`AuditEvent`] shapes the backend
//! would send: for each stage in order, progress at 0, 10, ..., 100, then
//! one synthetic completion. The sequence is finite and restartable, so
//! the number of ticks a simulated job takes depends only on the stage
//! count.

use crate::job_events::AuditEvent;
use crate::stages::StageDescriptor;

/// Step between consecutive simulated progress values.
pub const SIMULATED_PROGRESS_INCREMENT: u8 = 10;

/// Progress events emitted per stage (0 through 100 inclusive).
pub const SIMULATED_STEPS_PER_STAGE: usize = (100 / SIMULATED_PROGRESS_INCREMENT as usize) + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedSchedule {
    stage_count: usize,
    cursor: usize,
}

impl SimulatedSchedule {
    pub fn new(stage_count: usize) -> Self {
        Self {
            stage_count,
            cursor: 0,
        }
    }

    pub fn for_pipeline(pipeline: &[StageDescriptor]) -> Self {
        Self::new(pipeline.len())
    }

    /// Rewind to the first event.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    /// Length of the full sequence, completion included.
    pub fn total_events(&self) -> usize {
        self.stage_count * SIMULATED_STEPS_PER_STAGE + 1
    }

    fn event_at(&self, index: usize) -> Option<AuditEvent> {
        let progress_events = self.stage_count * SIMULATED_STEPS_PER_STAGE;
        if index < progress_events {
            let step = index / SIMULATED_STEPS_PER_STAGE;
            let tick = (index % SIMULATED_STEPS_PER_STAGE) as u8;
            Some(AuditEvent::progress(
                step,
                tick * SIMULATED_PROGRESS_INCREMENT,
            ))
        } else if index == progress_events {
            Some(AuditEvent::Complete(serde_json::json!({ "simulated": true })))
        } else {
            None
        }
    }
}

impl Iterator for SimulatedSchedule {
    type Item = AuditEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.event_at(self.cursor)?;
        self.cursor += 1;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total_events().saturating_sub(self.cursor);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SimulatedSchedule {}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::progress::{ProgressState, StageState, TerminalState};

    #[test]
    fn first_stage_walks_through_fixed_schedule() {
        let values: Vec<_> = SimulatedSchedule::new(4)
            .take(SIMULATED_STEPS_PER_STAGE)
            .collect();
        let expected: Vec<_> = (0..=10).map(|i| AuditEvent::progress(0, i * 10)).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn moves_to_next_stage_after_hundred() {
        let mut schedule = SimulatedSchedule::new(4).skip(SIMULATED_STEPS_PER_STAGE);
        assert_eq!(schedule.next(), Some(AuditEvent::progress(1, 0)));
    }

    #[test]
    fn ends_with_a_single_completion() {
        let events: Vec<_> = SimulatedSchedule::new(4).collect();
        assert_eq!(events.len(), 45);
        assert_eq!(
            events.last(),
            Some(&AuditEvent::Complete(json!({"simulated": true})))
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn size_hint_tracks_cursor() {
        let mut schedule = SimulatedSchedule::new(2);
        assert_eq!(schedule.len(), 23);
        schedule.next();
        assert_eq!(schedule.len(), 22);
    }

    #[test]
    fn restart_replays_from_the_beginning() {
        let mut schedule = SimulatedSchedule::new(1);
        let first: Vec<_> = schedule.by_ref().collect();
        assert_eq!(schedule.next(), None);

        schedule.restart();
        let second: Vec<_> = schedule.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn folding_the_schedule_completes_every_stage() {
        let state = SimulatedSchedule::new(4).fold(ProgressState::new(4), |s, e| s.apply(&e));
        assert!(state.stages().iter().all(|s| *s == StageState::COMPLETED));
        assert_eq!(state.terminal(), Some(TerminalState::Completed));
    }

    #[test]
    fn zero_stages_only_completes() {
        let events: Vec<_> = SimulatedSchedule::new(0).collect();
        assert_eq!(events.len(), 1);
    }
}
