//! Invariant checks for the progress reducer.
//!
//! Rather than random generation these tests enumerate every short event
//! sequence over a small grid of steps and progress values, so any
//! violation is reproducible from the failing sequence alone.

use sitescope_core::job_events::AuditEvent;
use sitescope_core::progress::{ProgressState, StageState, StageStatus, TerminalState};
use sitescope_core::stages::audit_pipeline;

const STAGES: usize = 4;
const STEPS: [usize; 4] = [0, 1, 2, 3];
const PROGRESS: [u8; 3] = [0, 50, 100];

/// Every (step, progress) pair on the grid.
fn grid() -> Vec<(usize, u8)> {
    STEPS
        .iter()
        .flat_map(|&s| PROGRESS.iter().map(move |&p| (s, p)))
        .collect()
}

/// All sequences of length `len` drawn from the grid.
fn sequences(len: usize) -> Vec<Vec<(usize, u8)>> {
    let mut out = vec![Vec::new()];
    for _ in 0..len {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                grid().into_iter().map(move |item| {
                    let mut next = prefix.clone();
                    next.push(item);
                    next
                })
            })
            .collect();
    }
    out
}

fn fold(events: &[(usize, u8)]) -> Vec<ProgressState> {
    let mut states = vec![ProgressState::new(STAGES)];
    for &(step, progress) in events {
        let next = states[states.len() - 1].apply(&AuditEvent::progress(step, progress));
        states.push(next);
    }
    states
}

fn assert_structural_invariants(state: &ProgressState, context: &[(usize, u8)]) {
    let stages = state.stages();
    let running: Vec<_> = stages
        .iter()
        .enumerate()
        .filter(|(_, s)| s.status == StageStatus::Running)
        .map(|(i, _)| i)
        .collect();

    assert!(running.len() <= 1, "more than one running stage after {context:?}");

    if let Some(&r) = running.first() {
        assert!(
            stages[..r].iter().all(|s| *s == StageState::COMPLETED),
            "stage before running index not completed after {context:?}"
        );
    }

    for stage in stages {
        if stage.status == StageStatus::Completed {
            assert_eq!(stage.progress, 100, "completed stage below 100 after {context:?}");
        }
    }
}

// ---------------------------------------------------------------------------
// Test: non-decreasing steps give a completed prefix and a running current
// ---------------------------------------------------------------------------

#[test]
fn non_decreasing_steps_complete_prefix_and_run_current() {
    for seq in sequences(3) {
        if seq.windows(2).any(|w| w[1].0 < w[0].0) {
            continue;
        }
        let state = fold(&seq).pop().expect("at least the initial state");
        let last_step = seq.last().map(|&(s, _)| s).unwrap_or(0);

        for (i, stage) in state.stages().iter().enumerate() {
            if i < last_step {
                assert_eq!(*stage, StageState::COMPLETED, "seq {seq:?}");
            }
        }

        let current = state.stages()[last_step];
        // A step that reports 100 stays running until the next step arrives.
        assert_eq!(current.status, StageStatus::Running, "seq {seq:?}");
    }
}

// ---------------------------------------------------------------------------
// Test: arbitrary orderings never regress and keep structural invariants
// ---------------------------------------------------------------------------

#[test]
fn arbitrary_orderings_never_regress() {
    for seq in sequences(3) {
        let states = fold(&seq);
        for pair in states.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            assert_structural_invariants(after, &seq);

            for (b, a) in before.stages().iter().zip(after.stages()) {
                assert!(a.progress >= b.progress, "progress regressed in {seq:?}");
                if b.status == StageStatus::Completed {
                    assert_eq!(a.status, StageStatus::Completed, "completed regressed in {seq:?}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test: completion overrides any prior state
// ---------------------------------------------------------------------------

#[test]
fn completion_overrides_any_prior_state() {
    for seq in sequences(2) {
        let state = fold(&seq)
            .pop()
            .expect("at least the initial state")
            .apply(&AuditEvent::Complete(serde_json::json!({"score": 87})));

        assert!(state.stages().iter().all(|s| *s == StageState::COMPLETED));
        assert_eq!(state.terminal(), Some(TerminalState::Completed));
    }
}

// ---------------------------------------------------------------------------
// Test: comprehensive-job scenario from a live channel
// ---------------------------------------------------------------------------

#[test]
fn step_one_at_fifty_percent_view() {
    let pipeline = audit_pipeline();
    let view = ProgressState::for_pipeline(pipeline)
        .apply(&AuditEvent::progress(1, 50))
        .view(pipeline);

    let summary: Vec<_> = view.stages.iter().map(|s| (s.status, s.progress)).collect();
    assert_eq!(
        summary,
        [
            (StageStatus::Completed, 100),
            (StageStatus::Running, 50),
            (StageStatus::Pending, 0),
            (StageStatus::Pending, 0),
        ]
    );
}
