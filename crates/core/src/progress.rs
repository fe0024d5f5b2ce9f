//! Step-progress reducer.
//!
//! [`apply`] folds an [`AuditEvent`] into a [`ProgressState`] and returns
//! the next state. Events may arrive duplicated or out of order; the
//! reducer keeps the per-stage view monotonic:
//!
//! - stages before the reported step are forced to `Completed`/100,
//! - the reported step becomes `Running` with the larger of the stored
//!   and incoming progress, unless it already completed,
//! - later stages are left alone.
//!
//! A complete or error event makes the state terminal. Terminal states
//! absorb every later event unchanged.

use serde::{Deserialize, Serialize};

use crate::job_events::{AuditEvent, AuditFailure, ProgressUpdate};
use crate::stages::{StageCategory, StageDescriptor};

/// Upper bound of a stage's progress value.
pub const MAX_STAGE_PROGRESS: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

/// Mutable per-stage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    /// 0-100; always 100 when `status` is `Completed`.
    pub progress: u8,
}

impl StageState {
    pub const PENDING: Self = Self {
        status: StageStatus::Pending,
        progress: 0,
    };

    pub const COMPLETED: Self = Self {
        status: StageStatus::Completed,
        progress: MAX_STAGE_PROGRESS,
    };

    pub const ERROR: Self = Self {
        status: StageStatus::Error,
        progress: 0,
    };

    /// Running at `progress`, clamped to 100.
    pub fn running(progress: u8) -> Self {
        Self {
            status: StageStatus::Running,
            progress: progress.min(MAX_STAGE_PROGRESS),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Errored,
}

/// Ordered stage states for one job plus its terminal marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    stages: Vec<StageState>,
    terminal: Option<TerminalState>,
}

impl ProgressState {
    /// All stages pending, not terminal.
    pub fn new(stage_count: usize) -> Self {
        Self {
            stages: vec![StageState::PENDING; stage_count],
            terminal: None,
        }
    }

    /// Initial state sized to a pipeline.
    pub fn for_pipeline(pipeline: &[StageDescriptor]) -> Self {
        Self::new(pipeline.len())
    }

    pub fn stages(&self) -> &[StageState] {
        &self.stages
    }

    pub fn terminal(&self) -> Option<TerminalState> {
        self.terminal
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Index of the stage currently running, if any.
    pub fn running_step(&self) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.status == StageStatus::Running)
    }

    /// Mean of per-stage progress, rounded to the nearest integer.
    pub fn overall_progress(&self) -> u8 {
        if self.stages.is_empty() {
            return 0;
        }
        let sum: usize = self.stages.iter().map(|s| usize::from(s.progress)).sum();
        let count = self.stages.len();
        ((sum + count / 2) / count) as u8
    }

    /// Shorthand for [`apply`].
    pub fn apply(&self, event: &AuditEvent) -> Self {
        apply(self, event)
    }

    /// Derive the consumer-facing view by pairing each state with its
    /// descriptor.
    pub fn view(&self, pipeline: &[StageDescriptor]) -> JobProgressView {
        let stages = pipeline
            .iter()
            .zip(&self.stages)
            .map(|(descriptor, state)| StageView {
                id: descriptor.id,
                name: descriptor.name,
                category: descriptor.category,
                factors: descriptor.factors,
                status: state.status,
                progress: state.progress,
            })
            .collect();

        JobProgressView {
            stages,
            overall_progress: self.overall_progress(),
            current_step: self.running_step(),
            terminal: self.terminal,
        }
    }
}

/// Reduce one event into the next state.
pub fn apply(current: &ProgressState, event: &AuditEvent) -> ProgressState {
    if current.is_terminal() {
        return current.clone();
    }

    let mut next = current.clone();
    match event {
        AuditEvent::Progress(update) => apply_progress(&mut next.stages, update),
        AuditEvent::Complete(_) => {
            next.stages.fill(StageState::COMPLETED);
            next.terminal = Some(TerminalState::Completed);
        }
        AuditEvent::Error(failure) => {
            if let Some(index) = error_step(&next.stages, failure) {
                next.stages[index] = StageState::ERROR;
            }
            next.terminal = Some(TerminalState::Errored);
        }
    }
    next
}

fn apply_progress(stages: &mut [StageState], update: &ProgressUpdate) {
    let completed_prefix = update.current_step.min(stages.len());
    stages[..completed_prefix].fill(StageState::COMPLETED);

    if let Some(stage) = stages.get_mut(update.current_step) {
        if stage.status != StageStatus::Completed {
            let progress = stage.progress.max(update.step_progress);
            *stage = StageState::running(progress);
        }
    }
}

/// Stage an error is bound to: the explicit step, else the running
/// stage, else the first stage not yet completed.
fn error_step(stages: &[StageState], failure: &AuditFailure) -> Option<usize> {
    failure
        .current_step
        .filter(|&step| step < stages.len())
        .or_else(|| {
            stages
                .iter()
                .position(|s| s.status == StageStatus::Running)
        })
        .or_else(|| {
            stages
                .iter()
                .position(|s| s.status != StageStatus::Completed)
        })
}

/// One stage as presented to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageView {
    pub id: &'static str,
    pub name: &'static str,
    pub category: StageCategory,
    pub factors: u32,
    pub status: StageStatus,
    pub progress: u8,
}

/// Derived progress view of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgressView {
    pub stages: Vec<StageView>,
    pub overall_progress: u8,
    pub current_step: Option<usize>,
    pub terminal: Option<TerminalState>,
}
