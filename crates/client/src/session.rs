//! One audit job bound to its lifecycle.
//!
//! A [`JobSession`] is created by starting a job. It owns a driver task
//! that pulls events from a [`ProgressSource`], folds them through the
//! progress reducer and publishes the resulting [`JobView`] on a
//! [`tokio::sync::watch`] channel.
//!
//! Once the job reaches `Completed`, `Errored` or `Cancelled` the view is
//! frozen: later events are ignored and the job's channel subscriptions
//! are released exactly once. Dropping the session cancels it.
//!
//! There is no session before the job exists: an idle job has no
//! `JobSession`, and the start call in flight inside [`JobSession::start`]
//! is the starting step. A failed start returns [`SessionError`] instead of
//! a session, so [`JobPhase`] begins at `InProgress`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use sitescope_core::job_events::AuditEvent;
use sitescope_core::progress::{JobProgressView, ProgressState, TerminalState};
use sitescope_core::stages::{audit_pipeline, StageDescriptor};
use sitescope_core::types::JobId;
use sitescope_events::{EventDispatcher, Subscription};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, AuditApi, StartAuditRequest};
use crate::connection::ConnectionState;
use crate::source::{ProgressSource, SimulatedSource, SourceKind, WireSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    InProgress,
    Completed,
    Errored,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

impl From<Option<TerminalState>> for JobPhase {
    fn from(terminal: Option<TerminalState>) -> Self {
        match terminal {
            None => Self::InProgress,
            Some(TerminalState::Completed) => Self::Completed,
            Some(TerminalState::Errored) => Self::Errored,
        }
    }
}

/// Everything a consumer needs to render one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub phase: JobPhase,
    pub source: SourceKind,
    pub progress: JobProgressView,
    /// Error text once the job has `Errored`.
    pub error: Option<String>,
    /// Result payload once the job has `Completed`.
    pub result: Option<serde_json::Value>,
}

/// Errors produced while starting a job.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to start audit: {0}")]
    Start(#[from] ApiError),
}

/// A running (or finished) audit job.
pub struct JobSession {
    shared: Arc<SessionShared>,
    view_rx: watch::Receiver<JobView>,
    task: JoinHandle<()>,
}

struct SessionShared {
    job_id: JobId,
    pipeline: &'static [StageDescriptor],
    cancel: CancellationToken,
    subscriptions: Mutex<Vec<Subscription>>,
    view_tx: watch::Sender<JobView>,
}

impl JobSession {
    /// Issue the start call and bind the new job to a progress source.
    ///
    /// The wire source is used when `connection` is `Connected` at this
    /// moment, the simulated one otherwise. The choice is not revisited.
    pub async fn start(
        api: &AuditApi,
        dispatcher: &EventDispatcher,
        connection: watch::Receiver<ConnectionState>,
        request: &StartAuditRequest,
        simulation_tick: Duration,
    ) -> Result<Self, SessionError> {
        tracing::debug!(url = %request.url, "Starting audit job");
        let started = api.start_audit(request).await?;
        let job_id = started.job_id;
        let pipeline = audit_pipeline();

        let live = *connection.borrow() == ConnectionState::Connected;
        let session = if live {
            let (source, subscriptions) = WireSource::subscribe(dispatcher, &job_id, connection);
            Self::with_source(job_id, pipeline, Box::new(source), subscriptions)
        } else {
            tracing::info!(job_id = %job_id, "Event channel unavailable, simulating progress");
            let source = SimulatedSource::for_pipeline(pipeline, simulation_tick);
            Self::with_source(job_id, pipeline, Box::new(source), Vec::new())
        };
        Ok(session)
    }

    /// Drive an already-started job from an arbitrary source.
    ///
    /// `subscriptions` are held until the job ends. Must be called from
    /// within a Tokio runtime.
    pub fn with_source(
        job_id: impl Into<JobId>,
        pipeline: &'static [StageDescriptor],
        source: Box<dyn ProgressSource>,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        let job_id = job_id.into();
        let initial = JobView {
            job_id: job_id.clone(),
            phase: JobPhase::InProgress,
            source: source.kind(),
            progress: ProgressState::for_pipeline(pipeline).view(pipeline),
            error: None,
            result: None,
        };
        let (view_tx, view_rx) = watch::channel(initial);

        let shared = Arc::new(SessionShared {
            job_id,
            pipeline,
            cancel: CancellationToken::new(),
            subscriptions: Mutex::new(subscriptions),
            view_tx,
        });

        tracing::info!(job_id = %shared.job_id, source = ?source.kind(), "Audit job in progress");
        let task = tokio::spawn(drive(Arc::clone(&shared), source));

        Self {
            shared,
            view_rx,
            task,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.shared.job_id
    }

    pub fn source(&self) -> SourceKind {
        self.view_rx.borrow().source
    }

    pub fn phase(&self) -> JobPhase {
        self.view_rx.borrow().phase
    }

    /// Current snapshot.
    pub fn view(&self) -> JobView {
        self.view_rx.borrow().clone()
    }

    /// Observe view changes.
    pub fn watch(&self) -> watch::Receiver<JobView> {
        self.view_rx.clone()
    }

    /// Channel subscriptions still held for this job.
    pub fn subscription_count(&self) -> usize {
        self.shared.lock_subscriptions().len()
    }

    /// Resolve with the view once the job is terminal.
    pub async fn wait(&self) -> JobView {
        let mut rx = self.view_rx.clone();
        let result = rx.wait_for(|view| view.phase.is_terminal()).await;
        match result {
            Ok(view) => view.clone(),
            Err(_) => self.view(),
        }
    }

    /// Stop tracking the job. A terminal job keeps its phase; otherwise
    /// the phase becomes `Cancelled`. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        self.shared.release_subscriptions();
        self.task.abort();

        let cancelled = self.shared.view_tx.send_if_modified(|view| {
            if view.phase.is_terminal() {
                return false;
            }
            view.phase = JobPhase::Cancelled;
            true
        });
        if cancelled {
            tracing::info!(job_id = %self.shared.job_id, "Audit job cancelled");
        }
    }
}

impl Drop for JobSession {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for JobSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSession")
            .field("job_id", &self.shared.job_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SessionShared {
    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every held subscription. Later calls find the list empty.
    fn release_subscriptions(&self) {
        let released = std::mem::take(&mut *self.lock_subscriptions());
        if !released.is_empty() {
            tracing::debug!(
                job_id = %self.job_id,
                count = released.len(),
                "Releasing job subscriptions",
            );
        }
        // Dropped outside the lock; each drop unsubscribes.
        drop(released);
    }

    /// Fold one event into `state` and publish it. Returns `false` once
    /// the job can accept no further events.
    ///
    /// Subscriptions are released before a terminal view is published.
    fn accept(&self, state: &mut ProgressState, event: AuditEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let next = state.apply(&event);
        let phase = JobPhase::from(next.terminal());
        let progress = next.view(self.pipeline);
        if phase.is_terminal() {
            self.release_subscriptions();
        }

        let published = self.view_tx.send_if_modified(|view| {
            // Cancelled between the check above and here.
            if view.phase.is_terminal() {
                return false;
            }
            view.phase = phase;
            view.progress = progress;
            match event {
                AuditEvent::Complete(result) => view.result = Some(result),
                AuditEvent::Error(failure) => view.error = Some(failure.error),
                AuditEvent::Progress(_) => {}
            }
            true
        });
        if !published {
            return false;
        }
        *state = next;

        match phase {
            JobPhase::Completed => {
                tracing::info!(job_id = %self.job_id, "Audit job completed");
            }
            JobPhase::Errored => {
                let error = self.view_tx.borrow().error.clone().unwrap_or_default();
                tracing::warn!(job_id = %self.job_id, error = %error, "Audit job failed");
            }
            _ => return true,
        }
        false
    }
}

async fn drive(shared: Arc<SessionShared>, mut source: Box<dyn ProgressSource>) {
    let mut state = ProgressState::for_pipeline(shared.pipeline);

    loop {
        let event = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            event = source.next_event() => event,
        };

        let Some(event) = event else {
            tracing::debug!(job_id = %shared.job_id, "Progress source exhausted");
            return;
        };

        if !shared.accept(&mut state, event) {
            return;
        }
    }
}
