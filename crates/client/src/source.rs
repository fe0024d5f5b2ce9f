//! Where a job's audit events come from.
//!
//! A [`JobSession`](crate::session::JobSession) pulls events through the
//! [`ProgressSource`] trait and never branches on the origin. The source
//! is chosen once per job:
//!
//! - [`WireSource`] forwards the job's scoped channel messages,
//! - [`SimulatedSource`] replays the fixed simulated schedule on a timer.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sitescope_core::job_events::{
    AuditEvent, MSG_TYPE_AUDIT_COMPLETE, MSG_TYPE_AUDIT_ERROR, MSG_TYPE_AUDIT_PROGRESS,
};
use sitescope_core::simulation::SimulatedSchedule;
use sitescope_core::stages::StageDescriptor;
use sitescope_events::{EventDispatcher, Subscription};
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};

use crate::connection::ConnectionState;

/// Error text for a wire job whose channel went away.
pub const CONNECTION_LOST: &str = "connection lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Live,
    Simulated,
}

/// A lazy, finite sequence of audit events for one job.
#[async_trait]
pub trait ProgressSource: Send {
    /// Wait for the next event. `None` when the source is exhausted.
    async fn next_event(&mut self) -> Option<AuditEvent>;

    fn kind(&self) -> SourceKind;
}

// ---------------------------------------------------------------------------
// WireSource
// ---------------------------------------------------------------------------

/// Events for one job received over the live channel.
///
/// Ends with a synthetic error when the connection fails or is torn down
/// while the job is still running.
pub struct WireSource {
    events: mpsc::UnboundedReceiver<AuditEvent>,
    connection: watch::Receiver<ConnectionState>,
    connection_lost: bool,
}

impl WireSource {
    /// Register scoped listeners for `job_id` and build the source they
    /// feed. The returned subscriptions keep the listeners alive; once all
    /// are dropped the source is exhausted.
    pub fn subscribe(
        dispatcher: &EventDispatcher,
        job_id: &str,
        connection: watch::Receiver<ConnectionState>,
    ) -> (Self, Vec<Subscription>) {
        let (tx, events) = mpsc::unbounded_channel();

        let subscriptions = [
            MSG_TYPE_AUDIT_PROGRESS,
            MSG_TYPE_AUDIT_COMPLETE,
            MSG_TYPE_AUDIT_ERROR,
        ]
        .into_iter()
        .map(|event_type| {
            let tx = tx.clone();
            dispatcher.subscribe_scoped(event_type, job_id, move |message| {
                match message.audit_event() {
                    Ok(Some(event)) => {
                        let _ = tx.send(event);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(
                        job_id = message.job_id.as_deref().unwrap_or(""),
                        event_type = %message.event_type,
                        error = %e,
                        "Malformed audit event payload",
                    ),
                }
            })
        })
        .collect();

        let source = Self {
            events,
            connection,
            connection_lost: false,
        };
        (source, subscriptions)
    }
}

#[async_trait]
impl ProgressSource for WireSource {
    async fn next_event(&mut self) -> Option<AuditEvent> {
        if self.connection_lost {
            return None;
        }

        tokio::select! {
            biased;
            event = self.events.recv() => event,
            _ = channel_gone(&mut self.connection) => {
                self.connection_lost = true;
                Some(AuditEvent::error(CONNECTION_LOST))
            }
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }
}

/// Resolves once no further channel events can arrive.
async fn channel_gone(connection: &mut watch::Receiver<ConnectionState>) {
    // A dropped manager means the channel is gone as well.
    let _ = connection
        .wait_for(|state| {
            matches!(
                state,
                ConnectionState::Failed | ConnectionState::Disconnected
            )
        })
        .await;
}

// ---------------------------------------------------------------------------
// SimulatedSource
// ---------------------------------------------------------------------------

/// Timer-driven replay of the [`SimulatedSchedule`].
///
/// The first event is emitted immediately, every later one after one
/// `tick`, so a full run takes `(total_events - 1) * tick`.
pub struct SimulatedSource {
    schedule: SimulatedSchedule,
    ticker: Interval,
}

impl SimulatedSource {
    /// Must be called from within a Tokio runtime.
    pub fn new(schedule: SimulatedSchedule, tick: Duration) -> Self {
        let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { schedule, ticker }
    }

    pub fn for_pipeline(pipeline: &[StageDescriptor], tick: Duration) -> Self {
        Self::new(SimulatedSchedule::for_pipeline(pipeline), tick)
    }

    /// Replay from the first event.
    pub fn restart(&mut self) {
        self.schedule.restart();
        self.ticker.reset_immediately();
    }

    pub fn remaining(&self) -> usize {
        self.schedule.len()
    }
}

#[async_trait]
impl ProgressSource for SimulatedSource {
    async fn next_event(&mut self) -> Option<AuditEvent> {
        if self.schedule.len() == 0 {
            return None;
        }
        self.ticker.tick().await;
        self.schedule.next()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Simulated
    }
}
