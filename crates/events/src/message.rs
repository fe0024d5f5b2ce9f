//! The event channel envelope.
//!
//! Every frame on the channel is a JSON object of the shape
//! `{"type": "<kind>", "jobId": "...", "data": {...}, "timestamp": 0}`.
//! Only `type` is required. Job-scoped kinds carry `jobId`.

use serde::{Deserialize, Serialize};
use sitescope_core::job_events::AuditEvent;
use sitescope_core::types::{now_millis, TimestampMillis};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Discriminator, e.g. `"audit_progress"`.
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Epoch milliseconds; receipt time when the sender omitted it.
    #[serde(default = "now_millis")]
    pub timestamp: TimestampMillis,
}

impl InboundMessage {
    /// Create a message with only the required `type`.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            job_id: None,
            data: None,
            timestamp: now_millis(),
        }
    }

    /// Scope the message to a job.
    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Attach the `data` payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Wrap a typed audit event for a job.
    pub fn from_audit_event(job_id: impl Into<String>, event: &AuditEvent) -> Self {
        Self::new(event.message_type())
            .with_job(job_id)
            .with_data(event.to_data())
    }

    /// Interpret this message as an audit job event.
    pub fn audit_event(&self) -> Result<Option<AuditEvent>, serde_json::Error> {
        AuditEvent::from_parts(&self.event_type, self.data.as_ref())
    }
}

/// Parse a text frame into an [`InboundMessage`].
///
/// Returns `Err` for malformed JSON or a missing `type`. Callers should
/// log and continue.
pub fn parse_message(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}
