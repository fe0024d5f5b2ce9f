//! Message type constants and payloads for audit job events.
//!
//! The backend pushes `{"type": ..., "jobId": ..., "data": {...}}`
//! envelopes over the event channel. The `type` strings below select the
//! payload shape; [`AuditEvent::from_parts`] turns a type plus raw `data`
//! into the typed event the progress reducer consumes.

use serde::{Deserialize, Serialize};

/// Progress update for one stage of a running audit.
pub const MSG_TYPE_AUDIT_PROGRESS: &str = "audit_progress";

/// Audit finished; `data` carries the result payload.
pub const MSG_TYPE_AUDIT_COMPLETE: &str = "audit_complete";

/// Audit failed; `data` carries `{"error": "..."}`.
pub const MSG_TYPE_AUDIT_ERROR: &str = "audit_error";

/// Payload of an `audit_progress` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Zero-based index of the stage currently executing.
    pub current_step: usize,
    /// Completion of that stage, 0-100.
    pub step_progress: u8,
}

/// Payload of an `audit_error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFailure {
    /// Human-readable error description.
    pub error: String,
    /// Stage the failure is bound to, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
}

impl AuditFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            current_step: None,
        }
    }
}

/// A typed audit job event, independent of where it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    Progress(ProgressUpdate),
    /// Opaque result payload from the backend.
    Complete(serde_json::Value),
    Error(AuditFailure),
}

impl AuditEvent {
    /// Build a progress event.
    pub fn progress(current_step: usize, step_progress: u8) -> Self {
        Self::Progress(ProgressUpdate {
            current_step,
            step_progress,
        })
    }

    /// Build an error event not bound to an explicit stage.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(AuditFailure::new(message))
    }

    /// The wire `type` string for this event.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Progress(_) => MSG_TYPE_AUDIT_PROGRESS,
            Self::Complete(_) => MSG_TYPE_AUDIT_COMPLETE,
            Self::Error(_) => MSG_TYPE_AUDIT_ERROR,
        }
    }

    /// Whether this event ends the job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }

    /// Interpret a wire message type and its `data` object.
    ///
    /// Returns `Ok(None)` for types that are not audit job events and
    /// `Err` when a known type carries a malformed payload.
    pub fn from_parts(
        message_type: &str,
        data: Option<&serde_json::Value>,
    ) -> Result<Option<Self>, serde_json::Error> {
        let data = data.cloned().unwrap_or(serde_json::Value::Null);
        let event = match message_type {
            MSG_TYPE_AUDIT_PROGRESS => Self::Progress(serde_json::from_value(data)?),
            MSG_TYPE_AUDIT_COMPLETE => Self::Complete(data),
            MSG_TYPE_AUDIT_ERROR => Self::Error(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// The `data` object this event would carry on the wire.
    pub fn to_data(&self) -> serde_json::Value {
        match self {
            Self::Progress(update) => serde_json::to_value(update),
            Self::Complete(result) => Ok(result.clone()),
            Self::Error(failure) => serde_json::to_value(failure),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}
