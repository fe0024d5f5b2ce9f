/// Job identifiers are opaque strings assigned by the audit backend.
pub type JobId = String;

/// Wire timestamps are Unix epoch milliseconds.
pub type TimestampMillis = i64;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> TimestampMillis {
    chrono::Utc::now().timestamp_millis()
}
