//! Inbound event envelope and listener dispatch for sitescope.
//!
//! - [`InboundMessage`]: the `{type, jobId, data, timestamp}` envelope
//!   received over the event channel.
//! - [`EventDispatcher`]: synchronous publish/subscribe registry keyed by
//!   message type, optionally scoped to one job.
//! - [`Subscription`]: disposer returned at subscribe time.

pub mod dispatcher;
pub mod message;

pub use dispatcher::{EventDispatcher, EventKey, Subscription};
pub use message::{parse_message, InboundMessage};
