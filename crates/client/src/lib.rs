//! Audit job tracking client.
//!
//! Provides the start-job HTTP API wrapper, a resilient event-channel
//! connection with bounded reconnection, the wire and simulated progress
//! sources, and [`JobSession`], which binds one audit job to its
//! lifecycle. [`AuditClient`] is the context object tying them together;
//! create one at startup and tear it down with
//! [`AuditClient::shutdown`].

pub mod api;
pub mod config;
pub mod connection;
pub mod context;
pub mod reconnect;
pub mod session;
pub mod source;
pub mod transport;

pub use api::{ApiError, AuditApi, AuditConfig, AuditType, StartAuditRequest};
pub use config::{ClientConfig, ConfigError};
pub use connection::{
    Connection, ConnectionEvent, ConnectionManager, ConnectionState, OutboundMessage,
};
pub use context::AuditClient;
pub use reconnect::ReconnectConfig;
pub use session::{JobPhase, JobSession, JobView, SessionError};
pub use source::{ProgressSource, SimulatedSource, SourceKind, WireSource};
pub use transport::{memory_transport, MemoryServer, Transport, WebSocketTransport};
