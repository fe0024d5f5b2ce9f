//! Client context.
//!
//! [`AuditClient`] bundles the configuration, the REST API wrapper, the
//! event dispatcher and the one shared [`ConnectionManager`]. Construct it
//! once, pass it by reference, and call [`AuditClient::shutdown`] when the
//! consumer goes away.

use std::sync::Arc;
use std::time::Duration;

use sitescope_core::job_events::{
    AuditEvent, AuditFailure, ProgressUpdate, MSG_TYPE_AUDIT_COMPLETE, MSG_TYPE_AUDIT_ERROR,
    MSG_TYPE_AUDIT_PROGRESS,
};
use sitescope_events::{EventDispatcher, InboundMessage, Subscription};

use crate::api::{AuditApi, StartAuditRequest};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionManager, ConnectionState, OutboundMessage};
use crate::session::{JobSession, SessionError};
use crate::transport::{Transport, WebSocketTransport};

/// Application-wide handle to the audit backend.
pub struct AuditClient {
    config: ClientConfig,
    api: AuditApi,
    dispatcher: Arc<EventDispatcher>,
    connection: ConnectionManager,
}

impl AuditClient {
    /// Client talking to the configured WebSocket endpoint.
    pub fn new(config: ClientConfig) -> Self {
        let transport = WebSocketTransport::new(config.ws_url.clone());
        Self::with_transport(config, Arc::new(transport))
    }

    /// Client over an arbitrary transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let connection = ConnectionManager::new(
            transport,
            Arc::clone(&dispatcher),
            config.reconnect.clone(),
        );
        let api = AuditApi::new(config.api_url.clone());

        Self {
            config,
            api,
            dispatcher,
            connection,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &AuditApi {
        &self.api
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Open the event channel. See [`ConnectionManager::connect`].
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Wait until the channel is connected or has given up, at most
    /// `timeout`. Returns the state at that point.
    pub async fn wait_for_connection(&self, timeout: Duration) -> ConnectionState {
        let mut state = self.connection.watch_state();
        let settled = state.wait_for(|s| {
            matches!(
                s,
                ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Disconnected
            )
        });
        let _ = tokio::time::timeout(timeout, settled).await;
        self.connection.state()
    }

    /// Tear the event channel down.
    pub fn shutdown(&self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection(&self) -> Connection {
        self.connection.connection()
    }

    pub fn send_message(&self, message: &OutboundMessage) -> bool {
        self.connection.send_message(message)
    }

    /// Start an audit job. See [`JobSession::start`].
    pub async fn start_audit(&self, request: &StartAuditRequest) -> Result<JobSession, SessionError> {
        JobSession::start(
            &self.api,
            &self.dispatcher,
            self.connection.watch_state(),
            request,
            self.config.simulation_tick,
        )
        .await
    }

    /// Typed listener for one job's progress updates.
    pub fn subscribe_to_progress<F>(&self, job_id: &str, handler: F) -> Subscription
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.subscribe_typed(MSG_TYPE_AUDIT_PROGRESS, job_id, move |event| {
            if let AuditEvent::Progress(update) = event {
                handler(update);
            }
        })
    }

    /// Typed listener for one job's completion.
    pub fn subscribe_to_complete<F>(&self, job_id: &str, handler: F) -> Subscription
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.subscribe_typed(MSG_TYPE_AUDIT_COMPLETE, job_id, move |event| {
            if let AuditEvent::Complete(result) = event {
                handler(result);
            }
        })
    }

    /// Typed listener for one job's failure.
    pub fn subscribe_to_error<F>(&self, job_id: &str, handler: F) -> Subscription
    where
        F: Fn(&AuditFailure) + Send + Sync + 'static,
    {
        self.subscribe_typed(MSG_TYPE_AUDIT_ERROR, job_id, move |event| {
            if let AuditEvent::Error(failure) = event {
                handler(failure);
            }
        })
    }

    fn subscribe_typed<F>(&self, event_type: &'static str, job_id: &str, handler: F) -> Subscription
    where
        F: Fn(&AuditEvent) + Send + Sync + 'static,
    {
        self.dispatcher
            .subscribe_scoped(event_type, job_id, move |message: &InboundMessage| {
                match message.audit_event() {
                    Ok(Some(event)) => handler(&event),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(
                        event_type,
                        error = %e,
                        "Dropping malformed audit event payload",
                    ),
                }
            })
    }
}

impl std::fmt::Debug for AuditClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditClient")
            .field("api_url", &self.config.api_url)
            .field("ws_url", &self.config.ws_url)
            .field("state", &self.connection.state())
            .finish()
    }
}
