//! Integration tests for `ConnectionManager` over the in-memory transport.
//!
//! Time is paused, so reconnect delays elapse instantly and the retry
//! schedule is exact.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sitescope_client::connection::{
    Connection, ConnectionEvent, ConnectionManager, ConnectionState, OutboundMessage,
};
use sitescope_client::reconnect::ReconnectConfig;
use sitescope_client::transport::{memory_transport, Channel, ConnectionError, MemoryServer, Transport};
use sitescope_events::EventDispatcher;
use tokio::sync::{broadcast, mpsc};

fn fast_config() -> ReconnectConfig {
    ReconnectConfig {
        auto_reconnect: true,
        max_attempts: 3,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 1.0,
        connect_timeout: Duration::from_millis(250),
    }
}

fn manager_with(config: ReconnectConfig) -> (ConnectionManager, MemoryServer, Arc<EventDispatcher>) {
    let (transport, server) = memory_transport();
    let dispatcher = Arc::new(EventDispatcher::new());
    let manager = ConnectionManager::new(Arc::new(transport), Arc::clone(&dispatcher), config);
    (manager, server, dispatcher)
}

async fn wait_for_state(manager: &ConnectionManager, want: ConnectionState) {
    let mut rx = manager.watch_state();
    rx.wait_for(|state| *state == want).await.unwrap();
}

/// Transport whose connect never resolves.
#[derive(Default)]
struct HangingTransport {
    attempts: AtomicU32,
}

#[async_trait]
impl Transport for HangingTransport {
    async fn connect(&self) -> Result<Channel, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    fn endpoint(&self) -> &str {
        "hanging://"
    }
}

fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Test: connect establishes the channel and is idempotent while active
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent_while_active() {
    let (manager, mut server, _dispatcher) = manager_with(fast_config());

    manager.connect();
    manager.connect();
    let _peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;

    manager.connect();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(server.connect_attempts(), 1);
    assert!(manager.is_connected());
    assert_eq!(manager.connection().attempt, 0);
}

// ---------------------------------------------------------------------------
// Test: inbound frames reach the dispatcher, malformed ones are skipped
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn frames_are_dispatched_and_garbage_is_skipped() {
    let (manager, mut server, dispatcher) = manager_with(fast_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = dispatcher.subscribe("audit_progress", move |message| {
        let _ = tx.send(message.clone());
    });

    manager.connect();
    let peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;

    peer.to_client.send("{not json".into()).unwrap();
    peer.to_client.send(r#"{"jobId":"j"}"#.into()).unwrap();
    peer.to_client
        .send(r#"{"type":"audit_progress","jobId":"j","data":{"currentStep":1,"stepProgress":20}}"#.into())
        .unwrap();

    let message = rx.recv().await.unwrap();
    assert_eq!(message.job_id.as_deref(), Some("j"));
    assert!(rx.try_recv().is_err());
    assert!(manager.is_connected());
}

// ---------------------------------------------------------------------------
// Test: exactly max_attempts retries, then Failed
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_then_failed() {
    let (manager, server, _dispatcher) = manager_with(fast_config());
    let mut lifecycle = manager.subscribe_lifecycle();
    server.refuse_all();

    let start = tokio::time::Instant::now();
    manager.connect();
    wait_for_state(&manager, ConnectionState::Failed).await;

    // One initial attempt plus three retries, 100ms apart.
    assert_eq!(server.connect_attempts(), 4);
    assert_eq!(start.elapsed(), Duration::from_millis(300));

    let connection = manager.connection();
    assert_eq!(connection.attempt, 3);
    assert!(connection.last_error.is_some());

    let errors = drain(&mut lifecycle);
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().all(|e| matches!(e, ConnectionEvent::Error(_))));

    // Nothing further is scheduled.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.connect_attempts(), 4);
}

// ---------------------------------------------------------------------------
// Test: backoff grows by the multiplier and is capped
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn backoff_delays_grow_and_cap() {
    let (manager, server, _dispatcher) = manager_with(ReconnectConfig {
        max_attempts: 4,
        multiplier: 2.0,
        max_delay: Duration::from_millis(500),
        ..fast_config()
    });
    server.refuse_all();

    let start = tokio::time::Instant::now();
    manager.connect();
    wait_for_state(&manager, ConnectionState::Failed).await;

    // 100 + 200 + 400 + 500
    assert_eq!(start.elapsed(), Duration::from_millis(1200));
}

// ---------------------------------------------------------------------------
// Test: a manual connect after Failed starts a fresh retry budget
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn manual_connect_after_failure_resets_attempts() {
    let (manager, mut server, _dispatcher) = manager_with(fast_config());
    server.refuse_all();
    manager.connect();
    wait_for_state(&manager, ConnectionState::Failed).await;

    server.refuse_next(0);
    manager.connect();
    assert_eq!(manager.connection().attempt, 0);
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let _peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(manager.connection().last_error, None);
}

// ---------------------------------------------------------------------------
// Test: a dropped channel is re-established after the delay
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dropped_channel_reconnects() {
    let (manager, mut server, _dispatcher) = manager_with(fast_config());
    let mut lifecycle = manager.subscribe_lifecycle();

    manager.connect();
    let peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;

    drop(peer);
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    assert_eq!(manager.connection().attempt, 1);

    let _peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(manager.connection().attempt, 0);

    assert_eq!(
        drain(&mut lifecycle),
        [
            ConnectionEvent::Connected,
            ConnectionEvent::Disconnected,
            ConnectionEvent::Connected,
        ]
    );
}

// ---------------------------------------------------------------------------
// Test: with auto-reconnect disabled a drop leaves the channel Disconnected
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn no_reconnect_when_disabled() {
    let (manager, mut server, _dispatcher) = manager_with(ReconnectConfig {
        auto_reconnect: false,
        ..fast_config()
    });

    manager.connect();
    let peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;

    drop(peer);
    wait_for_state(&manager, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.connect_attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Test: send_message delivers a stamped JSON frame
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn send_message_reaches_peer() {
    let (manager, mut server, _dispatcher) = manager_with(fast_config());
    manager.connect();
    let mut peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;

    assert!(manager.send_message(&OutboundMessage::new("subscribe").with_job("job-9")));

    let text = peer.from_client.recv().await.unwrap();
    let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["jobId"], "job-9");
    assert!(frame["timestamp"].is_i64());
}

// ---------------------------------------------------------------------------
// Test: disconnect releases the writer and emits Disconnected
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_releases_the_channel() {
    let (manager, mut server, _dispatcher) = manager_with(fast_config());
    let mut lifecycle = manager.subscribe_lifecycle();
    manager.connect();
    let mut peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;

    manager.disconnect();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(peer.from_client.recv().await.is_none());
    assert!(!manager.send_message(&OutboundMessage::new("ping")));
    assert_eq!(
        drain(&mut lifecycle),
        [ConnectionEvent::Connected, ConnectionEvent::Disconnected]
    );
}

// ---------------------------------------------------------------------------
// Test: disconnect while a retry is pending cancels it
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_retry() {
    let (manager, server, _dispatcher) = manager_with(fast_config());
    server.refuse_all();

    manager.connect();
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    manager.disconnect();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.connect_attempts(), 1);
    assert_eq!(manager.connection(), Connection::default());
}

// ---------------------------------------------------------------------------
// Test: connect during backoff skips the pending delay
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn connect_while_reconnecting_retries_immediately() {
    let (manager, mut server, _dispatcher) = manager_with(ReconnectConfig {
        initial_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(30),
        ..fast_config()
    });
    server.refuse_next(2);

    let start = tokio::time::Instant::now();
    manager.connect();
    // First retry fires at 30s; the second backoff runs until 60s.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(server.connect_attempts(), 2);
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
    assert_eq!(manager.connection().attempt, 2);

    manager.connect();
    assert_eq!(manager.state(), ConnectionState::Connecting);
    assert_eq!(manager.connection().attempt, 0);

    let _peer = server.accept().await.unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(server.connect_attempts(), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(31));

    // The abandoned backoff never fires.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.connect_attempts(), 3);
    assert!(manager.is_connected());
}

// ---------------------------------------------------------------------------
// Test: an attempt that never opens times out and counts as failed
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn hanging_connect_times_out_then_failed() {
    let transport = Arc::new(HangingTransport::default());
    let manager = ConnectionManager::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(EventDispatcher::new()),
        ReconnectConfig {
            max_attempts: 2,
            ..fast_config()
        },
    );

    let start = tokio::time::Instant::now();
    manager.connect();
    wait_for_state(&manager, ConnectionState::Failed).await;

    // Three 250ms attempts separated by two 100ms delays.
    assert_eq!(start.elapsed(), Duration::from_millis(950));
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);

    let connection = manager.connection();
    assert_eq!(connection.attempt, 2);
    assert!(connection.last_error.unwrap().contains("timed out"));
}
