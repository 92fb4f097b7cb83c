//! Connection Manager
//!
//! Owns the one gateway transport a session may have. A single task runs the
//! [`SessionMachine`]: commands from the [`ConnectionHandle`], inbound
//! frames, connect results, the reconnect timer and keep-alive events are all
//! turned into [`SessionEvent`]s, and the resulting [`SessionEffect`]s are
//! carried out here. Because every transition happens on this task, no two
//! connects can ever be in flight at once.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Connector, TransportError, TransportLink};
use crate::domain::session::{
    AccessToken, SessionEffect, SessionError, SessionEvent, SessionMachine, SessionSnapshot,
};
use crate::domain::subscription::WatchSet;
use crate::infrastructure::metrics;

use super::codec::FrameCodec;
use super::dispatcher::MessageDispatcher;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{PingRequest, SubscribeRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};

/// How long a deliberate close may take before the link is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type ConnectFuture = BoxFuture<'static, Result<TransportLink, TransportError>>;

// =============================================================================
// Settings
// =============================================================================

/// Timing settings for one connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    /// Keep-alive interval and idle timeout.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
enum Command {
    Connect {
        token: Option<AccessToken>,
        watch: WatchSet,
    },
    UpdateWatch(WatchSet),
    Teardown,
}

/// Cloneable handle for driving a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Request a connection for `watch` using `token`.
    pub fn connect(&self, token: Option<AccessToken>, watch: WatchSet) {
        self.send(Command::Connect { token, watch });
    }

    /// Replace the desired watch set.
    pub fn update_watch(&self, watch: WatchSet) {
        self.send(Command::UpdateWatch(watch));
    }

    /// Close the transport and forget the token.
    pub fn teardown(&self) {
        self.send(Command::Teardown);
    }

    /// Tear down and stop the manager task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every snapshot change.
    #[must_use]
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Whether the manager task is still accepting commands.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Connection manager stopped, command dropped");
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

struct KeepAlive {
    cancel: CancellationToken,
    events: mpsc::Receiver<HeartbeatEvent>,
    state: Arc<HeartbeatState>,
}

/// Single-task owner of the gateway transport.
pub struct ConnectionManager {
    machine: SessionMachine,
    dispatcher: MessageDispatcher,
    codec: FrameCodec,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    errors_tx: broadcast::Sender<SessionError>,
    link: Option<TransportLink>,
    pending_connect: Option<ConnectFuture>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    keepalive: Option<KeepAlive>,
    last_connected_at: Option<DateTime<Utc>>,
}

impl ConnectionManager {
    /// Create a manager and its handle. Nothing happens until [`run`](Self::run)
    /// is spawned.
    #[must_use]
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        dispatcher: MessageDispatcher,
        errors_tx: broadcast::Sender<SessionError>,
        cancel: CancellationToken,
    ) -> (Self, ConnectionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(SessionSnapshot::default());

        let handle = ConnectionHandle {
            commands: commands_tx,
            snapshots,
            cancel: cancel.clone(),
        };

        let manager = Self {
            machine: SessionMachine::new(),
            dispatcher,
            codec: FrameCodec::new(),
            policy: ReconnectPolicy::new(settings.reconnect),
            heartbeat: settings.heartbeat,
            connector,
            commands,
            cancel,
            snapshot_tx,
            errors_tx,
            link: None,
            pending_connect: None,
            reconnect_timer: None,
            keepalive: None,
            last_connected_at: None,
        };

        (manager, handle)
    }

    /// Run until cancelled or every handle is dropped, then tear down.
    pub async fn run(mut self) {
        tracing::debug!("Connection manager started");

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Connect { token, watch }) => {
                        SessionEvent::ConnectRequested { token, watch }
                    }
                    Some(Command::UpdateWatch(watch)) => SessionEvent::WatchChanged(watch),
                    Some(Command::Teardown) => SessionEvent::TeardownRequested,
                    None => break,
                },
                result = connect_result(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    match result {
                        Ok(link) => {
                            self.link = Some(link);
                            self.last_connected_at = Some(Utc::now());
                            metrics::set_connection_open(true);
                            tracing::info!("Market stream connected");
                            SessionEvent::TransportOpened
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Market stream connect failed");
                            SessionEvent::TransportFailed { reason: e.to_string() }
                        }
                    }
                }
                frame = next_frame(&mut self.link) => match frame {
                    Some(Ok(text)) => {
                        if let Some(keepalive) = &self.keepalive {
                            keepalive.state.record_inbound();
                        }
                        SessionEvent::Frame(self.dispatcher.dispatch(&text))
                    }
                    Some(Err(TransportError::Closed)) | None => {
                        tracing::info!("Market stream closed by peer");
                        SessionEvent::TransportClosed
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Market stream read failed");
                        SessionEvent::TransportFailed { reason: e.to_string() }
                    }
                },
                () = timer_elapsed(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    SessionEvent::ReconnectDue
                }
                event = keepalive_event(&mut self.keepalive) => match event {
                    Some(HeartbeatEvent::SendPing) => SessionEvent::HeartbeatDue,
                    Some(HeartbeatEvent::IdleTimeout) => SessionEvent::IdleTimeout,
                    None => {
                        // Supervisor exited after reporting
                        self.keepalive = None;
                        continue;
                    }
                },
            };

            self.apply(event).await;
        }

        self.apply(SessionEvent::TeardownRequested).await;
        tracing::info!("Connection manager stopped");
    }

    /// Feed one event through the machine and carry out every effect,
    /// including events the effects themselves produce.
    async fn apply(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
        self.publish();
    }

    async fn execute(&mut self, effect: SessionEffect) -> Option<SessionEvent> {
        match effect {
            SessionEffect::OpenTransport { token } => {
                let connector = Arc::clone(&self.connector);
                self.pending_connect =
                    Some(Box::pin(async move { connector.connect(&token).await }));
                None
            }
            SessionEffect::SendSubscription(keys) => {
                let follow_up = self.send(&SubscribeRequest::new(&keys)).await;
                if follow_up.is_none() {
                    tracing::info!(instruments = keys.len(), "Subscription sent");
                    metrics::record_subscription_sent();
                }
                follow_up
            }
            SessionEffect::SendHeartbeat => {
                let follow_up = self.send(&PingRequest::default()).await;
                if follow_up.is_none() {
                    metrics::record_heartbeat_sent();
                }
                follow_up
            }
            SessionEffect::CloseTransport => {
                self.pending_connect = None;
                if let Some(mut link) = self.link.take() {
                    match tokio::time::timeout(CLOSE_TIMEOUT, link.sink.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::debug!(error = %e, "Close handshake failed"),
                        Err(_) => tracing::debug!("Close handshake timed out"),
                    }
                }
                metrics::set_connection_open(false);
                Some(SessionEvent::TransportClosed)
            }
            SessionEffect::DropTransport => {
                self.pending_connect = None;
                self.link = None;
                metrics::set_connection_open(false);
                None
            }
            SessionEffect::StartKeepAlive => {
                self.start_keepalive();
                None
            }
            SessionEffect::StopKeepAlive => {
                self.stop_keepalive();
                None
            }
            SessionEffect::ScheduleReconnect => {
                if let Some(delay) = self.policy.next_delay() {
                    tracing::info!(
                        attempt = self.policy.attempt_count(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Scheduling reconnect"
                    );
                    metrics::record_reconnect();
                    self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
                    None
                } else {
                    let attempts = self.policy.attempt_count();
                    tracing::error!(attempts, "Reconnect attempts exhausted");
                    Some(SessionEvent::ReconnectGaveUp { attempts })
                }
            }
            SessionEffect::CancelReconnect => {
                self.reconnect_timer = None;
                None
            }
            SessionEffect::ResetBackoff => {
                self.policy.reset();
                None
            }
            SessionEffect::Notify(error) => {
                // No receivers is fine
                let _ = self.errors_tx.send(error);
                None
            }
        }
    }

    /// Encode and write one frame. Returns a failure event if the write fails.
    async fn send<T: Serialize>(&mut self, message: &T) -> Option<SessionEvent> {
        let text = match self.codec.encode(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode outbound frame");
                return None;
            }
        };

        let Some(link) = self.link.as_mut() else {
            tracing::debug!("No open link, outbound frame dropped");
            return None;
        };

        match link.sink.send(text).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to write to market stream");
                Some(SessionEvent::TransportFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn start_keepalive(&mut self) {
        self.stop_keepalive();

        let state = Arc::new(HeartbeatState::new());
        let (event_tx, events) = mpsc::channel(8);
        let cancel = self.cancel.child_token();

        tokio::spawn(
            HeartbeatManager::new(self.heartbeat, Arc::clone(&state), event_tx, cancel.clone())
                .run(),
        );

        self.keepalive = Some(KeepAlive {
            cancel,
            events,
            state,
        });
    }

    fn stop_keepalive(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.cancel.cancel();
        }
    }

    fn publish(&self) {
        let mut snapshot = self.machine.snapshot();
        snapshot.reconnect_attempts = self.policy.attempt_count();
        snapshot.last_connected_at = self.last_connected_at;

        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            if current.session != snapshot.session {
                tracing::info!(
                    from = current.session.as_str(),
                    to = snapshot.session.as_str(),
                    "Session state changed"
                );
            }
            *current = snapshot;
            true
        });
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("machine", &self.machine)
            .field("policy", &self.policy)
            .field("link_open", &self.link.is_some())
            .field("connect_pending", &self.pending_connect.is_some())
            .finish_non_exhaustive()
    }
}

// Each helper never resolves while its slot is empty, so the select loop
// only wakes for work that exists.

async fn connect_result(
    pending: &mut Option<ConnectFuture>,
) -> Result<TransportLink, TransportError> {
    match pending {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<TransportLink>) -> Option<Result<String, TransportError>> {
    match link {
        Some(link) => link.stream.next().await,
        None => std::future::pending().await,
    }
}

async fn timer_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn keepalive_event(keepalive: &mut Option<KeepAlive>) -> Option<HeartbeatEvent> {
    match keepalive {
        Some(keepalive) => keepalive.events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockConnector;
    use crate::domain::instrument::parse_keys;
    use crate::domain::price_cache::PriceCache;
    use crate::domain::session::SessionState;
    use futures::channel::mpsc as fmpsc;

    struct FakeLink {
        outbound: fmpsc::UnboundedReceiver<String>,
        inbound: fmpsc::UnboundedSender<Result<String, TransportError>>,
    }

    fn fake_link() -> (TransportLink, FakeLink) {
        let (out_tx, outbound) = fmpsc::unbounded::<String>();
        let (inbound, in_rx) = fmpsc::unbounded();
        let sink = out_tx.sink_map_err(|e| TransportError::Send(e.to_string()));
        (
            TransportLink::new(Box::pin(sink), Box::pin(in_rx)),
            FakeLink { outbound, inbound },
        )
    }

    fn settings(max_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat: HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(90)),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts,
                ..ReconnectConfig::default()
            }
            .without_jitter(),
        }
    }

    fn start(
        connector: MockConnector,
        max_attempts: u32,
    ) -> (
        ConnectionHandle,
        broadcast::Receiver<SessionError>,
        Arc<PriceCache>,
        tokio::task::JoinHandle<()>,
    ) {
        let cache = Arc::new(PriceCache::default());
        let (errors_tx, errors_rx) = broadcast::channel(16);
        let (manager, handle) = ConnectionManager::new(
            settings(max_attempts),
            Arc::new(connector),
            MessageDispatcher::new(Arc::clone(&cache)),
            errors_tx,
            CancellationToken::new(),
        );
        let task = tokio::spawn(manager.run());
        (handle, errors_rx, cache, task)
    }

    async fn wait_for_session(handle: &ConnectionHandle, state: SessionState) -> SessionSnapshot {
        let mut snapshots = handle.snapshots();
        tokio::time::timeout(
            Duration::from_secs(2),
            snapshots.wait_for(|s| s.session == state),
        )
        .await
        .expect("state reached in time")
        .expect("manager running")
        .clone()
    }

    #[tokio::test]
    async fn gives_up_after_reconnect_budget() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(3)
            .returning(|_| Err(TransportError::Connect("refused".to_string())));
        let (handle, mut errors, _, task) = start(connector, 2);

        handle.connect(AccessToken::new("t"), parse_keys(["RELIANCE"]).unwrap());

        let snapshot = wait_for_session(&handle, SessionState::Degraded).await;
        assert_eq!(snapshot.reconnect_attempts, 2);
        assert_eq!(
            errors.recv().await.unwrap(),
            SessionError::ReconnectExhausted(2)
        );

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_after_exhausted_budget_gets_full_retries() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(TransportError::Connect("refused".to_string()))
        });
        let (handle, mut errors, _, task) = start(connector, 2);

        for round in 1..=2 {
            handle.connect(AccessToken::new("t"), parse_keys(["RELIANCE"]).unwrap());

            let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
                .await
                .expect("gave up in time")
                .unwrap();
            assert_eq!(error, SessionError::ReconnectExhausted(2));
            assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3 * round);
        }
        let snapshot = wait_for_session(&handle, SessionState::Degraded).await;
        assert_eq!(snapshot.reconnect_attempts, 2);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sends_subscription_and_streams_on_ack() {
        let (link, mut server) = fake_link();
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(link));
        let (handle, _errors, cache, task) = start(connector, 0);

        handle.connect(AccessToken::new("t"), parse_keys(["RELIANCE"]).unwrap());

        let frame = tokio::time::timeout(Duration::from_secs(2), server.outbound.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, r#"{"data":{"instrumentKeys":["RELIANCE"]}}"#);

        server
            .inbound
            .unbounded_send(Ok(r#"{"status":"connected"}"#.to_string()))
            .unwrap();
        let snapshot = wait_for_session(&handle, SessionState::Streaming).await;
        assert!(snapshot.confirmed);
        assert!(snapshot.last_connected_at.is_some());

        server
            .inbound
            .unbounded_send(Ok(
                r#"{"type":"live_feed","data":{"RELIANCE":{"ltp":2500}}}"#.to_string()
            ))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while cache.get("RELIANCE").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(handle.snapshot().session, SessionState::Expired);
    }

    #[tokio::test]
    async fn connect_without_token_does_nothing() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();
        let (handle, _errors, _, task) = start(connector, 0);

        handle.connect(None, parse_keys(["RELIANCE"]).unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handle.snapshot().session, SessionState::Unauthenticated);
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn manager_stops_when_handles_drop() {
        let connector = MockConnector::new();
        let (handle, _errors, _, task) = start(connector, 0);

        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("manager exits")
            .unwrap();
    }
}
