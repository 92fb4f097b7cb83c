//! In-memory gateway for session tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use market_stream::{
    AccessToken, ConnectionSettings, Connector, HeartbeatConfig, MarketSession, ReconnectConfig,
    SessionConfig, SessionSnapshot, TransportError, TransportLink,
};

pub const WAIT: Duration = Duration::from_secs(2);

/// Server side of one fake connection.
pub struct FakeServer {
    outbound: fmpsc::UnboundedReceiver<String>,
    inbound: fmpsc::UnboundedSender<Result<String, TransportError>>,
    pub token: String,
}

impl FakeServer {
    /// Push a text frame to the client.
    pub fn push(&self, text: &str) {
        self.inbound.unbounded_send(Ok(text.to_string())).unwrap();
    }

    /// Make the client's next read fail.
    pub fn fail(&self, reason: &str) {
        self.inbound
            .unbounded_send(Err(TransportError::Receive(reason.to_string())))
            .unwrap();
    }

    /// Next frame the client sent; `None` once the client closed its sink.
    pub async fn next_frame(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.outbound.next())
            .await
            .expect("client frame in time")
    }

    /// Assert the client sends nothing for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(frame) = tokio::time::timeout(window, self.outbound.next()).await {
            panic!("unexpected client frame: {frame:?}");
        }
    }

    /// Whether the client closed its side.
    pub async fn client_closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(WAIT, self.outbound.next()).await,
            Ok(None)
        )
    }
}

/// Connector handing out in-memory links.
#[derive(Clone)]
pub struct FakeGateway {
    inner: Arc<Inner>,
}

struct Inner {
    connects: AtomicUsize,
    refuse: AtomicBool,
    handshake_delay: Mutex<Duration>,
    servers_tx: mpsc::UnboundedSender<FakeServer>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeServer>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connects: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                handshake_delay: Mutex::new(Duration::ZERO),
                servers_tx,
                servers_rx: tokio::sync::Mutex::new(servers_rx),
            }),
        }
    }

    pub fn with_handshake_delay(self, delay: Duration) -> Self {
        *self.inner.handshake_delay.lock() = delay;
        self
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Wait for the client to open the next connection.
    pub async fn accept(&self) -> FakeServer {
        let mut servers = self.inner.servers_rx.lock().await;
        tokio::time::timeout(WAIT, servers.recv())
            .await
            .expect("client connected in time")
            .expect("gateway alive")
    }

    /// Assert no connection is opened within `window`.
    pub async fn expect_no_connect(&self, window: Duration) {
        let mut servers = self.inner.servers_rx.lock().await;
        assert!(
            tokio::time::timeout(window, servers.recv()).await.is_err(),
            "unexpected connection"
        );
    }
}

#[async_trait]
impl Connector for FakeGateway {
    async fn connect(&self, token: &AccessToken) -> Result<TransportLink, TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.handshake_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (out_tx, outbound) = fmpsc::unbounded::<String>();
        let (inbound, in_rx) = fmpsc::unbounded();
        let sink = out_tx.sink_map_err(|e| TransportError::Send(e.to_string()));

        let _ = self.inner.servers_tx.send(FakeServer {
            outbound,
            inbound,
            token: token.expose().to_string(),
        });

        Ok(TransportLink::new(Box::pin(sink), Box::pin(in_rx)))
    }
}

/// Session settings with fast, deterministic timing.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        connection: ConnectionSettings {
            heartbeat: HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(90)),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                ..ReconnectConfig::default()
            }
            .without_jitter(),
        },
        tick_channel_capacity: 64,
    }
}

pub fn session(gateway: &FakeGateway) -> MarketSession {
    session_with(gateway, fast_config())
}

pub fn session_with(gateway: &FakeGateway, config: SessionConfig) -> MarketSession {
    MarketSession::new(config, Arc::new(gateway.clone()))
}

pub fn token(raw: &str) -> Option<AccessToken> {
    AccessToken::new(raw)
}

/// Wait until the session snapshot satisfies `predicate`.
pub async fn wait_until(
    session: &MarketSession,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut updates = session.status_updates();
    let snapshot = tokio::time::timeout(WAIT, updates.wait_for(predicate))
        .await
        .expect("session reached expected state in time")
        .expect("session running")
        .clone();
    snapshot
}

/// Assert `frame` is a subscribe message for exactly `keys`, in order.
pub fn assert_subscribe(frame: Option<String>, keys: &[&str]) {
    let frame = frame.expect("subscribe frame");
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(
        value,
        serde_json::json!({ "data": { "instrumentKeys": keys } }),
        "frame: {frame}"
    );
}
