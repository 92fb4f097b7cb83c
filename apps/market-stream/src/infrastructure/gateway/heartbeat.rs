//! Keep-Alive Supervisor
//!
//! While the transport is open, asks the connection manager to send a
//! keep-alive frame on a fixed interval and watches for inbound silence. Any
//! inbound frame (tick, status, pong) counts as liveness. When nothing has
//! arrived for the idle timeout the supervisor reports it once and exits;
//! the connection manager then treats the link as failed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for keep-alive behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between keep-alive frames.
    pub interval: Duration,
    /// Inbound silence after which the link is considered dead.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            interval,
            idle_timeout,
        }
    }
}

/// Events emitted by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a keep-alive frame now.
    SendPing,
    /// No inbound frame within the idle timeout.
    IdleTimeout,
}

/// Liveness state shared between the supervisor and the frame reader.
#[derive(Debug)]
pub struct HeartbeatState {
    last_inbound: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create state with the clock starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
        }
    }

    /// Record that a frame arrived.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn time_since_inbound(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }

    fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        *self.last_inbound.read() + idle_timeout
    }
}

/// Keep-alive supervisor for one open transport.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new supervisor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the event channel closes, or the link goes idle.
    pub async fn run(self) {
        let start = Instant::now() + self.config.interval;
        let mut ping = tokio::time::interval_at(start, self.config.interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let deadline = self.state.idle_deadline(self.config.idle_timeout);

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat supervisor cancelled");
                    break;
                }
                _ = ping.tick() => {
                    if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    let idle = self.state.time_since_inbound();
                    // Deadline may have moved while sleeping
                    if idle >= self.config.idle_timeout {
                        tracing::warn!(
                            idle_secs = idle.as_secs(),
                            timeout_secs = self.config.idle_timeout.as_secs(),
                            "No inbound frames within idle timeout"
                        );
                        let _ = self.event_tx.send(HeartbeatEvent::IdleTimeout).await;
                        break;
                    }
                }
            }
        }
    }
}
