//! Session Lifecycle Types
//!
//! States, events and effects for the single gateway connection a session
//! owns. The [`SessionMachine`] consumes [`SessionEvent`]s and answers with
//! [`SessionEffect`]s; it performs no I/O, so every transition is testable
//! without a socket.
//!
//! # State Machine
//!
//! ```text
//! unauthenticated ──connect + watch──► connecting ──ack / first tick──► streaming
//!        ▲                                 ▲  │                            │
//!        │                 unexpected close│  │ market_closed              │ market_closed
//!        │                                 │  ▼                            ▼
//!        └─────── watch empty ─────────────┘ degraded ◄────────────────────┘
//!
//! any ──token_expired / teardown──► expired (terminal until connect)
//! ```

mod machine;
mod token;

pub use machine::SessionMachine;
pub use token::AccessToken;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::streaming::MarketStatus;
use crate::domain::subscription::WatchSet;

// =============================================================================
// States
// =============================================================================

/// Session-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No stream has been requested, or the watch set is empty.
    #[default]
    Unauthenticated,
    /// Opening (or waiting to re-open) the transport.
    Connecting,
    /// Transport open and subscription accepted.
    Streaming,
    /// Market closed or reconnects exhausted; interest and cache are kept.
    Degraded,
    /// Token expired or torn down; needs a fresh token.
    Expired,
}

impl SessionState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Degraded => "degraded",
            Self::Expired => "expired",
        }
    }
}

/// Physical transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Closed,
    /// Transport handshake in flight.
    Connecting,
    /// Transport open.
    Open,
    /// Deliberate close in progress.
    Closing,
    /// Transport failed; about to be dropped.
    Error,
}

impl ConnectionState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Error => "error",
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Conditions surfaced to consumers on the session error channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Gateway reported the access token expired.
    #[error("access token expired, re-authentication required")]
    AuthExpired,

    /// Gateway pushed an error frame.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Reconnect attempt budget used up.
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

// =============================================================================
// Events & Effects
// =============================================================================

/// What a decoded frame meant for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// `{"status":"connected"}` handshake acknowledgment.
    Acknowledged,
    /// Number of ticks written to the cache.
    Ticks(usize),
    /// Market status frame.
    MarketStatus(MarketStatus),
    /// Gateway declared the market closed.
    MarketClosed,
    /// Gateway declared the token expired.
    AuthExpired,
    /// Any other gateway error.
    ServerError(String),
    /// Nothing to act on (pong, unknown or malformed frame).
    Ignored,
}

/// Input to the session machine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Consumer asked to connect.
    ConnectRequested {
        /// Token, absent if the caller had none.
        token: Option<AccessToken>,
        /// Watch set at the time of the request.
        watch: WatchSet,
    },
    /// Watch set changed.
    WatchChanged(WatchSet),
    /// Explicit terminal teardown.
    TeardownRequested,
    /// Transport handshake completed.
    TransportOpened,
    /// Transport could not be opened, or failed while open.
    TransportFailed {
        /// Failure description.
        reason: String,
    },
    /// Transport ended.
    TransportClosed,
    /// Inbound frame was dispatched.
    Frame(FrameOutcome),
    /// Keep-alive interval elapsed.
    HeartbeatDue,
    /// No inbound frame within the idle timeout.
    IdleTimeout,
    /// Reconnect backoff elapsed.
    ReconnectDue,
    /// Reconnect policy has no attempts left.
    ReconnectGaveUp {
        /// Attempts made.
        attempts: u32,
    },
}

/// Side effect the connection manager must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Open a transport with this token.
    OpenTransport {
        /// Token to present.
        token: AccessToken,
    },
    /// Send the full desired set as a subscription.
    SendSubscription(WatchSet),
    /// Send a keep-alive frame.
    SendHeartbeat,
    /// Close the transport deliberately.
    CloseTransport,
    /// Drop a failed transport.
    DropTransport,
    /// Start heartbeat and idle supervision.
    StartKeepAlive,
    /// Stop heartbeat and idle supervision.
    StopKeepAlive,
    /// Arm the reconnect timer.
    ScheduleReconnect,
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Reset the backoff and attempt budget.
    ResetBackoff,
    /// Publish on the error channel.
    Notify(SessionError),
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time view of a session, published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Session state.
    pub session: SessionState,
    /// Transport state.
    pub connection: ConnectionState,
    /// Last market status the gateway reported.
    pub market_status: MarketStatus,
    /// Whether the gateway acknowledged the current connection.
    pub confirmed: bool,
    /// Size of the desired watch set.
    pub watched: usize,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Most recent error surfaced.
    pub last_error: Option<String>,
    /// When the transport last opened.
    pub last_connected_at: Option<DateTime<Utc>>,
}
