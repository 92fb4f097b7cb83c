//! Session state machine.

use crate::domain::streaming::MarketStatus;
use crate::domain::subscription::{WatchSet, diff};

use super::{
    AccessToken, ConnectionState, FrameOutcome, SessionEffect, SessionError, SessionEvent,
    SessionSnapshot, SessionState,
};

/// Pure transition function for one gateway session.
///
/// Holds the desired watch set, the set last sent on the current connection,
/// and the token. Invariant: at most one transport is requested while the
/// connection state is not `Closed`.
#[derive(Debug, Default)]
pub struct SessionMachine {
    session: SessionState,
    connection: ConnectionState,
    market_status: MarketStatus,
    token: Option<AccessToken>,
    desired: WatchSet,
    /// Set last sent on the current connection; `None` until the first send.
    sent: Option<WatchSet>,
    reconnect_pending: bool,
    confirmed: bool,
    last_error: Option<SessionError>,
}

impl SessionMachine {
    /// Create a machine in the initial state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Session state.
    #[must_use]
    pub const fn session(&self) -> SessionState {
        self.session
    }

    /// Connection state.
    #[must_use]
    pub const fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Last reported market status.
    #[must_use]
    pub const fn market_status(&self) -> MarketStatus {
        self.market_status
    }

    /// Desired watch set.
    #[must_use]
    pub const fn desired(&self) -> &WatchSet {
        &self.desired
    }

    /// Whether a reconnect timer is armed.
    #[must_use]
    pub const fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Snapshot of the machine-owned fields.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session,
            connection: self.connection,
            market_status: self.market_status,
            confirmed: self.confirmed,
            watched: self.desired.len(),
            last_error: self.last_error.as_ref().map(ToString::to_string),
            ..SessionSnapshot::default()
        }
    }

    /// Apply one event, returning the effects to perform in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        match event {
            SessionEvent::ConnectRequested { token, watch } => self.on_connect(token, watch),
            SessionEvent::WatchChanged(watch) => self.on_watch_changed(watch),
            SessionEvent::TeardownRequested => self.teardown(),
            SessionEvent::TransportOpened => self.on_opened(),
            SessionEvent::TransportFailed { reason } => self.on_failed(&reason),
            SessionEvent::TransportClosed => self.on_closed(),
            SessionEvent::Frame(outcome) => self.on_frame(outcome),
            SessionEvent::HeartbeatDue => {
                if self.connection == ConnectionState::Open {
                    vec![SessionEffect::SendHeartbeat]
                } else {
                    vec![]
                }
            }
            SessionEvent::IdleTimeout => {
                if self.connection == ConnectionState::Open {
                    self.on_failed("idle timeout")
                } else {
                    vec![]
                }
            }
            SessionEvent::ReconnectDue => self.on_reconnect_due(),
            SessionEvent::ReconnectGaveUp { attempts } => {
                self.reconnect_pending = false;
                self.set_session(SessionState::Degraded);
                self.notify(SessionError::ReconnectExhausted(attempts))
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_connect(&mut self, token: Option<AccessToken>, watch: WatchSet) -> Vec<SessionEffect> {
        let Some(token) = token else {
            tracing::debug!("Connect ignored, no token");
            return vec![];
        };
        if self.connection != ConnectionState::Closed {
            tracing::debug!(
                connection = self.connection.as_str(),
                "Connect ignored, connection already exists"
            );
            return vec![];
        }

        let mut effects = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(SessionEffect::CancelReconnect);
        }

        self.token = Some(token);
        self.last_error = None;
        self.desired = watch;
        // An explicit connect starts a fresh attempt budget
        effects.push(SessionEffect::ResetBackoff);

        if self.desired.is_empty() {
            // Opened as soon as something is watched
            self.set_session(SessionState::Unauthenticated);
        } else {
            effects.extend(self.open_transport());
        }
        effects
    }

    fn on_watch_changed(&mut self, watch: WatchSet) -> Vec<SessionEffect> {
        self.desired = watch;

        match self.connection {
            ConnectionState::Open => self.sync_subscription(),
            ConnectionState::Closed
                if self.token.is_some()
                    && !self.reconnect_pending
                    && self.session == SessionState::Unauthenticated
                    && !self.desired.is_empty() =>
            {
                self.open_transport()
            }
            // Remembered; sent once the connection opens
            _ => vec![],
        }
    }

    fn teardown(&mut self) -> Vec<SessionEffect> {
        self.token = None;
        self.reconnect_pending = false;
        self.set_session(SessionState::Expired);

        let mut effects = vec![SessionEffect::CancelReconnect, SessionEffect::StopKeepAlive];
        if matches!(
            self.connection,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            self.set_connection(ConnectionState::Closing);
            effects.push(SessionEffect::CloseTransport);
        }
        effects
    }

    // =========================================================================
    // Transport
    // =========================================================================

    fn open_transport(&mut self) -> Vec<SessionEffect> {
        let Some(token) = self.token.clone() else {
            return vec![];
        };
        self.sent = None;
        self.confirmed = false;
        self.set_connection(ConnectionState::Connecting);
        self.set_session(SessionState::Connecting);
        vec![SessionEffect::OpenTransport { token }]
    }

    fn on_opened(&mut self) -> Vec<SessionEffect> {
        if self.connection != ConnectionState::Connecting {
            tracing::debug!(
                connection = self.connection.as_str(),
                "Stale transport open ignored"
            );
            return vec![];
        }
        self.set_connection(ConnectionState::Open);

        let mut effects = vec![SessionEffect::ResetBackoff, SessionEffect::StartKeepAlive];
        effects.extend(self.sync_subscription());
        effects
    }

    fn on_failed(&mut self, reason: &str) -> Vec<SessionEffect> {
        if self.connection == ConnectionState::Closed {
            return vec![];
        }
        tracing::debug!(reason, "Transport failed");
        self.set_connection(ConnectionState::Error);
        self.set_connection(ConnectionState::Closed);

        let mut effects = vec![SessionEffect::StopKeepAlive, SessionEffect::DropTransport];
        effects.extend(self.schedule_reconnect());
        effects
    }

    fn on_closed(&mut self) -> Vec<SessionEffect> {
        match self.connection {
            ConnectionState::Closed => vec![],
            ConnectionState::Closing | ConnectionState::Error => {
                self.set_connection(ConnectionState::Closed);
                vec![]
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                self.set_connection(ConnectionState::Closed);
                let mut effects = vec![SessionEffect::StopKeepAlive, SessionEffect::DropTransport];
                effects.extend(self.schedule_reconnect());
                effects
            }
        }
    }

    fn schedule_reconnect(&mut self) -> Vec<SessionEffect> {
        self.sent = None;
        self.confirmed = false;
        if self.token.is_none()
            || matches!(self.session, SessionState::Expired | SessionState::Degraded)
        {
            return vec![];
        }
        self.reconnect_pending = true;
        self.set_session(SessionState::Connecting);
        vec![SessionEffect::ScheduleReconnect]
    }

    fn on_reconnect_due(&mut self) -> Vec<SessionEffect> {
        if !self.reconnect_pending {
            return vec![];
        }
        self.reconnect_pending = false;
        if self.desired.is_empty() {
            self.set_session(SessionState::Unauthenticated);
            return vec![];
        }
        self.open_transport()
    }

    /// Send the desired set if it differs from what this connection has.
    fn sync_subscription(&mut self) -> Vec<SessionEffect> {
        let changed = match &self.sent {
            // Nothing to declare on a fresh connection
            None => !self.desired.is_empty(),
            Some(sent) => !diff(sent, &self.desired).is_empty(),
        };
        if !changed {
            return vec![];
        }
        self.sent = Some(self.desired.clone());
        vec![SessionEffect::SendSubscription(self.desired.clone())]
    }

    // =========================================================================
    // Frames
    // =========================================================================

    fn on_frame(&mut self, outcome: FrameOutcome) -> Vec<SessionEffect> {
        match outcome {
            FrameOutcome::Acknowledged => {
                self.confirmed = true;
                self.mark_streaming();
                vec![]
            }
            FrameOutcome::Ticks(count) => {
                if count > 0 {
                    self.mark_streaming();
                }
                vec![]
            }
            FrameOutcome::MarketStatus(status) => {
                self.market_status = status;
                vec![]
            }
            FrameOutcome::MarketClosed => {
                self.market_status = MarketStatus::Closed;
                self.set_session(SessionState::Degraded);
                let mut effects = Vec::new();
                if self.reconnect_pending {
                    self.reconnect_pending = false;
                    effects.push(SessionEffect::CancelReconnect);
                }
                effects.push(SessionEffect::StopKeepAlive);
                if matches!(
                    self.connection,
                    ConnectionState::Connecting | ConnectionState::Open
                ) {
                    self.set_connection(ConnectionState::Closing);
                    effects.push(SessionEffect::CloseTransport);
                }
                effects
            }
            FrameOutcome::AuthExpired => {
                let mut effects = self.notify(SessionError::AuthExpired);
                effects.extend(self.teardown());
                effects
            }
            FrameOutcome::ServerError(message) => self.notify(SessionError::Gateway(message)),
            FrameOutcome::Ignored => vec![],
        }
    }

    fn mark_streaming(&mut self) {
        if self.connection == ConnectionState::Open && self.session == SessionState::Connecting {
            self.set_session(SessionState::Streaming);
        }
    }

    fn notify(&mut self, error: SessionError) -> Vec<SessionEffect> {
        self.last_error = Some(error.clone());
        vec![SessionEffect::Notify(error)]
    }

    fn set_session(&mut self, next: SessionState) {
        if self.session != next {
            tracing::debug!(
                from = self.session.as_str(),
                to = next.as_str(),
                "Session state changed"
            );
            self.session = next;
        }
    }

    fn set_connection(&mut self, next: ConnectionState) {
        if self.connection != next {
            tracing::debug!(
                from = self.connection.as_str(),
                to = next.as_str(),
                "Connection state changed"
            );
            self.connection = next;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
