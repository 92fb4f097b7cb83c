#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Stream - Shared Market Data Session Core
//!
//! Keeps exactly one WebSocket connection per session to the market data
//! gateway, reconciles the instruments consumers watch into subscription
//! messages, and stores the latest tick per instrument in a cache any number
//! of in-process consumers read from.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core types and pure logic
//!   - `instrument`: Canonical instrument keys
//!   - `streaming`: Tick records and market status
//!   - `subscription`: Consumer interest and watch-set diffing
//!   - `price_cache`: Latest tick per instrument
//!   - `session`: Session/connection state machine
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Gateway connector and token storage interfaces
//!   - `services`: `MarketSession`, the consumer-facing API
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `gateway`: WebSocket connector, frame codec, connection manager
//!   - `config`: Environment configuration and token sources
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing and OpenTelemetry setup
//!
//! # Data Flow
//!
//! ```text
//! consumer A --watch--+                         +--> price(key)
//!                     +--> WatchRegistry        |
//! consumer B --watch--+        | watch set      +--> tick_updates()
//!                              v                |
//!                     ConnectionManager ---> PriceCache
//!                        |        ^
//!            subscribe   |        | live_feed / market_info / errors
//!                        v        |
//!                     gateway /ws/market
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types and the session state machine, no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::instrument::{InstrumentKey, KeyError};
pub use domain::price_cache::{PriceCache, TickUpdate};
pub use domain::session::{
    AccessToken, ConnectionState, SessionError, SessionSnapshot, SessionState,
};
pub use domain::streaming::{DepthLevel, Greeks, MarketStatus, OhlcBar, TickRecord};
pub use domain::subscription::{ConsumerId, SubscriptionDelta, WatchSet, diff};

// Ports
pub use application::ports::{
    Connector, FrameSink, FrameStream, TokenSource, TokenSourceError, TransportError,
    TransportLink,
};

// Session
pub use application::services::{MarketSession, SessionConfig};

// Gateway adapter
pub use infrastructure::gateway::{
    ConnectionSettings, GatewayEndpoint, HeartbeatConfig, ReconnectConfig, WebSocketConnector,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, StreamConfig, TokenLocation, token_source};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
