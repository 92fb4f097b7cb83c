//! Stream Configuration Settings
//!
//! Configuration types for the market stream, loaded from environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::ports::TransportError;
use crate::application::services::SessionConfig;
use crate::domain::instrument::{KeyError, parse_keys};
use crate::domain::price_cache::DEFAULT_UPDATE_CAPACITY;
use crate::domain::subscription::WatchSet;
use crate::infrastructure::gateway::{
    ConnectionSettings, GatewayEndpoint, HeartbeatConfig, ReconnectConfig,
};

/// Where the access token is read from.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenLocation {
    /// Token given inline.
    Inline(String),
    /// Token stored in a file.
    File(PathBuf),
    /// No token configured.
    Unset,
}

impl std::fmt::Debug for TokenLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("Inline([REDACTED])"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Unset => f.write_str("Unset"),
        }
    }
}

/// Keep-alive and reconnect timing.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Keep-alive interval.
    pub heartbeat_interval: Duration,
    /// Inbound silence before the link is considered dead.
    pub idle_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

impl WebSocketSettings {
    /// Connection settings for the session.
    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat: HeartbeatConfig::new(self.heartbeat_interval, self.idle_timeout),
            reconnect: ReconnectConfig {
                initial_delay: self.reconnect_delay_initial,
                max_delay: self.reconnect_delay_max,
                multiplier: self.reconnect_delay_multiplier,
                max_attempts: self.max_reconnect_attempts,
                ..ReconnectConfig::default()
            },
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Gateway base URL.
    pub endpoint: GatewayEndpoint,
    /// Access token location.
    pub token: TokenLocation,
    /// Instruments the binary watches on startup.
    pub instruments: WatchSet,
    /// Server port settings.
    pub server: ServerSettings,
    /// Keep-alive and reconnect settings.
    pub websocket: WebSocketSettings,
    /// Capacity of the tick update channel.
    pub tick_channel_capacity: usize,
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_STREAM_URL` is missing or invalid, or if
    /// `MARKET_STREAM_INSTRUMENTS` holds a blank key.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("MARKET_STREAM_URL")
            .map_err(|_| ConfigError::MissingEnvVar("MARKET_STREAM_URL".to_string()))?;

        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_STREAM_URL".to_string()));
        }

        let endpoint = GatewayEndpoint::parse(&url)?;

        let token = match (
            non_empty_env("MARKET_STREAM_TOKEN"),
            non_empty_env("MARKET_STREAM_TOKEN_FILE"),
        ) {
            (Some(token), _) => TokenLocation::Inline(token),
            (None, Some(path)) => TokenLocation::File(PathBuf::from(path)),
            (None, None) => TokenLocation::Unset,
        };

        let instruments = non_empty_env("MARKET_STREAM_INSTRUMENTS")
            .map(|raw| parse_instruments(&raw))
            .transpose()?
            .unwrap_or_default();

        let server = ServerSettings {
            health_port: parse_env_u16(
                "MARKET_STREAM_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let websocket = WebSocketSettings {
            heartbeat_interval: parse_env_duration_secs(
                "MARKET_STREAM_HEARTBEAT_INTERVAL_SECS",
                WebSocketSettings::default().heartbeat_interval,
            ),
            idle_timeout: parse_env_duration_secs(
                "MARKET_STREAM_IDLE_TIMEOUT_SECS",
                WebSocketSettings::default().idle_timeout,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                "MARKET_STREAM_RECONNECT_DELAY_INITIAL_MS",
                WebSocketSettings::default().reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "MARKET_STREAM_RECONNECT_DELAY_MAX_SECS",
                WebSocketSettings::default().reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "MARKET_STREAM_RECONNECT_DELAY_MULTIPLIER",
                WebSocketSettings::default().reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                "MARKET_STREAM_MAX_RECONNECT_ATTEMPTS",
                WebSocketSettings::default().max_reconnect_attempts,
            ),
        };

        Ok(Self {
            endpoint,
            token,
            instruments,
            server,
            websocket,
            tick_channel_capacity: parse_env_usize(
                "MARKET_STREAM_TICK_CHANNEL_CAPACITY",
                DEFAULT_UPDATE_CAPACITY,
            ),
        })
    }

    /// Session settings derived from this configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connection: self.websocket.connection_settings(),
            tick_channel_capacity: self.tick_channel_capacity,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Gateway URL is not usable.
    #[error("invalid MARKET_STREAM_URL: {0}")]
    InvalidEndpoint(#[from] TransportError),
    /// Instrument list holds a blank entry.
    #[error("invalid MARKET_STREAM_INSTRUMENTS: {0}")]
    InvalidInstrument(#[from] KeyError),
}

/// Parse a comma-separated instrument list, skipping empty segments.
///
/// # Errors
///
/// Never fails for comma-only input; returns [`KeyError`] only if a key
/// cannot be built.
pub fn parse_instruments(raw: &str) -> Result<WatchSet, KeyError> {
    parse_keys(raw.split(',').filter(|part| !part.trim().is_empty()))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
