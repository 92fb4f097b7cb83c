//! Gateway Message Types
//!
//! Client requests and decoded server frames for the market data gateway.
//!
//! # Client → Server
//!
//! ```json
//! {"data":{"instrumentKeys":["NSE_EQ|INE002A01018","NSE_INDEX|NIFTY 50"]}}
//! {"type":"ping"}
//! ```
//!
//! # Server → Client
//!
//! ```json
//! {"status":"connected","message":"Subscribed"}
//! {"status":"subscribed","instrumentKey":"NSE_EQ|INE002A01018"}
//! {"type":"market_info","marketStatus":"open"}
//! {"type":"live_feed","data":{"NSE_EQ|INE002A01018":{"ltp":2500.5}}}
//! {"event":"market_closed"}
//! {"type":"error","reason":"token_expired"}
//! ```

use serde::Serialize;

use crate::domain::instrument::InstrumentKey;
use crate::domain::streaming::TickRecord;
use crate::domain::subscription::WatchSet;

/// Reason string the gateway uses for an expired token.
pub const TOKEN_EXPIRED: &str = "token_expired";

// =============================================================================
// Client Requests
// =============================================================================

/// Full-set subscription request. The gateway replaces its state with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    data: SubscribeData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeData {
    instrument_keys: Vec<String>,
}

impl SubscribeRequest {
    /// Build a request for the whole watch set, in sorted order.
    #[must_use]
    pub fn new(keys: &WatchSet) -> Self {
        Self {
            data: SubscribeData {
                instrument_keys: keys.iter().map(ToString::to_string).collect(),
            },
        }
    }

    /// Keys in the request.
    #[must_use]
    pub fn instrument_keys(&self) -> &[String] {
        &self.data.instrument_keys
    }
}

/// Keep-alive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PingRequest {
    #[serde(rename = "type")]
    msg_type: &'static str,
}

impl Default for PingRequest {
    fn default() -> Self {
        Self { msg_type: "ping" }
    }
}

// =============================================================================
// Server Frames
// =============================================================================

/// A decoded server push frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Error frame.
    Error {
        /// Human-readable error.
        message: String,
        /// Machine-readable reason, if any.
        reason: Option<String>,
    },
    /// Subscription handshake acknowledged.
    Connected {
        /// Optional message.
        message: Option<String>,
    },
    /// Per-instrument subscription acknowledged.
    Subscribed {
        /// Instrument key as sent by the gateway.
        key: String,
    },
    /// Market status update.
    MarketInfo {
        /// Raw status string, if present.
        status: Option<String>,
    },
    /// Market closed for the day.
    MarketClosed,
    /// One or more ticks.
    Feed {
        /// Decoded entries, in frame order.
        entries: Vec<(InstrumentKey, TickRecord)>,
        /// Entries that could not be decoded.
        rejected: usize,
    },
    /// Keep-alive reply.
    Pong,
    /// Valid JSON of an unrecognized shape.
    Unknown(String),
}

impl ServerFrame {
    /// Whether this is the gateway's token-expiry signal.
    ///
    /// Matches the `token_expired` reason, or any error message mentioning
    /// expiry (`"Token expired"`).
    #[must_use]
    pub fn is_token_expired(&self) -> bool {
        match self {
            Self::Error { message, reason } => {
                reason.as_deref() == Some(TOKEN_EXPIRED)
                    || message.to_ascii_lowercase().contains("expired")
            }
            _ => false,
        }
    }
}
