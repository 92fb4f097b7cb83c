//! Market Data Streaming Types
//!
//! Core domain types for market data: tick records and market status.
//! These types are codec-agnostic, but their serde attributes accept the
//! field-name variants the gateway is known to emit (`bid_ask`/`bidAsk`,
//! `ltq`/`lastTradeQuantity`, ...).

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Tick Record
// =============================================================================

/// Latest known state of one instrument.
///
/// A record is always replaced as a whole when a new tick arrives for its
/// key. A field missing from the frame is `None`/empty in the new record,
/// even if the previous record had a value for it.
///
/// # Wire Format (JSON)
/// ```json
/// {"ltp": 2500.5, "cp": 2480.0, "ltq": "25", "ltt": "1719820799000",
///  "ohlc": [{"interval": "1d", "open": 2470, "high": 2510, "low": 2465, "close": 2500.5}],
///  "bid_ask": [{"bidQ": 10, "bidP": 2500.4, "askQ": 5, "askP": 2500.6}]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickRecord {
    /// Last traded price.
    #[serde(default)]
    pub ltp: Option<Decimal>,

    /// Close price the change percentage is measured against.
    #[serde(default, alias = "changePercentBasis")]
    pub cp: Option<Decimal>,

    /// OHLC bars for the intervals the gateway includes.
    #[serde(default, deserialize_with = "null_as_default")]
    pub ohlc: Vec<OhlcBar>,

    /// Implied volatility (options only).
    #[serde(default)]
    pub iv: Option<Decimal>,

    /// Open interest (derivatives only).
    #[serde(default)]
    pub oi: Option<Decimal>,

    /// Average traded price.
    #[serde(default)]
    pub atp: Option<Decimal>,

    /// Market depth levels.
    #[serde(default, alias = "bid_ask", deserialize_with = "null_as_default")]
    pub bid_ask: Vec<DepthLevel>,

    /// Option greeks.
    #[serde(default)]
    pub greeks: Option<Greeks>,

    /// Quantity of the last trade.
    #[serde(default, alias = "ltq")]
    pub last_trade_quantity: Option<Decimal>,

    /// Time of the last trade as sent by the gateway (epoch millis or RFC 3339).
    #[serde(
        default,
        alias = "last_trade_time",
        alias = "ltt",
        deserialize_with = "string_or_number"
    )]
    pub last_trade_time: Option<String>,

    /// Local receive time, stamped when the frame was decoded.
    #[serde(skip)]
    pub received_at: Option<DateTime<Utc>>,
}

impl TickRecord {
    /// Record carrying only a last traded price.
    #[must_use]
    pub fn with_ltp(ltp: Decimal) -> Self {
        Self {
            ltp: Some(ltp),
            ..Self::default()
        }
    }

    /// Stamp the local receive time.
    #[must_use]
    pub const fn received(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    /// Absolute change of the last price against `cp`.
    #[must_use]
    pub fn change(&self) -> Option<Decimal> {
        Some(self.ltp? - self.cp?)
    }

    /// Percentage change of the last price against `cp`.
    #[must_use]
    pub fn change_percent(&self) -> Option<Decimal> {
        let basis = self.cp?;
        if basis.is_zero() {
            return None;
        }
        Some(self.change()? / basis * Decimal::ONE_HUNDRED)
    }

    /// Parse `last_trade_time` into a timestamp.
    #[must_use]
    pub fn last_trade_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_trade_time.as_deref()?.trim();
        if let Ok(millis) = raw.parse::<i64>() {
            return Utc.timestamp_millis_opt(millis).single();
        }
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// One OHLC bar.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OhlcBar {
    /// Bar interval label (`1d`, `I1`, ...).
    #[serde(default)]
    pub interval: Option<String>,
    /// Open price.
    #[serde(default)]
    pub open: Option<Decimal>,
    /// High price.
    #[serde(default)]
    pub high: Option<Decimal>,
    /// Low price.
    #[serde(default)]
    pub low: Option<Decimal>,
    /// Close price.
    #[serde(default)]
    pub close: Option<Decimal>,
    /// Traded volume.
    #[serde(default, alias = "vol")]
    pub volume: Option<Decimal>,
    /// Bar timestamp as sent by the gateway.
    #[serde(default, deserialize_with = "string_or_number")]
    pub ts: Option<String>,
}

/// One market depth level.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthLevel {
    /// Bid quantity.
    #[serde(default, alias = "bid_q")]
    pub bid_q: Option<Decimal>,
    /// Bid price.
    #[serde(default, alias = "bid_p")]
    pub bid_p: Option<Decimal>,
    /// Ask quantity.
    #[serde(default, alias = "ask_q")]
    pub ask_q: Option<Decimal>,
    /// Ask price.
    #[serde(default, alias = "ask_p")]
    pub ask_p: Option<Decimal>,
}

/// Option greeks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Greeks {
    /// Delta.
    #[serde(default)]
    pub delta: Option<Decimal>,
    /// Theta.
    #[serde(default)]
    pub theta: Option<Decimal>,
    /// Gamma.
    #[serde(default)]
    pub gamma: Option<Decimal>,
    /// Vega.
    #[serde(default)]
    pub vega: Option<Decimal>,
    /// Rho.
    #[serde(default)]
    pub rho: Option<Decimal>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

// =============================================================================
// Market Status
// =============================================================================

/// Exchange session status as reported by the gateway.
///
/// Only explicit status frames change this; connection state never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    /// No status frame received yet.
    #[default]
    Loading,
    /// Market is open.
    Open,
    /// Market is closed.
    Closed,
}

impl MarketStatus {
    /// Map a wire status string. `open` (any case) is open; anything else,
    /// including a missing value, is closed.
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if s.trim().eq_ignore_ascii_case("open") => Self::Open,
            _ => Self::Closed,
        }
    }

    /// Status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}
