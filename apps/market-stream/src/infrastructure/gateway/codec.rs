//! Gateway Frame Codec
//!
//! Decodes server push frames into [`ServerFrame`]s and encodes client
//! requests. The gateway is not strict about field names, so decoding
//! classifies frames by inspecting the raw JSON object rather than relying on
//! a single tagged representation.
//!
//! # Classification Order
//!
//! 1. Bare `pong` text
//! 2. `error` key, or `type: "error"`
//! 3. `type`: `market_info`, `live_feed`, `ltp_update`, `pong`
//! 4. `event: "market_closed"`
//! 5. Top-level `instrumentKey` / `instrument_key` with `data`
//! 6. `status: "subscribed"` with a top-level key and no `data`
//! 7. `status: "connected"`
//! 8. Anything else is [`ServerFrame::Unknown`]

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::instrument::InstrumentKey;
use crate::domain::streaming::TickRecord;

use super::messages::ServerFrame;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is JSON but not a usable shape.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for gateway frames.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// A bad entry inside a tick batch does not fail the frame; it is counted
    /// as rejected on the returned [`ServerFrame::Feed`] instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object, or a recognized
    /// frame type carries an unusable payload.
    pub fn decode(&self, text: &str) -> Result<ServerFrame, CodecError> {
        let trimmed = text.trim();

        if trimmed.eq_ignore_ascii_case("pong") {
            return Ok(ServerFrame::Pong);
        }

        let value: Value = serde_json::from_str(trimmed)?;
        let Value::Object(obj) = value else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                preview(trimmed)
            )));
        };

        let msg_type = str_field(&obj, &["type"]);

        if obj.contains_key("error") || msg_type == Some("error") {
            return Ok(decode_error(&obj));
        }

        match msg_type {
            Some("market_info") => {
                return Ok(ServerFrame::MarketInfo {
                    status: str_field(&obj, &["marketStatus", "market_status", "status"])
                        .map(ToString::to_string),
                });
            }
            Some("live_feed") => return decode_batch(obj.get("data")),
            Some("ltp_update") => return decode_single(obj.get("data"), None),
            Some("pong") => return Ok(ServerFrame::Pong),
            _ => {}
        }

        if str_field(&obj, &["event"]) == Some("market_closed") {
            return Ok(ServerFrame::MarketClosed);
        }

        let status = str_field(&obj, &["status"]);

        if let Some(key) = obj.get("instrumentKey").or_else(|| obj.get("instrument_key")) {
            if obj.get("data").is_some_and(Value::is_object) {
                return decode_single(obj.get("data"), Some(key));
            }
            if status.is_some_and(|s| s.eq_ignore_ascii_case("subscribed")) {
                return Ok(ServerFrame::Subscribed {
                    key: key.as_str().unwrap_or_default().to_string(),
                });
            }
        }

        if status.is_some_and(|s| s.eq_ignore_ascii_case("connected")) {
            return Ok(ServerFrame::Connected {
                message: str_field(&obj, &["message"]).map(ToString::to_string),
            });
        }

        Ok(ServerFrame::Unknown(describe(&obj)))
    }

    /// Encode a request to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// First string value among `names`.
fn str_field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| obj.get(*name).and_then(Value::as_str))
}

fn decode_error(obj: &Map<String, Value>) -> ServerFrame {
    let message = match obj.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => str_field(obj, &["message", "msg"])
            .unwrap_or("unspecified error")
            .to_string(),
        Some(other) => other.to_string(),
    };
    ServerFrame::Error {
        message,
        reason: str_field(obj, &["reason"]).map(ToString::to_string),
    }
}

/// `{"data": {"KEY": {tick}, ...}}`
fn decode_batch(data: Option<&Value>) -> Result<ServerFrame, CodecError> {
    let Some(Value::Object(entries)) = data else {
        return Err(CodecError::InvalidFormat(
            "live_feed without data object".to_string(),
        ));
    };

    let mut decoded = Vec::with_capacity(entries.len());
    let mut rejected = 0;

    for (raw_key, raw_tick) in entries {
        match decode_entry(raw_key, raw_tick) {
            Some(entry) => decoded.push(entry),
            None => rejected += 1,
        }
    }

    Ok(ServerFrame::Feed {
        entries: decoded,
        rejected,
    })
}

/// `{"instrumentKey": K, "data": {tick}}` or `{"data": {"instrumentKey": K, ...tick}}`
fn decode_single(data: Option<&Value>, key: Option<&Value>) -> Result<ServerFrame, CodecError> {
    let Some(data) = data.filter(|d| d.is_object()) else {
        return Err(CodecError::InvalidFormat("tick without data object".to_string()));
    };

    let key = key
        .or_else(|| data.get("instrumentKey"))
        .or_else(|| data.get("instrument_key"))
        .and_then(Value::as_str);

    let entry = key.and_then(|k| decode_entry(k, data));
    let rejected = usize::from(entry.is_none());

    Ok(ServerFrame::Feed {
        entries: entry.into_iter().collect(),
        rejected,
    })
}

fn decode_entry(raw_key: &str, raw_tick: &Value) -> Option<(InstrumentKey, TickRecord)> {
    let key = match InstrumentKey::new(raw_key) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(error = %e, "Dropping tick with invalid key");
            return None;
        }
    };

    match TickRecord::deserialize(raw_tick) {
        Ok(tick) => Some((key, tick)),
        Err(e) => {
            tracing::debug!(key = %key, error = %e, "Dropping undecodable tick");
            None
        }
    }
}

fn describe(obj: &Map<String, Value>) -> String {
    let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
    format!("{{{}}}", keys.join(","))
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(idx, _)| idx);
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use test_case::test_case;

    fn decode(text: &str) -> ServerFrame {
        FrameCodec::new().decode(text).unwrap()
    }

    #[test_case("pong" ; "bare text")]
    #[test_case(" PONG\n" ; "bare text any case")]
    #[test_case(r#"{"type":"pong"}"# ; "json")]
    fn decodes_pong(text: &str) {
        assert_eq!(decode(text), ServerFrame::Pong);
    }

    #[test_case(r#"{"type":"market_info","marketStatus":"open"}"#, Some("open") ; "camel case")]
    #[test_case(r#"{"type":"market_info","status":"NORMAL_CLOSE"}"#, Some("NORMAL_CLOSE") ; "status alias")]
    #[test_case(r#"{"type":"market_info"}"#, None ; "missing status")]
    fn decodes_market_info(text: &str, expected: Option<&str>) {
        assert_eq!(
            decode(text),
            ServerFrame::MarketInfo {
                status: expected.map(ToString::to_string)
            }
        );
    }

    #[test_case(r#"{"error":"Unauthorized","reason":"token_expired"}"#, true ; "error key with reason")]
    #[test_case(r#"{"type":"error","reason":"token_expired"}"#, true ; "typed error")]
    #[test_case(r#"{"error":"token_expired"}"#, true ; "reason in error field")]
    #[test_case(r#"{"error":"Token expired"}"#, true ; "expiry in message")]
    #[test_case(r#"{"type":"error","message":"Session EXPIRED, login again"}"#, true ; "expiry any case")]
    #[test_case(r#"{"error":"Invalid instrument"}"#, false ; "other error")]
    #[test_case(r#"{"type":"error","message":"bad request"}"#, false ; "typed error with message")]
    fn decodes_errors(text: &str, expired: bool) {
        let frame = decode(text);
        assert!(matches!(frame, ServerFrame::Error { .. }));
        assert_eq!(frame.is_token_expired(), expired);
    }

    #[test]
    fn error_message_fallbacks() {
        assert_eq!(
            decode(r#"{"type":"error","message":"bad request"}"#),
            ServerFrame::Error {
                message: "bad request".to_string(),
                reason: None
            }
        );
        assert!(matches!(
            decode(r#"{"error":{"code":500}}"#),
            ServerFrame::Error { message, .. } if message.contains("500")
        ));
    }

    #[test]
    fn decodes_market_closed() {
        assert_eq!(decode(r#"{"event":"market_closed"}"#), ServerFrame::MarketClosed);
    }

    #[test_case(r#"{"status":"connected","message":"Subscribed to 1 instruments"}"# ; "with message")]
    #[test_case(r#"{"status":"CONNECTED"}"# ; "any case")]
    fn decodes_connected(text: &str) {
        assert!(matches!(decode(text), ServerFrame::Connected { .. }));
    }

    #[test]
    fn decodes_live_feed_batch() {
        let frame = decode(
            r#"{"type":"live_feed","data":{
                "nse_eq|reliance":{"ltp":2500.5,"ltq":"10"},
                "NSE_INDEX|NIFTY 50":{"ltp":24000,"cp":23900}
            }}"#,
        );

        let ServerFrame::Feed { entries, rejected } = frame else {
            panic!("expected Feed frame");
        };
        assert_eq!(rejected, 0);
        assert_eq!(entries.len(), 2);

        let reliance = entries
            .iter()
            .find(|(k, _)| k.as_str() == "NSE_EQ|RELIANCE")
            .unwrap();
        assert_eq!(reliance.1.ltp, Some(Decimal::from_str("2500.5").unwrap()));
    }

    #[test]
    fn bad_batch_entry_is_dropped_individually() {
        let frame = decode(
            r#"{"type":"live_feed","data":{
                "GOOD":{"ltp":1},
                "BAD":{"ltp":"not-a-number"},
                "ALSO_BAD":42
            }}"#,
        );

        let ServerFrame::Feed { entries, rejected } = frame else {
            panic!("expected Feed frame");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.as_str(), "GOOD");
        assert_eq!(rejected, 2);
    }

    #[test_case(r#"{"instrumentKey":"nifty","data":{"ltp":100}}"# ; "camel key")]
    #[test_case(r#"{"instrument_key":"NIFTY","data":{"ltp":100}}"# ; "snake key")]
    #[test_case(r#"{"type":"ltp_update","data":{"instrumentKey":"Nifty","ltp":100}}"# ; "ltp update")]
    fn decodes_single_tick(text: &str) {
        let ServerFrame::Feed { entries, rejected } = decode(text) else {
            panic!("expected Feed frame");
        };
        assert_eq!(rejected, 0);
        assert_eq!(entries[0].0.as_str(), "NIFTY");
        assert_eq!(entries[0].1.ltp, Some(Decimal::from(100)));
    }

    #[test_case(r#"{"status":"subscribed","instrumentKey":"NSE_EQ|INE002A01018"}"# ; "camel key")]
    #[test_case(r#"{"status":"SUBSCRIBED","instrument_key":"NSE_EQ|INE002A01018"}"# ; "snake key")]
    fn decodes_subscribed_ack(text: &str) {
        assert_eq!(
            decode(text),
            ServerFrame::Subscribed {
                key: "NSE_EQ|INE002A01018".to_string()
            }
        );
    }

    #[test]
    fn keyed_frame_without_data_is_not_a_tick() {
        assert!(matches!(
            decode(r#"{"instrumentKey":"NIFTY","note":"queued"}"#),
            ServerFrame::Unknown(_)
        ));
    }

    #[test]
    fn single_tick_without_key_is_rejected() {
        assert_eq!(
            decode(r#"{"type":"ltp_update","data":{"ltp":100}}"#),
            ServerFrame::Feed {
                entries: vec![],
                rejected: 1
            }
        );
    }

    #[test]
    fn unknown_shape_is_reported() {
        assert!(matches!(
            decode(r#"{"hello":"world"}"#),
            ServerFrame::Unknown(desc) if desc.contains("hello")
        ));
    }

    #[test_case("not json" ; "plain text")]
    #[test_case("[1,2,3]" ; "array")]
    #[test_case(r#"{"type":"live_feed","data":[]}"# ; "feed without object")]
    #[test_case(r#"{"type":"live_feed""# ; "truncated")]
    fn rejects_malformed(text: &str) {
        assert!(FrameCodec::new().decode(text).is_err());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let text = "é".repeat(80);
        assert_eq!(preview(&text).chars().count(), 50);
    }
}
