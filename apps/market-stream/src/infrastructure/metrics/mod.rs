//! Prometheus Metrics Module
//!
//! Exposes session metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames by kind, and frames dropped during decoding
//! - **Connection**: Transport state and reconnect attempts
//! - **Subscriptions**: Watched and cached instrument counts
//! - **Latency**: Frame processing time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Panics
///
/// Panics if another global recorder was already installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            #[allow(clippy::expect_used)]
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_stream_frames_received_total",
        "Total frames received from the gateway, by kind"
    );
    describe_counter!(
        "market_stream_frames_dropped_total",
        "Total frames or batch entries dropped during decoding"
    );
    describe_counter!(
        "market_stream_ticks_applied_total",
        "Total ticks written to the price cache"
    );
    describe_counter!(
        "market_stream_subscriptions_sent_total",
        "Total subscription messages sent"
    );
    describe_counter!(
        "market_stream_heartbeats_sent_total",
        "Total keep-alive frames sent"
    );
    describe_counter!(
        "market_stream_reconnects_total",
        "Total reconnection attempts scheduled"
    );

    describe_gauge!(
        "market_stream_connection_open",
        "1 while the gateway transport is open"
    );
    describe_gauge!(
        "market_stream_watched_instruments",
        "Instruments in the current watch set"
    );
    describe_gauge!(
        "market_stream_cached_instruments",
        "Instruments held in the price cache"
    );

    describe_histogram!(
        "market_stream_frame_processing_seconds",
        "Time to decode and apply one inbound frame"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for inbound frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Handshake acknowledgment.
    Connected,
    /// Per-instrument subscription acknowledgment.
    Subscribed,
    /// Tick batch or single tick.
    Feed,
    /// Market status.
    MarketInfo,
    /// Market closed notice.
    MarketClosed,
    /// Error frame.
    Error,
    /// Keep-alive reply.
    Pong,
    /// Unrecognized shape.
    Unknown,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Subscribed => "subscribed",
            Self::Feed => "feed",
            Self::MarketInfo => "market_info",
            Self::MarketClosed => "market_closed",
            Self::Error => "error",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }
}

/// Why a frame (or part of one) was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload was not a decodable frame.
    Malformed,
    /// One entry of a tick batch failed to decode.
    BadEntry,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::BadEntry => "bad_entry",
        }
    }
}

/// Record a frame received from the gateway.
pub fn record_frame_received(kind: FrameKind) {
    counter!(
        "market_stream_frames_received_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record dropped frames or batch entries.
pub fn record_frames_dropped(reason: DropReason, count: u64) {
    counter!(
        "market_stream_frames_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record ticks written to the cache.
pub fn record_ticks_applied(count: u64) {
    counter!("market_stream_ticks_applied_total").increment(count);
}

/// Record a subscription message sent.
pub fn record_subscription_sent() {
    counter!("market_stream_subscriptions_sent_total").increment(1);
}

/// Record a keep-alive frame sent.
pub fn record_heartbeat_sent() {
    counter!("market_stream_heartbeats_sent_total").increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("market_stream_reconnects_total").increment(1);
}

/// Update the transport gauge.
pub fn set_connection_open(open: bool) {
    gauge!("market_stream_connection_open").set(if open { 1.0 } else { 0.0 });
}

/// Update the watched instrument gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_watched_instruments(count: usize) {
    gauge!("market_stream_watched_instruments").set(count as f64);
}

/// Update the cached instrument gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_cached_instruments(count: usize) {
    gauge!("market_stream_cached_instruments").set(count as f64);
}

/// Record frame processing duration.
pub fn record_processing_duration(duration: Duration) {
    histogram!("market_stream_frame_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_as_str() {
        assert_eq!(FrameKind::Connected.as_str(), "connected");
        assert_eq!(FrameKind::Feed.as_str(), "feed");
        assert_eq!(FrameKind::MarketInfo.as_str(), "market_info");
        assert_eq!(FrameKind::MarketClosed.as_str(), "market_closed");
        assert_eq!(FrameKind::Error.as_str(), "error");
        assert_eq!(FrameKind::Pong.as_str(), "pong");
        assert_eq!(FrameKind::Unknown.as_str(), "unknown");
    }

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::Malformed.as_str(), "malformed");
        assert_eq!(DropReason::BadEntry.as_str(), "bad_entry");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received(FrameKind::Feed);
        record_frames_dropped(DropReason::Malformed, 1);
        set_watched_instruments(3);
        record_processing_duration(Duration::from_micros(5));
    }
}
