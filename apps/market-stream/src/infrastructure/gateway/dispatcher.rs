//! Message Dispatcher
//!
//! Applies decoded server frames: ticks go into the price cache, everything
//! else becomes a [`FrameOutcome`] for the session machine. Undecodable
//! frames are logged and dropped; nothing here can tear the session down on
//! its own.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::domain::price_cache::PriceCache;
use crate::domain::session::FrameOutcome;
use crate::domain::streaming::MarketStatus;
use crate::infrastructure::metrics::{self, DropReason, FrameKind};

use super::codec::FrameCodec;
use super::messages::ServerFrame;

/// Decodes inbound frames and writes ticks to the cache.
#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    codec: FrameCodec,
    cache: Arc<PriceCache>,
}

impl MessageDispatcher {
    /// Create a dispatcher writing into `cache`.
    #[must_use]
    pub const fn new(cache: Arc<PriceCache>) -> Self {
        Self {
            codec: FrameCodec::new(),
            cache,
        }
    }

    /// Decode and apply one text frame.
    pub fn dispatch(&self, text: &str) -> FrameOutcome {
        let started = Instant::now();

        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, len = text.len(), "Dropping undecodable frame");
                metrics::record_frames_dropped(DropReason::Malformed, 1);
                return FrameOutcome::Ignored;
            }
        };

        let outcome = self.apply(frame);
        metrics::record_processing_duration(started.elapsed());
        outcome
    }

    fn apply(&self, frame: ServerFrame) -> FrameOutcome {
        match frame {
            ServerFrame::Feed { entries, rejected } => {
                metrics::record_frame_received(FrameKind::Feed);
                if rejected > 0 {
                    tracing::debug!(rejected, "Dropped undecodable batch entries");
                    metrics::record_frames_dropped(
                        DropReason::BadEntry,
                        u64::try_from(rejected).unwrap_or(u64::MAX),
                    );
                }

                let received_at = Utc::now();
                let count = entries.len();
                for (key, tick) in entries {
                    self.cache.upsert(key, tick.received(received_at));
                }

                metrics::record_ticks_applied(u64::try_from(count).unwrap_or(u64::MAX));
                metrics::set_cached_instruments(self.cache.len());
                FrameOutcome::Ticks(count)
            }
            ServerFrame::Connected { message } => {
                metrics::record_frame_received(FrameKind::Connected);
                tracing::info!(
                    message = message.as_deref().unwrap_or(""),
                    "Gateway acknowledged subscription"
                );
                FrameOutcome::Acknowledged
            }
            ServerFrame::Subscribed { key } => {
                metrics::record_frame_received(FrameKind::Subscribed);
                tracing::debug!(instrument = %key, "Gateway acknowledged instrument");
                FrameOutcome::Acknowledged
            }
            ServerFrame::MarketInfo { status } => {
                metrics::record_frame_received(FrameKind::MarketInfo);
                let status = MarketStatus::from_wire(status.as_deref());
                tracing::info!(status = status.as_str(), "Market status update");
                FrameOutcome::MarketStatus(status)
            }
            ServerFrame::MarketClosed => {
                metrics::record_frame_received(FrameKind::MarketClosed);
                tracing::info!("Gateway reports market closed");
                FrameOutcome::MarketClosed
            }
            frame @ ServerFrame::Error { .. } if frame.is_token_expired() => {
                metrics::record_frame_received(FrameKind::Error);
                tracing::warn!("Gateway reports access token expired");
                FrameOutcome::AuthExpired
            }
            ServerFrame::Error { message, reason } => {
                metrics::record_frame_received(FrameKind::Error);
                tracing::warn!(
                    message = %message,
                    reason = reason.as_deref().unwrap_or(""),
                    "Gateway error"
                );
                FrameOutcome::ServerError(message)
            }
            ServerFrame::Pong => {
                metrics::record_frame_received(FrameKind::Pong);
                tracing::trace!("Pong");
                FrameOutcome::Ignored
            }
            ServerFrame::Unknown(shape) => {
                metrics::record_frame_received(FrameKind::Unknown);
                tracing::debug!(shape = %shape, "Ignoring unrecognized frame");
                FrameOutcome::Ignored
            }
        }
    }
}
