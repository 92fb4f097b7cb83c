//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Connector`]: opens one text-frame transport to the market data gateway
//! - [`TokenSource`]: reads the access token from local storage

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::domain::session::AccessToken;

// =============================================================================
// Transport
// =============================================================================

/// Errors raised by a transport link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Endpoint could not be built from configuration.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Handshake failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Outbound frame could not be written.
    #[error("send failed: {0}")]
    Send(String),

    /// Inbound stream failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// Peer closed the link.
    #[error("connection closed")]
    Closed,
}

/// Outbound half of a link: accepts text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a link: yields text frames until the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open, full-duplex text-frame link.
pub struct TransportLink {
    /// Outbound frames.
    pub sink: FrameSink,
    /// Inbound frames.
    pub stream: FrameStream,
}

impl TransportLink {
    /// Bundle a sink and stream.
    #[must_use]
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// Opens transports to the market data gateway.
///
/// One call yields one physical connection. The session guarantees it never
/// has more than one call outstanding.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link authenticated with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the link cannot be established.
    async fn connect(&self, token: &AccessToken) -> Result<TransportLink, TransportError>;
}

// =============================================================================
// Token Storage
// =============================================================================

/// Errors reading a stored token.
#[derive(Debug, thiserror::Error)]
pub enum TokenSourceError {
    /// Storage could not be read.
    #[error("failed to read token from {location}: {source}")]
    Read {
        /// Where the token was expected.
        location: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Local storage holding the access token.
pub trait TokenSource: Send + Sync {
    /// Load the current token. `Ok(None)` means no token is stored.
    ///
    /// # Errors
    ///
    /// Returns [`TokenSourceError`] if storage exists but cannot be read.
    fn load(&self) -> Result<Option<AccessToken>, TokenSourceError>;
}
