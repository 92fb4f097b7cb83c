//! WebSocket Connector
//!
//! Production [`Connector`] over `tokio-tungstenite` with rustls. Adapts the
//! socket into the text-frame [`TransportLink`] the session works with:
//! protocol-level ping/pong is handled here and never reaches the session,
//! binary frames are accepted when they hold UTF-8 text.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::application::ports::{Connector, TransportError, TransportLink};
use crate::domain::session::AccessToken;

use super::endpoint::GatewayEndpoint;

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens WebSocket links to the gateway.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: GatewayEndpoint,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for `endpoint`.
    #[must_use]
    pub const fn new(endpoint: GatewayEndpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, token: &AccessToken) -> Result<TransportLink, TransportError> {
        let url = self.endpoint.stream_url(token);
        tracing::info!(endpoint = %self.endpoint.as_str(), "Connecting to market stream");

        let handshake = tokio_tungstenite::connect_async(url.as_str());
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Connect("handshake timed out".to_string()))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text.into()))))
            .sink_map_err(|e| TransportError::Send(e.to_string()));

        let stream = read.filter_map(|message| future::ready(map_inbound(message)));

        Ok(TransportLink::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Map a socket message to a text frame. `None` skips control frames.
fn map_inbound(message: Result<Message, WsError>) -> Option<Result<String, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => Some(
            String::from_utf8(bytes.to_vec())
                .map_err(|e| TransportError::Receive(format!("non-UTF-8 binary frame: {e}"))),
        ),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Ok(Message::Close(frame)) => {
            let (code, reason) =
                frame.map_or((0, String::new()), |f| (u16::from(f.code), f.reason.to_string()));
            tracing::info!(code, reason = %reason, "Server sent close frame");
            Some(Err(TransportError::Closed))
        }
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
            Some(Err(TransportError::Closed))
        }
        Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
    }
}
