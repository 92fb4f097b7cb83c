//! Market Data Gateway Adapter
//!
//! WebSocket client for the gateway's `/ws/market` stream.
//!
//! # Protocol
//!
//! - Connect to `{base}/ws/market?token={access_token}`
//! - Send `{"data":{"instrumentKeys":[...]}}` with the full watch set
//! - Receive JSON text frames: `live_feed` batches, single `ltp_update`
//!   ticks, `market_info`, `{"status":"connected"}`, `{"event":"market_closed"}`
//!   and error frames
//! - Send `{"type":"ping"}` on an interval; the server may answer `pong`

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod endpoint;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod websocket;

pub use codec::{CodecError, FrameCodec};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionSettings};
pub use dispatcher::MessageDispatcher;
pub use endpoint::GatewayEndpoint;
pub use heartbeat::HeartbeatConfig;
pub use messages::ServerFrame;
pub use reconnect::ReconnectConfig;
pub use websocket::WebSocketConnector;
