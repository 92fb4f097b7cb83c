//! Configuration Module
//!
//! Configuration loading and token storage for the market stream.

mod settings;
mod token;

pub use settings::{
    ConfigError, ServerSettings, StreamConfig, TokenLocation, WebSocketSettings,
    parse_instruments,
};
pub use token::{FileTokenSource, InlineTokenSource, token_source};
