//! Domain Layer - Core streaming types and session logic.
//!
//! This layer contains the market data types, the shared price cache,
//! consumer interest tracking and the session state machine. Nothing here
//! performs I/O.

/// Canonical instrument keys.
pub mod instrument;

/// Latest-tick store shared by all consumers.
pub mod price_cache;

/// Session and connection state machine.
pub mod session;

/// Market data types (tick records, market status).
pub mod streaming;

/// Consumer interest tracking and watch-set diffing.
pub mod subscription;
