//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (gateway transport, token storage).
pub mod ports;

/// Application services for the market data session.
pub mod services;
