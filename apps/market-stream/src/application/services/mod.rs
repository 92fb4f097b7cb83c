//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `MarketSession`: watch interest, price cache and the gateway connection
//!   behind one consumer API

mod market_session;

pub use market_session::{MarketSession, SessionConfig};
