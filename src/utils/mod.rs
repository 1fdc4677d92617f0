//! # Utility Modules
//!
//! Supporting utilities shared by the handshake state machines.
//!
//! ## Components
//! - **Replay Cache**: bounded nonce set that refuses replayed connect tokens
//! - **Metrics**: Thread-safe observability counters
//! - **Logging**: Structured logging configuration
//! - **Time**: Unix timestamps for token expiry checks

pub mod logging;
pub mod metrics;
pub mod replay_cache;
pub mod time;

// Re-export public types for advanced users
pub use replay_cache::{CacheKey, ReplayCache};
