//! # Utility Modules
//!
//! Supporting utilities for logging, timing, replay protection and metrics.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout wrappers and default deadlines
//! - **Replay Cache**: TTL-based nonce deduplication for replay attack prevention
//! - **Metrics**: Thread-safe observability counters

pub mod logging;
pub mod metrics;
pub mod replay_cache;
pub mod timeout;

// Re-export public types for advanced users
pub use replay_cache::{CacheKey, ReplayCache};
