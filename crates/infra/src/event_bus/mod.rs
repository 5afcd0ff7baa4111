//! Infrastructure message bus implementations.
//!
//! The bus abstraction lives in `waypoint-events` as pure mechanics.
//! This module provides infrastructure-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsMessageBus};

/// Stream key for a message type.
pub fn stream_key(message_type: &str) -> String {
    format!("waypoint:{message_type}")
}

/// Dead-letter stream key for a message type.
pub fn dlq_key(message_type: &str) -> String {
    format!("waypoint:{message_type}:dlq")
}
