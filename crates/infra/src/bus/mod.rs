//! Infrastructure-backed message bus implementations.
//!
//! The bus abstraction lives in `jobwarden-bus` as pure mechanics. This module
//! provides the Redis Streams transport.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsMessageBus};
