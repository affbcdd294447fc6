//! Shared key-value store abstraction and backends.

pub mod r#trait;
pub mod in_memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryKvStore;
pub use r#trait::{GuardedCounter, KvError, KvStore, SharedStore};

#[cfg(feature = "redis")]
pub use redis::RedisKvStore;
