//! Storage backend implementations

pub mod memory;
pub mod memory_store;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBackend;
pub use memory_store::MemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
#[cfg(feature = "redis")]
pub use redis::RedisBackend;
