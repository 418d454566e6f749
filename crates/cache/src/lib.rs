//! Durable change-detection state: per-connection content hashes and the
//! "modified since" cursor.

pub mod memory;
pub mod redis_cache;
pub mod traits;

pub use memory::MemoryChangeCache;
pub use redis_cache::RedisChangeCache;
pub use traits::ChangeCache;
