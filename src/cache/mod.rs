//! Multi-tier response cache with per-endpoint policies.
//!
//! This module provides the caching half of the client core:
//! - Entries carry a TTL and are lazily expired on read
//! - Four storage tiers (memory, local, session, structured database)
//! - Per-endpoint policy resolution by pattern (strategy, TTL, tier)
//! - Writes never fail: quota pressure evicts, then demotes to memory

mod key;
mod policy;
mod storage;
mod store;

pub use key::{hash_key, RequestKey};
pub use policy::{CachePolicy, CacheStrategy, PolicyTable, StorageTier};
pub use storage::{
  CacheBackend, KvBackend, MemoryBackend, NoopBackend, Payload, SqliteBackend, StoredEntry,
  MEMORY_MAX_ENTRIES,
};
pub use store::{CacheStats, CacheStore, CachedValue, GetOptions, SetOptions};
