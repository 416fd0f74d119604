//! Multi-tier cache store facade.
//!
//! Callers address the store with the canonical request key; the store
//! resolves the endpoint policy, hashes the key for storage, and dispatches
//! to the configured tier. Writes never fail from the caller's point of
//! view: storage trouble degrades to the in-memory tier.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::env::{Environment, StorageError};

use super::key::hash_key;
use super::policy::{CachePolicy, PolicyTable, StorageTier};
use super::storage::{
  CacheBackend, KvBackend, MemoryBackend, NoopBackend, Payload, SqliteBackend, StoredEntry,
};

const LOCAL_PREFIX: &str = "rolefit_cache_local:";
const SESSION_PREFIX: &str = "rolefit_cache_session:";

/// Lookup order when an entry is not in its policy-resolved tier (covers
/// entries demoted to memory by a storage failure).
const TIER_ORDER: [StorageTier; 4] = [
  StorageTier::Memory,
  StorageTier::Local,
  StorageTier::Session,
  StorageTier::Database,
];

/// A cache read result.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
  pub data: Payload,
  pub timestamp: DateTime<Utc>,
  pub age_ms: u64,
  /// Advisory: the entry is older than the caller's `max_age_ms`. Stale
  /// entries are returned, not deleted.
  pub is_stale: bool,
}

/// Per-call overrides for [`CacheStore::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
  pub ttl_ms: Option<u64>,
  pub tier: Option<StorageTier>,
}

/// Per-call options for [`CacheStore::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
  /// Age threshold for the advisory `is_stale` flag.
  pub max_age_ms: Option<u64>,
}

/// Entry counts per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
  pub memory: usize,
  pub local: usize,
  pub session: usize,
  pub database: usize,
}

impl CacheStats {
  pub fn total(&self) -> usize {
    self.memory + self.local + self.session + self.database
  }
}

struct StoreInner {
  memory: MemoryBackend,
  local: KvBackend,
  session: KvBackend,
  database: Box<dyn CacheBackend>,
  policies: PolicyTable,
}

/// The multi-tier cache store.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl CacheStore {
  /// Store wired to the host environment's key/value stores, with the
  /// structured tier on disk. A database that fails to open degrades that
  /// tier to a no-op rather than failing construction.
  pub fn new(env: &Environment, policies: PolicyTable) -> Self {
    let database: Box<dyn CacheBackend> = match SqliteBackend::open() {
      Ok(backend) => Box::new(backend),
      Err(e) => {
        tracing::warn!(error = %e, "cache database unavailable, database tier disabled");
        Box::new(NoopBackend)
      }
    };
    Self::with_database(env, policies, database)
  }

  /// Fully in-memory store (memory-backed key/value tiers, in-memory
  /// SQLite). Used by tests and short-lived CLI invocations.
  pub fn in_memory(env: &Environment, policies: PolicyTable) -> Self {
    let database: Box<dyn CacheBackend> = match SqliteBackend::open_in_memory() {
      Ok(backend) => Box::new(backend),
      Err(e) => {
        tracing::warn!(error = %e, "in-memory cache database unavailable");
        Box::new(NoopBackend)
      }
    };
    Self::with_database(env, policies, database)
  }

  fn with_database(
    env: &Environment,
    policies: PolicyTable,
    database: Box<dyn CacheBackend>,
  ) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        memory: MemoryBackend::new(),
        local: KvBackend::new(env.local.clone(), LOCAL_PREFIX),
        session: KvBackend::new(env.session.clone(), SESSION_PREFIX),
        database,
        policies,
      }),
    }
  }

  fn backend(&self, tier: StorageTier) -> &dyn CacheBackend {
    match tier {
      StorageTier::Memory => &self.inner.memory,
      StorageTier::Local => &self.inner.local,
      StorageTier::Session => &self.inner.session,
      StorageTier::Database => self.inner.database.as_ref(),
    }
  }

  /// Resolve the caching policy for a canonical request key.
  pub fn policy_for(&self, key: &str) -> CachePolicy {
    self.inner.policies.resolve(key)
  }

  /// Write an entry. TTL and tier fall back to the endpoint policy when not
  /// overridden. Never fails: a quota error evicts the oldest 25% of the
  /// tier and retries once, and any remaining failure demotes the entry to
  /// the memory tier.
  pub fn set(&self, key: &str, data: Payload, options: SetOptions) {
    let policy = self.policy_for(key);
    let ttl_ms = options.ttl_ms.unwrap_or(policy.ttl_ms);
    let tier = options.tier.unwrap_or(policy.tier);
    let entry = StoredEntry::new(data, ttl_ms);
    let hashed = hash_key(key);

    match self.backend(tier).put(&hashed, &entry) {
      Ok(()) => {}
      Err(StorageError::QuotaExceeded) => {
        tracing::warn!(?tier, "cache tier full, evicting oldest entries");
        if let Err(e) = self.backend(tier).evict_oldest(0.25) {
          tracing::warn!(?tier, error = %e, "cache eviction failed");
        }
        if self.backend(tier).put(&hashed, &entry).is_err() {
          self.demote_to_memory(&hashed, &entry, tier);
        }
      }
      Err(e) => {
        tracing::warn!(?tier, error = %e, "cache write failed");
        self.demote_to_memory(&hashed, &entry, tier);
      }
    }
  }

  fn demote_to_memory(&self, hashed: &str, entry: &StoredEntry, tier: StorageTier) {
    if tier == StorageTier::Memory {
      return;
    }
    if self.inner.memory.put(hashed, entry).is_ok() {
      tracing::debug!(?tier, "cache entry demoted to memory tier");
    }
  }

  /// Read an entry. Expired entries are deleted on read and reported
  /// absent. `is_stale` is set when the entry's age exceeds
  /// `options.max_age_ms`.
  pub fn get(&self, key: &str, options: GetOptions) -> Option<CachedValue> {
    let hashed = hash_key(key);

    for tier in self.lookup_order(key) {
      let entry = match self.backend(tier).get(&hashed) {
        Ok(Some(entry)) => entry,
        Ok(None) => continue,
        Err(e) => {
          tracing::warn!(?tier, error = %e, "cache read failed");
          continue;
        }
      };

      if entry.is_expired() {
        if let Err(e) = self.backend(tier).delete(&hashed) {
          tracing::warn!(?tier, error = %e, "failed to delete expired cache entry");
        }
        continue;
      }

      let age_ms = entry.age_ms();
      let is_stale = options
        .max_age_ms
        .map(|max_age| age_ms > max_age)
        .unwrap_or(false);

      return Some(CachedValue {
        data: entry.data,
        timestamp: entry.timestamp,
        age_ms,
        is_stale,
      });
    }

    None
  }

  /// Read ignoring expiry, without side effects. Used to serve something
  /// rather than nothing when the network has failed.
  pub fn get_any(&self, key: &str) -> Option<CachedValue> {
    let hashed = hash_key(key);

    for tier in self.lookup_order(key) {
      if let Ok(Some(entry)) = self.backend(tier).get(&hashed) {
        let age_ms = entry.age_ms();
        let is_stale = entry.is_expired();
        return Some(CachedValue {
          data: entry.data,
          timestamp: entry.timestamp,
          age_ms,
          is_stale,
        });
      }
    }

    None
  }

  /// The policy-resolved tier first, then the rest in fixed order.
  fn lookup_order(&self, key: &str) -> impl Iterator<Item = StorageTier> {
    let preferred = self.policy_for(key).tier;
    std::iter::once(preferred).chain(TIER_ORDER.into_iter().filter(move |t| *t != preferred))
  }

  /// Remove an entry from every tier. Idempotent.
  pub fn delete(&self, key: &str) {
    let hashed = hash_key(key);
    for tier in TIER_ORDER {
      if let Err(e) = self.backend(tier).delete(&hashed) {
        tracing::warn!(?tier, error = %e, "cache delete failed");
      }
    }
  }

  /// Purge one tier, or everything.
  pub fn clear(&self, tier: Option<StorageTier>) {
    let tiers: Vec<StorageTier> = match tier {
      Some(t) => vec![t],
      None => TIER_ORDER.to_vec(),
    };
    for t in tiers {
      if let Err(e) = self.backend(t).clear() {
        tracing::warn!(tier = ?t, error = %e, "cache clear failed");
      }
    }
  }

  pub fn has(&self, key: &str) -> bool {
    self.get(key, GetOptions::default()).is_some()
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      memory: self.inner.memory.len().unwrap_or(0),
      local: self.inner.local.len().unwrap_or(0),
      session: self.inner.session.len().unwrap_or(0),
      database: self.inner.database.len().unwrap_or(0),
    }
  }
}
