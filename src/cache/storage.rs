//! Cache entry model and storage backends.
//!
//! Four backends implement [`CacheBackend`]: a bounded in-process map, a
//! prefixed wrapper over a host key/value store, a SQLite database, and a
//! no-op used when caching is disabled.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::env::{KeyValueStore, StorageError};

/// Default bound on the in-memory tier.
pub const MEMORY_MAX_ENTRIES: usize = 100;

/// A cached response body, decoded once at the network boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Payload {
  Json(serde_json::Value),
  Text(String),
  Bytes(Vec<u8>),
}

impl Payload {
  pub fn as_json(&self) -> Option<&serde_json::Value> {
    match self {
      Payload::Json(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_text(&self) -> Option<&str> {
    match self {
      Payload::Text(text) => Some(text),
      _ => None,
    }
  }
}

impl From<serde_json::Value> for Payload {
  fn from(value: serde_json::Value) -> Self {
    Payload::Json(value)
  }
}

/// One cache entry as persisted: payload plus the timing fields that drive
/// expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
  pub data: Payload,
  pub timestamp: DateTime<Utc>,
  pub ttl_ms: u64,
  /// `timestamp + ttl_ms`, computed at write time.
  pub expires_at: DateTime<Utc>,
}

impl StoredEntry {
  pub fn new(data: Payload, ttl_ms: u64) -> Self {
    let timestamp = Utc::now();
    Self {
      data,
      timestamp,
      ttl_ms,
      expires_at: timestamp + Duration::milliseconds(ttl_ms as i64),
    }
  }

  pub fn is_expired(&self) -> bool {
    Utc::now() > self.expires_at
  }

  pub fn age_ms(&self) -> u64 {
    (Utc::now() - self.timestamp).num_milliseconds().max(0) as u64
  }
}

/// One storage tier's backend.
pub trait CacheBackend: Send + Sync {
  fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError>;

  fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError>;

  fn delete(&self, key: &str) -> Result<(), StorageError>;

  fn clear(&self) -> Result<(), StorageError>;

  fn len(&self) -> Result<usize, StorageError>;

  /// Remove the oldest `fraction` of entries by write timestamp. Returns how
  /// many were evicted.
  fn evict_oldest(&self, fraction: f64) -> Result<usize, StorageError>;
}

// ============================================================================
// Memory backend
// ============================================================================

struct MemoryInner {
  entries: HashMap<String, StoredEntry>,
  /// Keys in insertion order. Overwriting a live key keeps its position.
  order: VecDeque<String>,
  max_entries: usize,
}

/// Bounded in-process backend. When the bound is exceeded the
/// earliest-inserted entry is evicted (insertion order, not access order).
pub struct MemoryBackend {
  inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::with_capacity(MEMORY_MAX_ENTRIES)
  }

  pub fn with_capacity(max_entries: usize) -> Self {
    Self {
      inner: Mutex::new(MemoryInner {
        entries: HashMap::new(),
        order: VecDeque::new(),
        max_entries,
      }),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StorageError> {
    self
      .inner
      .lock()
      .map_err(|_| StorageError::Backend("memory cache lock poisoned".into()))
  }
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheBackend for MemoryBackend {
  fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError> {
    let mut inner = self.lock()?;
    if inner.entries.insert(key.to_string(), entry.clone()).is_none() {
      inner.order.push_back(key.to_string());
    }
    while inner.entries.len() > inner.max_entries {
      match inner.order.pop_front() {
        Some(oldest) => {
          inner.entries.remove(&oldest);
          tracing::debug!(key = %oldest, "evicted oldest in-memory cache entry");
        }
        None => break,
      }
    }
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
    Ok(self.lock()?.entries.get(key).cloned())
  }

  fn delete(&self, key: &str) -> Result<(), StorageError> {
    let mut inner = self.lock()?;
    if inner.entries.remove(key).is_some() {
      inner.order.retain(|k| k != key);
    }
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    let mut inner = self.lock()?;
    inner.entries.clear();
    inner.order.clear();
    Ok(())
  }

  fn len(&self) -> Result<usize, StorageError> {
    Ok(self.lock()?.entries.len())
  }

  fn evict_oldest(&self, fraction: f64) -> Result<usize, StorageError> {
    let mut inner = self.lock()?;
    let count = ((inner.entries.len() as f64) * fraction).ceil() as usize;
    let mut evicted = 0;
    for _ in 0..count {
      match inner.order.pop_front() {
        Some(oldest) => {
          inner.entries.remove(&oldest);
          evicted += 1;
        }
        None => break,
      }
    }
    Ok(evicted)
  }
}

// ============================================================================
// Key/value backend
// ============================================================================

/// Backend over a host [`KeyValueStore`], with a fixed key prefix so cache
/// entries never collide with unrelated storage on the same host.
pub struct KvBackend {
  store: Arc<dyn KeyValueStore>,
  prefix: String,
}

impl KvBackend {
  pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
    Self {
      store,
      prefix: prefix.into(),
    }
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  fn own_keys(&self) -> Vec<String> {
    self
      .store
      .keys()
      .into_iter()
      .filter(|k| k.starts_with(&self.prefix))
      .collect()
  }
}

impl CacheBackend for KvBackend {
  fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError> {
    let serialized = serde_json::to_string(entry)?;
    self.store.set_item(&self.storage_key(key), &serialized)
  }

  fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
    let storage_key = self.storage_key(key);
    match self.store.get_item(&storage_key) {
      Some(raw) => match serde_json::from_str(&raw) {
        Ok(entry) => Ok(Some(entry)),
        Err(_) => {
          // Corrupt entry, drop it.
          self.store.remove_item(&storage_key);
          Ok(None)
        }
      },
      None => Ok(None),
    }
  }

  fn delete(&self, key: &str) -> Result<(), StorageError> {
    self.store.remove_item(&self.storage_key(key));
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    for key in self.own_keys() {
      self.store.remove_item(&key);
    }
    Ok(())
  }

  fn len(&self) -> Result<usize, StorageError> {
    Ok(self.own_keys().len())
  }

  fn evict_oldest(&self, fraction: f64) -> Result<usize, StorageError> {
    let mut stamped: Vec<(String, DateTime<Utc>)> = Vec::new();
    for key in self.own_keys() {
      if let Some(raw) = self.store.get_item(&key) {
        if let Ok(entry) = serde_json::from_str::<StoredEntry>(&raw) {
          stamped.push((key, entry.timestamp));
          continue;
        }
      }
      // Unreadable entries count as oldest.
      stamped.push((key, DateTime::<Utc>::MIN_UTC));
    }

    stamped.sort_by_key(|(_, timestamp)| *timestamp);
    let count = ((stamped.len() as f64) * fraction).ceil() as usize;
    for (key, _) in stamped.iter().take(count) {
      self.store.remove_item(key);
    }
    Ok(count.min(stamped.len()))
  }
}

// ============================================================================
// SQLite backend
// ============================================================================

/// Schema for the structured cache tier.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS api_cache (
    cache_key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    ttl_ms INTEGER NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_cache_cached_at ON api_cache(cached_at);
"#;

/// SQLite-backed structured cache tier.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  /// Open or create the cache database at the default location.
  pub fn open() -> Result<Self, StorageError> {
    let path = Self::default_path()?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StorageError::Backend(format!("failed to create cache directory: {}", e)))?;
    }

    Self::open_at(&path)
  }

  pub fn open_at(path: &std::path::Path) -> Result<Self, StorageError> {
    let conn = Connection::open(path)?;
    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;
    Ok(backend)
  }

  /// Purely in-memory database, for tests.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory()?;
    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;
    Ok(backend)
  }

  fn default_path() -> Result<std::path::PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::Backend("could not determine data directory".into()))?;

    Ok(data_dir.join("rolefit").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|_| StorageError::Backend("cache database lock poisoned".into()))
  }
}

impl CacheBackend for SqliteBackend {
  fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError> {
    let conn = self.lock()?;
    let data = serde_json::to_vec(&entry.data)?;

    conn.execute(
      "INSERT OR REPLACE INTO api_cache (cache_key, data, cached_at, ttl_ms, expires_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        key,
        data,
        entry.timestamp.to_rfc3339(),
        entry.ttl_ms,
        entry.expires_at.to_rfc3339()
      ],
    )?;

    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT data, cached_at, ttl_ms, expires_at FROM api_cache WHERE cache_key = ?")?;

    let row: Option<(Vec<u8>, String, u64, String)> = stmt
      .query_row(params![key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((data, cached_at, ttl_ms, expires_at)) => {
        let payload: Payload = serde_json::from_slice(&data)?;
        Ok(Some(StoredEntry {
          data: payload,
          timestamp: parse_datetime(&cached_at)?,
          ttl_ms,
          expires_at: parse_datetime(&expires_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM api_cache WHERE cache_key = ?", params![key])?;
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM api_cache", [])?;
    Ok(())
  }

  fn len(&self) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM api_cache", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  fn evict_oldest(&self, fraction: f64) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM api_cache", [], |row| row.get(0))?;
    let to_evict = ((count as f64) * fraction).ceil() as i64;

    let evicted = conn.execute(
      "DELETE FROM api_cache WHERE cache_key IN
         (SELECT cache_key FROM api_cache ORDER BY cached_at ASC LIMIT ?)",
      params![to_evict],
    )?;

    Ok(evicted)
  }
}

/// Parse an RFC 3339 datetime stored by `put`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Backend(format!("failed to parse datetime '{}': {}", s, e)))
}

// ============================================================================
// Noop backend
// ============================================================================

/// Backend that stores nothing. Used when caching is disabled.
pub struct NoopBackend;

impl CacheBackend for NoopBackend {
  fn put(&self, _key: &str, _entry: &StoredEntry) -> Result<(), StorageError> {
    Ok(())
  }

  fn get(&self, _key: &str) -> Result<Option<StoredEntry>, StorageError> {
    Ok(None)
  }

  fn delete(&self, _key: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    Ok(())
  }

  fn len(&self) -> Result<usize, StorageError> {
    Ok(0)
  }

  fn evict_oldest(&self, _fraction: f64) -> Result<usize, StorageError> {
    Ok(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::env::MemoryKeyValueStore;

  fn entry(value: &str, ttl_ms: u64) -> StoredEntry {
    StoredEntry::new(Payload::Json(serde_json::json!({ "value": value })), ttl_ms)
  }

  #[test]
  fn test_memory_roundtrip() {
    let backend = MemoryBackend::new();
    let e = entry("a", 60_000);
    backend.put("k1", &e).unwrap();

    let got = backend.get("k1").unwrap().unwrap();
    assert_eq!(got, e);
  }

  #[test]
  fn test_memory_insertion_order_eviction() {
    let backend = MemoryBackend::with_capacity(3);
    for i in 0..3 {
      backend.put(&format!("k{}", i), &entry("x", 60_000)).unwrap();
    }

    // k0 is the earliest-inserted and must go first.
    backend.put("k3", &entry("x", 60_000)).unwrap();
    assert!(backend.get("k0").unwrap().is_none());
    assert!(backend.get("k1").unwrap().is_some());
    assert!(backend.get("k3").unwrap().is_some());
  }

  #[test]
  fn test_memory_overwrite_keeps_position() {
    let backend = MemoryBackend::with_capacity(2);
    backend.put("k0", &entry("a", 60_000)).unwrap();
    backend.put("k1", &entry("b", 60_000)).unwrap();

    // Re-setting k0 does not move it to the back of the queue.
    backend.put("k0", &entry("c", 60_000)).unwrap();
    backend.put("k2", &entry("d", 60_000)).unwrap();

    assert!(backend.get("k0").unwrap().is_none());
    assert!(backend.get("k1").unwrap().is_some());
    assert!(backend.get("k2").unwrap().is_some());
  }

  #[test]
  fn test_kv_roundtrip_and_prefix() {
    let store = Arc::new(MemoryKeyValueStore::new());
    store.set_item("unrelated", "data").unwrap();

    let backend = KvBackend::new(store.clone(), "rolefit_cache_local:");
    backend.put("k1", &entry("a", 60_000)).unwrap();

    assert_eq!(backend.len().unwrap(), 1);
    assert_eq!(
      backend.get("k1").unwrap().unwrap().data,
      Payload::Json(serde_json::json!({ "value": "a" }))
    );

    backend.clear().unwrap();
    assert_eq!(backend.len().unwrap(), 0);
    // Unrelated host storage is untouched.
    assert_eq!(store.get_item("unrelated").as_deref(), Some("data"));
  }

  #[test]
  fn test_kv_evict_oldest_by_timestamp() {
    let store = Arc::new(MemoryKeyValueStore::new());
    let backend = KvBackend::new(store, "c:");

    let mut first = entry("old", 60_000);
    first.timestamp = Utc::now() - Duration::minutes(10);
    backend.put("old", &first).unwrap();
    backend.put("new1", &entry("x", 60_000)).unwrap();
    backend.put("new2", &entry("x", 60_000)).unwrap();
    backend.put("new3", &entry("x", 60_000)).unwrap();

    let evicted = backend.evict_oldest(0.25).unwrap();
    assert_eq!(evicted, 1);
    assert!(backend.get("old").unwrap().is_none());
    assert!(backend.get("new1").unwrap().is_some());
  }

  #[test]
  fn test_sqlite_roundtrip() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let e = entry("a", 60_000);
    backend.put("k1", &e).unwrap();

    let got = backend.get("k1").unwrap().unwrap();
    assert_eq!(got.data, e.data);
    assert_eq!(got.ttl_ms, e.ttl_ms);

    backend.delete("k1").unwrap();
    assert!(backend.get("k1").unwrap().is_none());
    // Deleting again is a no-op.
    backend.delete("k1").unwrap();
  }

  #[test]
  fn test_sqlite_evict_oldest() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let mut old = entry("old", 60_000);
    old.timestamp = Utc::now() - Duration::minutes(10);
    backend.put("old", &old).unwrap();
    for i in 0..3 {
      backend.put(&format!("k{}", i), &entry("x", 60_000)).unwrap();
    }

    let evicted = backend.evict_oldest(0.25).unwrap();
    assert_eq!(evicted, 1);
    assert!(backend.get("old").unwrap().is_none());
    assert_eq!(backend.len().unwrap(), 3);
  }

  #[test]
  fn test_payload_bytes_roundtrip() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let e = StoredEntry::new(Payload::Bytes(vec![0, 159, 146, 150]), 60_000);
    backend.put("bin", &e).unwrap();
    assert_eq!(backend.get("bin").unwrap().unwrap().data, e.data);
  }
}
