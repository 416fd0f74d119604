//! Host environment abstraction.
//!
//! The client core runs inside some host (a desktop shell, a test harness, a
//! server-side worker) that owns the persistent key/value stores, navigation,
//! and the production flag. Everything host-specific is behind the traits in
//! this module so the core is testable headlessly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Storage key under which the auth token is kept in the local store.
pub const AUTH_TOKEN_KEY: &str = "rolefit_auth_token";

/// Errors from storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
  /// The backing store refused the write because it is out of space.
  #[error("storage quota exceeded")]
  QuotaExceeded,

  #[error("serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("{0}")]
  Backend(String),
}

/// Synchronous string key/value store, the shape of `localStorage` and
/// `sessionStorage`.
///
/// `set_item` is the only operation that can fail; a full store must report
/// [`StorageError::QuotaExceeded`] so callers can evict and retry.
pub trait KeyValueStore: Send + Sync {
  fn get_item(&self, key: &str) -> Option<String>;

  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

  fn remove_item(&self, key: &str);

  /// All keys currently present, in no particular order.
  fn keys(&self) -> Vec<String>;
}

/// In-process [`KeyValueStore`], optionally bounded by a byte quota.
///
/// Used as the default local/session store outside a browser host and as the
/// test double for quota handling.
pub struct MemoryKeyValueStore {
  entries: Mutex<HashMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryKeyValueStore {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      quota_bytes: None,
    }
  }

  /// A store that rejects writes once the total size of keys and values
  /// would exceed `quota_bytes`.
  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }

  fn used_bytes(entries: &HashMap<String, String>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.len()).sum()
  }
}

impl Default for MemoryKeyValueStore {
  fn default() -> Self {
    Self::new()
  }
}

impl KeyValueStore for MemoryKeyValueStore {
  fn get_item(&self, key: &str) -> Option<String> {
    self.entries.lock().ok()?.get(key).cloned()
  }

  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|_| StorageError::Backend("store lock poisoned".into()))?;

    if let Some(quota) = self.quota_bytes {
      let existing = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
      let used = Self::used_bytes(&entries) - existing;
      if used + key.len() + value.len() > quota {
        return Err(StorageError::QuotaExceeded);
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.remove(key);
    }
  }

  fn keys(&self) -> Vec<String> {
    self
      .entries
      .lock()
      .map(|e| e.keys().cloned().collect())
      .unwrap_or_default()
  }
}

/// Client-side navigation hooks used by error recovery.
pub trait Navigator: Send + Sync {
  /// Navigate to an in-app route (e.g. `/login`).
  fn redirect(&self, path: &str);

  /// Reload the whole application.
  fn reload(&self);

  /// Ask the user to confirm a disruptive action. Hosts without a UI should
  /// return `false`.
  fn confirm(&self, message: &str) -> bool;
}

/// Navigator that logs and declines confirmations.
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
  fn redirect(&self, path: &str) {
    tracing::debug!(path, "redirect requested but no navigator is attached");
  }

  fn reload(&self) {
    tracing::debug!("reload requested but no navigator is attached");
  }

  fn confirm(&self, _message: &str) -> bool {
    false
  }
}

/// Everything the core needs from its host, bundled for injection.
#[derive(Clone)]
pub struct Environment {
  /// Persistent key/value store (survives restarts on a real host).
  pub local: Arc<dyn KeyValueStore>,
  /// Session-scoped key/value store.
  pub session: Arc<dyn KeyValueStore>,
  pub navigator: Arc<dyn Navigator>,
  /// Gates forwarding of errors to the external monitoring sink.
  pub production: bool,
}

impl Environment {
  /// Fully in-memory environment: memory-backed stores, no-op navigation,
  /// non-production. The default for tests and CLI usage.
  pub fn in_memory() -> Self {
    Self {
      local: Arc::new(MemoryKeyValueStore::new()),
      session: Arc::new(MemoryKeyValueStore::new()),
      navigator: Arc::new(NoopNavigator),
      production: false,
    }
  }

  pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
    self.navigator = navigator;
    self
  }

  pub fn with_production(mut self, production: bool) -> Self {
    self.production = production;
    self
  }

  /// Current bearer token, if the user is signed in.
  pub fn auth_token(&self) -> Option<String> {
    self.local.get_item(AUTH_TOKEN_KEY)
  }

  pub fn set_auth_token(&self, token: &str) -> Result<(), StorageError> {
    self.local.set_item(AUTH_TOKEN_KEY, token)
  }

  pub fn clear_auth_token(&self) {
    self.local.remove_item(AUTH_TOKEN_KEY);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_store_roundtrip() {
    let store = MemoryKeyValueStore::new();
    assert!(store.get_item("a").is_none());

    store.set_item("a", "1").unwrap();
    assert_eq!(store.get_item("a").as_deref(), Some("1"));

    store.remove_item("a");
    assert!(store.get_item("a").is_none());
  }

  #[test]
  fn test_quota_exceeded() {
    let store = MemoryKeyValueStore::with_quota(10);
    store.set_item("k", "12345").unwrap();

    let err = store.set_item("other", "too large").unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded));

    // Overwriting an existing key frees its old value first.
    store.set_item("k", "123456789").unwrap();
  }

  #[test]
  fn test_auth_token_lifecycle() {
    let env = Environment::in_memory();
    assert!(env.auth_token().is_none());

    env.set_auth_token("tok_123").unwrap();
    assert_eq!(env.auth_token().as_deref(), Some("tok_123"));

    env.clear_auth_token();
    assert!(env.auth_token().is_none());
  }
}
