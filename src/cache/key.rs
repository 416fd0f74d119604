//! Cache key construction for API requests.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::net::Method;

/// SHA-256 hash of a caller-supplied cache key, for stable fixed-length
/// storage addressing.
pub fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

/// Identity of one API request for caching purposes: method, URL, and the
/// query parameters in sorted order.
#[derive(Clone, Debug)]
pub struct RequestKey {
  method: Method,
  url: String,
  params: BTreeMap<String, String>,
}

impl RequestKey {
  pub fn new(method: Method, url: impl Into<String>, params: BTreeMap<String, String>) -> Self {
    Self {
      method,
      url: url.into(),
      params,
    }
  }

  /// The canonical key string, `METHOD_url_{sorted params as JSON}`. Used
  /// both as the cache key and as the subject of policy pattern matching.
  pub fn canonical(&self) -> String {
    let params = serde_json::to_string(&self.params).unwrap_or_else(|_| "{}".to_string());
    format!("{}_{}_{}", self.method, self.url, params)
  }

  /// Short human-readable form for logs.
  pub fn description(&self) -> String {
    if self.params.is_empty() {
      format!("{} {}", self.method, self.url)
    } else {
      format!("{} {} ({} params)", self.method, self.url, self.params.len())
    }
  }
}
