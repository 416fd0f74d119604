//! Per-endpoint caching policy: tiers, strategies, and the pattern table.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Where a cache entry lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
  /// Bounded in-process map, lost on restart.
  #[default]
  Memory,
  /// Persistent key/value store.
  Local,
  /// Session-scoped key/value store.
  Session,
  /// Structured on-disk database.
  Database,
}

/// How the orchestrator consults the cache for an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
  CacheFirst,
  #[default]
  NetworkFirst,
  CacheOnly,
  NetworkOnly,
  StaleWhileRevalidate,
}

/// Effective caching configuration for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
  pub ttl_ms: u64,
  pub tier: StorageTier,
  pub strategy: CacheStrategy,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self {
      ttl_ms: 300_000,
      tier: StorageTier::Memory,
      strategy: CacheStrategy::NetworkFirst,
    }
  }
}

struct PolicyRule {
  pattern: Regex,
  policy: CachePolicy,
}

/// Ordered pattern → policy mapping.
///
/// Exactly one policy applies per request: the first rule whose pattern
/// matches the request's canonical key wins, and the default policy applies
/// when nothing matches.
pub struct PolicyTable {
  rules: Vec<PolicyRule>,
  default: CachePolicy,
}

impl PolicyTable {
  pub fn new(default: CachePolicy) -> Self {
    Self {
      rules: Vec::new(),
      default,
    }
  }

  /// Append a rule. Later rules only apply where earlier ones don't match.
  pub fn add_rule(&mut self, pattern: &str, policy: CachePolicy) -> Result<(), regex::Error> {
    self.rules.push(PolicyRule {
      pattern: Regex::new(pattern)?,
      policy,
    });
    Ok(())
  }

  pub fn resolve(&self, canonical_key: &str) -> CachePolicy {
    self
      .rules
      .iter()
      .find(|rule| rule.pattern.is_match(canonical_key))
      .map(|rule| rule.policy)
      .unwrap_or(self.default)
  }

  pub fn default_policy(&self) -> CachePolicy {
    self.default
  }

  /// The product's shipped endpoint policies.
  pub fn standard() -> Self {
    let mut table = Self::new(CachePolicy::default());
    let rules = [
      (
        "/api/dashboard",
        CachePolicy {
          ttl_ms: 120_000,
          tier: StorageTier::Local,
          strategy: CacheStrategy::StaleWhileRevalidate,
        },
      ),
      (
        "/api/user/credits",
        CachePolicy {
          ttl_ms: 60_000,
          tier: StorageTier::Memory,
          strategy: CacheStrategy::NetworkFirst,
        },
      ),
      (
        "/api/jobs/search",
        CachePolicy {
          ttl_ms: 1_800_000,
          tier: StorageTier::Session,
          strategy: CacheStrategy::StaleWhileRevalidate,
        },
      ),
    ];
    for (pattern, policy) in rules {
      table
        .add_rule(pattern, policy)
        .expect("built-in pattern compiles");
    }
    table
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_match_wins() {
    let mut table = PolicyTable::new(CachePolicy::default());
    table
      .add_rule(
        "/api/jobs",
        CachePolicy {
          ttl_ms: 1,
          tier: StorageTier::Memory,
          strategy: CacheStrategy::CacheFirst,
        },
      )
      .unwrap();
    table
      .add_rule(
        "/api/jobs/search",
        CachePolicy {
          ttl_ms: 2,
          tier: StorageTier::Session,
          strategy: CacheStrategy::CacheOnly,
        },
      )
      .unwrap();

    let resolved = table.resolve("GET_https://x/api/jobs/search_{}");
    assert_eq!(resolved.ttl_ms, 1);
  }

  #[test]
  fn test_default_when_no_match() {
    let table = PolicyTable::standard();
    let resolved = table.resolve("GET_https://x/api/resume/parse_{}");
    assert_eq!(resolved, CachePolicy::default());
  }

  #[test]
  fn test_standard_credits_policy() {
    let table = PolicyTable::standard();
    let resolved = table.resolve("GET_https://api.rolefit.io/api/user/credits_{}");
    assert_eq!(resolved.ttl_ms, 60_000);
    assert_eq!(resolved.tier, StorageTier::Memory);
    assert_eq!(resolved.strategy, CacheStrategy::NetworkFirst);
  }
}
