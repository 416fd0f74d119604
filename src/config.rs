use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;

use crate::cache::{CachePolicy, CacheStrategy, PolicyTable, StorageTier};
use crate::net::FetchOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub defaults: Defaults,
  /// Per-endpoint cache policy rules, first match wins. When empty the
  /// shipped product policies apply.
  #[serde(default)]
  pub endpoints: Vec<EndpointRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Probed periodically to detect silent connectivity loss.
  pub health_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  #[serde(default = "default_retries")]
  pub retries: u32,
  #[serde(default = "default_retry_delay_ms")]
  pub retry_delay_ms: u64,
  #[serde(default = "default_backoff_multiplier")]
  pub backoff_multiplier: f64,
  #[serde(default)]
  pub cache_strategy: CacheStrategy,
  #[serde(default)]
  pub cache_tier: StorageTier,
  #[serde(default = "default_cache_ttl_ms")]
  pub cache_ttl_ms: u64,
}

impl Default for Defaults {
  fn default() -> Self {
    Self {
      timeout_ms: default_timeout_ms(),
      retries: default_retries(),
      retry_delay_ms: default_retry_delay_ms(),
      backoff_multiplier: default_backoff_multiplier(),
      cache_strategy: CacheStrategy::default(),
      cache_tier: StorageTier::default(),
      cache_ttl_ms: default_cache_ttl_ms(),
    }
  }
}

fn default_timeout_ms() -> u64 {
  30_000
}

fn default_retries() -> u32 {
  3
}

fn default_retry_delay_ms() -> u64 {
  1_000
}

fn default_backoff_multiplier() -> f64 {
  2.0
}

fn default_cache_ttl_ms() -> u64 {
  300_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointRule {
  /// Regular expression matched against the canonical request key.
  pub pattern: String,
  pub strategy: CacheStrategy,
  pub ttl_ms: u64,
  pub tier: StorageTier,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rolefit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rolefit/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/rolefit/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rolefit.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rolefit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks ROLEFIT_API_TOKEN first, then ROLEFIT_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("ROLEFIT_API_TOKEN")
      .or_else(|_| std::env::var("ROLEFIT_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set ROLEFIT_API_TOKEN or ROLEFIT_TOKEN environment variable.")
      })
  }

  /// Build the cache policy table from the configured endpoint rules, or
  /// the shipped product policies when none are configured.
  pub fn policy_table(&self) -> Result<PolicyTable> {
    let default = CachePolicy {
      ttl_ms: self.defaults.cache_ttl_ms,
      tier: self.defaults.cache_tier,
      strategy: self.defaults.cache_strategy,
    };

    if self.endpoints.is_empty() {
      return Ok(PolicyTable::standard());
    }

    let mut table = PolicyTable::new(default);
    for rule in &self.endpoints {
      table
        .add_rule(
          &rule.pattern,
          CachePolicy {
            ttl_ms: rule.ttl_ms,
            tier: rule.tier,
            strategy: rule.strategy,
          },
        )
        .map_err(|e| eyre!("Invalid endpoint pattern '{}': {}", rule.pattern, e))?;
    }
    Ok(table)
  }

  /// Transport-level retry and timeout defaults.
  pub fn fetch_options(&self) -> FetchOptions {
    FetchOptions {
      retries: self.defaults.retries,
      retry_delay: Duration::from_millis(self.defaults.retry_delay_ms),
      backoff_multiplier: self.defaults.backoff_multiplier,
      timeout: Duration::from_millis(self.defaults.timeout_ms),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_parses_with_defaults() {
    let config: Config = serde_yaml::from_str(
      r#"
api:
  base_url: https://api.rolefit.io
"#,
    )
    .unwrap();

    assert_eq!(config.api.base_url, "https://api.rolefit.io");
    assert_eq!(config.defaults.timeout_ms, 30_000);
    assert_eq!(config.defaults.retries, 3);
    assert_eq!(config.defaults.cache_strategy, CacheStrategy::NetworkFirst);
    assert_eq!(config.defaults.cache_tier, StorageTier::Memory);
    assert!(config.endpoints.is_empty());
  }

  #[test]
  fn test_endpoint_rules_parse_and_build_table() {
    let config: Config = serde_yaml::from_str(
      r#"
api:
  base_url: https://api.rolefit.io
  health_url: https://api.rolefit.io/health
defaults:
  retries: 1
  cache_ttl_ms: 10000
endpoints:
  - pattern: "/api/dashboard"
    strategy: stale-while-revalidate
    ttl_ms: 120000
    tier: local
  - pattern: "/api/user/credits"
    strategy: network-first
    ttl_ms: 60000
    tier: memory
"#,
    )
    .unwrap();

    let table = config.policy_table().unwrap();
    let dashboard = table.resolve("GET_https://api.rolefit.io/api/dashboard_{}");
    assert_eq!(dashboard.strategy, CacheStrategy::StaleWhileRevalidate);
    assert_eq!(dashboard.tier, StorageTier::Local);
    assert_eq!(dashboard.ttl_ms, 120_000);

    // Anything unmatched gets the configured defaults.
    let other = table.resolve("GET_https://api.rolefit.io/api/other_{}");
    assert_eq!(other.ttl_ms, 10_000);

    let fetch = config.fetch_options();
    assert_eq!(fetch.retries, 1);
  }

  #[test]
  fn test_invalid_endpoint_pattern_is_rejected() {
    let config: Config = serde_yaml::from_str(
      r#"
api:
  base_url: https://api.rolefit.io
endpoints:
  - pattern: "["
    strategy: cache-first
    ttl_ms: 1000
    tier: memory
"#,
    )
    .unwrap();

    assert!(config.policy_table().is_err());
  }
}
