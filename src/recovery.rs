//! Automated error recovery.
//!
//! Maps each error category to a primary strategy and an optional fallback
//! strategy. The retry layer here is deliberately separate from the
//! transport's: it re-runs a whole caller-level operation (request plus
//! decoding) and keeps its own attempt counters, keyed by a recovery id, so
//! repeated failures of the same operation eventually stop being retried.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{CacheStore, Payload};
use crate::env::Environment;
use crate::error::{ApiError, ErrorCategory};

/// Route used by the re-authentication strategy.
pub const LOGIN_ROUTE: &str = "/login";

/// Longest wait between recovery retry attempts.
const MAX_RECOVERY_BACKOFF: Duration = Duration::from_secs(30);

/// What to do about a classified error.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStrategy {
  /// Re-run the operation with bounded exponential backoff.
  Retry {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
  },
  /// Serve registered fallback data or a cached value instead.
  Fallback,
  /// Navigate to an in-app route.
  Redirect { path: String },
  /// Reload the application, optionally asking the user first.
  Refresh { confirm: bool },
  /// Purge named cache keys, then re-run the operation once.
  ClearCache,
  /// Clear credentials and send the user to the login route.
  Reauth,
  /// No automated recovery; surface the error.
  None,
}

/// Caller-supplied context for one recovery attempt.
#[derive(Debug, Clone, Default)]
pub struct RecoveryContext {
  /// Keys the retry counter. Use something stable per logical operation,
  /// e.g. `"dashboard:load"`.
  pub recovery_id: String,
  /// Key for fallback-data and cache lookups.
  pub fallback_key: Option<String>,
  /// Cache keys purged by the clear-cache strategy.
  pub cache_keys: Vec<String>,
}

impl RecoveryContext {
  pub fn new(recovery_id: impl Into<String>) -> Self {
    Self {
      recovery_id: recovery_id.into(),
      ..Default::default()
    }
  }

  pub fn with_fallback_key(mut self, key: impl Into<String>) -> Self {
    self.fallback_key = Some(key.into());
    self
  }

  pub fn with_cache_keys(mut self, keys: Vec<String>) -> Self {
    self.cache_keys = keys;
    self
  }
}

/// Outcome of a successful recovery.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
  /// A usable value was produced.
  Value { data: Payload, is_fallback: bool },
  /// The user was navigated away (redirect, reload, or re-authentication).
  Navigated,
}

type StrategyPair = (RecoveryStrategy, Option<RecoveryStrategy>);

struct EngineInner {
  strategies: Mutex<HashMap<ErrorCategory, StrategyPair>>,
  fallback_data: Mutex<HashMap<String, Payload>>,
  attempts: Mutex<HashMap<String, u32>>,
  cache: CacheStore,
  env: Environment,
}

#[derive(Clone)]
pub struct RecoveryEngine {
  inner: Arc<EngineInner>,
}

impl RecoveryEngine {
  pub fn new(cache: CacheStore, env: Environment) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        strategies: Mutex::new(default_strategies()),
        fallback_data: Mutex::new(HashMap::new()),
        attempts: Mutex::new(HashMap::new()),
        cache,
        env,
      }),
    }
  }

  /// Replace the strategy pair for a category.
  pub fn set_strategy(
    &self,
    category: ErrorCategory,
    primary: RecoveryStrategy,
    fallback: Option<RecoveryStrategy>,
  ) {
    if let Ok(mut strategies) = self.inner.strategies.lock() {
      strategies.insert(category, (primary, fallback));
    }
  }

  /// Register data served by the fallback strategy for `key`.
  pub fn register_fallback(&self, key: impl Into<String>, data: Payload) {
    if let Ok(mut fallback_data) = self.inner.fallback_data.lock() {
      fallback_data.insert(key.into(), data);
    }
  }

  /// Attempt to recover from `error` by re-running or substituting
  /// `operation` per the category's configured strategies. Returns the
  /// original (or last) error when recovery fails.
  pub async fn attempt<F, Fut>(
    &self,
    error: ApiError,
    operation: F,
    ctx: &RecoveryContext,
  ) -> Result<Recovery, ApiError>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Payload, ApiError>>,
  {
    let (primary, fallback) = self.strategies_for(error.category);
    tracing::debug!(
      category = %error.category,
      strategy = ?primary,
      recovery_id = %ctx.recovery_id,
      "attempting recovery"
    );

    match self.run_strategy(&primary, &error, &operation, ctx).await {
      Ok(recovery) => Ok(recovery),
      Err(primary_error) => {
        if let Some(fallback) = fallback {
          if fallback != primary {
            return self
              .run_strategy(&fallback, &error, &operation, ctx)
              .await
              .map_err(|_| primary_error);
          }
        }
        Err(primary_error)
      }
    }
  }

  fn strategies_for(&self, category: ErrorCategory) -> StrategyPair {
    self
      .inner
      .strategies
      .lock()
      .ok()
      .and_then(|s| s.get(&category).cloned())
      .unwrap_or((RecoveryStrategy::None, None))
  }

  async fn run_strategy<F, Fut>(
    &self,
    strategy: &RecoveryStrategy,
    error: &ApiError,
    operation: &F,
    ctx: &RecoveryContext,
  ) -> Result<Recovery, ApiError>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Payload, ApiError>>,
  {
    match strategy {
      RecoveryStrategy::None => Err(error.clone()),

      RecoveryStrategy::Retry {
        max_attempts,
        base_delay,
        multiplier,
      } => {
        let used = self.attempts_used(&ctx.recovery_id);
        if used >= *max_attempts {
          tracing::warn!(recovery_id = %ctx.recovery_id, "recovery retry budget exhausted");
          return Err(error.clone());
        }

        let mut last_error = error.clone();
        for attempt in used..*max_attempts {
          let delay = recovery_backoff(*base_delay, *multiplier, attempt);
          tokio::time::sleep(delay).await;
          self.record_attempt(&ctx.recovery_id);

          match operation().await {
            Ok(data) => {
              self.reset_attempts(&ctx.recovery_id);
              return Ok(Recovery::Value {
                data,
                is_fallback: false,
              });
            }
            Err(e) => {
              tracing::warn!(
                recovery_id = %ctx.recovery_id,
                attempt = attempt + 1,
                error = %e,
                "recovery retry failed"
              );
              last_error = e;
            }
          }
        }
        Err(last_error)
      }

      RecoveryStrategy::Fallback => {
        if let Some(key) = &ctx.fallback_key {
          let registered = self
            .inner
            .fallback_data
            .lock()
            .ok()
            .and_then(|data| data.get(key).cloned());
          if let Some(data) = registered {
            return Ok(Recovery::Value {
              data,
              is_fallback: true,
            });
          }

          if let Some(cached) = self.inner.cache.get_any(key) {
            return Ok(Recovery::Value {
              data: cached.data,
              is_fallback: true,
            });
          }
        }
        Err(error.clone())
      }

      RecoveryStrategy::Redirect { path } => {
        self.inner.env.navigator.redirect(path);
        Ok(Recovery::Navigated)
      }

      RecoveryStrategy::Refresh { confirm } => {
        if *confirm
          && !self
            .inner
            .env
            .navigator
            .confirm("The application hit a problem. Reload now?")
        {
          return Err(error.clone());
        }
        self.inner.env.navigator.reload();
        Ok(Recovery::Navigated)
      }

      RecoveryStrategy::ClearCache => {
        for key in &ctx.cache_keys {
          self.inner.cache.delete(key);
        }
        let data = operation().await?;
        Ok(Recovery::Value {
          data,
          is_fallback: false,
        })
      }

      RecoveryStrategy::Reauth => {
        self.inner.env.clear_auth_token();
        self.inner.env.navigator.redirect(LOGIN_ROUTE);
        Ok(Recovery::Navigated)
      }
    }
  }

  fn attempts_used(&self, recovery_id: &str) -> u32 {
    self
      .inner
      .attempts
      .lock()
      .ok()
      .and_then(|a| a.get(recovery_id).copied())
      .unwrap_or(0)
  }

  fn record_attempt(&self, recovery_id: &str) {
    if let Ok(mut attempts) = self.inner.attempts.lock() {
      *attempts.entry(recovery_id.to_string()).or_insert(0) += 1;
    }
  }

  fn reset_attempts(&self, recovery_id: &str) {
    if let Ok(mut attempts) = self.inner.attempts.lock() {
      attempts.remove(recovery_id);
    }
  }
}

fn default_strategies() -> HashMap<ErrorCategory, StrategyPair> {
  let mut strategies = HashMap::new();
  strategies.insert(
    ErrorCategory::Network,
    (
      RecoveryStrategy::Retry {
        max_attempts: 3,
        base_delay: Duration::from_millis(1000),
        multiplier: 2.0,
      },
      Some(RecoveryStrategy::Fallback),
    ),
  );
  strategies.insert(ErrorCategory::Authentication, (RecoveryStrategy::Reauth, None));
  strategies.insert(ErrorCategory::Permission, (RecoveryStrategy::None, None));
  strategies.insert(
    ErrorCategory::NotFound,
    (
      RecoveryStrategy::Fallback,
      Some(RecoveryStrategy::Redirect {
        path: "/".to_string(),
      }),
    ),
  );
  strategies.insert(
    ErrorCategory::Server,
    (
      RecoveryStrategy::Retry {
        max_attempts: 2,
        base_delay: Duration::from_millis(2000),
        multiplier: 1.5,
      },
      Some(RecoveryStrategy::Fallback),
    ),
  );
  strategies.insert(
    ErrorCategory::Client,
    (RecoveryStrategy::Refresh { confirm: true }, None),
  );
  strategies.insert(ErrorCategory::Validation, (RecoveryStrategy::None, None));
  strategies.insert(ErrorCategory::Unknown, (RecoveryStrategy::None, None));
  strategies
}

fn recovery_backoff(base: Duration, multiplier: f64, step: u32) -> Duration {
  let millis = base.as_millis() as f64 * multiplier.powi(step as i32);
  Duration::from_millis(millis as u64).min(MAX_RECOVERY_BACKOFF)
}
