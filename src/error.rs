//! Error taxonomy, classification, and reporting.
//!
//! Every failure entering the client core is normalized into exactly one
//! [`ApiError`] at the boundary where it is first observed. Everything above
//! that boundary (recovery, feedback, callers) operates on the typed error
//! only; raw transport or decoding errors never escape.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// What went wrong, at the granularity recovery decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
  Network,
  Authentication,
  Validation,
  Permission,
  NotFound,
  Server,
  Client,
  Unknown,
}

impl ErrorCategory {
  /// Default severity assigned at classification time.
  pub fn default_severity(self) -> Severity {
    match self {
      ErrorCategory::Authentication
      | ErrorCategory::Permission
      | ErrorCategory::Server
      | ErrorCategory::Client => Severity::High,
      ErrorCategory::NotFound => Severity::Low,
      ErrorCategory::Network
      | ErrorCategory::Validation
      | ErrorCategory::Unknown => Severity::Medium,
    }
  }

  /// Human-readable label used in toast titles.
  pub fn title(self) -> &'static str {
    match self {
      ErrorCategory::Network => "Connection problem",
      ErrorCategory::Authentication => "Sign-in required",
      ErrorCategory::Validation => "Invalid input",
      ErrorCategory::Permission => "Access denied",
      ErrorCategory::NotFound => "Not found",
      ErrorCategory::Server => "Service unavailable",
      ErrorCategory::Client => "Application error",
      ErrorCategory::Unknown => "Unexpected error",
    }
  }
}

impl fmt::Display for ErrorCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ErrorCategory::Network => "network",
      ErrorCategory::Authentication => "authentication",
      ErrorCategory::Validation => "validation",
      ErrorCategory::Permission => "permission",
      ErrorCategory::NotFound => "not_found",
      ErrorCategory::Server => "server",
      ErrorCategory::Client => "client",
      ErrorCategory::Unknown => "unknown",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

/// The one error type the client core surfaces.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
  /// Unique per error instance, for correlating logs and reports.
  pub id: String,
  pub message: String,
  pub category: ErrorCategory,
  pub severity: Severity,
  pub context: HashMap<String, serde_json::Value>,
  pub timestamp: DateTime<Utc>,
}

impl ApiError {
  pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      message: message.into(),
      category,
      severity: category.default_severity(),
      context: HashMap::new(),
      timestamp: Utc::now(),
    }
  }

  pub fn with_severity(mut self, severity: Severity) -> Self {
    self.severity = severity;
    self
  }

  pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
    self.context.insert(key.into(), value.into());
    self
  }

  /// Classify a non-2xx HTTP status.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let category = match status {
      401 => ErrorCategory::Authentication,
      403 => ErrorCategory::Permission,
      404 => ErrorCategory::NotFound,
      422 => ErrorCategory::Validation,
      400..=499 => ErrorCategory::Client,
      500..=599 => ErrorCategory::Server,
      _ => ErrorCategory::Unknown,
    };
    Self::new(category, message).with_context("status", status)
  }

  /// Normalize an arbitrary error from the uncontrolled boundary.
  ///
  /// An [`ApiError`] passes through unchanged. Known constructors are matched
  /// first (decode failures classify as Client), then the message substring
  /// heuristics run in a fixed precedence order that downstream recovery
  /// behavior depends on.
  pub fn from_error(source: &(dyn std::error::Error + 'static)) -> Self {
    if let Some(api) = source.downcast_ref::<ApiError>() {
      return api.clone();
    }
    if source.downcast_ref::<serde_json::Error>().is_some() {
      return Self::new(ErrorCategory::Client, source.to_string());
    }
    Self::from_message(&source.to_string())
  }

  /// Substring classification, lowest-precedence fallback.
  pub fn from_message(message: &str) -> Self {
    let category = classify_message(message);
    Self::new(category, message)
  }

  /// One fixed, non-technical sentence per category. Never exposes the raw
  /// message to the user.
  pub fn user_message(&self) -> &'static str {
    match self.category {
      ErrorCategory::Network => "Connection problem. Please check your internet and try again.",
      ErrorCategory::Authentication => "Your session has expired. Please sign in again.",
      ErrorCategory::Validation => {
        "Some of the provided information is invalid. Please review it and try again."
      }
      ErrorCategory::Permission => "You don't have permission to perform this action.",
      ErrorCategory::NotFound => "We couldn't find what you were looking for.",
      ErrorCategory::Server => "Something went wrong on our end. Please try again in a moment.",
      ErrorCategory::Client => "The application hit an unexpected problem. Reloading may help.",
      ErrorCategory::Unknown => "Something unexpected happened. Please try again.",
    }
  }

  /// Whether the transport layer may retry after this error. Authentication,
  /// permission, and validation failures never change on retry.
  pub fn is_retryable(&self) -> bool {
    !matches!(
      self.category,
      ErrorCategory::Authentication | ErrorCategory::Permission | ErrorCategory::Validation
    )
  }
}

/// Message substring classification. Earlier patterns win; recovery
/// behavior depends on this order.
fn classify_message(message: &str) -> ErrorCategory {
  let m = message.to_lowercase();
  if m.contains("fetch") || m.contains("network") {
    ErrorCategory::Network
  } else if m.contains("401") || m.contains("unauthorized") {
    ErrorCategory::Authentication
  } else if m.contains("403") || m.contains("forbidden") {
    ErrorCategory::Permission
  } else if m.contains("404") || m.contains("not found") {
    ErrorCategory::NotFound
  } else if m.contains("500") || m.contains("server") {
    ErrorCategory::Server
  } else {
    ErrorCategory::Unknown
  }
}

/// External monitoring sink, e.g. an error-tracking service. Only invoked in
/// production builds.
pub trait MonitorSink: Send + Sync {
  fn report(&self, error: &ApiError);
}

/// Sink that drops every report.
pub struct NoopMonitor;

impl MonitorSink for NoopMonitor {
  fn report(&self, _error: &ApiError) {}
}

/// Logs classified errors at a severity-appropriate level, tagged with a
/// best-effort signed-in marker from the host environment, and forwards them
/// to the monitoring sink in production builds only.
#[derive(Clone)]
pub struct ErrorReporter {
  env: crate::env::Environment,
  sink: std::sync::Arc<dyn MonitorSink>,
}

impl ErrorReporter {
  pub fn new(env: crate::env::Environment) -> Self {
    Self {
      env,
      sink: std::sync::Arc::new(NoopMonitor),
    }
  }

  pub fn with_sink(env: crate::env::Environment, sink: std::sync::Arc<dyn MonitorSink>) -> Self {
    Self { env, sink }
  }

  pub fn report(&self, error: &ApiError) {
    let authenticated = self.env.auth_token().is_some();
    match error.severity {
      Severity::Critical | Severity::High => {
        tracing::error!(
          id = %error.id,
          category = %error.category,
          authenticated,
          context = ?error.context,
          "{}",
          error.message
        );
      }
      Severity::Medium => {
        tracing::warn!(
          id = %error.id,
          category = %error.category,
          authenticated,
          "{}",
          error.message
        );
      }
      Severity::Low => {
        tracing::info!(id = %error.id, category = %error.category, "{}", error.message);
      }
    }

    if self.env.production {
      self.sink.report(error);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_classification() {
    assert_eq!(
      ApiError::from_status(401, "x").category,
      ErrorCategory::Authentication
    );
    assert_eq!(
      ApiError::from_status(403, "x").category,
      ErrorCategory::Permission
    );
    assert_eq!(
      ApiError::from_status(404, "x").category,
      ErrorCategory::NotFound
    );
    assert_eq!(
      ApiError::from_status(422, "x").category,
      ErrorCategory::Validation
    );
    assert_eq!(ApiError::from_status(418, "x").category, ErrorCategory::Client);
    assert_eq!(ApiError::from_status(503, "x").category, ErrorCategory::Server);
  }

  #[test]
  fn test_message_classification_precedence() {
    // "fetch"/"network" win over everything else in the message.
    assert_eq!(
      ApiError::from_message("fetch failed with 401").category,
      ErrorCategory::Network
    );
    assert_eq!(
      ApiError::from_message("request unauthorized").category,
      ErrorCategory::Authentication
    );
    assert_eq!(
      ApiError::from_message("403 Forbidden").category,
      ErrorCategory::Permission
    );
    assert_eq!(
      ApiError::from_message("resource not found").category,
      ErrorCategory::NotFound
    );
    assert_eq!(
      ApiError::from_message("internal server error").category,
      ErrorCategory::Server
    );
    assert_eq!(
      ApiError::from_message("out of cheese").category,
      ErrorCategory::Unknown
    );
  }

  #[test]
  fn test_severity_defaults() {
    let not_found = ApiError::from_message("404 not found");
    assert_eq!(not_found.category, ErrorCategory::NotFound);
    assert_eq!(not_found.severity, Severity::Low);

    let network = ApiError::from_message("fetch failed");
    assert_eq!(network.category, ErrorCategory::Network);
    assert_eq!(network.severity, Severity::Medium);

    let auth = ApiError::from_status(401, "x");
    assert_eq!(auth.severity, Severity::High);
  }

  #[test]
  fn test_fixed_user_messages() {
    let network = ApiError::from_message("fetch failed");
    assert_eq!(
      network.user_message(),
      "Connection problem. Please check your internet and try again."
    );

    let not_found = ApiError::from_message("404 not found");
    assert_eq!(
      not_found.user_message(),
      "We couldn't find what you were looking for."
    );
  }

  #[test]
  fn test_existing_error_passes_through() {
    let original = ApiError::new(ErrorCategory::Validation, "bad field");
    let normalized = ApiError::from_error(&original);
    assert_eq!(normalized.id, original.id);
    assert_eq!(normalized.category, ErrorCategory::Validation);
  }

  #[test]
  fn test_decode_errors_classify_as_client() {
    let decode_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
    let err = ApiError::from_error(&decode_err);
    assert_eq!(err.category, ErrorCategory::Client);
  }

  #[test]
  fn test_retryable_categories() {
    assert!(ApiError::new(ErrorCategory::Network, "x").is_retryable());
    assert!(ApiError::new(ErrorCategory::Server, "x").is_retryable());
    assert!(!ApiError::new(ErrorCategory::Authentication, "x").is_retryable());
    assert!(!ApiError::new(ErrorCategory::Permission, "x").is_retryable());
    assert!(!ApiError::new(ErrorCategory::Validation, "x").is_retryable());
  }

  #[test]
  fn test_unique_error_ids() {
    let a = ApiError::new(ErrorCategory::Unknown, "x");
    let b = ApiError::new(ErrorCategory::Unknown, "x");
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn test_monitor_sink_only_fires_in_production() {
    use crate::env::Environment;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(AtomicUsize);
    impl MonitorSink for CountingSink {
      fn report(&self, _error: &ApiError) {
        self.0.fetch_add(1, Ordering::SeqCst);
      }
    }

    let error = ApiError::new(ErrorCategory::Server, "boom");

    let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
    let dev = ErrorReporter::with_sink(Environment::in_memory(), sink.clone());
    dev.report(&error);
    assert_eq!(sink.0.load(Ordering::SeqCst), 0);

    let prod_env = Environment::in_memory().with_production(true);
    let prod = ErrorReporter::with_sink(prod_env, sink.clone());
    prod.report(&error);
    assert_eq!(sink.0.load(Ordering::SeqCst), 1);
  }
}
