//! Per-component loading/error state and user notifications.
//!
//! UI components register here by id; the coordinator tracks their
//! loading/error state, invokes their callback synchronously on every
//! change, and turns classified errors into exactly one toast each via the
//! attached notification sink.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::Payload;
use crate::error::{ApiError, ErrorCategory, ErrorReporter, Severity};
use crate::recovery::{Recovery, RecoveryContext, RecoveryEngine};

/// Default toast duration.
pub const TOAST_DURATION: Duration = Duration::from_secs(5);
/// Toast duration for errors.
pub const ERROR_TOAST_DURATION: Duration = Duration::from_secs(7);

/// Action buttons a toast may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastAction {
  Retry,
  SignIn,
  ContactSupport,
}

/// Presentation options for an error toast.
#[derive(Debug, Clone, PartialEq)]
pub struct ToastOptions {
  /// `None` means the toast never auto-dismisses.
  pub duration: Option<Duration>,
  pub actions: Vec<ToastAction>,
}

/// Notification sink, implemented by the host UI's toast system.
pub trait Notifier: Send + Sync {
  fn success(&self, title: &str, message: &str);
  fn error(&self, title: &str, message: &str, options: &ToastOptions);
  fn warning(&self, title: &str, message: &str);
  fn info(&self, title: &str, message: &str);
}

#[derive(Debug, Clone)]
pub struct LoadingState {
  pub is_loading: bool,
  pub message: Option<String>,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorState {
  pub error: ApiError,
  /// The fixed user-facing sentence for the error's category.
  pub message: String,
  pub timestamp: DateTime<Utc>,
}

/// One component's feedback state.
#[derive(Debug, Clone, Default)]
pub struct ComponentState {
  pub loading: Option<LoadingState>,
  pub error: Option<ErrorState>,
}

type StateCallback = Arc<dyn Fn(&ComponentState) + Send + Sync>;

struct FeedbackInner {
  states: Mutex<HashMap<String, ComponentState>>,
  callbacks: Mutex<HashMap<String, StateCallback>>,
  notifier: Option<Arc<dyn Notifier>>,
  reporter: ErrorReporter,
}

/// Removes the component's callback and state when dropped.
pub struct Registration {
  component: String,
  inner: Weak<FeedbackInner>,
}

impl Drop for Registration {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      if let Ok(mut callbacks) = inner.callbacks.lock() {
        callbacks.remove(&self.component);
      }
      if let Ok(mut states) = inner.states.lock() {
        states.remove(&self.component);
      }
    }
  }
}

#[derive(Clone)]
pub struct FeedbackCoordinator {
  inner: Arc<FeedbackInner>,
}

impl FeedbackCoordinator {
  pub fn new(reporter: ErrorReporter) -> Self {
    Self {
      inner: Arc::new(FeedbackInner {
        states: Mutex::new(HashMap::new()),
        callbacks: Mutex::new(HashMap::new()),
        notifier: None,
        reporter,
      }),
    }
  }

  pub fn with_notifier(reporter: ErrorReporter, notifier: Arc<dyn Notifier>) -> Self {
    Self {
      inner: Arc::new(FeedbackInner {
        states: Mutex::new(HashMap::new()),
        callbacks: Mutex::new(HashMap::new()),
        notifier: Some(notifier),
        reporter,
      }),
    }
  }

  /// Register a component. Its callback fires synchronously on every state
  /// change until the returned [`Registration`] is dropped.
  pub fn register(
    &self,
    component: impl Into<String>,
    callback: impl Fn(&ComponentState) + Send + Sync + 'static,
  ) -> Registration {
    let component = component.into();
    if let Ok(mut callbacks) = self.inner.callbacks.lock() {
      callbacks.insert(component.clone(), Arc::new(callback));
    }
    Registration {
      component,
      inner: Arc::downgrade(&self.inner),
    }
  }

  pub fn state(&self, component: &str) -> Option<ComponentState> {
    self.inner.states.lock().ok()?.get(component).cloned()
  }

  pub fn set_loading(&self, component: &str, is_loading: bool, message: Option<&str>) {
    let state = self.update_state(component, |state| {
      state.loading = Some(LoadingState {
        is_loading,
        message: message.map(String::from),
        timestamp: Utc::now(),
      });
      if is_loading {
        state.error = None;
      }
    });
    self.invoke_callback(component, &state);
  }

  /// Record a classified error for a component, notify its callback, report
  /// the error, and emit one toast.
  pub fn set_error(&self, component: &str, error: ApiError) {
    let user_message = error.user_message().to_string();
    let state = self.update_state(component, |state| {
      state.error = Some(ErrorState {
        error: error.clone(),
        message: user_message.clone(),
        timestamp: Utc::now(),
      });
      state.loading = None;
    });
    self.invoke_callback(component, &state);

    self.inner.reporter.report(&error);

    if let Some(notifier) = &self.inner.notifier {
      let options = toast_options(&error);
      notifier.error(error.category.title(), &user_message, &options);
    }
  }

  pub fn clear(&self, component: &str) {
    let state = self.update_state(component, |state| {
      state.loading = None;
      state.error = None;
    });
    self.invoke_callback(component, &state);
  }

  fn update_state(
    &self,
    component: &str,
    mutate: impl FnOnce(&mut ComponentState),
  ) -> ComponentState {
    match self.inner.states.lock() {
      Ok(mut states) => {
        let state = states.entry(component.to_string()).or_default();
        mutate(state);
        state.clone()
      }
      Err(_) => ComponentState::default(),
    }
  }

  fn invoke_callback(&self, component: &str, state: &ComponentState) {
    let callback = self
      .inner
      .callbacks
      .lock()
      .ok()
      .and_then(|callbacks| callbacks.get(component).cloned());
    if let Some(callback) = callback {
      callback(state);
    }
  }

  /// Run an operation with loading state management: the loading flag is
  /// set before and always cleared after, success or failure, and failures
  /// go through [`set_error`](Self::set_error) before propagating.
  pub async fn run_with_feedback<F, Fut, T>(
    &self,
    component: &str,
    message: Option<&str>,
    operation: F,
  ) -> Result<T, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    self.set_loading(component, true, message);
    let result = operation().await;
    self.set_loading(component, false, None);

    match result {
      Ok(value) => Ok(value),
      Err(error) => {
        self.set_error(component, error.clone());
        Err(error)
      }
    }
  }

  /// Like [`run_with_feedback`](Self::run_with_feedback), but failures are
  /// first handed to the recovery engine; only unrecovered errors surface.
  pub async fn run_with_recovery<F, Fut>(
    &self,
    component: &str,
    message: Option<&str>,
    engine: &RecoveryEngine,
    ctx: &RecoveryContext,
    operation: F,
  ) -> Result<Recovery, ApiError>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Payload, ApiError>>,
  {
    self.set_loading(component, true, message);
    let result = match operation().await {
      Ok(data) => Ok(Recovery::Value {
        data,
        is_fallback: false,
      }),
      Err(error) => engine.attempt(error, &operation, ctx).await,
    };
    self.set_loading(component, false, None);

    match result {
      Ok(recovery) => Ok(recovery),
      Err(error) => {
        self.set_error(component, error.clone());
        Err(error)
      }
    }
  }

  /// Run sub-operations in order, reporting fractional progress after each
  /// settles. One failure never stops the rest.
  pub async fn run_batch<F, Fut, T>(
    &self,
    component: &str,
    operations: Vec<F>,
    progress: impl Fn(usize, usize),
  ) -> Vec<Result<T, ApiError>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    let total = operations.len();
    self.set_loading(component, true, Some(&format!("0/{}", total)));

    let mut results = Vec::with_capacity(total);
    for (index, operation) in operations.into_iter().enumerate() {
      let result = operation().await;
      if let Err(error) = &result {
        self.inner.reporter.report(error);
      }
      results.push(result);
      progress(index + 1, total);
      self.set_loading(component, true, Some(&format!("{}/{}", index + 1, total)));
    }

    self.set_loading(component, false, None);
    results
  }
}

/// Duration and actions for an error toast: critical errors stay up until
/// dismissed and offer support contact; network/server errors offer a
/// retry; authentication errors offer sign-in.
fn toast_options(error: &ApiError) -> ToastOptions {
  let duration = if error.severity == Severity::Critical {
    None
  } else {
    Some(ERROR_TOAST_DURATION)
  };

  let mut actions = Vec::new();
  match error.category {
    ErrorCategory::Network | ErrorCategory::Server => actions.push(ToastAction::Retry),
    ErrorCategory::Authentication => actions.push(ToastAction::SignIn),
    _ => {}
  }
  if error.severity == Severity::Critical {
    actions.push(ToastAction::ContactSupport);
  }

  ToastOptions { duration, actions }
}
