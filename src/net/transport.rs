//! Retrying, connectivity-aware wrapper around the HTTP primitive.
//!
//! Adds to a plain [`HttpClient`]:
//! - per-attempt timeouts
//! - exponential backoff with a cap, re-checking connectivity between
//!   attempts
//! - immediate propagation of authentication/permission/validation errors
//! - an offline queue replayed FIFO when connectivity returns
//! - a listener registry for online/offline transitions and an optional
//!   periodic health probe

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::{ApiError, ErrorCategory};

use super::http::{HttpClient, HttpRequest, HttpResponse, Method};
use super::queue::{OfflineQueue, QUEUE_TIMEOUT};

/// Longest wait between retry attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default interval for the connectivity health probe.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
  Online,
  Offline,
}

/// Retry/timeout knobs for one fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
  /// Extra attempts after the first failure.
  pub retries: u32,
  pub retry_delay: Duration,
  pub backoff_multiplier: f64,
  /// Bound on each individual attempt.
  pub timeout: Duration,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      retries: 3,
      retry_delay: Duration::from_millis(1000),
      backoff_multiplier: 2.0,
      timeout: Duration::from_secs(30),
    }
  }
}

type Listener = Arc<dyn Fn(NetworkStatus, bool) + Send + Sync>;

struct TransportInner {
  http: Arc<dyn HttpClient>,
  online: AtomicBool,
  queue: OfflineQueue,
  listeners: Mutex<HashMap<u64, Listener>>,
  next_listener_id: AtomicU64,
}

/// Unsubscribes its listener when dropped.
pub struct Subscription {
  id: u64,
  inner: Weak<TransportInner>,
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      if let Ok(mut listeners) = inner.listeners.lock() {
        listeners.remove(&self.id);
      }
    }
  }
}

/// The network transport. Cheap to clone; all clones share connectivity
/// state and the offline queue.
#[derive(Clone)]
pub struct NetworkTransport {
  inner: Arc<TransportInner>,
}

impl NetworkTransport {
  pub fn new(http: Arc<dyn HttpClient>) -> Self {
    Self {
      inner: Arc::new(TransportInner {
        http,
        online: AtomicBool::new(true),
        queue: OfflineQueue::new(),
        listeners: Mutex::new(HashMap::new()),
        next_listener_id: AtomicU64::new(0),
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  /// Record a connectivity transition, e.g. from the host's online/offline
  /// events. Going online drains the offline queue.
  pub fn set_online(&self, online: bool) {
    let was_online = self.inner.online.swap(online, Ordering::SeqCst);
    if was_online == online {
      return;
    }

    let status = if online {
      NetworkStatus::Online
    } else {
      NetworkStatus::Offline
    };
    tracing::info!(?status, "connectivity changed");
    self.notify(status, online);

    if online {
      self.replay_queue();
    }
  }

  /// Register a connectivity listener. The callback fires on every
  /// transition until the returned [`Subscription`] is dropped.
  pub fn subscribe(
    &self,
    callback: impl Fn(NetworkStatus, bool) + Send + Sync + 'static,
  ) -> Subscription {
    let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut listeners) = self.inner.listeners.lock() {
      listeners.insert(id, Arc::new(callback));
    }
    Subscription {
      id,
      inner: Arc::downgrade(&self.inner),
    }
  }

  fn notify(&self, status: NetworkStatus, is_online: bool) {
    let listeners: Vec<Listener> = match self.inner.listeners.lock() {
      Ok(listeners) => listeners.values().cloned().collect(),
      Err(_) => return,
    };
    for listener in listeners {
      listener(status, is_online);
    }
  }

  /// Number of requests currently parked offline.
  pub fn queued(&self) -> usize {
    self.inner.queue.len()
  }

  /// Reject and drop all parked requests.
  pub fn clear_queue(&self) {
    self.inner.queue.clear();
  }

  /// Issue a request with retry, backoff, and offline handling.
  pub async fn fetch(
    &self,
    request: HttpRequest,
    options: FetchOptions,
  ) -> Result<HttpResponse, ApiError> {
    if !self.is_online() {
      return self.enqueue_offline(request, options).await;
    }
    self.fetch_with_retry(request, options).await
  }

  async fn enqueue_offline(
    &self,
    request: HttpRequest,
    options: FetchOptions,
  ) -> Result<HttpResponse, ApiError> {
    let url = request.url.clone();
    let (id, rx) = self.inner.queue.enqueue(request, options);
    tracing::debug!(%url, queued = self.inner.queue.len(), "offline, request queued");

    match tokio::time::timeout(QUEUE_TIMEOUT, rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(ApiError::new(
        ErrorCategory::Network,
        "queued request cancelled",
      )),
      Err(_) => {
        self.inner.queue.remove(&id);
        Err(
          ApiError::new(ErrorCategory::Network, "offline request timed out")
            .with_context("queued_for_ms", QUEUE_TIMEOUT.as_millis() as u64),
        )
      }
    }
  }

  fn replay_queue(&self) {
    let drained = self.inner.queue.drain();
    if drained.is_empty() {
      return;
    }
    tracing::info!(count = drained.len(), "replaying queued requests");

    let transport = self.clone();
    tokio::spawn(async move {
      for queued in drained {
        let request = queued.request.clone();
        let options = queued.options;
        let result = transport.fetch_with_retry(request, options).await;
        queued.complete(result);
      }
    });
  }

  async fn fetch_with_retry(
    &self,
    request: HttpRequest,
    options: FetchOptions,
  ) -> Result<HttpResponse, ApiError> {
    let mut last_error: Option<ApiError> = None;

    for attempt in 0..=options.retries {
      if attempt > 0 {
        let delay = backoff_delay(options.retry_delay, options.backoff_multiplier, attempt - 1);
        tracing::warn!(
          attempt,
          delay_ms = delay.as_millis() as u64,
          url = %request.url,
          "request failed, retrying"
        );
        tokio::time::sleep(delay).await;

        if !self.is_online() {
          return Err(ApiError::new(
            ErrorCategory::Network,
            "connection lost while retrying",
          ));
        }
      }

      match self.attempt(request.clone(), options.timeout).await {
        Ok(response) => return Ok(response),
        Err(error) => {
          if !error.is_retryable() {
            return Err(error);
          }
          last_error = Some(error);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| ApiError::new(ErrorCategory::Network, "request failed")))
  }

  async fn attempt(
    &self,
    request: HttpRequest,
    timeout: Duration,
  ) -> Result<HttpResponse, ApiError> {
    let url = request.url.clone();
    let response = match tokio::time::timeout(timeout, self.inner.http.execute(request)).await {
      Ok(result) => result?,
      Err(_) => {
        return Err(
          ApiError::new(ErrorCategory::Network, format!("request to {} timed out", url))
            .with_context("timeout_ms", timeout.as_millis() as u64),
        );
      }
    };

    if response.ok() {
      Ok(response)
    } else {
      Err(
        ApiError::from_status(
          response.status,
          format!("request to {} failed with status {}", url, response.status),
        )
        .with_context("body", response.body_snippet()),
      )
    }
  }

  /// Periodically probe `health_url` while believed online; a failed probe
  /// flips the transport offline, which notifies listeners and starts
  /// queuing. Promotion back online is the host's call via `set_online`.
  pub fn spawn_health_monitor(
    &self,
    health_url: String,
    interval: Duration,
  ) -> tokio::task::JoinHandle<()> {
    let transport = self.clone();
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(interval).await;
        if !transport.is_online() {
          continue;
        }

        let probe = HttpRequest::new(Method::Head, &health_url);
        let healthy = match tokio::time::timeout(
          Duration::from_secs(5),
          transport.inner.http.execute(probe),
        )
        .await
        {
          Ok(Ok(response)) => response.ok(),
          _ => false,
        };

        if !healthy {
          tracing::warn!(%health_url, "health check failed, marking transport offline");
          transport.set_online(false);
        }
      }
    })
  }
}

fn backoff_delay(base: Duration, multiplier: f64, step: u32) -> Duration {
  let millis = base.as_millis() as f64 * multiplier.powi(step as i32);
  Duration::from_millis(millis as u64).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::AtomicUsize;
  use std::time::Instant;

  fn ok_response() -> HttpResponse {
    HttpResponse {
      status: 200,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: b"{}".to_vec(),
    }
  }

  fn status_response(status: u16) -> HttpResponse {
    HttpResponse {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  /// Scripted fake: responds per call index, records every request URL.
  struct ScriptedHttp {
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    respond: Box<dyn Fn(usize) -> Result<HttpResponse, ApiError> + Send + Sync>,
  }

  impl ScriptedHttp {
    fn new(respond: impl Fn(usize) -> Result<HttpResponse, ApiError> + Send + Sync + 'static) -> Arc<Self> {
      Arc::new(Self {
        calls: AtomicUsize::new(0),
        urls: Mutex::new(Vec::new()),
        respond: Box::new(respond),
      })
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl HttpClient for ScriptedHttp {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
      let index = self.calls.fetch_add(1, Ordering::SeqCst);
      self.urls.lock().unwrap().push(request.url.clone());
      (self.respond)(index)
    }
  }

  /// Fake that never responds within any reasonable test timeout.
  struct SlowHttp;

  #[async_trait]
  impl HttpClient for SlowHttp {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, ApiError> {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(ok_response())
    }
  }

  fn options(retries: u32, delay_ms: u64) -> FetchOptions {
    FetchOptions {
      retries,
      retry_delay: Duration::from_millis(delay_ms),
      backoff_multiplier: 2.0,
      timeout: Duration::from_secs(5),
    }
  }

  #[tokio::test]
  async fn test_retry_succeeds_after_transient_failures() {
    // Fails twice with 500, then succeeds.
    let http = ScriptedHttp::new(|index| {
      if index < 2 {
        Ok(status_response(500))
      } else {
        Ok(ok_response())
      }
    });
    let transport = NetworkTransport::new(http.clone());

    let started = Instant::now();
    let response = transport
      .fetch(HttpRequest::new(Method::Get, "https://x/api"), options(3, 100))
      .await
      .unwrap();

    assert!(response.ok());
    assert_eq!(http.calls(), 3);
    // Backoff waits at least 100ms + 200ms before the successful attempt.
    assert!(started.elapsed() >= Duration::from_millis(300));
  }

  #[tokio::test]
  async fn test_retries_exhausted_returns_last_error() {
    let http = ScriptedHttp::new(|_| Ok(status_response(503)));
    let transport = NetworkTransport::new(http.clone());

    let err = transport
      .fetch(HttpRequest::new(Method::Get, "https://x/api"), options(2, 10))
      .await
      .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Server);
    assert_eq!(http.calls(), 3);
  }

  #[tokio::test]
  async fn test_authentication_errors_never_retry() {
    let http = ScriptedHttp::new(|_| Ok(status_response(401)));
    let transport = NetworkTransport::new(http.clone());

    let err = transport
      .fetch(HttpRequest::new(Method::Get, "https://x/api"), options(3, 10))
      .await
      .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Authentication);
    assert_eq!(http.calls(), 1);
  }

  #[tokio::test]
  async fn test_validation_errors_never_retry() {
    let http = ScriptedHttp::new(|_| Ok(status_response(422)));
    let transport = NetworkTransport::new(http.clone());

    let err = transport
      .fetch(HttpRequest::new(Method::Get, "https://x/api"), options(3, 10))
      .await
      .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Validation);
    assert_eq!(http.calls(), 1);
  }

  #[tokio::test]
  async fn test_status_to_category_mapping() {
    for (status, category) in [
      (401, ErrorCategory::Authentication),
      (403, ErrorCategory::Permission),
      (404, ErrorCategory::NotFound),
      (422, ErrorCategory::Validation),
      (400, ErrorCategory::Client),
      (500, ErrorCategory::Server),
    ] {
      let http = ScriptedHttp::new(move |_| Ok(status_response(status)));
      let transport = NetworkTransport::new(http);
      let err = transport
        .fetch(HttpRequest::new(Method::Get, "https://x/api"), options(0, 10))
        .await
        .unwrap_err();
      assert_eq!(err.category, category, "status {}", status);
    }
  }

  #[tokio::test]
  async fn test_attempt_timeout_is_retryable_network_error() {
    let transport = NetworkTransport::new(Arc::new(SlowHttp));

    let err = transport
      .fetch(
        HttpRequest::new(Method::Get, "https://x/api"),
        FetchOptions {
          retries: 0,
          timeout: Duration::from_millis(50),
          ..FetchOptions::default()
        },
      )
      .await
      .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Network);
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_connectivity_loss_aborts_retry_sequence() {
    let http = ScriptedHttp::new(|_| Ok(status_response(500)));
    let transport = NetworkTransport::new(http.clone());

    let t = transport.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(30)).await;
      t.set_online(false);
    });

    let err = transport
      .fetch(HttpRequest::new(Method::Get, "https://x/api"), options(3, 100))
      .await
      .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Network);
    assert!(err.message.contains("connection lost"));
  }

  #[tokio::test]
  async fn test_offline_requests_queue_until_online() {
    let http = ScriptedHttp::new(|_| Ok(ok_response()));
    let transport = NetworkTransport::new(http.clone());
    transport.set_online(false);

    let t = transport.clone();
    let handle = tokio::spawn(async move {
      t.fetch(HttpRequest::new(Method::Get, "https://x/api"), options(0, 10))
        .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    assert_eq!(transport.queued(), 1);
    assert_eq!(http.calls(), 0);

    transport.set_online(true);
    let response = handle.await.unwrap().unwrap();
    assert!(response.ok());
    assert_eq!(http.calls(), 1);
    assert_eq!(transport.queued(), 0);
  }

  #[tokio::test]
  async fn test_queue_replays_in_fifo_order() {
    let http = ScriptedHttp::new(|_| Ok(ok_response()));
    let transport = NetworkTransport::new(http.clone());
    transport.set_online(false);

    let mut handles = Vec::new();
    for i in 0..3 {
      let t = transport.clone();
      let url = format!("https://x/api/{}", i);
      handles.push(tokio::spawn(async move {
        t.fetch(HttpRequest::new(Method::Get, url), options(0, 10)).await
      }));
      // Give each spawned fetch time to enqueue before the next.
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transport.queued(), 3);

    transport.set_online(true);
    for handle in handles {
      handle.await.unwrap().unwrap();
    }

    let urls = http.urls.lock().unwrap().clone();
    assert_eq!(
      urls,
      vec!["https://x/api/0", "https://x/api/1", "https://x/api/2"]
    );
  }

  #[tokio::test]
  async fn test_listeners_observe_transitions_until_dropped() {
    let http = ScriptedHttp::new(|_| Ok(ok_response()));
    let transport = NetworkTransport::new(http);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let subscription = transport.subscribe(move |status, is_online| {
      seen_clone.lock().unwrap().push((status, is_online));
    });

    transport.set_online(false);
    transport.set_online(false); // no transition, no callback
    transport.set_online(true);

    assert_eq!(
      *seen.lock().unwrap(),
      vec![
        (NetworkStatus::Offline, false),
        (NetworkStatus::Online, true)
      ]
    );

    drop(subscription);
    transport.set_online(false);
    assert_eq!(seen.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_health_monitor_flips_offline() {
    // Probe always fails.
    let http = ScriptedHttp::new(|_| {
      Err(ApiError::new(ErrorCategory::Network, "connection refused"))
    });
    let transport = NetworkTransport::new(http);
    let monitor = transport.spawn_health_monitor(
      "https://x/health".to_string(),
      Duration::from_millis(20),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!transport.is_online());
    monitor.abort();
  }

  #[test]
  fn test_backoff_delay_caps() {
    assert_eq!(
      backoff_delay(Duration::from_millis(1000), 2.0, 0),
      Duration::from_millis(1000)
    );
    assert_eq!(
      backoff_delay(Duration::from_millis(1000), 2.0, 2),
      Duration::from_millis(4000)
    );
    assert_eq!(backoff_delay(Duration::from_millis(1000), 2.0, 10), MAX_BACKOFF);
  }
}
