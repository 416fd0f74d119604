//! Offline request queue.
//!
//! While the transport believes it is offline, requests are parked here with
//! a oneshot resolver instead of hitting the network. The queue drains in
//! FIFO order when connectivity returns; entries that wait longer than
//! [`QUEUE_TIMEOUT`] are rejected and removed.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::ApiError;

use super::http::{HttpRequest, HttpResponse};
use super::transport::FetchOptions;

/// How long a queued request waits for connectivity before rejecting.
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(300);

/// One request parked while offline.
pub struct QueuedRequest {
  pub id: String,
  pub request: HttpRequest,
  pub options: FetchOptions,
  pub enqueued_at: DateTime<Utc>,
  tx: oneshot::Sender<Result<HttpResponse, ApiError>>,
}

impl QueuedRequest {
  /// Resolve the waiting caller. A caller that already timed out is gone;
  /// that is fine.
  pub fn complete(self, result: Result<HttpResponse, ApiError>) {
    let _ = self.tx.send(result);
  }
}

/// FIFO queue of offline requests.
pub struct OfflineQueue {
  entries: Mutex<VecDeque<QueuedRequest>>,
}

impl OfflineQueue {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(VecDeque::new()),
    }
  }

  /// Park a request. Returns its id and the receiver the caller awaits.
  pub fn enqueue(
    &self,
    request: HttpRequest,
    options: FetchOptions,
  ) -> (String, oneshot::Receiver<Result<HttpResponse, ApiError>>) {
    let (tx, rx) = oneshot::channel();
    let id = Uuid::new_v4().to_string();
    let queued = QueuedRequest {
      id: id.clone(),
      request,
      options,
      enqueued_at: Utc::now(),
      tx,
    };

    if let Ok(mut entries) = self.entries.lock() {
      entries.push_back(queued);
    }
    (id, rx)
  }

  /// Take every queued request, oldest first.
  pub fn drain(&self) -> Vec<QueuedRequest> {
    match self.entries.lock() {
      Ok(mut entries) => entries.drain(..).collect(),
      Err(_) => Vec::new(),
    }
  }

  /// Drop a request whose caller gave up waiting.
  pub fn remove(&self, id: &str) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.retain(|q| q.id != id);
    }
  }

  /// Reject and drop everything. Waiting callers observe a cancellation.
  pub fn clear(&self) {
    let drained = self.drain();
    for queued in drained {
      queued.complete(Err(ApiError::new(
        crate::error::ErrorCategory::Network,
        "queued request cancelled",
      )));
    }
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for OfflineQueue {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::http::Method;

  fn request(url: &str) -> HttpRequest {
    HttpRequest::new(Method::Get, url)
  }

  #[test]
  fn test_fifo_drain_order() {
    let queue = OfflineQueue::new();
    let (_, _rx1) = queue.enqueue(request("https://x/1"), FetchOptions::default());
    let (_, _rx2) = queue.enqueue(request("https://x/2"), FetchOptions::default());
    let (_, _rx3) = queue.enqueue(request("https://x/3"), FetchOptions::default());

    let drained = queue.drain();
    let urls: Vec<&str> = drained.iter().map(|q| q.request.url.as_str()).collect();
    assert_eq!(urls, vec!["https://x/1", "https://x/2", "https://x/3"]);
    assert!(queue.is_empty());
  }

  #[test]
  fn test_remove_by_id() {
    let queue = OfflineQueue::new();
    let (id1, _rx1) = queue.enqueue(request("https://x/1"), FetchOptions::default());
    let (_, _rx2) = queue.enqueue(request("https://x/2"), FetchOptions::default());

    queue.remove(&id1);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.drain()[0].request.url, "https://x/2");
  }

  #[tokio::test]
  async fn test_clear_rejects_waiters() {
    let queue = OfflineQueue::new();
    let (_, rx) = queue.enqueue(request("https://x/1"), FetchOptions::default());

    queue.clear();
    let result = rx.await.unwrap();
    assert!(result.is_err());
  }
}
