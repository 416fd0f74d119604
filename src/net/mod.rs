//! Network layer: the HTTP primitive, the offline queue, and the retrying
//! transport that composes them.

mod http;
mod queue;
mod transport;

pub use http::{HttpClient, HttpRequest, HttpResponse, Method, ReqwestHttp};
pub use queue::{OfflineQueue, QueuedRequest, QUEUE_TIMEOUT};
pub use transport::{
  FetchOptions, NetworkStatus, NetworkTransport, Subscription, HEALTH_CHECK_INTERVAL, MAX_BACKOFF,
};
