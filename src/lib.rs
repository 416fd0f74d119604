//! Offline-first API client for the RoleFit platform.
//!
//! The core pieces, leaf-first:
//! - [`cache`]: multi-tier response cache with per-endpoint policies
//! - [`error`]: the error taxonomy every failure is normalized into
//! - [`net`]: retrying transport with an offline queue
//! - [`recovery`]: category-specific automated error recovery
//! - [`client`]: the request orchestrator composing the above
//! - [`feedback`]: per-component loading/error state and toasts
//! - [`env`]: host abstraction (storage, navigation, production flag)
//!
//! A typical wiring:
//!
//! ```ignore
//! let env = Environment::in_memory();
//! let cache = CacheStore::new(&env, PolicyTable::standard());
//! let transport = NetworkTransport::new(Arc::new(ReqwestHttp::new()?));
//! let client = ApiClient::new(
//!   transport,
//!   cache,
//!   env,
//!   "https://api.rolefit.io",
//!   FetchOptions::default(),
//! );
//!
//! let credits = client.get("/api/user/credits", RequestOptions::default()).await?;
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod feedback;
pub mod net;
pub mod recovery;

pub use cache::{
  CachePolicy, CacheStats, CacheStore, CacheStrategy, CachedValue, Payload, PolicyTable,
  StorageTier,
};
pub use client::{ApiClient, ApiResponse, BatchRequest, RequestOptions};
pub use config::Config;
pub use env::{Environment, KeyValueStore, MemoryKeyValueStore, Navigator, StorageError};
pub use error::{ApiError, ErrorCategory, ErrorReporter, MonitorSink, Severity};
pub use feedback::{FeedbackCoordinator, Notifier, ToastAction, ToastOptions};
pub use net::{
  FetchOptions, HttpClient, HttpRequest, HttpResponse, Method, NetworkStatus, NetworkTransport,
  ReqwestHttp,
};
pub use recovery::{Recovery, RecoveryContext, RecoveryEngine, RecoveryStrategy};
