//! The API client: request orchestration over transport + cache.
//!
//! Wraps the transport with per-endpoint caching strategies, request and
//! response interceptors, body decoding, and a cached-data fallback when the
//! network fails. This is the surface the rest of the application calls.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::{
  CacheStore, CacheStrategy, CachedValue, GetOptions, Payload, RequestKey, SetOptions, StorageTier,
};
use crate::env::Environment;
use crate::error::{ApiError, ErrorCategory};
use crate::net::{FetchOptions, HttpRequest, HttpResponse, Method, NetworkTransport};

/// Per-request options and overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  /// Query parameters; part of the cache key in sorted order.
  pub params: BTreeMap<String, String>,
  /// JSON request body.
  pub data: Option<serde_json::Value>,
  pub headers: Vec<(String, String)>,
  /// Force caching on or off regardless of method defaults.
  pub cache: Option<bool>,
  pub cache_strategy: Option<CacheStrategy>,
  pub cache_ttl_ms: Option<u64>,
  pub cache_tier: Option<StorageTier>,
  pub timeout: Option<Duration>,
  pub retries: Option<u32>,
}

impl RequestOptions {
  pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.params.insert(key.into(), value.into());
    self
  }

  pub fn with_data(mut self, data: serde_json::Value) -> Self {
    self.data = Some(data);
    self
  }

  pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
    self.cache_strategy = Some(strategy);
    self
  }
}

/// What a request resolved to: decoded payload plus provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub data: Payload,
  pub from_cache: bool,
  /// HTTP status; absent for cache-served responses.
  pub status: Option<u16>,
  pub timestamp: DateTime<Utc>,
}

impl ApiResponse {
  fn from_cache(cached: CachedValue) -> Self {
    Self {
      data: cached.data,
      from_cache: true,
      status: None,
      timestamp: cached.timestamp,
    }
  }
}

/// One request in a [`ApiClient::batch`] call.
#[derive(Debug, Clone)]
pub struct BatchRequest {
  pub method: Method,
  pub endpoint: String,
  pub options: RequestOptions,
}

impl BatchRequest {
  pub fn get(endpoint: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      endpoint: endpoint.into(),
      options: RequestOptions::default(),
    }
  }
}

type RequestInterceptor = Box<dyn Fn(&mut HttpRequest) + Send + Sync>;
type ResponseInterceptor = Box<dyn Fn(&mut HttpResponse) + Send + Sync>;

struct ClientInner {
  transport: NetworkTransport,
  cache: CacheStore,
  base_url: String,
  defaults: FetchOptions,
  request_interceptors: Mutex<Vec<RequestInterceptor>>,
  response_interceptors: Mutex<Vec<ResponseInterceptor>>,
}

/// The API client. Cheap to clone; clones share the cache, transport, and
/// interceptor registry.
#[derive(Clone)]
pub struct ApiClient {
  inner: Arc<ClientInner>,
}

impl ApiClient {
  /// Build a client. Installs the default interceptors: a request-start
  /// timestamp header and a bearer token read from the environment on every
  /// request.
  pub fn new(
    transport: NetworkTransport,
    cache: CacheStore,
    env: Environment,
    base_url: impl Into<String>,
    defaults: FetchOptions,
  ) -> Self {
    let client = Self {
      inner: Arc::new(ClientInner {
        transport,
        cache,
        base_url: base_url.into(),
        defaults,
        request_interceptors: Mutex::new(Vec::new()),
        response_interceptors: Mutex::new(Vec::new()),
      }),
    };

    client.add_request_interceptor(|request| {
      request.headers.push((
        "x-request-start".to_string(),
        Utc::now().timestamp_millis().to_string(),
      ));
    });

    let token_env = env;
    client.add_request_interceptor(move |request| {
      if let Some(token) = token_env.auth_token() {
        request
          .headers
          .push(("authorization".to_string(), format!("Bearer {}", token)));
      }
    });

    client
  }

  /// Runs before every outgoing request.
  pub fn add_request_interceptor(&self, interceptor: impl Fn(&mut HttpRequest) + Send + Sync + 'static) {
    if let Ok(mut interceptors) = self.inner.request_interceptors.lock() {
      interceptors.push(Box::new(interceptor));
    }
  }

  /// Runs after every completed request, before the body is decoded.
  pub fn add_response_interceptor(
    &self,
    interceptor: impl Fn(&mut HttpResponse) + Send + Sync + 'static,
  ) {
    if let Ok(mut interceptors) = self.inner.response_interceptors.lock() {
      interceptors.push(Box::new(interceptor));
    }
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn transport(&self) -> &NetworkTransport {
    &self.inner.transport
  }

  pub async fn get(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
    self.request(Method::Get, endpoint, options).await
  }

  pub async fn post(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
    self.request(Method::Post, endpoint, options).await
  }

  pub async fn put(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
    self.request(Method::Put, endpoint, options).await
  }

  pub async fn patch(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
    self.request(Method::Patch, endpoint, options).await
  }

  pub async fn delete(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
    self.request(Method::Delete, endpoint, options).await
  }

  /// Issue one request per the endpoint's caching strategy.
  pub async fn request(
    &self,
    method: Method,
    endpoint: &str,
    options: RequestOptions,
  ) -> Result<ApiResponse, ApiError> {
    let key = RequestKey::new(method, self.endpoint_url(endpoint), options.params.clone());
    let canonical = key.canonical();
    let policy = self.inner.cache.policy_for(&canonical);
    let strategy = options.cache_strategy.unwrap_or(policy.strategy);
    let caching = options.cache.unwrap_or(true)
      && method.is_idempotent()
      && strategy != CacheStrategy::NetworkOnly;

    if caching {
      match strategy {
        CacheStrategy::CacheOnly => {
          return match self.inner.cache.get(&canonical, GetOptions::default()) {
            Some(cached) => Ok(ApiResponse::from_cache(cached)),
            None => Err(ApiError::new(
              ErrorCategory::NotFound,
              format!("no cached data for {}", key.description()),
            )),
          };
        }
        CacheStrategy::CacheFirst => {
          if let Some(cached) = self.inner.cache.get(&canonical, GetOptions::default()) {
            tracing::debug!(request = %key.description(), "cache hit");
            return Ok(ApiResponse::from_cache(cached));
          }
        }
        CacheStrategy::StaleWhileRevalidate => {
          let max_age = options.cache_ttl_ms.unwrap_or(policy.ttl_ms);
          if let Some(cached) = self.inner.cache.get(
            &canonical,
            GetOptions {
              max_age_ms: Some(max_age),
            },
          ) {
            tracing::debug!(
              request = %key.description(),
              is_stale = cached.is_stale,
              "serving cached value, revalidating in background"
            );
            self.spawn_revalidate(method, endpoint.to_string(), options, canonical);
            return Ok(ApiResponse::from_cache(cached));
          }
        }
        CacheStrategy::NetworkFirst | CacheStrategy::NetworkOnly => {}
      }
    }

    match self.perform(method, endpoint, &options).await {
      Ok(response) => {
        if caching && response.status.map(|s| (200..300).contains(&s)).unwrap_or(false) {
          self.inner.cache.set(
            &canonical,
            response.data.clone(),
            SetOptions {
              ttl_ms: options.cache_ttl_ms,
              tier: options.cache_tier,
            },
          );
        }
        Ok(response)
      }
      Err(error) => {
        if caching {
          // Anything cached beats nothing, freshness included.
          if let Some(stale) = self.inner.cache.get_any(&canonical) {
            tracing::warn!(
              request = %key.description(),
              error = %error,
              "network failed, serving cached data"
            );
            return Ok(ApiResponse::from_cache(stale));
          }
        }
        Err(error)
      }
    }
  }

  /// Run every request concurrently and report per-request outcomes. One
  /// failure never aborts the rest.
  pub async fn batch(&self, requests: Vec<BatchRequest>) -> Vec<Result<ApiResponse, ApiError>> {
    let futures = requests.into_iter().map(|batch_request| {
      let client = self.clone();
      async move {
        client
          .request(
            batch_request.method,
            &batch_request.endpoint,
            batch_request.options,
          )
          .await
      }
    });
    futures::future::join_all(futures).await
  }

  /// The network round trip: interceptors, transport, decoding.
  async fn perform(
    &self,
    method: Method,
    endpoint: &str,
    options: &RequestOptions,
  ) -> Result<ApiResponse, ApiError> {
    let url = self.build_url(endpoint, &options.params)?;
    let mut request = HttpRequest::new(method, url);
    for (name, value) in &options.headers {
      request.headers.push((name.clone(), value.clone()));
    }
    if let Some(data) = &options.data {
      request
        .headers
        .push(("content-type".to_string(), "application/json".to_string()));
      request.body = Some(data.clone());
    }

    if let Ok(interceptors) = self.inner.request_interceptors.lock() {
      for interceptor in interceptors.iter() {
        interceptor(&mut request);
      }
    }

    let fetch_options = FetchOptions {
      retries: options.retries.unwrap_or(self.inner.defaults.retries),
      timeout: options.timeout.unwrap_or(self.inner.defaults.timeout),
      ..self.inner.defaults
    };

    let mut response = self.inner.transport.fetch(request, fetch_options).await?;

    if let Ok(interceptors) = self.inner.response_interceptors.lock() {
      for interceptor in interceptors.iter() {
        interceptor(&mut response);
      }
    }

    let data = response.decode()?;
    Ok(ApiResponse {
      data,
      from_cache: false,
      status: Some(response.status),
      timestamp: Utc::now(),
    })
  }

  /// Fire-and-forget refresh behind stale-while-revalidate. Failures are
  /// logged, never surfaced to the caller that got the cached value.
  fn spawn_revalidate(
    &self,
    method: Method,
    endpoint: String,
    options: RequestOptions,
    canonical: String,
  ) {
    let client = self.clone();
    tokio::spawn(async move {
      match client.perform(method, &endpoint, &options).await {
        Ok(response) => {
          client.inner.cache.set(
            &canonical,
            response.data,
            SetOptions {
              ttl_ms: options.cache_ttl_ms,
              tier: options.cache_tier,
            },
          );
          tracing::debug!(%endpoint, "background revalidation complete");
        }
        Err(error) => {
          tracing::warn!(%endpoint, error = %error, "background revalidation failed");
        }
      }
    });
  }

  /// Absolute URL for an endpoint, without query parameters. This is the
  /// URL component of the cache key.
  fn endpoint_url(&self, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
      endpoint.to_string()
    } else {
      format!("{}{}", self.inner.base_url, endpoint)
    }
  }

  fn build_url(
    &self,
    endpoint: &str,
    params: &BTreeMap<String, String>,
  ) -> Result<String, ApiError> {
    let base = self.endpoint_url(endpoint);
    let mut url = url::Url::parse(&base).map_err(|e| {
      ApiError::new(ErrorCategory::Client, format!("invalid URL {}: {}", base, e))
    })?;
    for (name, value) in params {
      url.query_pairs_mut().append_pair(name, value);
    }
    Ok(url.to_string())
  }
}
