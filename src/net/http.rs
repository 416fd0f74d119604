//! HTTP primitive: request/response types and the client trait.

use std::fmt;

use async_trait::async_trait;

use crate::cache::Payload;
use crate::error::{ApiError, ErrorCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Only idempotent read methods participate in caching.
  pub fn is_idempotent(&self) -> bool {
    matches!(self, Method::Get | Method::Head)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One outgoing HTTP request, fully assembled.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<serde_json::Value>,
}

impl HttpRequest {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: serde_json::Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// One completed HTTP response. Any status; converting non-2xx statuses to
/// errors is the transport's job.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }

  /// Best-effort snippet of the body for error messages.
  pub fn body_snippet(&self) -> String {
    let text = String::from_utf8_lossy(&self.body);
    let mut snippet: String = text.chars().take(200).collect();
    if text.chars().count() > 200 {
      snippet.push('…');
    }
    snippet
  }

  /// Decode the body by content type: JSON, text, or raw bytes.
  pub fn decode(&self) -> Result<Payload, ApiError> {
    // HEAD responses and 204s have no body to decode.
    if self.body.is_empty() {
      return Ok(Payload::Json(serde_json::Value::Null));
    }

    let content_type = self.content_type().unwrap_or("").to_lowercase();

    if content_type.contains("json") {
      let value = serde_json::from_slice(&self.body).map_err(|e| {
        ApiError::new(
          ErrorCategory::Client,
          format!("failed to decode response body: {}", e),
        )
      })?;
      return Ok(Payload::Json(value));
    }

    if content_type.starts_with("text/") {
      return Ok(Payload::Text(String::from_utf8_lossy(&self.body).into_owned()));
    }

    if content_type.is_empty() {
      // No content type declared; JSON is the common case for API bodies.
      if let Ok(value) = serde_json::from_slice(&self.body) {
        return Ok(Payload::Json(value));
      }
      return Ok(Payload::Text(String::from_utf8_lossy(&self.body).into_owned()));
    }

    Ok(Payload::Bytes(self.body.clone()))
  }
}

/// The fetch primitive the transport is built on. Implementations resolve to
/// an [`HttpResponse`] for any completed exchange and an [`ApiError`] only
/// for transport-level failures (connect, TLS, timeout).
#[async_trait]
pub trait HttpClient: Send + Sync {
  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

/// reqwest-backed [`HttpClient`].
pub struct ReqwestHttp {
  client: reqwest::Client,
}

impl ReqwestHttp {
  pub fn new() -> Result<Self, ApiError> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| ApiError::new(ErrorCategory::Client, format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl HttpClient for ReqwestHttp {
  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| ApiError::new(ErrorCategory::Client, format!("invalid method: {}", e)))?;

    let mut builder = self.client.request(method, &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(map_reqwest_error)?
      .to_vec();

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

fn map_reqwest_error(e: reqwest::Error) -> ApiError {
  if e.is_timeout() || e.is_connect() {
    ApiError::new(ErrorCategory::Network, format!("network request failed: {}", e))
  } else if e.is_decode() || e.is_builder() {
    ApiError::new(ErrorCategory::Client, e.to_string())
  } else {
    ApiError::from_message(&e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(content_type: &str, body: &[u8]) -> HttpResponse {
    HttpResponse {
      status: 200,
      headers: vec![("Content-Type".to_string(), content_type.to_string())],
      body: body.to_vec(),
    }
  }

  #[test]
  fn test_decode_json() {
    let resp = response("application/json; charset=utf-8", br#"{"credits": 5}"#);
    let payload = resp.decode().unwrap();
    assert_eq!(payload, Payload::Json(serde_json::json!({ "credits": 5 })));
  }

  #[test]
  fn test_decode_text() {
    let resp = response("text/plain", b"hello");
    assert_eq!(resp.decode().unwrap(), Payload::Text("hello".to_string()));
  }

  #[test]
  fn test_decode_binary() {
    let resp = response("application/pdf", &[0x25, 0x50, 0x44, 0x46]);
    assert_eq!(
      resp.decode().unwrap(),
      Payload::Bytes(vec![0x25, 0x50, 0x44, 0x46])
    );
  }

  #[test]
  fn test_decode_invalid_json_is_client_error() {
    let resp = response("application/json", b"not json");
    let err = resp.decode().unwrap_err();
    assert_eq!(err.category, ErrorCategory::Client);
  }

  #[test]
  fn test_header_lookup_case_insensitive() {
    let resp = response("application/json", b"{}");
    assert_eq!(resp.header("CONTENT-TYPE"), Some("application/json"));
  }

  #[test]
  fn test_idempotent_methods() {
    assert!(Method::Get.is_idempotent());
    assert!(Method::Head.is_idempotent());
    assert!(!Method::Post.is_idempotent());
    assert!(!Method::Delete.is_idempotent());
  }
}
