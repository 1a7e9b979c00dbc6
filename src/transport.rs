//! HTTP transport to the dashboard API.
//!
//! Issues GET requests against the configured base URL with a fixed timeout,
//! and camelizes object keys of JSON responses so downstream code sees one
//! casing convention first.

use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;

/// Upper bound for the retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Errors from a single request.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("request timed out")]
  Timeout,

  #[error("network error: {0}")]
  Network(String),

  #[error("HTTP {status}: {message}")]
  Status { status: u16, message: String },

  #[error("invalid URL: {0}")]
  InvalidUrl(String),

  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl From<reqwest::Error> for TransportError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      TransportError::Timeout
    } else if e.is_decode() {
      TransportError::Decode(e.to_string())
    } else {
      TransportError::Network(e.to_string())
    }
  }
}

/// Delay before retry number `attempt` (0-based): doubles from `base`, capped
/// at 30 seconds.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
  let factor = 2u32.saturating_pow(attempt);
  base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

/// HTTP client bound to one API base URL.
#[derive(Clone, Debug)]
pub struct Transport {
  http: reqwest::Client,
  base_url: Url,
}

impl Transport {
  pub fn new(config: &ApiConfig) -> Result<Self, TransportError> {
    let base_url =
      Url::parse(&config.url).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", config.url, e)))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| TransportError::Network(e.to_string()))?;

    Ok(Self { http, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve `path` against the base URL.
  pub fn url_for(&self, path: &str) -> Result<Url, TransportError> {
    self
      .base_url
      .join(path)
      .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", path, e)))
  }

  /// GET `path` with `query` and return the JSON body.
  ///
  /// Object keys are camelized when the server labels the body as JSON.
  pub async fn get_json(
    &self,
    path: &str,
    query: &[(String, String)],
  ) -> Result<Value, TransportError> {
    let url = self.url_for(path)?;
    debug!(url = %url, ?query, "GET");

    let response = self.http.get(url).query(query).send().await?;
    let status = response.status();
    let is_json = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.starts_with("application/json"))
      .unwrap_or(false);
    let body = response.bytes().await?;

    if !status.is_success() {
      return Err(TransportError::Status {
        status: status.as_u16(),
        message: error_detail(&body).unwrap_or_else(|| {
          status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
        }),
      });
    }

    let value: Value =
      serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))?;

    Ok(if is_json { camelize_keys(value) } else { value })
  }
}

/// The `detail` message an API error body carries, if any.
fn error_detail(body: &[u8]) -> Option<String> {
  let value: Value = serde_json::from_slice(body).ok()?;
  match value.get("detail")? {
    Value::String(s) => Some(s.clone()),
    other => Some(other.to_string()),
  }
}

/// Recursively convert object keys from snake_case to camelCase.
pub fn camelize_keys(value: Value) -> Value {
  match value {
    Value::Object(map) => Value::Object(
      map
        .into_iter()
        .map(|(k, v)| (camelize(&k), camelize_keys(v)))
        .collect::<Map<String, Value>>(),
    ),
    Value::Array(items) => Value::Array(items.into_iter().map(camelize_keys).collect()),
    other => other,
  }
}

/// `person_id` -> `personId`, `alerts_24h` -> `alerts24h`, `_id` -> `id`.
/// Purely numeric keys are left alone.
pub fn camelize(key: &str) -> String {
  if key.chars().all(|c| c.is_ascii_digit()) {
    return key.to_string();
  }

  let mut out = String::with_capacity(key.len());
  let mut upper_next = false;
  for c in key.chars() {
    if c == '_' || c == '-' || c.is_whitespace() {
      upper_next = true;
    } else if upper_next {
      out.extend(c.to_uppercase());
      upper_next = false;
    } else {
      out.push(c);
    }
  }

  let mut chars = out.chars();
  match chars.next() {
    Some(first) => first.to_lowercase().chain(chars).collect(),
    None => out,
  }
}
