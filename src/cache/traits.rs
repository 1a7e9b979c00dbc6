//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::key::ResourceKey;

/// Anything the cache can hold.
///
/// Data is stored as JSON so one cache can hold every resource shape and be
/// persisted as-is; typed values cross the boundary through serde.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Fetch status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
  /// Created but never fetched
  Idle,
  /// A fetch is in flight
  Fetching,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed; `error` holds the message
  Error,
}

/// A single cached query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub key: ResourceKey,
  /// Entity list (JSON array) or single entity
  pub data: Option<Value>,
  /// When `data` was last written by a successful fetch
  pub fetched_at: Option<DateTime<Utc>>,
  /// After this instant the entry is stale. `None` means stale now.
  pub stale_after: Option<DateTime<Utc>>,
  pub status: FetchStatus,
  pub error: Option<String>,
  /// Last read or fetch, for garbage collection
  #[serde(skip, default = "Utc::now")]
  pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
  pub(crate) fn new(key: ResourceKey, now: DateTime<Utc>) -> Self {
    Self {
      key,
      data: None,
      fetched_at: None,
      stale_after: None,
      status: FetchStatus::Idle,
      error: None,
      last_accessed: now,
    }
  }

  /// Stale once `now` is strictly past `stale_after`, or when invalidated.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    match self.stale_after {
      Some(stale_after) => now > stale_after,
      None => true,
    }
  }

  /// Age of the data, if any has been fetched.
  pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
    self.fetched_at.map(|t| now - t)
  }

  /// Decode the cached data into a typed value.
  pub fn decode<T: Cacheable>(&self) -> Option<T> {
    self
      .data
      .as_ref()
      .and_then(|v| serde_json::from_value(v.clone()).ok())
  }
}

/// Result from a cache operation, including data and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched
  pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T, fetched_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at,
    }
  }

  pub fn from_cache(data: T, fetched_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      fetched_at,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched by this call, or by a concurrent call it attached to
  Network,
  /// Served from a fresh cache entry
  Cache,
}

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
  Fetching,
  Updated,
  Failed,
  Invalidated,
  Evicted,
}

/// Change notification broadcast by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
  pub key: ResourceKey,
  pub kind: CacheEventKind,
}
