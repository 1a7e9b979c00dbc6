//! Cached API client that wraps ApiClient with the query cache.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{Cacheable, Persister, QueryCache, ResourceKey, SqliteStore};
use crate::config::Config;
use crate::paginator::Paginator;

use super::client::ApiClient;
use super::keys;
use super::types::{
  Alert, AlertFilters, Camera, CameraPerson, ImageMetadata, Person, PersonDetails, PersonImage,
  Stats, TimeSeriesPoint,
};

/// API client with transparent caching.
///
/// Exposes the same reads as [`ApiClient`], but every call goes through the
/// shared [`QueryCache`]: fresh results are served from memory, concurrent
/// calls for the same data share one request, and stale data is refetched.
#[derive(Clone, Debug)]
pub struct CachedApiClient {
  inner: ApiClient,
  cache: QueryCache,
  page_size: u32,
}

impl CachedApiClient {
  pub fn new(inner: ApiClient, cache: QueryCache, page_size: u32) -> Self {
    Self {
      inner,
      cache,
      page_size: page_size.max(1),
    }
  }

  /// Build the client and its cache from configuration.
  ///
  /// With persistence enabled the cache is rehydrated from the SQLite store.
  /// A store that cannot be opened degrades to a memory-only cache.
  pub fn from_config(config: &Config) -> Result<Self> {
    let inner = ApiClient::new(&config.api)?;
    let mut cache = QueryCache::new(config.cache.cache_config());

    if config.cache.persist {
      match SqliteStore::open() {
        Ok(store) => {
          let persister = Persister::new(Arc::new(store), config.cache.persist_options());
          cache = cache.with_persister(persister);
        }
        Err(e) => warn!(error = %e, "cache persistence unavailable, using memory only"),
      }
    }

    Ok(Self::new(inner, cache, config.page_size))
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn api(&self) -> &ApiClient {
    &self.inner
  }

  async fn query<T, F, Fut>(&self, key: ResourceKey, fetch: F) -> Result<T>
  where
    T: Cacheable,
    F: Fn(ApiClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let inner = self.inner.clone();
    let result = self.cache.mount(&key, move || fetch(inner.clone())).await?;
    Ok(result.data)
  }

  pub async fn stats(&self) -> Result<Stats> {
    self
      .query(keys::stats(), |api| async move { api.get_stats().await })
      .await
  }

  pub async fn stats_over_time(&self, days: u32) -> Result<Vec<TimeSeriesPoint>> {
    self
      .query(keys::stats_over_time(days), move |api| async move {
        api.get_stats_over_time(days).await
      })
      .await
  }

  /// Paginated alert list for `filters`, not yet loaded.
  pub fn alerts(&self, filters: &AlertFilters) -> Paginator<Alert> {
    let inner = self.inner.clone();
    Paginator::new(
      self.cache.clone(),
      keys::alerts(filters),
      self.page_size,
      move |page_key| {
        let inner = inner.clone();
        async move { inner.list_alerts(&page_key).await }
      },
    )
  }

  pub async fn people(&self) -> Result<Vec<Person>> {
    self
      .query(keys::people(), |api| async move { api.get_people().await })
      .await
  }

  pub async fn person(&self, person_id: &str) -> Result<PersonDetails> {
    let id = person_id.to_string();
    self
      .query(keys::person(person_id), move |api| {
        let id = id.clone();
        async move { api.get_person(&id).await }
      })
      .await
  }

  pub async fn person_images(&self, person_id: &str) -> Result<Vec<PersonImage>> {
    let id = person_id.to_string();
    self
      .query(keys::person_images(person_id), move |api| {
        let id = id.clone();
        async move { api.get_person_images(&id).await }
      })
      .await
  }

  pub async fn cameras(&self) -> Result<Vec<Camera>> {
    self
      .query(keys::cameras(), |api| async move { api.get_cameras().await })
      .await
  }

  pub async fn camera_people(&self, camera_id: &str, limit: u32) -> Result<Vec<CameraPerson>> {
    let id = camera_id.to_string();
    self
      .query(keys::camera_people(camera_id, limit), move |api| {
        let id = id.clone();
        async move { api.get_camera_people(&id, limit).await }
      })
      .await
  }

  /// Metadata for an image id. Nothing is fetched without an id.
  pub async fn image_metadata(&self, image_id: Option<&str>) -> Result<Option<ImageMetadata>> {
    let Some(image_id) = image_id.filter(|id| !id.is_empty()) else {
      return Ok(None);
    };

    let id = image_id.to_string();
    let metadata = self
      .query(keys::image_metadata(image_id), move |api| {
        let id = id.clone();
        async move { api.get_image_metadata(&id).await }
      })
      .await?;
    Ok(Some(metadata))
  }
}
