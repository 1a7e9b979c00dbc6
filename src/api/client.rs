use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use url::Url;

use crate::cache::ResourceKey;
use crate::config::ApiConfig;
use crate::transport::Transport;

use super::normalize::{normalize_list, Normalize};
use super::types::{
  Alert, Camera, CameraPerson, ImageMetadata, Person, PersonDetails, PersonImage, Stats,
  TimeSeriesPoint,
};

const API_PREFIX: &str = "/api/v1";

/// Bounds accepted by the over-time endpoint.
pub const MIN_DAYS: u32 = 1;
pub const MAX_DAYS: u32 = 90;
pub const DEFAULT_DAYS: u32 = 7;

pub const DEFAULT_CAMERA_PEOPLE_LIMIT: u32 = 100;
pub const MAX_CAMERA_PEOPLE_LIMIT: u32 = 1000;

/// Dashboard API client. Every response is normalized; nothing is cached.
#[derive(Clone, Debug)]
pub struct ApiClient {
  transport: Transport,
}

impl ApiClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let transport =
      Transport::new(config).map_err(|e| eyre!("Failed to create API client: {}", e))?;
    Ok(Self { transport })
  }

  pub fn from_transport(transport: Transport) -> Self {
    Self { transport }
  }

  async fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
    let path = format!("{}{}", API_PREFIX, path);
    self
      .transport
      .get_json(&path, query)
      .await
      .map_err(|e| eyre!("{}", e))
  }

  /// Headline counters
  pub async fn get_stats(&self) -> Result<Stats> {
    let raw = self.get("/stats", &[]).await?;
    Ok(Stats::normalize(&raw))
  }

  /// Daily alert counts for the last `days` days, clamped to 1..=90
  pub async fn get_stats_over_time(&self, days: u32) -> Result<Vec<TimeSeriesPoint>> {
    let days = days.clamp(MIN_DAYS, MAX_DAYS);
    let raw = self
      .get("/stats/over-time", &[("days".to_string(), days.to_string())])
      .await?;
    Ok(normalize_list(&raw))
  }

  /// One page of alerts. `query` carries the filters plus `page` and
  /// `page_size` as parameters.
  pub async fn list_alerts(&self, query: &ResourceKey) -> Result<Vec<Alert>> {
    let raw = self.get("/alerts", &query.query_pairs()).await?;
    Ok(normalize_list(&raw))
  }

  pub async fn get_people(&self) -> Result<Vec<Person>> {
    let raw = self.get("/people", &[]).await?;
    Ok(normalize_list(&raw))
  }

  pub async fn get_person(&self, person_id: &str) -> Result<PersonDetails> {
    let raw = self.get(&format!("/people/{}", person_id), &[]).await?;
    Ok(PersonDetails::normalize(&raw))
  }

  pub async fn get_person_images(&self, person_id: &str) -> Result<Vec<PersonImage>> {
    let raw = self
      .get(&format!("/people/{}/images", person_id), &[])
      .await?;
    Ok(normalize_list(&raw))
  }

  pub async fn get_cameras(&self) -> Result<Vec<Camera>> {
    let raw = self.get("/cameras", &[]).await?;
    Ok(normalize_list(&raw))
  }

  /// People seen by one camera, most detections first, at most `limit`
  pub async fn get_camera_people(&self, camera_id: &str, limit: u32) -> Result<Vec<CameraPerson>> {
    let limit = limit.min(MAX_CAMERA_PEOPLE_LIMIT);
    let raw = self
      .get(
        &format!("/cameras/{}/people", camera_id),
        &[("limit".to_string(), limit.to_string())],
      )
      .await?;
    Ok(normalize_list(&raw))
  }

  pub async fn get_image_metadata(&self, image_id: &str) -> Result<ImageMetadata> {
    let raw = self
      .get(&format!("/images/by-image-id/{}", image_id), &[])
      .await?;
    Ok(ImageMetadata::normalize(&raw))
  }

  /// URL of the full image bytes for a storage file id
  pub fn image_bytes_url(&self, file_id: &str) -> Result<Url> {
    self.image_url(file_id, "bytes")
  }

  /// URL of the thumbnail for a storage file id
  pub fn image_thumb_url(&self, file_id: &str) -> Result<Url> {
    self.image_url(file_id, "thumb")
  }

  fn image_url(&self, file_id: &str, variant: &str) -> Result<Url> {
    if file_id.is_empty() {
      return Err(eyre!("Image file id is empty"));
    }
    self
      .transport
      .url_for(&format!("{}/images/{}/{}", API_PREFIX, file_id, variant))
      .map_err(|e| eyre!("{}", e))
  }
}
