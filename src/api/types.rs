//! Canonical records handed to consumers.
//!
//! Every field has a default, so a record built from a sparse payload never
//! carries holes. Serialized names are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of an alert. Unknown wire values read as `Info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
  Alert,
  #[default]
  Info,
  Warning,
}

impl AlertLevel {
  pub fn from_wire(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "alert" => AlertLevel::Alert,
      "warning" => AlertLevel::Warning,
      _ => AlertLevel::Info,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      AlertLevel::Alert => "alert",
      AlertLevel::Info => "info",
      AlertLevel::Warning => "warning",
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
  pub id: String,
  pub person_id: String,
  pub time: String,
  pub level: AlertLevel,
  pub image_id: Option<String>,
  pub camera_id: String,
  pub message: String,
}

/// A person seen by the cameras, summarized over their alerts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
  pub person_id: String,
  pub alert_count: u64,
  pub first_seen: String,
  pub last_seen: String,
  pub image_ids: Vec<String>,
  pub sample_image_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonDetails {
  #[serde(flatten)]
  pub person: Person,
  pub cameras_detected: Vec<String>,
  pub alert_levels: Vec<AlertLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonImage {
  pub image_id: String,
  pub alert_time: String,
  pub camera_id: String,
  pub alert_level: AlertLevel,
  pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
  pub camera_id: String,
  pub total_detections: u64,
  pub unique_people: u64,
  pub first_detection: Option<String>,
  pub last_detection: Option<String>,
}

/// A person as seen by one camera
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraPerson {
  pub person_id: String,
  pub detection_count: u64,
  pub first_detection: Option<String>,
  pub last_detection: Option<String>,
}

/// Stored image file metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
  /// Storage file id, used for the bytes and thumbnail URLs
  pub id: String,
  pub metadata: ImageMeta,
  pub chunk_size: u64,
  pub length: u64,
  pub upload_date: String,
  pub filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMeta {
  /// Image id as referenced by alerts
  pub image_id: String,
  pub event_ts: String,
  /// Any other metadata keys, passed through untouched
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Dashboard headline numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
  pub total_alerts: u64,
  pub alerts_24h: u64,
  pub distinct_people: u64,
  pub active_cameras: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
  pub time_bucket: String,
  pub count: u64,
}

/// Filters accepted by the alert list. Empty strings count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFilters {
  pub level: Option<String>,
  pub camera_id: Option<String>,
  pub person_id: Option<String>,
  pub message_search: Option<String>,
  /// ISO 8601 lower bound on alert time
  pub start_time: Option<String>,
  /// ISO 8601 upper bound on alert time
  pub end_time: Option<String>,
}

impl AlertFilters {
  /// Filter on a single level.
  pub fn level(level: impl Into<String>) -> Self {
    Self {
      level: Some(level.into()),
      ..Default::default()
    }
  }

  /// Filters as wire query parameter pairs.
  pub fn pairs(&self) -> [(&'static str, Option<&str>); 6] {
    [
      ("level", self.level.as_deref()),
      ("camera_id", self.camera_id.as_deref()),
      ("person_id", self.person_id.as_deref()),
      ("message_search", self.message_search.as_deref()),
      ("start_time", self.start_time.as_deref()),
      ("end_time", self.end_time.as_deref()),
    ]
  }
}
