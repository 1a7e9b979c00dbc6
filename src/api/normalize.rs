//! Mapping of wire payloads onto the canonical records in [`super::types`].
//!
//! The API has shipped several shapes for the same entity over time
//! (snake_case keys, camelCase keys, `_id` vs `id`). Each field is resolved by
//! probing its aliases in order; the first present, non-null, usable value
//! wins and anything else falls back to the field default. Normalization never
//! fails.

use serde_json::{Map, Value};

use super::types::{
  Alert, AlertLevel, Camera, CameraPerson, ImageMeta, ImageMetadata, Person, PersonDetails,
  PersonImage, Stats, TimeSeriesPoint,
};

/// Build a canonical record from any JSON value.
pub trait Normalize: Sized {
  fn normalize(raw: &Value) -> Self;
}

/// Normalize every element of a list payload. Anything but an array yields an
/// empty list.
pub fn normalize_list<T: Normalize>(raw: &Value) -> Vec<T> {
  match raw {
    Value::Array(items) => items.iter().map(T::normalize).collect(),
    _ => Vec::new(),
  }
}

/// Read-only view over one wire object with alias probing.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
  map: Option<&'a Map<String, Value>>,
}

impl<'a> Record<'a> {
  pub fn new(raw: &'a Value) -> Self {
    Self {
      map: raw.as_object(),
    }
  }

  fn first_of<R>(&self, aliases: &[&str], read: impl Fn(&'a Value) -> Option<R>) -> Option<R> {
    let map = self.map?;
    aliases
      .iter()
      .filter_map(|alias| map.get(*alias))
      .filter(|v| !v.is_null())
      .find_map(read)
  }

  pub fn opt_string(&self, aliases: &[&str]) -> Option<String> {
    self.first_of(aliases, as_text)
  }

  pub fn string(&self, aliases: &[&str]) -> String {
    self.opt_string(aliases).unwrap_or_default()
  }

  pub fn count(&self, aliases: &[&str]) -> u64 {
    self.first_of(aliases, as_count).unwrap_or(0)
  }

  pub fn strings(&self, aliases: &[&str]) -> Vec<String> {
    self
      .first_of(aliases, |v| v.as_array())
      .map(|items| items.iter().filter_map(as_text).collect())
      .unwrap_or_default()
  }

  pub fn level(&self, aliases: &[&str]) -> AlertLevel {
    self
      .opt_string(aliases)
      .map(|s| AlertLevel::from_wire(&s))
      .unwrap_or_default()
  }

  pub fn object(&self, aliases: &[&str]) -> Option<&'a Map<String, Value>> {
    self.first_of(aliases, |v| v.as_object())
  }
}

fn as_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

fn as_count(value: &Value) -> Option<u64> {
  match value {
    Value::Number(n) => n
      .as_u64()
      .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
    Value::String(s) => {
      let s = s.trim();
      s.parse::<u64>().ok().or_else(|| {
        s.parse::<f64>()
          .ok()
          .filter(|f| f.is_finite() && *f >= 0.0)
          .map(|f| f as u64)
      })
    }
    _ => None,
  }
}

impl Normalize for Alert {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    Alert {
      id: r.string(&["id", "_id"]),
      person_id: r.string(&["personId", "person_id"]),
      time: r.string(&["time"]),
      level: r.level(&["level"]),
      image_id: r.opt_string(&["imageId", "image_id"]),
      camera_id: r.string(&["cameraId", "camera_id"]),
      message: r.string(&["message"]),
    }
  }
}

impl Normalize for Person {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    Person {
      person_id: r.string(&["personId", "person_id", "_id"]),
      alert_count: r.count(&["alertCount", "alert_count"]),
      first_seen: r.string(&["firstSeen", "first_seen"]),
      last_seen: r.string(&["lastSeen", "last_seen"]),
      image_ids: r.strings(&["imageIds", "image_ids"]),
      sample_image_id: r.opt_string(&["sampleImageId", "sample_image_id"]),
    }
  }
}

impl Normalize for PersonDetails {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    PersonDetails {
      person: Person::normalize(raw),
      cameras_detected: r.strings(&["camerasDetected", "cameras_detected"]),
      alert_levels: r
        .strings(&["alertLevels", "alert_levels"])
        .iter()
        .map(|s| AlertLevel::from_wire(s))
        .collect(),
    }
  }
}

impl Normalize for PersonImage {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    PersonImage {
      image_id: r.string(&["imageId", "image_id"]),
      alert_time: r.string(&["alertTime", "alert_time"]),
      camera_id: r.string(&["cameraId", "camera_id"]),
      alert_level: r.level(&["alertLevel", "alert_level"]),
      message: r.string(&["message"]),
    }
  }
}

impl Normalize for Camera {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    Camera {
      camera_id: r.string(&["cameraId", "camera_id", "_id"]),
      total_detections: r.count(&["totalDetections", "total_detections"]),
      unique_people: r.count(&["uniquePeople", "unique_people"]),
      first_detection: r.opt_string(&["firstDetection", "first_detection"]),
      last_detection: r.opt_string(&["lastDetection", "last_detection"]),
    }
  }
}

impl Normalize for CameraPerson {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    CameraPerson {
      person_id: r.string(&["personId", "person_id"]),
      detection_count: r.count(&["detectionCount", "detection_count"]),
      first_detection: r.opt_string(&["firstDetection", "first_detection"]),
      last_detection: r.opt_string(&["lastDetection", "last_detection"]),
    }
  }
}

const IMAGE_ID_ALIASES: [&str; 2] = ["imageId", "image_id"];
const EVENT_TS_ALIASES: [&str; 2] = ["eventTs", "event_ts"];

impl Normalize for ImageMetadata {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    let metadata = r
      .object(&["metadata"])
      .map(|meta| {
        let view = Record { map: Some(meta) };
        // Alias keys are folded into the typed fields; everything else rides along
        let extra = meta
          .iter()
          .filter(|(k, _)| {
            !IMAGE_ID_ALIASES.contains(&k.as_str()) && !EVENT_TS_ALIASES.contains(&k.as_str())
          })
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect();
        ImageMeta {
          image_id: view.string(&IMAGE_ID_ALIASES),
          event_ts: view.string(&EVENT_TS_ALIASES),
          extra,
        }
      })
      .unwrap_or_default();

    ImageMetadata {
      id: r.string(&["id", "_id"]),
      metadata,
      chunk_size: r.count(&["chunkSize", "chunk_size"]),
      length: r.count(&["length"]),
      upload_date: r.string(&["uploadDate", "upload_date"]),
      filename: r.string(&["filename"]),
    }
  }
}

impl Normalize for Stats {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    Stats {
      total_alerts: r.count(&["totalAlerts", "total_alerts"]),
      alerts_24h: r.count(&["alerts24h", "alerts_24h"]),
      distinct_people: r.count(&["distinctPeople", "distinct_people"]),
      active_cameras: r.count(&["activeCameras", "active_cameras"]),
    }
  }
}

impl Normalize for TimeSeriesPoint {
  fn normalize(raw: &Value) -> Self {
    let r = Record::new(raw);
    TimeSeriesPoint {
      time_bucket: r.string(&["timeBucket", "time_bucket", "_id"]),
      count: r.count(&["count"]),
    }
  }
}
