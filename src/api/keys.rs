//! Cache keys for the dashboard endpoints.

use crate::cache::ResourceKey;

use super::client::{MAX_DAYS, MIN_DAYS};
use super::types::AlertFilters;

pub const STATS: &str = "stats";
pub const ALERTS: &str = "alerts";
pub const PEOPLE: &str = "people";
pub const PERSON_IMAGES: &str = "person_images";
pub const CAMERAS: &str = "cameras";
pub const CAMERA_PEOPLE: &str = "camera_people";
pub const IMAGE_METADATA: &str = "image_metadata";

pub fn stats() -> ResourceKey {
  ResourceKey::new(STATS)
}

/// Daily alert counts. Lives under `stats` so invalidating stats covers it.
///
/// `days` is clamped the same way the request is, so out-of-range values
/// share an entry with the range they are served from.
pub fn stats_over_time(days: u32) -> ResourceKey {
  ResourceKey::new(STATS)
    .with_param("view", "over-time")
    .with_param("days", days.clamp(MIN_DAYS, MAX_DAYS))
}

/// The alert list for a filter set, without page parameters.
///
/// Filter values are trimmed, so `" warning "` and `"warning"` share a key.
pub fn alerts(filters: &AlertFilters) -> ResourceKey {
  ResourceKey::from_pairs(
    ALERTS,
    filters
      .pairs()
      .into_iter()
      .map(|(name, value)| (name, value.map(str::trim))),
  )
}

pub fn people() -> ResourceKey {
  ResourceKey::new(PEOPLE)
}

pub fn person(person_id: &str) -> ResourceKey {
  ResourceKey::new(PEOPLE).with_param("person_id", person_id)
}

pub fn person_images(person_id: &str) -> ResourceKey {
  ResourceKey::new(PERSON_IMAGES).with_param("person_id", person_id)
}

pub fn cameras() -> ResourceKey {
  ResourceKey::new(CAMERAS)
}

pub fn camera_people(camera_id: &str, limit: u32) -> ResourceKey {
  ResourceKey::new(CAMERA_PEOPLE)
    .with_param("camera_id", camera_id)
    .with_param("limit", limit)
}

pub fn image_metadata(image_id: &str) -> ResourceKey {
  ResourceKey::new(IMAGE_METADATA).with_param("image_id", image_id)
}

/// Keys watched for new data: the dashboard's headline resources. Each
/// matches exactly one list; details and filtered variants are not watched.
pub fn critical() -> Vec<ResourceKey> {
  vec![stats(), alerts(&AlertFilters::default()), people(), cameras()]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_alert_filters_normalize() {
    let blank = AlertFilters {
      level: Some("  ".to_string()),
      camera_id: Some(String::new()),
      ..Default::default()
    };
    assert_eq!(alerts(&blank), alerts(&AlertFilters::default()));

    let padded = AlertFilters::level(" warning ");
    assert_eq!(alerts(&padded), alerts(&AlertFilters::level("warning")));
    assert_eq!(alerts(&padded).param("level"), Some("warning"));
  }

  #[test]
  fn test_critical_keys_are_headline_lists() {
    let critical = critical();
    assert_eq!(critical.len(), 4);
    assert!(critical.contains(&stats()));
    assert!(critical.contains(&alerts(&AlertFilters::default())));
    assert!(!critical.contains(&alerts(&AlertFilters::level("alert"))));
    assert!(!critical.contains(&stats_over_time(7)));
    assert!(!critical.contains(&person("p1")));
  }

  #[test]
  fn test_over_time_days_clamped() {
    assert_eq!(stats_over_time(0), stats_over_time(1));
    assert_eq!(stats_over_time(500), stats_over_time(90));
    assert_eq!(stats_over_time(500).param("days"), Some("90"));
    assert_ne!(stats_over_time(7), stats_over_time(30));
  }

  #[test]
  fn test_distinct_resources() {
    assert_ne!(person("p1"), person_images("p1"));
    assert_ne!(camera_people("1", 100), camera_people("1", 50));
    assert_ne!(stats(), stats_over_time(7));
  }
}
