//! Dashboard API access: endpoint client, wire normalization, cache keys.

mod cached_client;
mod client;
pub mod keys;
mod normalize;
mod types;

pub use cached_client::CachedApiClient;
pub use client::{
  ApiClient, DEFAULT_CAMERA_PEOPLE_LIMIT, DEFAULT_DAYS, MAX_CAMERA_PEOPLE_LIMIT, MAX_DAYS, MIN_DAYS,
};
pub use normalize::{normalize_list, Normalize, Record};
pub use types::{
  Alert, AlertFilters, AlertLevel, Camera, CameraPerson, ImageMeta, ImageMetadata, Person,
  PersonDetails, PersonImage, Stats, TimeSeriesPoint,
};
