//! Caching data-access layer for the DFIP alert dashboard API.
//!
//! [`api::CachedApiClient`] is the entry point: typed reads of stats, alerts,
//! people, cameras and image metadata, normalized from whatever shape the
//! server sends, and served through a shared [`cache::QueryCache`] with
//! request coalescing, staleness, retries and optional persistence.
//! [`freshness::FreshnessMonitor`] tells consumers when cached data is old.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod freshness;
pub mod logging;
pub mod paginator;
pub mod task;
pub mod transport;
