//! Client-side query cache for the dashboard API.
//!
//! This module provides an API-agnostic caching mechanism that:
//! - Keys results by resource name plus canonicalized parameters
//! - Coalesces concurrent fetches for the same key into one request
//! - Serves fresh data from memory and refetches stale or failed entries
//! - Keeps stale data readable while a refetch is in flight
//! - Evicts idle entries and mirrors everything to durable storage

mod key;
mod layer;
mod persist;
mod storage;
mod traits;

pub use key::ResourceKey;
pub use layer::{CacheConfig, Invalidate, QueryCache, RefetchOnMount};
pub use persist::{PersistOptions, Persister, Snapshot, DEFAULT_BUSTER, DEFAULT_STORAGE_KEY};
pub use storage::{DurableStore, MemoryStore, SqliteStore};
pub use traits::{
  CacheEntry, CacheEvent, CacheEventKind, CacheResult, CacheSource, Cacheable, FetchStatus,
};
