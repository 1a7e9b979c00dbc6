//! Mirrors the query cache into durable storage and restores it at startup.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::storage::DurableStore;
use super::traits::{CacheEntry, FetchStatus};

/// Default identifier of the persisted blob.
pub const DEFAULT_STORAGE_KEY: &str = "DFIP_QUERY_CACHE";

/// Default buster. Change it to throw away every persisted cache.
pub const DEFAULT_BUSTER: &str = "v1";

/// Versioned blob written to storage.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
  version: String,
  entries: Vec<CacheEntry>,
  saved_at: DateTime<Utc>,
}

/// Settings for the persister.
#[derive(Debug, Clone)]
pub struct PersistOptions {
  pub storage_key: String,
  pub buster: String,
  /// Envelopes older than this are discarded on restore
  pub max_age: Duration,
}

impl Default for PersistOptions {
  fn default() -> Self {
    Self {
      storage_key: DEFAULT_STORAGE_KEY.to_string(),
      buster: DEFAULT_BUSTER.to_string(),
      max_age: Duration::hours(2),
    }
  }
}

/// Cache contents captured at one point, waiting to be written.
///
/// Snapshots are numbered in the order they are taken. Writing one that is
/// older than what already landed is a no-op, so writes may run on any thread
/// without an earlier state overwriting a later one.
#[derive(Debug)]
pub struct Snapshot {
  seq: u64,
  entries: Vec<CacheEntry>,
  saved_at: DateTime<Utc>,
}

impl Snapshot {
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Best-effort persistence adapter.
///
/// Neither writing nor reading ever fails outward: problems are logged and
/// treated as an empty cache.
#[derive(Clone)]
pub struct Persister {
  store: Arc<dyn DurableStore>,
  options: PersistOptions,
  next_seq: Arc<AtomicU64>,
  /// Sequence number of the last snapshot written or discarded
  written: Arc<Mutex<u64>>,
}

impl Persister {
  pub fn new(store: Arc<dyn DurableStore>, options: PersistOptions) -> Self {
    Self {
      store,
      options,
      next_seq: Arc::new(AtomicU64::new(0)),
      written: Arc::new(Mutex::new(0)),
    }
  }

  pub fn options(&self) -> &PersistOptions {
    &self.options
  }

  /// Capture `entries` for a later `write`. Entries without data are skipped.
  ///
  /// Cheap compared to the write itself: no serialization, no I/O.
  pub fn snapshot<'a, I>(&self, entries: I, now: DateTime<Utc>) -> Snapshot
  where
    I: IntoIterator<Item = &'a CacheEntry>,
  {
    Snapshot {
      seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
      entries: entries
        .into_iter()
        .filter(|e| e.data.is_some())
        .cloned()
        .collect(),
      saved_at: now,
    }
  }

  /// Serialize and store `snapshot` unless a newer one has already landed.
  /// An empty snapshot removes the blob.
  pub fn write(&self, snapshot: Snapshot) {
    let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
    if snapshot.seq <= *written {
      debug!(seq = snapshot.seq, "skipping superseded cache snapshot");
      return;
    }
    *written = snapshot.seq;

    if snapshot.entries.is_empty() {
      self.remove();
      return;
    }

    let envelope = Envelope {
      version: self.options.buster.clone(),
      entries: snapshot.entries,
      saved_at: snapshot.saved_at,
    };
    if let Err(e) = self.store_envelope(&envelope) {
      warn!(error = %e, "failed to persist query cache");
    }
  }

  /// Snapshot and write in one go.
  pub fn persist<'a, I>(&self, entries: I, now: DateTime<Utc>)
  where
    I: IntoIterator<Item = &'a CacheEntry>,
  {
    let snapshot = self.snapshot(entries, now);
    self.write(snapshot);
  }

  fn store_envelope(&self, envelope: &Envelope) -> Result<()> {
    let blob =
      serde_json::to_string(envelope).map_err(|e| eyre!("Failed to serialize cache: {}", e))?;
    self.store.set_item(&self.options.storage_key, &blob)
  }

  /// Read the persisted entries, or nothing if the envelope is missing,
  /// corrupt, from another version, or too old.
  pub fn restore(&self, now: DateTime<Utc>) -> Vec<CacheEntry> {
    let blob = match self.store.get_item(&self.options.storage_key) {
      Ok(Some(blob)) => blob,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!(error = %e, "failed to read persisted query cache");
        return Vec::new();
      }
    };

    let envelope: Envelope = match serde_json::from_str(&blob) {
      Ok(envelope) => envelope,
      Err(e) => {
        warn!(error = %e, "discarding corrupt persisted query cache");
        self.discard();
        return Vec::new();
      }
    };

    if envelope.version != self.options.buster {
      info!(
        found = %envelope.version,
        expected = %self.options.buster,
        "discarding persisted query cache from another version"
      );
      self.discard();
      return Vec::new();
    }

    if now - envelope.saved_at > self.options.max_age {
      info!(saved_at = %envelope.saved_at, "discarding expired persisted query cache");
      self.discard();
      return Vec::new();
    }

    debug!(count = envelope.entries.len(), "restored persisted query cache");
    envelope
      .entries
      .into_iter()
      .filter(|e| e.data.is_some())
      .map(|mut entry| {
        entry.status = FetchStatus::Success;
        entry.error = None;
        entry.last_accessed = now;
        entry
      })
      .collect()
  }

  /// Remove the persisted blob. Snapshots taken before this call can no
  /// longer bring it back.
  pub fn discard(&self) {
    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
    *written = (*written).max(seq);
    self.remove();
  }

  fn remove(&self) {
    if let Err(e) = self.store.remove_item(&self.options.storage_key) {
      warn!(error = %e, "failed to remove persisted query cache");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::ResourceKey;
  use crate::cache::storage::MemoryStore;
  use serde_json::json;

  fn entry(resource: &str, now: DateTime<Utc>) -> CacheEntry {
    let mut entry = CacheEntry::new(ResourceKey::new(resource), now);
    entry.data = Some(json!([{ "id": resource }]));
    entry.fetched_at = Some(now);
    entry.stale_after = Some(now + Duration::minutes(10));
    entry.status = FetchStatus::Success;
    entry
  }

  #[test]
  fn test_round_trip_within_max_age() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let persister = Persister::new(store, PersistOptions::default());
    let now = Utc::now();
    let entries = vec![entry("people", now), entry("cameras", now)];

    persister.persist(&entries, now);
    let restored = persister.restore(now + Duration::minutes(90));

    assert_eq!(restored.len(), 2);
    assert_eq!(restored[0].key, entries[0].key);
    assert_eq!(restored[0].data, entries[0].data);
    assert_eq!(restored[0].fetched_at, entries[0].fetched_at);
    assert_eq!(restored[1].key, entries[1].key);
  }

  #[test]
  fn test_expired_envelope_is_discarded() {
    let store = Arc::new(MemoryStore::new());
    let persister = Persister::new(store.clone(), PersistOptions::default());
    let now = Utc::now();

    persister.persist(&[entry("people", now)], now);
    let restored = persister.restore(now + Duration::hours(2) + Duration::seconds(1));

    assert!(restored.is_empty());
    assert_eq!(store.get_item(DEFAULT_STORAGE_KEY).unwrap(), None);
  }

  #[test]
  fn test_buster_mismatch_is_discarded() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let now = Utc::now();

    Persister::new(store.clone(), PersistOptions::default()).persist(&[entry("people", now)], now);

    let bumped = Persister::new(
      store,
      PersistOptions {
        buster: "v2".to_string(),
        ..Default::default()
      },
    );
    assert!(bumped.restore(now).is_empty());
  }

  #[test]
  fn test_corrupt_envelope_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    store.set_item(DEFAULT_STORAGE_KEY, "{not json").unwrap();
    let persister = Persister::new(store.clone(), PersistOptions::default());

    assert!(persister.restore(Utc::now()).is_empty());
    assert_eq!(store.get_item(DEFAULT_STORAGE_KEY).unwrap(), None);
  }

  #[test]
  fn test_superseded_snapshot_is_not_written() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let persister = Persister::new(store, PersistOptions::default());
    let now = Utc::now();

    let older = persister.snapshot(&[entry("people", now)], now);
    let newer = persister.snapshot(&[entry("people", now), entry("cameras", now)], now);
    assert_eq!(older.len(), 1);

    // Writes finish out of order
    persister.write(newer);
    persister.write(older);

    assert_eq!(persister.restore(now).len(), 2);
  }

  #[test]
  fn test_discard_beats_pending_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let persister = Persister::new(store.clone(), PersistOptions::default());
    let now = Utc::now();

    let pending = persister.snapshot(&[entry("people", now)], now);
    persister.discard();
    persister.write(pending);

    assert_eq!(store.get_item(DEFAULT_STORAGE_KEY).unwrap(), None);
  }

  #[test]
  fn test_empty_snapshot_removes_blob() {
    let store = Arc::new(MemoryStore::new());
    let persister = Persister::new(store.clone(), PersistOptions::default());
    let now = Utc::now();

    persister.persist(&[entry("people", now)], now);
    assert!(store.get_item(DEFAULT_STORAGE_KEY).unwrap().is_some());

    let empty = persister.snapshot(std::iter::empty(), now);
    assert!(empty.is_empty());
    persister.write(empty);
    assert_eq!(store.get_item(DEFAULT_STORAGE_KEY).unwrap(), None);
  }

  #[test]
  fn test_entries_without_data_are_not_persisted() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let persister = Persister::new(store, PersistOptions::default());
    let now = Utc::now();
    let empty = CacheEntry::new(ResourceKey::new("stats"), now);

    persister.persist(&[empty, entry("people", now)], now);
    let restored = persister.restore(now);

    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].key, ResourceKey::new("people"));
    assert_eq!(restored[0].status, FetchStatus::Success);
  }
}
