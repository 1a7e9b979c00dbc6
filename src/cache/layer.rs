//! Query cache that orchestrates caching logic with network fetching.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::key::ResourceKey;
use super::persist::{Persister, Snapshot};
use super::traits::{CacheEntry, CacheEvent, CacheEventKind, CacheResult, Cacheable, FetchStatus};
use crate::clock::{Clock, SystemClock};
use crate::task::ScheduledTask;
use crate::transport::retry_delay;

/// A fetch in flight, shared by every caller waiting on the same key.
type SharedFetch = Shared<BoxFuture<'static, Result<Value, String>>>;

/// Whether mounting a consumer refetches an otherwise fresh entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefetchOnMount {
  /// Only refetch when the entry is missing, stale or errored
  #[default]
  IfStale,
  /// Always refetch on mount, serving cached data meanwhile
  Always,
}

/// Staleness, garbage collection and retry policy.
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// How long fetched data stays fresh
  pub stale_time: Duration,
  /// Entries untouched for this long are evicted
  pub gc_time: Duration,
  /// Retries after the first failed attempt
  pub retry: u32,
  /// Base delay for the retry backoff
  pub retry_delay: std::time::Duration,
  pub refetch_on_mount: RefetchOnMount,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::minutes(10),
      gc_time: Duration::minutes(30),
      retry: 2,
      retry_delay: std::time::Duration::from_secs(1),
      refetch_on_mount: RefetchOnMount::IfStale,
    }
  }
}

/// Which entries an invalidation applies to.
#[derive(Debug, Clone)]
pub enum Invalidate {
  /// Exactly this key
  Key(ResourceKey),
  /// Every key of this resource, whatever its parameters
  Resource(String),
  /// Every key this one covers, e.g. all pages of one filtered list
  Matching(ResourceKey),
  /// Everything
  All,
}

impl Invalidate {
  fn matches(&self, key: &ResourceKey) -> bool {
    match self {
      Self::Key(k) => k == key,
      Self::Resource(name) => key.resource() == name,
      Self::Matching(k) => k.covers(key),
      Self::All => true,
    }
  }
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<ResourceKey, CacheEntry>,
  in_flight: HashMap<ResourceKey, SharedFetch>,
}

/// In-memory query cache with request coalescing.
///
/// Cloning is cheap and every clone shares the same entries, so the cache is
/// passed explicitly to whoever needs it. All writes to entries happen in
/// fetch completion, invalidation, removal or garbage collection; callers
/// only ever get clones.
pub struct QueryCache {
  state: Arc<Mutex<CacheState>>,
  config: CacheConfig,
  clock: Arc<dyn Clock>,
  persister: Option<Persister>,
  events: broadcast::Sender<CacheEvent>,
}

impl QueryCache {
  /// Create an empty, memory-only cache.
  pub fn new(config: CacheConfig) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      state: Arc::new(Mutex::new(CacheState::default())),
      config,
      clock: Arc::new(SystemClock),
      persister: None,
      events,
    }
  }

  /// Use a different time source.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Rehydrate from `persister` and mirror every later write to it.
  ///
  /// Call this before any fetch: restored entries replace nothing that is
  /// already present.
  pub fn with_persister(mut self, persister: Persister) -> Self {
    let restored = persister.restore(self.clock.now());
    {
      let mut state = self.lock();
      for entry in restored {
        state.entries.entry(entry.key.clone()).or_insert(entry);
      }
    }
    self.persister = Some(persister);
    self
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Listen for entry changes.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn emit(&self, key: &ResourceKey, kind: CacheEventKind) {
    // No receivers is fine
    let _ = self.events.send(CacheEvent {
      key: key.clone(),
      kind,
    });
  }

  /// Capture what to persist. Taken under the lock; written after it is
  /// released so storage I/O never holds up other keys.
  fn snapshot(&self, state: &CacheState) -> Option<Snapshot> {
    self
      .persister
      .as_ref()
      .map(|p| p.snapshot(state.entries.values(), self.clock.now()))
  }

  fn write_snapshot(&self, snapshot: Option<Snapshot>) {
    if let (Some(persister), Some(snapshot)) = (&self.persister, snapshot) {
      persister.write(snapshot);
    }
  }

  /// Current entry for `key`. Never fetches.
  pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
    let now = self.clock.now();
    let mut state = self.lock();
    state.entries.get_mut(key).map(|entry| {
      entry.last_accessed = now;
      entry.clone()
    })
  }

  /// Typed view of the data cached for `key`.
  pub fn get_data<T: Cacheable>(&self, key: &ResourceKey) -> Option<T> {
    self.get(key).and_then(|entry| entry.decode())
  }

  /// Snapshot of every entry, without counting as access.
  pub fn entries(&self) -> Vec<CacheEntry> {
    self.lock().entries.values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether a fetch for `key` is in flight.
  pub fn is_fetching(&self, key: &ResourceKey) -> bool {
    self.lock().in_flight.contains_key(key)
  }

  /// Return fresh data for `key`, fetching only when needed.
  ///
  /// 1. A fetch for this key is in flight: wait for it
  /// 2. Entry is fresh: return it immediately
  /// 3. Entry is missing, stale or errored: start exactly one fetch
  pub async fn ensure_fresh<T, F, Fut>(
    &self,
    key: &ResourceKey,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.ensure(key, fetcher, false).await
  }

  /// `ensure_fresh` for a consumer that just mounted, honoring
  /// `refetch_on_mount`.
  pub async fn mount<T, F, Fut>(&self, key: &ResourceKey, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let force = self.config.refetch_on_mount == RefetchOnMount::Always;
    self.ensure(key, fetcher, force).await
  }

  /// Fetch regardless of freshness. Still attaches to an in-flight fetch.
  pub async fn refetch<T, F, Fut>(&self, key: &ResourceKey, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.ensure(key, fetcher, true).await
  }

  async fn ensure<T, F, Fut>(
    &self,
    key: &ResourceKey,
    fetcher: F,
    force: bool,
  ) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let now = self.clock.now();

    let shared = {
      let mut state = self.lock();
      let CacheState { entries, in_flight } = &mut *state;
      let entry = entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::new(key.clone(), now));
      entry.last_accessed = now;

      if let Some(pending) = in_flight.get(key) {
        debug!(key = %key, "attaching to in-flight fetch");
        pending.clone()
      } else {
        let needs_fetch = force
          || entry.data.is_none()
          || entry.status == FetchStatus::Error
          || entry.is_stale(now);

        if !needs_fetch {
          if let Some(data) = entry.data.clone() {
            let fetched_at = entry.fetched_at;
            let data: T = serde_json::from_value(data)
              .map_err(|e| eyre!("Cached data for {} has unexpected shape: {}", key, e))?;
            return Ok(CacheResult::from_cache(data, fetched_at));
          }
        }

        entry.status = FetchStatus::Fetching;
        self.emit(key, CacheEventKind::Fetching);
        let shared = self.start_fetch(key.clone(), fetcher);
        in_flight.insert(key.clone(), shared.clone());
        shared
      }
    };

    let value = shared.await.map_err(|e| eyre!(e))?;
    let fetched_at = self.lock().entries.get(key).and_then(|e| e.fetched_at);
    let data: T = serde_json::from_value(value)
      .map_err(|e| eyre!("Fetched data for {} has unexpected shape: {}", key, e))?;

    Ok(CacheResult::from_network(data, fetched_at))
  }

  /// Spawn the fetch so it completes (and writes) even if every waiter goes
  /// away, and hand back a shareable handle to its outcome.
  fn start_fetch<T, F, Fut>(&self, key: ResourceKey, fetcher: F) -> SharedFetch
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    debug!(key = %key, "starting fetch");
    let cache = self.clone();
    let retries = self.config.retry;
    let base_delay = self.config.retry_delay;

    let handle = tokio::spawn(async move {
      let mut attempt = 0;
      let outcome = loop {
        match fetcher().await {
          Ok(data) => {
            break serde_json::to_value(&data)
              .map_err(|e| format!("Failed to encode {}: {}", key, e));
          }
          Err(e) if attempt < retries => {
            let delay = retry_delay(attempt, base_delay);
            warn!(key = %key, attempt, error = %e, "fetch failed, retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
          }
          Err(e) => break Err(e.to_string()),
        }
      };

      if let Some(snapshot) = cache.complete_fetch(&key, &outcome) {
        if let Some(persister) = cache.persister.clone() {
          // Storage writes stay off the async workers
          let write = tokio::task::spawn_blocking(move || persister.write(snapshot));
          if let Err(e) = write.await {
            warn!(key = %key, error = %e, "cache persistence task failed");
          }
        }
      }
      outcome
    });

    async move {
      handle
        .await
        .unwrap_or_else(|e| Err(format!("Fetch task failed: {}", e)))
    }
    .boxed()
    .shared()
  }

  /// Write a settled fetch into its entry. Runs synchronously under the lock,
  /// so two completions for one key can never interleave. Returns the
  /// snapshot to persist.
  fn complete_fetch(
    &self,
    key: &ResourceKey,
    outcome: &std::result::Result<Value, String>,
  ) -> Option<Snapshot> {
    let now = self.clock.now();
    let (kind, snapshot) = {
      let mut state = self.lock();
      state.in_flight.remove(key);
      let entry = state
        .entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::new(key.clone(), now));
      entry.last_accessed = now;

      let kind = match outcome {
        Ok(value) => {
          entry.data = Some(value.clone());
          entry.fetched_at = Some(now);
          entry.stale_after = Some(now + self.config.stale_time);
          entry.status = FetchStatus::Success;
          entry.error = None;
          debug!(key = %key, "fetch succeeded");
          CacheEventKind::Updated
        }
        Err(message) => {
          entry.status = FetchStatus::Error;
          entry.error = Some(message.clone());
          warn!(key = %key, error = %message, "fetch failed");
          CacheEventKind::Failed
        }
      };
      (kind, self.snapshot(&state))
    };
    self.emit(key, kind);
    snapshot
  }

  /// Mark matching entries stale. Data stays readable until the refetch lands.
  pub fn invalidate(&self, target: Invalidate) -> usize {
    let (keys, snapshot) = {
      let mut state = self.lock();
      let keys: Vec<ResourceKey> = state
        .entries
        .values_mut()
        .filter(|entry| target.matches(&entry.key))
        .map(|entry| {
          entry.stale_after = None;
          entry.key.clone()
        })
        .collect();
      let snapshot = if keys.is_empty() {
        None
      } else {
        self.snapshot(&state)
      };
      (keys, snapshot)
    };
    self.write_snapshot(snapshot);

    debug!(count = keys.len(), ?target, "invalidated entries");
    for key in &keys {
      self.emit(key, CacheEventKind::Invalidated);
    }
    keys.len()
  }

  /// Drop an entry outright. An in-flight fetch will recreate it on completion.
  pub fn remove(&self, key: &ResourceKey) -> bool {
    let (removed, snapshot) = {
      let mut state = self.lock();
      let removed = state.entries.remove(key).is_some();
      let snapshot = if removed { self.snapshot(&state) } else { None };
      (removed, snapshot)
    };
    self.write_snapshot(snapshot);
    if removed {
      self.emit(key, CacheEventKind::Evicted);
    }
    removed
  }

  /// Drop every entry that has no fetch in flight, and the persisted copy.
  pub fn clear(&self) {
    let (keys, snapshot) = {
      let mut state = self.lock();
      let CacheState { entries, in_flight } = &mut *state;
      let keys: Vec<ResourceKey> = entries
        .keys()
        .filter(|k| !in_flight.contains_key(*k))
        .cloned()
        .collect();
      for key in &keys {
        entries.remove(key);
      }
      (keys, self.snapshot(&state))
    };
    // Only in-flight entries survive; with none left the blob is removed
    self.write_snapshot(snapshot);
    for key in &keys {
      self.emit(key, CacheEventKind::Evicted);
    }
  }

  /// Evict entries idle for longer than `gc_time`. Entries with a fetch in
  /// flight are left alone until it settles.
  pub fn collect_garbage(&self) -> usize {
    let now = self.clock.now();
    let gc_time = self.config.gc_time;

    let (evicted, snapshot) = {
      let mut state = self.lock();
      let CacheState { entries, in_flight } = &mut *state;
      let evicted: Vec<ResourceKey> = entries
        .values()
        .filter(|e| now - e.last_accessed > gc_time && !in_flight.contains_key(&e.key))
        .map(|e| e.key.clone())
        .collect();
      for key in &evicted {
        entries.remove(key);
      }
      let snapshot = if evicted.is_empty() {
        None
      } else {
        self.snapshot(&state)
      };
      (evicted, snapshot)
    };
    self.write_snapshot(snapshot);

    if !evicted.is_empty() {
      debug!(count = evicted.len(), "garbage collected idle entries");
    }
    for key in &evicted {
      self.emit(key, CacheEventKind::Evicted);
    }
    evicted.len()
  }

  /// Run `collect_garbage` every `period` until the returned task is stopped.
  pub fn spawn_gc(&self, period: std::time::Duration) -> ScheduledTask {
    let cache = self.clone();
    ScheduledTask::every("cache-gc", period, move || {
      let cache = cache.clone();
      async move {
        cache.collect_garbage();
      }
    })
  }
}

impl Clone for QueryCache {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
      config: self.config.clone(),
      clock: Arc::clone(&self.clock),
      persister: self.persister.clone(),
      events: self.events.clone(),
    }
  }
}

impl std::fmt::Debug for QueryCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryCache")
      .field("entries", &self.len())
      .field("config", &self.config)
      .field("persistent", &self.persister.is_some())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::persist::PersistOptions;
  use crate::cache::storage::{DurableStore, MemoryStore};
  use crate::cache::traits::CacheSource;
  use crate::clock::ManualClock;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn test_config() -> CacheConfig {
    CacheConfig {
      retry_delay: std::time::Duration::ZERO,
      ..Default::default()
    }
  }

  fn test_cache() -> (QueryCache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let cache = QueryCache::new(test_config()).with_clock(clock.clone());
    (cache, clock)
  }

  /// Fetcher returning `value` after `delay_ms`, counting its calls.
  fn counting_fetcher(
    counter: Arc<AtomicU32>,
    value: Vec<String>,
    delay_ms: u64,
  ) -> impl Fn() -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync + 'static {
    move || {
      let counter = counter.clone();
      let value = value.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        Ok(value)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_concurrent_ensure_fresh_fetches_once() {
    let (cache, _clock) = test_cache();
    let counter = Arc::new(AtomicU32::new(0));
    let key = ResourceKey::new("people");
    let people = vec!["a".to_string(), "b".to_string()];

    let first = cache.ensure_fresh(&key, counting_fetcher(counter.clone(), people.clone(), 20));
    let second = cache.ensure_fresh(&key, counting_fetcher(counter.clone(), people.clone(), 20));
    let (first, second) = tokio::join!(first, second);

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(first.unwrap().data, people);
    assert_eq!(second.unwrap().data, people);
  }

  #[tokio::test]
  async fn test_fresh_entry_served_from_cache() {
    let (cache, clock) = test_cache();
    let counter = Arc::new(AtomicU32::new(0));
    let key = ResourceKey::new("cameras");
    let fetcher = || counting_fetcher(counter.clone(), vec!["cam".to_string()], 0);

    let first = cache.ensure_fresh(&key, fetcher()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    clock.advance(Duration::minutes(9));
    let second = cache.ensure_fresh(&key, fetcher()).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data, vec!["cam".to_string()]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_entry_refetches_once() {
    let (cache, clock) = test_cache();
    let counter = Arc::new(AtomicU32::new(0));
    let key = ResourceKey::new("stats");
    let fetcher = || counting_fetcher(counter.clone(), vec!["s".to_string()], 10);

    cache.ensure_fresh(&key, fetcher()).await.unwrap();
    clock.advance(Duration::minutes(11));

    let a = cache.ensure_fresh(&key, fetcher());
    let b = cache.ensure_fresh(&key, fetcher());
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Success);
    assert!(!entry.is_stale(clock.now()));
  }

  #[tokio::test]
  async fn test_error_retries_then_surfaces() {
    let (cache, _clock) = test_cache();
    let counter = Arc::new(AtomicU32::new(0));
    let key = ResourceKey::new("people");
    let counter_clone = counter.clone();

    let result = cache
      .ensure_fresh(&key, move || {
        let counter = counter_clone.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
          Err::<Vec<String>, _>(eyre!("connection refused"))
        }
      })
      .await;

    assert!(result.is_err());
    // first attempt plus two retries
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Error);
    assert_eq!(entry.error.as_deref(), Some("connection refused"));
    assert!(!cache.is_fetching(&key));
  }

  #[tokio::test]
  async fn test_error_does_not_poison_later_fetches() {
    let (cache, _clock) = test_cache();
    let key = ResourceKey::new("people");

    let failed = cache
      .ensure_fresh(&key, || async { Err::<Vec<String>, _>(eyre!("boom")) })
      .await;
    assert!(failed.is_err());

    let ok = cache
      .ensure_fresh(&key, || async { Ok(vec!["p".to_string()]) })
      .await
      .unwrap();
    assert_eq!(ok.data, vec!["p".to_string()]);
    assert_eq!(cache.get(&key).unwrap().status, FetchStatus::Success);
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_stale_data() {
    let (cache, clock) = test_cache();
    let key = ResourceKey::new("cameras");

    cache
      .ensure_fresh(&key, || async { Ok(vec![1u32, 2]) })
      .await
      .unwrap();
    clock.advance(Duration::minutes(15));

    let failed = cache
      .ensure_fresh(&key, || async { Err::<Vec<u32>, _>(eyre!("timeout")) })
      .await;
    assert!(failed.is_err());

    assert_eq!(cache.get_data::<Vec<u32>>(&key), Some(vec![1, 2]));
    assert_eq!(cache.get(&key).unwrap().status, FetchStatus::Error);
  }

  #[tokio::test]
  async fn test_invalidate_keeps_data_and_forces_refetch() {
    let (cache, _clock) = test_cache();
    let counter = Arc::new(AtomicU32::new(0));
    let alerts = ResourceKey::new("alerts").with_param("level", "alert");
    let people = ResourceKey::new("people");
    let fetcher = || counting_fetcher(counter.clone(), vec!["x".to_string()], 0);

    cache.ensure_fresh(&alerts, fetcher()).await.unwrap();
    cache.ensure_fresh(&people, fetcher()).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    assert_eq!(cache.invalidate(Invalidate::Resource("alerts".into())), 1);
    assert!(cache.get(&alerts).unwrap().data.is_some());

    cache.ensure_fresh(&alerts, fetcher()).await.unwrap();
    cache.ensure_fresh(&people, fetcher()).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    assert_eq!(cache.invalidate(Invalidate::All), 2);
    cache.ensure_fresh(&people, fetcher()).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
  }

  #[tokio::test]
  async fn test_invalidate_matching_spares_other_filters() {
    let (cache, _clock) = test_cache();
    let counter = Arc::new(AtomicU32::new(0));
    let list = ResourceKey::new("alerts").with_param("level", "alert");
    let page1 = list.clone().with_param("page", 1);
    let page2 = list.clone().with_param("page", 2);
    let warnings = ResourceKey::new("alerts").with_param("level", "warning");
    for key in [&page1, &page2, &warnings] {
      let fetcher = counting_fetcher(counter.clone(), vec!["x".to_string()], 0);
      cache.ensure_fresh(key, fetcher).await.unwrap();
    }

    assert_eq!(cache.invalidate(Invalidate::Matching(list)), 2);
    let now = cache.now();
    assert!(cache.get(&page1).unwrap().is_stale(now));
    assert!(cache.get(&page2).unwrap().is_stale(now));
    assert!(!cache.get(&warnings).unwrap().is_stale(now));
  }

  #[tokio::test]
  async fn test_mount_honors_refetch_on_mount() {
    let clock = Arc::new(ManualClock::default());
    let cache = QueryCache::new(CacheConfig {
      refetch_on_mount: RefetchOnMount::Always,
      ..test_config()
    })
    .with_clock(clock);
    let counter = Arc::new(AtomicU32::new(0));
    let key = ResourceKey::new("stats");
    let fetcher = || counting_fetcher(counter.clone(), vec!["s".to_string()], 0);

    cache.mount(&key, fetcher()).await.unwrap();
    cache.mount(&key, fetcher()).await.unwrap();
    cache.ensure_fresh(&key, fetcher()).await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_gc_evicts_idle_entries_only() {
    let (cache, clock) = test_cache();
    let idle = ResourceKey::new("cameras");
    let busy = ResourceKey::new("people");

    cache
      .ensure_fresh(&idle, || async { Ok(1u32) })
      .await
      .unwrap();
    cache
      .ensure_fresh(&busy, || async { Ok(2u32) })
      .await
      .unwrap();

    clock.advance(Duration::minutes(20));
    cache.get(&busy);
    clock.advance(Duration::minutes(11));

    assert_eq!(cache.collect_garbage(), 1);
    assert!(cache.get(&idle).is_none());
    assert!(cache.get(&busy).is_some());
  }

  #[tokio::test]
  async fn test_gc_defers_in_flight_entries() {
    let (cache, clock) = test_cache();
    let key = ResourceKey::new("people");
    let counter = Arc::new(AtomicU32::new(0));

    let pending = {
      let cache = cache.clone();
      let key = key.clone();
      let fetcher = counting_fetcher(counter.clone(), vec!["p".to_string()], 50);
      tokio::spawn(async move { cache.ensure_fresh(&key, fetcher).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    clock.advance(Duration::minutes(31));
    assert!(cache.is_fetching(&key));
    assert_eq!(cache.collect_garbage(), 0);

    pending.await.unwrap().unwrap();
    assert!(cache.get(&key).is_some());
  }

  #[tokio::test]
  async fn test_abandoned_fetch_still_completes() {
    let (cache, _clock) = test_cache();
    let key = ResourceKey::new("alerts").with_param("level", "alert");
    let counter = Arc::new(AtomicU32::new(0));

    let waiter = {
      let cache = cache.clone();
      let key = key.clone();
      let fetcher = counting_fetcher(counter.clone(), vec!["a".to_string()], 30);
      tokio::spawn(async move { cache.ensure_fresh(&key, fetcher).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    waiter.abort();

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Success);
    assert_eq!(entry.decode::<Vec<String>>(), Some(vec!["a".to_string()]));
  }

  #[tokio::test]
  async fn test_events_are_broadcast() {
    let (cache, _clock) = test_cache();
    let mut events = cache.subscribe();
    let key = ResourceKey::new("stats");

    cache
      .ensure_fresh(&key, || async { Ok(7u32) })
      .await
      .unwrap();
    cache.invalidate(Invalidate::Key(key.clone()));

    assert_eq!(events.recv().await.unwrap().kind, CacheEventKind::Fetching);
    assert_eq!(events.recv().await.unwrap().kind, CacheEventKind::Updated);
    assert_eq!(
      events.recv().await.unwrap(),
      CacheEvent {
        key,
        kind: CacheEventKind::Invalidated
      }
    );
  }

  #[tokio::test]
  async fn test_persisted_round_trip_across_reload() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let persister = || Persister::new(store.clone(), PersistOptions::default());

    let cache = QueryCache::new(test_config())
      .with_clock(clock.clone())
      .with_persister(persister());
    for (i, resource) in ["stats", "people", "cameras"].iter().enumerate() {
      cache
        .ensure_fresh(&ResourceKey::new(*resource), move || async move { Ok(i as u32) })
        .await
        .unwrap();
    }
    drop(cache);

    clock.advance(Duration::minutes(30));
    let reloaded = QueryCache::new(test_config())
      .with_clock(clock.clone())
      .with_persister(persister());
    assert_eq!(reloaded.len(), 3);
    assert_eq!(reloaded.get_data::<u32>(&ResourceKey::new("people")), Some(1));

    // Restored entries keep their original timestamps, so these are stale now
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();
    reloaded
      .ensure_fresh(&ResourceKey::new("cameras"), move || {
        let counter = counter_clone.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(9u32)
        }
      })
      .await
      .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    clock.advance(Duration::hours(3));
    let expired = QueryCache::new(test_config())
      .with_clock(clock)
      .with_persister(persister());
    assert!(expired.is_empty());
  }

  /// Store whose writes take a while, flagging when one is under way.
  #[derive(Default)]
  struct SlowStore {
    inner: MemoryStore,
    writing: std::sync::atomic::AtomicBool,
  }

  impl DurableStore for SlowStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
      self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
      self.writing.store(true, Ordering::SeqCst);
      std::thread::sleep(std::time::Duration::from_millis(200));
      let result = self.inner.set_item(key, value);
      self.writing.store(false, Ordering::SeqCst);
      result
    }

    fn remove_item(&self, key: &str) -> Result<()> {
      self.inner.remove_item(key)
    }
  }

  #[tokio::test]
  async fn test_persist_write_does_not_hold_cache_lock() {
    let store = Arc::new(SlowStore::default());
    let cache = QueryCache::new(test_config())
      .with_persister(Persister::new(store.clone(), PersistOptions::default()));
    let other = ResourceKey::new("cameras");
    cache
      .refetch(&other, || async { Ok(1u32) })
      .await
      .unwrap();

    let pending = {
      let cache = cache.clone();
      tokio::spawn(async move {
        cache
          .ensure_fresh(&ResourceKey::new("stats"), || async { Ok(2u32) })
          .await
      })
    };

    let mut waited = 0;
    while !store.writing.load(Ordering::SeqCst) {
      assert!(waited < 1000, "write never started");
      tokio::time::sleep(std::time::Duration::from_millis(1)).await;
      waited += 1;
    }

    // Reads of any key go through while the write is still running
    assert_eq!(cache.get_data::<u32>(&other), Some(1));
    assert_eq!(cache.entries().len(), 2);
    assert!(store.writing.load(Ordering::SeqCst));

    assert_eq!(pending.await.unwrap().unwrap().data, 2);
    assert!(!store.writing.load(Ordering::SeqCst));
    assert!(store.get_item(crate::cache::persist::DEFAULT_STORAGE_KEY).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_clear_removes_entries_and_persisted_copy() {
    let store = Arc::new(MemoryStore::new());
    let cache = QueryCache::new(test_config())
      .with_persister(Persister::new(store.clone(), PersistOptions::default()));

    cache
      .ensure_fresh(&ResourceKey::new("stats"), || async { Ok(1u32) })
      .await
      .unwrap();
    assert!(store
      .get_item(crate::cache::persist::DEFAULT_STORAGE_KEY)
      .unwrap()
      .is_some());

    cache.clear();
    assert!(cache.is_empty());
    assert!(store
      .get_item(crate::cache::persist::DEFAULT_STORAGE_KEY)
      .unwrap()
      .is_none());
  }
}
