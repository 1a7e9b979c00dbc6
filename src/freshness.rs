//! Background check for "new data available".
//!
//! The monitor never fetches. It looks at how old the cached copies of the
//! dashboard's headline resources are and raises a sticky signal once any of
//! them is older than the threshold. The signal stays up until acknowledged.

use chrono::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::keys;
use crate::cache::{Invalidate, QueryCache, ResourceKey};
use crate::paginator::list_key;
use crate::task::ScheduledTask;

#[derive(Debug, Clone)]
pub struct FreshnessConfig {
  /// How often to look
  pub check_interval: std::time::Duration,
  /// Age past which cached data counts as outdated
  pub threshold: Duration,
  /// Keys to watch. An entry matches when its key, minus any page
  /// parameters, equals one of these exactly.
  pub critical: Vec<ResourceKey>,
}

impl Default for FreshnessConfig {
  fn default() -> Self {
    Self {
      check_interval: std::time::Duration::from_secs(5 * 60),
      threshold: Duration::minutes(10),
      critical: keys::critical(),
    }
  }
}

struct Shared {
  cache: QueryCache,
  config: FreshnessConfig,
  signal: watch::Sender<bool>,
  refreshing: AtomicBool,
}

impl Shared {
  fn is_critical(&self, key: &ResourceKey) -> bool {
    let key = list_key(key);
    self.config.critical.contains(&key)
  }

  fn check(&self) -> bool {
    let now = self.cache.now();
    let outdated = self.cache.entries().into_iter().find(|entry| {
      self.is_critical(&entry.key)
        && entry
          .age(now)
          .map(|age| age > self.config.threshold)
          .unwrap_or(false)
    });

    match outdated {
      Some(entry) => {
        if !*self.signal.borrow() {
          info!(key = %entry.key, "new data may be available");
        }
        self.signal.send_replace(true);
        true
      }
      None => false,
    }
  }
}

/// Periodically judges whether critical cache entries are outdated.
pub struct FreshnessMonitor {
  shared: Arc<Shared>,
  task: Option<ScheduledTask>,
}

impl FreshnessMonitor {
  /// Create a monitor without starting the periodic check.
  pub fn new(cache: QueryCache, config: FreshnessConfig) -> Self {
    let (signal, _) = watch::channel(false);
    Self {
      shared: Arc::new(Shared {
        cache,
        config,
        signal,
        refreshing: AtomicBool::new(false),
      }),
      task: None,
    }
  }

  /// Create a monitor and start checking every `check_interval`.
  pub fn spawn(cache: QueryCache, config: FreshnessConfig) -> Self {
    let mut monitor = Self::new(cache, config);
    monitor.start();
    monitor
  }

  /// Start the periodic check. No-op when already running.
  pub fn start(&mut self) {
    if self.task.as_ref().map(|t| t.is_running()).unwrap_or(false) {
      return;
    }

    let shared = Arc::clone(&self.shared);
    let period = shared.config.check_interval;
    debug!(?period, "starting freshness monitor");
    self.task = Some(ScheduledTask::every("freshness", period, move || {
      let shared = Arc::clone(&shared);
      async move {
        shared.check();
      }
    }));
  }

  /// Stop the periodic check and wait for it to exit.
  pub async fn stop(&mut self) {
    if let Some(task) = self.task.take() {
      task.stop().await;
    }
  }

  pub fn is_running(&self) -> bool {
    self.task.as_ref().map(|t| t.is_running()).unwrap_or(false)
  }

  /// Run one check now. Returns whether an outdated critical entry was found.
  pub fn check_now(&self) -> bool {
    self.shared.check()
  }

  pub fn has_new_data(&self) -> bool {
    *self.shared.signal.borrow()
  }

  /// Watch the signal.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.shared.signal.subscribe()
  }

  /// Clear the signal.
  pub fn acknowledge(&self) {
    self.shared.signal.send_replace(false);
  }

  /// Invalidate the whole cache so every consumer refetches. Returns once the
  /// invalidation is issued, not when the refetches land.
  pub async fn refresh(&self) -> usize {
    self.shared.refreshing.store(true, Ordering::SeqCst);
    let count = self.shared.cache.invalidate(Invalidate::All);
    info!(count, "manual refresh");
    tokio::task::yield_now().await;
    self.shared.refreshing.store(false, Ordering::SeqCst);
    count
  }

  pub fn is_refreshing(&self) -> bool {
    self.shared.refreshing.load(Ordering::SeqCst)
  }
}

impl std::fmt::Debug for FreshnessMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FreshnessMonitor")
      .field("config", &self.shared.config)
      .field("running", &self.is_running())
      .field("has_new_data", &self.has_new_data())
      .finish()
  }
}
