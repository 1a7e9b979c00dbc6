//! Periodic background work with a single owner.
//!
//! A `ScheduledTask` runs a closure on a fixed period until `stop()` is called
//! or the handle is dropped. There is no way to detach it.

use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest period a task runs on; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a spawned periodic task.
#[derive(Debug)]
pub struct ScheduledTask {
  name: &'static str,
  shutdown_tx: Option<oneshot::Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
  /// Spawn `tick` to run every `period`. The first run happens immediately.
  /// A zero period is raised to one millisecond.
  pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let period = if period.is_zero() {
      warn!(task = name, "zero period, using {:?}", MIN_PERIOD);
      MIN_PERIOD
    } else {
      period
    };
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = interval.tick() => tick().await,
          _ = &mut shutdown_rx => break,
        }
      }
      debug!(task = name, "scheduled task stopped");
    });

    Self {
      name,
      shutdown_tx: Some(shutdown_tx),
      handle: Some(handle),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Whether the task loop is still alive.
  pub fn is_running(&self) -> bool {
    self
      .handle
      .as_ref()
      .map(|h| !h.is_finished())
      .unwrap_or(false)
  }

  /// Signal the task to stop and wait for the loop to exit.
  pub async fn stop(mut self) {
    if let Some(tx) = self.shutdown_tx.take() {
      let _ = tx.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }
}

impl Drop for ScheduledTask {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  #[tokio::test]
  async fn test_task_ticks_until_stopped() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = ScheduledTask::every("counter", Duration::from_millis(10), move || {
      let counter = counter_clone.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    tokio::time::sleep(Duration::from_millis(55)).await;
    assert!(task.is_running());
    task.stop().await;

    let seen = counter.load(Ordering::SeqCst);
    assert!(seen >= 2, "expected several ticks, got {}", seen);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(counter.load(Ordering::SeqCst), seen);
  }

  #[tokio::test]
  async fn test_zero_period_is_clamped() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = ScheduledTask::every("zero", Duration::ZERO, move || {
      let counter = counter_clone.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(task.is_running());
    task.stop().await;
    assert!(counter.load(Ordering::SeqCst) >= 1);
  }

  #[tokio::test]
  async fn test_drop_aborts_task() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = ScheduledTask::every("dropped", Duration::from_millis(10), move || {
      let counter = counter_clone.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });
    tokio::time::sleep(Duration::from_millis(15)).await;
    drop(task);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let seen = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(counter.load(Ordering::SeqCst), seen);
  }
}
