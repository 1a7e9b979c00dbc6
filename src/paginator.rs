//! Incremental page loading for list resources.
//!
//! A `Paginator<T>` walks one list key page by page, in the spirit of an
//! infinite query: load the first page, then "fetch more" until a short page
//! says the list is exhausted. Every page goes through the `QueryCache`
//! under the list key plus `page`/`page_size`, so pages are coalesced,
//! retried, persisted and invalidated like any other entry.
//!
//! # Example
//!
//! ```ignore
//! let alerts = client.alerts(&AlertFilters::level("alert"));
//! alerts.ensure_fresh().await?;
//! while alerts.has_more() {
//!     alerts.fetch_more().await?;
//! }
//! let all = alerts.items();
//! ```

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::cache::{Cacheable, QueryCache, ResourceKey};

/// Query parameter carrying the 1-based page index.
pub const PAGE_PARAM: &str = "page";
/// Query parameter carrying the page size.
pub const PAGE_SIZE_PARAM: &str = "page_size";

/// The list key a page key was built from.
pub fn list_key(page_key: &ResourceKey) -> ResourceKey {
  page_key
    .clone()
    .with_param(PAGE_PARAM, "")
    .with_param(PAGE_SIZE_PARAM, "")
}

/// Where a paginated list stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
  /// Nothing requested yet
  Empty,
  /// First page in flight
  LoadingFirst,
  /// Pages loaded, more available
  Idle,
  /// A follow-up page in flight
  LoadingMore,
  /// The last page has been loaded
  Exhausted,
  /// Last fetch failed; re-invoking the same operation retries it
  Errored,
}

impl PageState {
  pub fn is_loading(&self) -> bool {
    matches!(self, PageState::LoadingFirst | PageState::LoadingMore)
  }
}

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
  /// 1-based page index
  pub index: u32,
  pub items: Vec<T>,
  /// Index of the following page, `None` once exhausted
  pub next: Option<u32>,
}

type PageFetcher<T> = Arc<dyn Fn(ResourceKey) -> BoxFuture<'static, Result<Vec<T>>> + Send + Sync>;

struct PaginatorInner<T> {
  key: ResourceKey,
  /// Bumped whenever the key changes; completions from older generations are dropped
  generation: u64,
  state: PageState,
  pages: Vec<Page<T>>,
  /// Completed pages waiting for their predecessor
  pending: BTreeMap<u32, Page<T>>,
  error: Option<String>,
}

impl<T> PaginatorInner<T> {
  fn reset(&mut self) {
    self.generation += 1;
    self.state = PageState::Empty;
    self.pages.clear();
    self.pending.clear();
    self.error = None;
  }

  fn next_page(&self) -> Option<u32> {
    self.pages.last().and_then(|p| p.next)
  }
}

/// Incrementally loaded list for one resource key.
pub struct Paginator<T> {
  cache: QueryCache,
  fetcher: PageFetcher<T>,
  page_size: u32,
  inner: Arc<Mutex<PaginatorInner<T>>>,
}

impl<T: Cacheable> Paginator<T> {
  /// Create a paginator for `key`.
  ///
  /// `fetcher` receives the page key (the list key plus `page` and
  /// `page_size`) and returns that page's items.
  pub fn new<F, Fut>(cache: QueryCache, key: ResourceKey, page_size: u32, fetcher: F) -> Self
  where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    Self {
      cache,
      fetcher: Arc::new(move |key| fetcher(key).boxed()),
      page_size: page_size.max(1),
      inner: Arc::new(Mutex::new(PaginatorInner {
        key,
        generation: 0,
        state: PageState::Empty,
        pages: Vec::new(),
        pending: BTreeMap::new(),
        error: None,
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, PaginatorInner<T>> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn key(&self) -> ResourceKey {
    self.lock().key.clone()
  }

  pub fn page_size(&self) -> u32 {
    self.page_size
  }

  pub fn state(&self) -> PageState {
    self.lock().state
  }

  /// True when the last loaded page carries a continuation.
  pub fn has_more(&self) -> bool {
    self.lock().next_page().is_some()
  }

  pub fn is_fetching_more(&self) -> bool {
    self.lock().state == PageState::LoadingMore
  }

  pub fn error(&self) -> Option<String> {
    self.lock().error.clone()
  }

  /// Loaded pages, in order.
  pub fn pages(&self) -> Vec<Page<T>> {
    self.lock().pages.clone()
  }

  /// All loaded items, concatenated in page order.
  pub fn items(&self) -> Vec<T> {
    self
      .lock()
      .pages
      .iter()
      .flat_map(|p| p.items.iter().cloned())
      .collect()
  }

  /// Key under which page `index` is cached.
  pub fn page_key(&self, index: u32) -> ResourceKey {
    self
      .key()
      .with_param(PAGE_PARAM, index)
      .with_param(PAGE_SIZE_PARAM, self.page_size)
  }

  /// Load the first page if nothing is loaded yet, or start over when the
  /// cached first page went stale or was invalidated.
  ///
  /// A no-op while a load is running or while the loaded pages are fresh.
  /// After a failed first page this retries it.
  pub async fn ensure_fresh(&self) -> Result<()> {
    let first_page_stale = self.first_page_stale();
    let (key, generation) = {
      let mut inner = self.lock();
      match inner.state {
        PageState::Empty => {}
        PageState::Errored if inner.pages.is_empty() => {}
        PageState::Idle | PageState::Exhausted if first_page_stale => {
          debug!(key = %inner.key, "first page stale, reloading list");
          inner.reset();
        }
        _ => return Ok(()),
      }
      inner.state = PageState::LoadingFirst;
      inner.error = None;
      (inner.key.clone(), inner.generation)
    };

    self.load_page(key, generation, 1).await
  }

  /// Whether the cache no longer holds a fresh copy of page 1.
  fn first_page_stale(&self) -> bool {
    let now = self.cache.now();
    self
      .cache
      .get(&self.page_key(1))
      .map(|entry| entry.is_stale(now))
      .unwrap_or(true)
  }

  /// Load the next page.
  ///
  /// Returns `Ok(false)` without fetching when a load is already running,
  /// the list is exhausted, or nothing has been loaded yet.
  pub async fn fetch_more(&self) -> Result<bool> {
    let (key, generation, next) = {
      let mut inner = self.lock();
      let next = match inner.state {
        PageState::Idle => inner.next_page(),
        PageState::Errored if !inner.pages.is_empty() => inner.next_page(),
        _ => None,
      };
      let Some(next) = next else {
        debug!(key = %inner.key, state = ?inner.state, "fetch more ignored");
        return Ok(false);
      };
      inner.state = PageState::LoadingMore;
      inner.error = None;
      (inner.key.clone(), inner.generation, next)
    };

    self.load_page(key, generation, next).await?;
    Ok(true)
  }

  /// Switch to a different key, abandoning loaded pages.
  ///
  /// Returns false if `key` is the current key. Completions still in flight
  /// for the old key are dropped when they land.
  pub fn set_key(&self, key: ResourceKey) -> bool {
    let mut inner = self.lock();
    if inner.key == key {
      return false;
    }
    debug!(from = %inner.key, to = %key, "paginator key changed");
    inner.key = key;
    inner.reset();
    true
  }

  /// Keep the resource, replace its parameters. Same semantics as `set_key`.
  pub fn set_params<I, K, V>(&self, params: I) -> bool
  where
    I: IntoIterator<Item = (K, Option<V>)>,
    K: Into<String>,
    V: ToString,
  {
    let resource = self.lock().key.resource().to_string();
    self.set_key(ResourceKey::from_pairs(resource, params))
  }

  /// Forget loaded pages so the next `ensure_fresh` starts over from page 1.
  pub fn reset(&self) {
    self.lock().reset();
  }

  async fn load_page(&self, key: ResourceKey, generation: u64, index: u32) -> Result<()> {
    let page_key = key
      .with_param(PAGE_PARAM, index)
      .with_param(PAGE_SIZE_PARAM, self.page_size);
    let fetcher = Arc::clone(&self.fetcher);
    let fetch_key = page_key.clone();

    let result = self
      .cache
      .ensure_fresh(&page_key, move || fetcher(fetch_key.clone()))
      .await;

    match result {
      Ok(result) => {
        self.complete_page(generation, index, result.data);
        Ok(())
      }
      Err(e) => {
        self.fail_page(generation, e.to_string());
        Err(e)
      }
    }
  }

  /// Apply a completed page. Page N is appended only after page N-1; an
  /// early arrival waits in `pending`.
  fn complete_page(&self, generation: u64, index: u32, items: Vec<T>) {
    let mut inner = self.lock();
    if inner.generation != generation {
      debug!(index, "dropping page for abandoned key");
      return;
    }

    let next = if items.len() < self.page_size as usize {
      None
    } else {
      Some(index + 1)
    };

    let expected = inner.pages.len() as u32 + 1;
    if index < expected {
      return;
    }
    inner.pending.insert(index, Page { index, items, next });

    loop {
      let expected = inner.pages.len() as u32 + 1;
      match inner.pending.remove(&expected) {
        Some(page) => inner.pages.push(page),
        None => break,
      }
    }

    if (inner.pages.len() as u32) < index {
      // still waiting for a predecessor
      return;
    }

    inner.state = if inner.next_page().is_some() {
      PageState::Idle
    } else {
      PageState::Exhausted
    };
  }

  fn fail_page(&self, generation: u64, message: String) {
    let mut inner = self.lock();
    if inner.generation != generation {
      return;
    }
    inner.state = PageState::Errored;
    inner.error = Some(message);
  }
}

impl<T> Clone for Paginator<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      fetcher: Arc::clone(&self.fetcher),
      page_size: self.page_size,
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> std::fmt::Debug for Paginator<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    f.debug_struct("Paginator")
      .field("key", &inner.key)
      .field("state", &inner.state)
      .field("pages", &inner.pages.len())
      .field("page_size", &self.page_size)
      .finish_non_exhaustive()
  }
}
