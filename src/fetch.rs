//! Page reads: stale-while-revalidate over the cache, with prefetch.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::types::ListRequest;
use crate::api::{with_timeout, UsersApi};
use crate::cache::{CacheSource, CacheStore, Claim, DatasetSnapshot};
use crate::error::{ListError, Result};
use crate::event::{EventSender, ListEvent};
use crate::filters::{CacheKey, FilterSet, Signature};
use crate::prefetch::PrefetchScheduler;
use crate::tasks::BackgroundTasks;
use crate::view::ViewHandle;

/// How many times a foreground miss waits on somebody else's fetch of the
/// same key before issuing its own.
const MAX_IN_FLIGHT_WAITS: usize = 2;

/// Fetches one page from the API and records it in the cache.
///
/// Callers are expected to hold the key's in-flight claim.
#[derive(Clone)]
pub struct PageLoader {
  api: Arc<dyn UsersApi>,
  store: CacheStore,
  timeout: Duration,
}

impl PageLoader {
  pub fn new(api: Arc<dyn UsersApi>, store: CacheStore, timeout: Duration) -> Self {
    Self { api, store, timeout }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub async fn load(&self, key: &CacheKey, filters: &FilterSet) -> Result<Arc<DatasetSnapshot>> {
    let request = ListRequest {
      page: key.page,
      page_size: key.page_size,
      filters: filters.clone(),
    };
    let ticket = self.store.begin_request()?;

    debug!(key = %key, "Fetching page");
    let page = with_timeout(self.timeout, self.api.list(&request)).await?;
    let snapshot = Arc::new(DatasetSnapshot::from_page(&request, page));

    // Out-of-range pages are redirected, never cached
    if snapshot.total_pages > 0 && key.page > snapshot.total_pages {
      debug!(key = %key, total_pages = snapshot.total_pages, "Page beyond last page");
      return Ok(snapshot);
    }

    self.store.complete(key, ticket, snapshot.clone())?;
    Ok(snapshot)
  }
}

/// Result of a page read
#[derive(Debug, Clone)]
pub struct PageView {
  /// The page actually served (differs from the request after a redirect)
  pub key: CacheKey,
  pub snapshot: Arc<DatasetSnapshot>,
  pub source: CacheSource,
  /// Requested page when it was beyond the last page
  pub redirected_from: Option<u32>,
}

/// Serves pages from cache first, fetching and revalidating as needed.
#[derive(Clone)]
pub struct FetchCoordinator {
  loader: PageLoader,
  prefetch: PrefetchScheduler,
  tasks: BackgroundTasks,
  view: ViewHandle,
  events: EventSender,
}

impl FetchCoordinator {
  pub fn new(
    loader: PageLoader,
    prefetch: PrefetchScheduler,
    tasks: BackgroundTasks,
    view: ViewHandle,
    events: EventSender,
  ) -> Self {
    Self {
      loader,
      prefetch,
      tasks,
      view,
      events,
    }
  }

  pub fn store(&self) -> &CacheStore {
    self.loader.store()
  }

  pub fn view(&self) -> &ViewHandle {
    &self.view
  }

  /// Abort background fetches for filters the user has left.
  ///
  /// Their prefetch is re-armed, since the aborted pages never landed.
  pub fn cancel_background(&self, signature: &Signature) -> usize {
    let aborted = self.tasks.abort_signature(signature);
    if aborted > 0 {
      self.prefetch.forget(signature);
    }
    aborted
  }

  /// Serve `page` of `filters`.
  ///
  /// 1. Fresh cache entry: served, sibling pages prefetched
  /// 2. Stale cache entry: served, one background revalidation started
  /// 3. Miss: fetched; a page past the last page redirects to the last page once
  pub async fn fetch_page(
    &self,
    page: u32,
    filters: &FilterSet,
    page_size: u32,
  ) -> Result<PageView> {
    if page_size == 0 {
      return Err(ListError::validation("page_size", "must be positive"));
    }

    let key = CacheKey::new(page.max(1), page_size, filters);
    let (snapshot, source) = self.resolve(&key, filters).await?;

    if snapshot.total_pages > 0 && key.page > snapshot.total_pages {
      let target = key.sibling(snapshot.total_pages);
      info!(
        requested = key.page,
        last = snapshot.total_pages,
        "Requested page beyond last page, redirecting"
      );
      // The redirected read is final even if the data moved again meanwhile
      let (snapshot, source) = self.resolve(&target, filters).await?;
      return Ok(self.present(target, snapshot, source, Some(key.page), filters));
    }

    Ok(self.present(key, snapshot, source, None, filters))
  }

  /// Drop the cache for `filters` and read `page` again from the network.
  pub async fn refresh(&self, page: u32, filters: &FilterSet, page_size: u32) -> Result<PageView> {
    self.store().invalidate_signature(&filters.signature())?;
    self.fetch_page(page, filters, page_size).await
  }

  async fn resolve(
    &self,
    key: &CacheKey,
    filters: &FilterSet,
  ) -> Result<(Arc<DatasetSnapshot>, CacheSource)> {
    self.view.request(key);

    if let Some(entry) = self.store().get(key)? {
      if entry.is_stale(self.store().now()) {
        self.revalidate(key, filters);
        return Ok((entry.snapshot, CacheSource::CacheStale));
      }
      return Ok((entry.snapshot, CacheSource::CacheFresh));
    }

    // Keep the previous page on screen while fetching, if there is one
    if !self.view.has_data() {
      self.view.set_loading();
      let _ = self.events.send(ListEvent::Loading { key: key.clone() });
    }

    match self.load_foreground(key, filters).await {
      Ok(snapshot) => Ok((snapshot, CacheSource::Network)),
      Err(error) => {
        warn!(key = %key, error = %error, "Page fetch failed");
        self.view.fail(error.clone());
        let _ = self.events.send(ListEvent::LoadFailed {
          key: key.clone(),
          error: error.clone(),
        });
        Err(error)
      }
    }
  }

  /// Fetch a missing page, joining a fetch of the same key already on the wire.
  async fn load_foreground(&self, key: &CacheKey, filters: &FilterSet) -> Result<Arc<DatasetSnapshot>> {
    for _ in 0..MAX_IN_FLIGHT_WAITS {
      match self.store().in_flight().try_claim(key) {
        Claim::Started(_guard) => return self.loader.load(key, filters).await,
        Claim::Busy(wait) => {
          debug!(key = %key, "Page already in flight, waiting");
          wait.finished().await;
          if let Some(entry) = self.store().get(key)? {
            return Ok(entry.snapshot);
          }
        }
      }
    }
    self.loader.load(key, filters).await
  }

  /// Start a background refetch of a stale page unless one is running.
  fn revalidate(&self, key: &CacheKey, filters: &FilterSet) {
    let guard = match self.store().in_flight().try_claim(key) {
      Claim::Started(guard) => guard,
      Claim::Busy(_) => {
        debug!(key = %key, "Revalidation already in flight");
        return;
      }
    };

    let loader = self.loader.clone();
    let view = self.view.clone();
    let events = self.events.clone();
    let key = key.clone();
    let filters = filters.clone();
    self.tasks.spawn(key.signature.clone(), async move {
      let _guard = guard;
      match loader.load(&key, &filters).await {
        Ok(snapshot) => {
          debug!(key = %key, "Revalidated stale page");
          // Only repaint if the user is still looking at this exact page
          let mut visible = view.lock();
          if visible.is_viewing(&key) && visible.pending.is_empty() {
            visible.snapshot = Some(snapshot.clone());
            drop(visible);
            let _ = events.send(ListEvent::Refreshed { key, snapshot });
          }
        }
        Err(e) => {
          // The stale entry stays authoritative
          debug!(key = %key, error = %e, "Background revalidation failed");
        }
      }
    });
  }

  fn present(
    &self,
    key: CacheKey,
    snapshot: Arc<DatasetSnapshot>,
    source: CacheSource,
    redirected_from: Option<u32>,
    filters: &FilterSet,
  ) -> PageView {
    if !self.view.show_unless_pending(&key, snapshot.clone()) {
      debug!(key = %key, "Mutation pending, keeping optimistic page");
    }
    let _ = self.events.send(ListEvent::Loaded {
      key: key.clone(),
      source,
    });

    if source != CacheSource::CacheStale {
      if let Err(e) = self
        .prefetch
        .trigger_aggressive(filters, key.page_size, snapshot.total_pages)
      {
        warn!(error = %e, "Could not schedule prefetch");
      }
    }

    PageView {
      key,
      snapshot,
      source,
      redirected_from,
    }
  }
}
