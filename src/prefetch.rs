//! Best-effort background fetching of every page of a filter set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheStore, Claim, InvalidationListener, InvalidationScope};
use crate::error::Result;
use crate::fetch::PageLoader;
use crate::filters::{CacheKey, FilterSet, Signature};
use crate::tasks::BackgroundTasks;

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
  pub enabled: bool,
  /// Delay added per page index so a large result set is not fetched in one burst
  pub stagger: Duration,
  /// Pages beyond this are only fetched on demand
  pub max_pages: u32,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      stagger: Duration::from_millis(150),
      max_pages: 50,
    }
  }
}

/// Filter signatures that have already been prefetched once.
///
/// Entries are dropped whenever the cache invalidates anything under them.
#[derive(Debug, Default)]
pub struct PrefetchDoneSet {
  signatures: Mutex<HashSet<Signature>>,
}

impl PrefetchDoneSet {
  /// Mark `signature` done. Returns false if it already was.
  fn mark(&self, signature: &Signature) -> bool {
    self
      .signatures
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(signature.clone())
  }

  fn forget(&self, signature: &Signature) {
    self
      .signatures
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(signature);
  }

  pub fn contains(&self, signature: &Signature) -> bool {
    self
      .signatures
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .contains(signature)
  }
}

impl InvalidationListener for PrefetchDoneSet {
  fn invalidated(&self, scope: &InvalidationScope) {
    self
      .signatures
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .retain(|signature| !scope.covers(signature));
  }
}

/// Schedules background fetches of sibling pages.
#[derive(Clone)]
pub struct PrefetchScheduler {
  loader: PageLoader,
  store: CacheStore,
  done: Arc<PrefetchDoneSet>,
  tasks: BackgroundTasks,
  config: PrefetchConfig,
}

impl PrefetchScheduler {
  pub fn new(loader: PageLoader, tasks: BackgroundTasks, config: PrefetchConfig) -> Self {
    let store = loader.store().clone();
    let done = Arc::new(PrefetchDoneSet::default());
    store.subscribe(done.clone());

    Self {
      loader,
      store,
      done,
      tasks,
      config,
    }
  }

  pub fn is_done(&self, signature: &Signature) -> bool {
    self.done.contains(signature)
  }

  /// Allow `signature` to be prefetched again, e.g. after its fetches were cancelled.
  pub fn forget(&self, signature: &Signature) {
    debug!(signature = signature.short(), "Prefetch re-armed");
    self.done.forget(signature);
  }

  /// Fetch every page of `filters` that is neither cached nor in flight,
  /// at most once per signature between invalidations.
  /// Returns the number of fetches scheduled.
  pub fn trigger_aggressive(
    &self,
    filters: &FilterSet,
    page_size: u32,
    total_pages: u32,
  ) -> Result<usize> {
    if !self.config.enabled {
      return Ok(0);
    }

    let signature = filters.signature();
    // Marked before scheduling so concurrent callers back off immediately
    if !self.done.mark(&signature) {
      return Ok(0);
    }

    let last = total_pages.min(self.config.max_pages);
    let mut scheduled = 0;
    for page in 1..=last {
      let key = CacheKey {
        signature: signature.clone(),
        page_size,
        page,
      };
      if self.store.contains(&key)? || self.store.in_flight().contains(&key) {
        continue;
      }

      let delay = self.config.stagger * (page - 1);
      let loader = self.loader.clone();
      let filters = filters.clone();
      self.tasks.spawn(signature.clone(), async move {
        prefetch_page(loader, key, filters, delay).await;
      });
      scheduled += 1;
    }

    debug!(
      signature = signature.short(),
      total_pages, scheduled, "Scheduled aggressive prefetch"
    );
    Ok(scheduled)
  }
}

async fn prefetch_page(loader: PageLoader, key: CacheKey, filters: FilterSet, delay: Duration) {
  if !delay.is_zero() {
    tokio::time::sleep(delay).await;
  }

  // Re-check at run time: the page may have been fetched during the delay
  let _guard = match loader.store().in_flight().try_claim(&key) {
    Claim::Started(guard) => guard,
    Claim::Busy(_) => return,
  };
  match loader.store().contains(&key) {
    Ok(false) => {}
    Ok(true) => return,
    Err(e) => {
      warn!(key = %key, error = %e, "Prefetch skipped, cache unreadable");
      return;
    }
  }

  // No retry; the page is fetched on demand if the user navigates to it
  if let Err(e) = loader.load(&key, &filters).await {
    warn!(key = %key, error = %e, "Prefetch failed");
  }
}
