//! The visible state of the list: what the user currently sees.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::types::UserId;
use crate::cache::DatasetSnapshot;
use crate::error::ListError;
use crate::filters::CacheKey;

/// Load state of the visible page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadState {
  /// Nothing requested yet
  #[default]
  Idle,
  /// Fetching with nothing to show in the meantime
  Loading,
  /// A snapshot is on screen
  Ready,
  /// Fetch failed with no fallback; the user may retry
  Error(ListError),
}

impl LoadState {
  pub fn is_loading(&self) -> bool {
    matches!(self, LoadState::Loading)
  }

  pub fn error(&self) -> Option<&ListError> {
    match self {
      LoadState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Everything the list view renders.
#[derive(Debug, Clone, Default)]
pub struct VisibleList {
  /// Page/filter combination the user asked for last
  pub requested: Option<CacheKey>,
  /// Page/filter combination of `snapshot`
  pub key: Option<CacheKey>,
  pub snapshot: Option<Arc<DatasetSnapshot>>,
  pub state: LoadState,
  /// Rows with a mutation on the wire
  pub pending: BTreeSet<UserId>,
  /// Row-scoped errors from failed mutations
  pub row_errors: BTreeMap<UserId, ListError>,
  /// Batch-scoped error from the last failed bulk mutation
  pub batch_error: Option<ListError>,
}

impl VisibleList {
  pub fn is_pending(&self, id: &str) -> bool {
    self.pending.contains(id)
  }

  /// Whether `key` is both requested and on screen.
  pub fn is_viewing(&self, key: &CacheKey) -> bool {
    self.requested.as_ref() == Some(key) && self.key.as_ref() == Some(key)
  }
}

/// Shared handle to the visible list of one session.
#[derive(Debug, Clone, Default)]
pub struct ViewHandle {
  inner: Arc<Mutex<VisibleList>>,
}

impl ViewHandle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn lock(&self) -> MutexGuard<'_, VisibleList> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn get(&self) -> VisibleList {
    self.lock().clone()
  }

  pub fn snapshot(&self) -> Option<Arc<DatasetSnapshot>> {
    self.lock().snapshot.clone()
  }

  pub fn has_data(&self) -> bool {
    self.lock().snapshot.is_some()
  }

  pub fn request(&self, key: &CacheKey) {
    self.lock().requested = Some(key.clone());
  }

  pub fn set_loading(&self) {
    self.lock().state = LoadState::Loading;
  }

  /// Put a snapshot on screen.
  pub fn show(&self, key: &CacheKey, snapshot: Arc<DatasetSnapshot>) {
    let mut view = self.lock();
    view.requested = Some(key.clone());
    view.key = Some(key.clone());
    view.snapshot = Some(snapshot);
    view.state = LoadState::Ready;
  }

  /// Put a snapshot on screen unless it would replace the same page while a
  /// mutation on it is still pending. Returns whether the snapshot was shown.
  pub fn show_unless_pending(&self, key: &CacheKey, snapshot: Arc<DatasetSnapshot>) -> bool {
    let mut view = self.lock();
    if view.key.as_ref() == Some(key) && !view.pending.is_empty() {
      // The optimistic snapshot stays until its mutations settle
      view.requested = Some(key.clone());
      view.state = LoadState::Ready;
      return false;
    }
    view.requested = Some(key.clone());
    view.key = Some(key.clone());
    view.snapshot = Some(snapshot);
    view.state = LoadState::Ready;
    true
  }

  /// Surface a page-level error. Whatever was on screen stays there.
  pub fn fail(&self, error: ListError) {
    self.lock().state = LoadState::Error(error);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::filters::FilterSet;

  fn snapshot(page: u32) -> Arc<DatasetSnapshot> {
    Arc::new(DatasetSnapshot {
      items: Vec::new(),
      page,
      page_size: 20,
      total_items: 0,
      total_pages: 0,
    })
  }

  #[test]
  fn test_show_marks_ready_and_viewing() {
    let view = ViewHandle::new();
    let key = CacheKey::new(2, 20, &FilterSet::default());
    assert!(!view.has_data());

    view.request(&key);
    view.set_loading();
    assert!(view.get().state.is_loading());
    assert!(!view.get().is_viewing(&key));

    view.show(&key, snapshot(2));
    assert_eq!(view.get().state, LoadState::Ready);
    assert!(view.get().is_viewing(&key));
  }

  #[test]
  fn test_navigating_away_stops_viewing() {
    let view = ViewHandle::new();
    let first = CacheKey::new(1, 20, &FilterSet::default());
    let second = first.sibling(2);
    view.show(&first, snapshot(1));
    view.request(&second);
    assert!(!view.get().is_viewing(&first));
  }

  #[test]
  fn test_pending_mutation_keeps_optimistic_snapshot() {
    let view = ViewHandle::new();
    let key = CacheKey::new(1, 20, &FilterSet::default());
    let optimistic = snapshot(1);
    view.show(&key, optimistic.clone());
    view.lock().pending.insert("u1".to_string());

    assert!(!view.show_unless_pending(&key, snapshot(1)));
    assert!(Arc::ptr_eq(&view.snapshot().unwrap(), &optimistic));

    // Another page is shown regardless
    assert!(view.show_unless_pending(&key.sibling(2), snapshot(2)));
    assert_eq!(view.snapshot().unwrap().page, 2);
  }

  #[test]
  fn test_fail_keeps_previous_snapshot() {
    let view = ViewHandle::new();
    let key = CacheKey::new(1, 20, &FilterSet::default());
    view.show(&key, snapshot(1));
    view.fail(ListError::Network("down".into()));
    assert!(view.has_data());
    assert!(view.get().state.error().is_some());
  }
}
