//! One list-view session: the query string, the visible page, and the
//! coordinators working on them.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::api::types::{Role, User, UserId, UserType};
use crate::api::UsersApi;
use crate::cache::CacheStore;
use crate::error::{ListError, Result};
use crate::event::{self, ListEvents};
use crate::fetch::{FetchCoordinator, PageLoader, PageView};
use crate::mutation::{Confirm, MutationCoordinator, MutationOutcome, SaveRequest, SaveState};
use crate::prefetch::{PrefetchConfig, PrefetchScheduler};
use crate::sync::{FilterChange, ListParams, StateSync};
use crate::tasks::BackgroundTasks;
use crate::view::ViewHandle;

/// Tunables of a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
  pub page_size: u32,
  pub request_timeout: Duration,
  pub search_debounce: Duration,
  pub prefetch: PrefetchConfig,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self {
      page_size: 20,
      request_timeout: Duration::from_secs(15),
      search_debounce: Duration::from_millis(300),
      prefetch: PrefetchConfig::default(),
    }
  }
}

pub struct ListSession {
  sync: StateSync,
  page_size: u32,
  search_debounce: Duration,
  store: CacheStore,
  fetch: FetchCoordinator,
  mutations: MutationCoordinator,
  tasks: BackgroundTasks,
  view: ViewHandle,
}

impl ListSession {
  /// Wire up a session. Nothing is fetched until `open`.
  pub fn new(
    api: Arc<dyn UsersApi>,
    store: CacheStore,
    options: SessionOptions,
  ) -> (Self, ListEvents) {
    let (events, receiver) = event::channel();
    let tasks = BackgroundTasks::new();
    let view = ViewHandle::new();

    let loader = PageLoader::new(api.clone(), store.clone(), options.request_timeout);
    let prefetch = PrefetchScheduler::new(loader.clone(), tasks.clone(), options.prefetch);
    let fetch = FetchCoordinator::new(
      loader,
      prefetch,
      tasks.clone(),
      view.clone(),
      events.clone(),
    );
    let mutations = MutationCoordinator::new(
      api,
      store.clone(),
      view.clone(),
      events,
      options.request_timeout,
    );

    let session = Self {
      sync: StateSync::from_query("", options.search_debounce),
      page_size: options.page_size,
      search_debounce: options.search_debounce,
      store,
      fetch,
      mutations,
      tasks,
      view,
    };
    (session, receiver)
  }

  pub fn view(&self) -> &ViewHandle {
    &self.view
  }

  pub fn params(&self) -> &ListParams {
    self.sync.params()
  }

  /// Canonical query string of the current page and filters
  pub fn query_string(&self) -> String {
    self.sync.query_string()
  }

  pub fn save_state(&self) -> SaveState {
    self.mutations.save_state()
  }

  pub fn acknowledge_save(&self) {
    self.mutations.acknowledge_save();
  }

  /// Start from a query string and show the page it names.
  pub async fn open(&mut self, query: &str) -> Result<PageView> {
    self.sync = StateSync::from_query(query, self.search_debounce);
    info!(query = %self.sync.query_string(), "Opening list");
    self.load_current().await
  }

  pub async fn goto_page(&mut self, page: u32) -> Result<PageView> {
    self.sync.set_page(page);
    self.load_current().await
  }

  pub async fn set_role(&mut self, role: Option<Role>) -> Result<PageView> {
    let mut filters = self.sync.filters().clone();
    filters.role = role;
    let change = self.sync.commit_filters(filters);
    self.apply_change(change).await
  }

  pub async fn set_verified(&mut self, verified: Option<bool>) -> Result<PageView> {
    let mut filters = self.sync.filters().clone();
    filters.verified = verified;
    let change = self.sync.commit_filters(filters);
    self.apply_change(change).await
  }

  pub async fn set_user_type(&mut self, user_type: Option<UserType>) -> Result<PageView> {
    let mut filters = self.sync.filters().clone();
    filters.user_type = user_type;
    let change = self.sync.commit_filters(filters);
    self.apply_change(change).await
  }

  /// Record search box input; `tick` commits it once typing pauses.
  pub fn search_input(&mut self, text: impl Into<String>, now: Instant) {
    self.sync.search_input(text, now);
  }

  /// When the pending search is due, if there is one
  pub fn search_deadline(&self) -> Option<Instant> {
    self.sync.search_deadline()
  }

  /// Commit a due search. Returns the new page if the filters changed.
  pub async fn tick(&mut self, now: Instant) -> Result<Option<PageView>> {
    match self.sync.tick(now) {
      Some(change) => self.apply_change(Some(change)).await.map(Some),
      None => Ok(None),
    }
  }

  /// Throw away cached pages of the current filters and fetch again.
  pub async fn refresh(&mut self) -> Result<PageView> {
    let view = self
      .fetch
      .refresh(self.sync.page(), self.sync.filters(), self.page_size)
      .await?;
    Ok(self.settle_page(view))
  }

  pub async fn toggle_verified(&mut self, id: &str) -> Result<MutationOutcome> {
    let result = self.mutations.toggle_verified(id).await;
    self.after_mutation(result).await
  }

  pub async fn bulk_set_role(
    &mut self,
    ids: &[UserId],
    role: Role,
    confirm: &dyn Confirm,
  ) -> Result<MutationOutcome> {
    let result = self.mutations.bulk_set_role(ids, role, confirm).await;
    self.after_mutation(result).await
  }

  pub async fn bulk_delete(&mut self, ids: &[UserId], confirm: &dyn Confirm) -> Result<MutationOutcome> {
    let result = self.mutations.bulk_delete(ids, confirm).await;
    self.after_mutation(result).await
  }

  pub async fn save(&mut self, request: SaveRequest) -> Result<User> {
    let result = self.mutations.save(request).await;
    if let Err(ListError::NotFound(_)) = &result {
      self.reload_after_not_found().await;
    }
    result
  }

  /// Wait for prefetches and revalidations to finish.
  pub async fn drain(&self) {
    self.tasks.drain().await;
  }

  /// Cancel all background work of this session.
  pub fn close(&self) {
    self.tasks.abort_all();
  }

  async fn load_current(&mut self) -> Result<PageView> {
    let view = self
      .fetch
      .fetch_page(self.sync.page(), self.sync.filters(), self.page_size)
      .await?;
    Ok(self.settle_page(view))
  }

  /// Bring the query string in line with the page actually shown.
  fn settle_page(&mut self, view: PageView) -> PageView {
    self.sync.set_page(view.key.page);
    if let Some(query) = self.sync.clamp(view.snapshot.total_pages) {
      debug!(query = %query, "Query rewritten");
    }
    view
  }

  async fn apply_change(&mut self, change: Option<FilterChange>) -> Result<PageView> {
    if let Some(change) = change {
      // Work for the filters being left is no longer useful
      self.fetch.cancel_background(&change.previous.signature());

      // Pages of the new filters that are past their ttl must not be served
      let stale = self.store.stale_keys(&change.current.signature())?;
      if !stale.is_empty() {
        self.store.invalidate_matching(|key| stale.contains(key))?;
      }
    }
    self.load_current().await
  }

  async fn after_mutation(&mut self, result: Result<MutationOutcome>) -> Result<MutationOutcome> {
    if let Err(ListError::NotFound(_)) = &result {
      self.reload_after_not_found().await;
    }
    result
  }

  async fn reload_after_not_found(&mut self) {
    info!("Entity disappeared server-side, reloading");
    // The cache was already dropped by the coordinator
    if let Err(e) = self.load_current().await {
      warn!(error = %e, "Reload after missing entity failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::fake::FakeUsersApi;
  use crate::cache::ManualClock;
  use crate::filters::{CacheKey, FilterSet};
  use crate::mutation::AssumeYes;
  use chrono::Utc;

  struct Harness {
    api: Arc<FakeUsersApi>,
    clock: Arc<ManualClock>,
    store: CacheStore,
    session: ListSession,
    _events: ListEvents,
  }

  fn harness(users: usize) -> Harness {
    harness_with_stagger(users, Duration::ZERO)
  }

  fn harness_with_stagger(users: usize, stagger: Duration) -> Harness {
    let api = FakeUsersApi::seeded(users);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = CacheStore::in_memory(clock.clone(), chrono::Duration::minutes(5));
    let options = SessionOptions {
      page_size: 10,
      request_timeout: Duration::from_secs(5),
      search_debounce: Duration::from_millis(300),
      prefetch: PrefetchConfig {
        enabled: true,
        stagger,
        max_pages: 50,
      },
    };
    let (session, events) = ListSession::new(api.clone(), store.clone(), options);
    Harness {
      api,
      clock,
      store,
      session,
      _events: events,
    }
  }

  #[tokio::test]
  async fn test_open_then_paginate_from_prefetched_cache() {
    let mut h = harness(45);
    let first = h.session.open("").await.unwrap();
    assert_eq!(first.key.page, 1);
    h.session.drain().await;
    assert_eq!(h.api.list_calls(), 5);

    let third = h.session.goto_page(3).await.unwrap();
    assert_eq!(third.snapshot.page, 3);
    assert_eq!(h.api.list_calls(), 5);
    assert_eq!(h.session.query_string(), "page=3");
  }

  #[tokio::test]
  async fn test_out_of_range_query_is_rewritten() {
    let mut h = harness(45);
    let view = h.session.open("page=9").await.unwrap();
    assert_eq!(view.key.page, 5);
    assert_eq!(view.redirected_from, Some(9));
    assert_eq!(h.session.query_string(), "page=5");
  }

  #[tokio::test]
  async fn test_empty_result_clamps_page_to_one() {
    let mut h = harness(0);
    h.session.open("page=3").await.unwrap();
    assert_eq!(h.session.query_string(), "");
    assert_eq!(h.api.list_calls(), 1);
  }

  #[tokio::test]
  async fn test_role_filter_resets_page_and_uses_new_signature() {
    let mut h = harness(45);
    h.session.open("page=2").await.unwrap();
    h.session.drain().await;
    let all_calls = h.api.list_calls();

    let view = h.session.set_role(Some(Role::Admin)).await.unwrap();
    h.session.drain().await;

    let admins = FilterSet::default().with_role(Role::Admin);
    assert_eq!(view.key, CacheKey::new(1, 10, &admins));
    assert_eq!(h.session.query_string(), "role=admin");
    // 11 admins: two pages, both fetched for the new signature
    assert_eq!(h.api.list_calls_for(1, &admins), 1);
    assert_eq!(h.api.list_calls_for(2, &admins), 1);
    assert_eq!(h.api.list_calls(), all_calls + 2);
  }

  #[tokio::test]
  async fn test_filter_commit_drops_stale_pages_of_new_filters() {
    let mut h = harness(30);
    let members = FilterSet::default().with_role(Role::Member);
    h.session.set_role(Some(Role::Member)).await.unwrap();
    h.session.drain().await;
    h.session.set_role(None).await.unwrap();
    h.session.drain().await;

    h.clock.advance(chrono::Duration::minutes(6));
    let before = h.api.list_calls_for(1, &members);
    let view = h.session.set_role(Some(Role::Member)).await.unwrap();
    assert_eq!(view.source, crate::cache::CacheSource::Network);
    assert_eq!(h.api.list_calls_for(1, &members), before + 1);
  }

  #[tokio::test]
  async fn test_search_is_debounced() {
    let mut h = harness(30);
    h.session.open("").await.unwrap();
    h.session.drain().await;
    let calls = h.api.list_calls();

    let start = Instant::now();
    h.session.search_input("user 1", start);
    h.session.search_input("user 12", start + Duration::from_millis(100));
    assert!(h
      .session
      .tick(start + Duration::from_millis(350))
      .await
      .unwrap()
      .is_none());
    assert_eq!(h.api.list_calls(), calls);

    let view = h
      .session
      .tick(start + Duration::from_millis(400))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(view.snapshot.items.len(), 1);
    assert_eq!(h.session.query_string(), "search=user+12");
  }

  #[tokio::test]
  async fn test_not_found_mutation_reloads_page() {
    let mut h = harness(30);
    h.session.open("").await.unwrap();
    h.session.drain().await;
    h.api.remove_user("u2");
    let calls = h.api.list_calls_for(1, &FilterSet::default());

    let err = h
      .session
      .bulk_delete(&["u2".to_string()], &AssumeYes)
      .await
      .unwrap_err();
    assert!(matches!(err, ListError::NotFound(_)));
    assert_eq!(h.api.list_calls_for(1, &FilterSet::default()), calls + 1);
    let snapshot = h.session.view().snapshot().unwrap();
    assert!(snapshot.find("u2").is_none());
    assert_eq!(snapshot.total_items, 29);
  }

  #[tokio::test]
  async fn test_refresh_refetches_current_page() {
    let mut h = harness(30);
    h.session.open("page=2").await.unwrap();
    h.session.drain().await;
    let calls = h.api.list_calls_for(2, &FilterSet::default());

    h.session.refresh().await.unwrap();
    assert_eq!(h.api.list_calls_for(2, &FilterSet::default()), calls + 1);
    assert!(h
      .store
      .contains(&CacheKey::new(2, 10, &FilterSet::default()))
      .unwrap());
  }

  #[tokio::test]
  async fn test_returning_to_filters_resumes_cancelled_prefetch() {
    let mut h = harness_with_stagger(45, Duration::from_millis(50));
    let all = FilterSet::default();
    h.session.open("").await.unwrap();

    // Leave before the staggered prefetch of pages 2..5 gets going
    h.session.set_role(Some(Role::Admin)).await.unwrap();
    h.session.drain().await;
    assert_eq!(h.api.list_calls_for(3, &all), 0);

    h.session.set_role(None).await.unwrap();
    h.session.drain().await;
    assert_eq!(h.api.list_calls_for(3, &all), 1);

    let third = h.session.goto_page(3).await.unwrap();
    assert_eq!(third.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(h.api.list_calls_for(3, &all), 1);
  }
}
