//! Two-way sync between the list state and its query-string form, plus the
//! debounced search box.

use std::time::{Duration, Instant};
use tracing::debug;
use url::form_urlencoded;

use crate::api::types::{Role, UserType};
use crate::filters::FilterSet;

/// Page and filters as carried by the external query string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListParams {
  pub page: u32,
  pub filters: FilterSet,
}

impl Default for ListParams {
  fn default() -> Self {
    Self {
      page: 1,
      filters: FilterSet::default(),
    }
  }
}

impl ListParams {
  /// Parse a query string such as `page=2&role=admin`.
  ///
  /// Absent, unknown or malformed values fall back to their defaults.
  pub fn parse(query: &str) -> Self {
    let mut params = Self::default();
    let query = query.trim().trim_start_matches('?');

    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
      let value = value.trim();
      match name.as_ref() {
        "page" => params.page = value.parse::<u32>().ok().filter(|p| *p >= 1).unwrap_or(1),
        "role" => params.filters.role = value.parse::<Role>().ok(),
        "search" => params.filters.search = value.to_string(),
        "verified" => params.filters.verified = parse_bool(value),
        "user_type" => params.filters.user_type = value.parse::<UserType>().ok(),
        other => debug!(param = other, "Ignoring unknown query parameter"),
      }
    }
    params
  }

  /// Minimal canonical query string: parameters at their default are left out.
  pub fn to_query(&self) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    if self.page > 1 {
      query.append_pair("page", &self.page.to_string());
    }
    if let Some(role) = self.filters.role {
      query.append_pair("role", role.as_str());
    }
    let search = self.filters.search.trim();
    if !search.is_empty() {
      query.append_pair("search", search);
    }
    if let Some(verified) = self.filters.verified {
      query.append_pair("verified", if verified { "true" } else { "false" });
    }
    if let Some(user_type) = self.filters.user_type {
      query.append_pair("user_type", user_type.as_str());
    }
    query.finish()
  }
}

fn parse_bool(value: &str) -> Option<bool> {
  match value.to_lowercase().as_str() {
    "true" | "1" | "yes" => Some(true),
    "false" | "0" | "no" => Some(false),
    _ => None,
  }
}

/// Commits a value once input has been quiet for a fixed period.
///
/// Time is passed in explicitly; nothing here sleeps or spawns.
#[derive(Debug, Clone)]
pub struct Debouncer {
  quiet: Duration,
  pending: Option<String>,
  deadline: Option<Instant>,
}

impl Debouncer {
  pub fn new(quiet: Duration) -> Self {
    Self {
      quiet,
      pending: None,
      deadline: None,
    }
  }

  /// Record a keystroke. Pushes the deadline out by the quiet period.
  pub fn input(&mut self, value: impl Into<String>, now: Instant) {
    self.pending = Some(value.into());
    self.deadline = Some(now + self.quiet);
  }

  pub fn pending(&self) -> Option<&str> {
    self.pending.as_deref()
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// The pending value, if its deadline has passed.
  pub fn tick(&mut self, now: Instant) -> Option<String> {
    match self.deadline {
      Some(deadline) if now >= deadline => self.flush(),
      _ => None,
    }
  }

  /// Commit now regardless of the deadline.
  pub fn flush(&mut self) -> Option<String> {
    self.deadline = None;
    self.pending.take()
  }
}

/// A committed filter change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChange {
  pub previous: FilterSet,
  pub current: FilterSet,
}

/// Owns the list parameters of one session and keeps the query string in step.
#[derive(Debug, Clone)]
pub struct StateSync {
  params: ListParams,
  search: Debouncer,
}

impl StateSync {
  pub fn from_query(query: &str, search_quiet: Duration) -> Self {
    Self {
      params: ListParams::parse(query),
      search: Debouncer::new(search_quiet),
    }
  }

  pub fn params(&self) -> &ListParams {
    &self.params
  }

  pub fn page(&self) -> u32 {
    self.params.page
  }

  pub fn filters(&self) -> &FilterSet {
    &self.params.filters
  }

  pub fn query_string(&self) -> String {
    self.params.to_query()
  }

  pub fn set_page(&mut self, page: u32) {
    self.params.page = page.max(1);
  }

  /// Replace the filters. A change resets pagination to page 1.
  ///
  /// Returns `None` when the new filters select the same rows.
  pub fn commit_filters(&mut self, filters: FilterSet) -> Option<FilterChange> {
    if filters.signature() == self.params.filters.signature() {
      self.params.filters = filters;
      return None;
    }

    let previous = std::mem::replace(&mut self.params.filters, filters);
    self.params.page = 1;
    debug!(query = %self.query_string(), "Filters committed");
    Some(FilterChange {
      previous,
      current: self.params.filters.clone(),
    })
  }

  /// Clamp the page into `1..=max(1, total_pages)` once the page count is known.
  ///
  /// Returns the rewritten query string if the page changed.
  pub fn clamp(&mut self, total_pages: u32) -> Option<String> {
    let clamped = self.params.page.clamp(1, total_pages.max(1));
    if clamped == self.params.page {
      return None;
    }
    debug!(from = self.params.page, to = clamped, "Page clamped");
    self.params.page = clamped;
    Some(self.query_string())
  }

  /// Record search box input. Nothing is committed until `tick`.
  pub fn search_input(&mut self, text: impl Into<String>, now: Instant) {
    self.search.input(text, now);
  }

  pub fn pending_search(&self) -> Option<&str> {
    self.search.pending()
  }

  pub fn search_deadline(&self) -> Option<Instant> {
    self.search.deadline()
  }

  /// Commit the pending search if the input has been quiet long enough.
  pub fn tick(&mut self, now: Instant) -> Option<FilterChange> {
    let search = self.search.tick(now)?;
    let filters = self.params.filters.clone().with_search(search);
    self.commit_filters(filters)
  }
}
