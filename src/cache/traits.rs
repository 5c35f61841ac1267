//! Core types for the page cache.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::api::types::{ListPage, ListRequest, User};

/// One page of the list as the user sees it.
///
/// Stored behind an `Arc` and never mutated in place once cached;
/// optimistic edits build a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
  pub items: Vec<User>,
  pub page: u32,
  pub page_size: u32,
  pub total_items: u64,
  pub total_pages: u32,
}

impl DatasetSnapshot {
  pub fn from_page(request: &ListRequest, page: ListPage) -> Self {
    Self {
      items: page.items,
      page: request.page,
      page_size: request.page_size,
      total_items: page.total,
      total_pages: page.total_pages,
    }
  }

  pub fn find(&self, id: &str) -> Option<&User> {
    self.items.iter().find(|user| user.id == id)
  }
}

/// A cached snapshot with its freshness metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub snapshot: Arc<DatasetSnapshot>,
  pub fetched_at: DateTime<Utc>,
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.fetched_at
  }

  /// Stale entries stay servable; they are only superseded by a revalidation.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    self.age(now) >= self.ttl
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its ttl, background revalidation started
  CacheStale,
}

/// Time source for freshness decisions.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: Duration) {
    if let Ok(mut now) = self.now.lock() {
      *now += by;
    }
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(fetched_at: DateTime<Utc>) -> CacheEntry {
    CacheEntry {
      snapshot: Arc::new(DatasetSnapshot {
        items: Vec::new(),
        page: 1,
        page_size: 20,
        total_items: 0,
        total_pages: 0,
      }),
      fetched_at,
      ttl: Duration::minutes(5),
    }
  }

  #[test]
  fn test_entry_goes_stale_at_ttl() {
    let t0 = Utc::now();
    let entry = entry(t0);
    assert!(!entry.is_stale(t0 + Duration::minutes(4)));
    assert!(entry.is_stale(t0 + Duration::minutes(5)));
    assert!(entry.is_stale(t0 + Duration::minutes(6)));
  }

  #[test]
  fn test_manual_clock_advances() {
    let t0 = Utc::now();
    let clock = ManualClock::new(t0);
    clock.advance(Duration::seconds(90));
    assert_eq!(clock.now(), t0 + Duration::seconds(90));
  }
}
