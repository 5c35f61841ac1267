//! Keyed snapshot store with ttl metadata and per-key request ordering.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::in_flight::InFlightSet;
use super::storage::{MemoryStorage, SnapshotStorage};
use super::traits::{CacheEntry, Clock, DatasetSnapshot};
use crate::error::Result;
use crate::filters::{CacheKey, Signature};

/// Ordering token handed out before a fetch goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

/// What an invalidation touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
  All,
  Signatures(BTreeSet<Signature>),
}

impl InvalidationScope {
  pub fn covers(&self, signature: &Signature) -> bool {
    match self {
      InvalidationScope::All => true,
      InvalidationScope::Signatures(signatures) => signatures.contains(signature),
    }
  }
}

/// Hook for state derived from the cache that must reset with it.
pub trait InvalidationListener: Send + Sync {
  fn invalidated(&self, scope: &InvalidationScope);
}

#[derive(Debug, Default)]
struct RequestOrdering {
  /// Last ticket handed out
  issued: u64,
  /// Ticket of the fetch whose result is currently stored, per key
  completed: HashMap<CacheKey, u64>,
  /// Tickets at or below the floor were issued before an invalidation
  floors: HashMap<CacheKey, u64>,
  global_floor: u64,
}

impl RequestOrdering {
  fn accepts(&self, key: &CacheKey, ticket: Ticket) -> bool {
    if ticket.0 <= self.global_floor {
      return false;
    }
    if self.floors.get(key).is_some_and(|floor| ticket.0 <= *floor) {
      return false;
    }
    !self.completed.get(key).is_some_and(|done| *done > ticket.0)
  }
}

struct StoreInner {
  storage: Box<dyn SnapshotStorage>,
  clock: Arc<dyn Clock>,
  default_ttl: Duration,
  in_flight: InFlightSet,
  ordering: Mutex<RequestOrdering>,
  listeners: Mutex<Vec<Arc<dyn InvalidationListener>>>,
}

/// Cache of dataset snapshots for one list-view session.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl CacheStore {
  /// Create a new store over the given storage backend.
  pub fn new(storage: impl SnapshotStorage + 'static, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        storage: Box::new(storage),
        clock,
        default_ttl: ttl,
        in_flight: InFlightSet::new(),
        ordering: Mutex::new(RequestOrdering::default()),
        listeners: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn in_memory(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
    Self::new(MemoryStorage::new(), clock, ttl)
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  pub fn default_ttl(&self) -> Duration {
    self.inner.default_ttl
  }

  pub fn in_flight(&self) -> &InFlightSet {
    &self.inner.in_flight
  }

  /// Register state that must be reset whenever entries are invalidated.
  pub fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
    self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(listener);
  }

  pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    self.inner.storage.get(key)
  }

  pub fn contains(&self, key: &CacheKey) -> Result<bool> {
    Ok(self.get(key)?.is_some())
  }

  /// Store `snapshot` under `key` unconditionally, replacing any entry.
  pub fn set(&self, key: &CacheKey, snapshot: Arc<DatasetSnapshot>, ttl: Duration) -> Result<()> {
    let mut ordering = self.inner.ordering.lock()?;
    ordering.issued += 1;
    let ticket = ordering.issued;
    ordering.completed.insert(key.clone(), ticket);
    self.write(key, snapshot, ttl)
  }

  /// Take an ordering ticket for a fetch that is about to start.
  pub fn begin_request(&self) -> Result<Ticket> {
    let mut ordering = self.inner.ordering.lock()?;
    ordering.issued += 1;
    Ok(Ticket(ordering.issued))
  }

  /// Store the result of the fetch holding `ticket`, unless a later-started
  /// fetch already completed for `key` or `key` was invalidated after the
  /// ticket was issued. Returns whether the snapshot was stored.
  pub fn complete(&self, key: &CacheKey, ticket: Ticket, snapshot: Arc<DatasetSnapshot>) -> Result<bool> {
    let mut ordering = self.inner.ordering.lock()?;
    if !ordering.accepts(key, ticket) {
      debug!(key = %key, ?ticket, "Discarding out-of-order fetch result");
      return Ok(false);
    }
    ordering.completed.insert(key.clone(), ticket.0);
    self.write(key, snapshot, self.inner.default_ttl)?;
    Ok(true)
  }

  fn write(&self, key: &CacheKey, snapshot: Arc<DatasetSnapshot>, ttl: Duration) -> Result<()> {
    let entry = CacheEntry {
      snapshot,
      fetched_at: self.now(),
      ttl,
    };
    self.inner.storage.put(key, &entry)
  }

  /// Drop every entry and fence off every fetch already on the wire.
  pub fn invalidate_all(&self) -> Result<()> {
    {
      let mut ordering = self.inner.ordering.lock()?;
      ordering.global_floor = ordering.issued;
      ordering.floors.clear();
      self.inner.storage.clear()?;
    }
    debug!("Invalidated all cache entries");
    self.notify(&InvalidationScope::All);
    Ok(())
  }

  /// Drop entries whose key matches `predicate`. In-flight fetches for
  /// matching keys are fenced off so their results are discarded.
  /// Returns the number of stored entries removed.
  pub fn invalidate_matching(&self, predicate: impl Fn(&CacheKey) -> bool) -> Result<usize> {
    self.invalidate_where(predicate, BTreeSet::new())
  }

  /// Drop every page cached for one filter signature.
  ///
  /// Listeners always hear about `signature`, even when nothing was cached.
  pub fn invalidate_signature(&self, signature: &Signature) -> Result<usize> {
    self.invalidate_where(
      |key| &key.signature == signature,
      BTreeSet::from([signature.clone()]),
    )
  }

  fn invalidate_where(
    &self,
    predicate: impl Fn(&CacheKey) -> bool,
    mut signatures: BTreeSet<Signature>,
  ) -> Result<usize> {
    let removed = {
      let mut ordering = self.inner.ordering.lock()?;
      let stored: Vec<CacheKey> = self
        .inner
        .storage
        .keys()?
        .into_iter()
        .filter(|key| predicate(key))
        .collect();
      let flying: Vec<CacheKey> = self
        .inner
        .in_flight
        .keys()
        .into_iter()
        .filter(|key| predicate(key))
        .collect();
      // Keys fetched before, even if their entry is gone or was never stored
      let known: Vec<CacheKey> = ordering
        .completed
        .keys()
        .chain(ordering.floors.keys())
        .filter(|key| predicate(key))
        .cloned()
        .collect();

      let floor = ordering.issued;
      for key in stored.iter().chain(flying.iter()) {
        ordering.floors.insert(key.clone(), floor);
        signatures.insert(key.signature.clone());
      }
      signatures.extend(known.into_iter().map(|key| key.signature));
      self.inner.storage.remove(&stored)?;
      stored.len()
    };

    if !signatures.is_empty() {
      debug!(removed, signatures = signatures.len(), "Invalidated cache entries");
      self.notify(&InvalidationScope::Signatures(signatures));
    }
    Ok(removed)
  }

  /// Keys of `signature` whose entries are past their ttl.
  pub fn stale_keys(&self, signature: &Signature) -> Result<Vec<CacheKey>> {
    let now = self.now();
    let mut stale = Vec::new();
    for key in self.inner.storage.keys()? {
      if &key.signature != signature {
        continue;
      }
      if let Some(entry) = self.get(&key)? {
        if entry.is_stale(now) {
          stale.push(key);
        }
      }
    }
    Ok(stale)
  }

  fn notify(&self, scope: &InvalidationScope) {
    let listeners = self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    for listener in listeners {
      listener.invalidated(scope);
    }
  }
}
