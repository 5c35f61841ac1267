//! Dedup guard for fetches that are currently on the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::filters::CacheKey;

/// Set of cache keys with a fetch in progress.
///
/// Membership is checked and claimed under one lock, so two schedulers can
/// never both start a fetch for the same key.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
  keys: Arc<Mutex<HashMap<CacheKey, watch::Sender<()>>>>,
}

/// Outcome of trying to claim a key.
#[derive(Debug)]
pub enum Claim {
  /// The caller owns the fetch; dropping the guard releases the key.
  Started(InFlightGuard),
  /// Someone else is fetching this key.
  Busy(InFlightWait),
}

impl InFlightSet {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, watch::Sender<()>>> {
    self.keys.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Atomically claim `key` if nobody else holds it.
  pub fn try_claim(&self, key: &CacheKey) -> Claim {
    let mut keys = self.lock();
    if let Some(sender) = keys.get(key) {
      return Claim::Busy(InFlightWait {
        rx: sender.subscribe(),
      });
    }

    let (tx, _rx) = watch::channel(());
    keys.insert(key.clone(), tx);
    Claim::Started(InFlightGuard {
      set: self.clone(),
      key: key.clone(),
    })
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.lock().contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    self.lock().keys().cloned().collect()
  }

  fn release(&self, key: &CacheKey) {
    // Dropping the sender wakes every waiter
    self.lock().remove(key);
  }
}

/// Ownership of an in-flight key. Released on drop, including when the
/// owning task is aborted or panics.
#[derive(Debug)]
pub struct InFlightGuard {
  set: InFlightSet,
  key: CacheKey,
}

impl InFlightGuard {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self.set.release(&self.key);
  }
}

/// Handle for waiting on somebody else's fetch.
#[derive(Debug)]
pub struct InFlightWait {
  rx: watch::Receiver<()>,
}

impl InFlightWait {
  /// Resolves once the owning guard is dropped.
  pub async fn finished(mut self) {
    while self.rx.changed().await.is_ok() {}
  }
}
