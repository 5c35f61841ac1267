use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::types::UserId;
use crate::cache::{CacheSource, DatasetSnapshot};
use crate::error::ListError;
use crate::filters::CacheKey;
use crate::mutation::SaveState;

/// Notifications from the coordinators to whoever renders the list
#[derive(Debug, Clone)]
pub enum ListEvent {
  /// Fetching a page with nothing visible in the meantime
  Loading { key: CacheKey },
  /// A page was put on screen
  Loaded { key: CacheKey, source: CacheSource },
  /// Background revalidation replaced the page currently on screen
  Refreshed {
    key: CacheKey,
    snapshot: Arc<DatasetSnapshot>,
  },
  /// A page could not be fetched and no cached copy exists
  LoadFailed { key: CacheKey, error: ListError },
  /// An optimistic mutation failed and was undone
  RolledBack { ids: Vec<UserId>, error: ListError },
  /// The save pipeline changed state
  SaveState(SaveState),
}

pub type EventSender = mpsc::UnboundedSender<ListEvent>;

/// Create a connected sender and receiver
pub fn channel() -> (EventSender, ListEvents) {
  let (tx, rx) = mpsc::unbounded_channel();
  (tx, ListEvents { rx })
}

/// Receiving end of the session's events
pub struct ListEvents {
  rx: mpsc::UnboundedReceiver<ListEvent>,
}

impl ListEvents {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<ListEvent> {
    self.rx.recv().await
  }

  /// Receive an event if one is queued
  pub fn try_next(&mut self) -> Option<ListEvent> {
    self.rx.try_recv().ok()
  }

  /// Everything queued right now
  pub fn drain_now(&mut self) -> Vec<ListEvent> {
    let mut events = Vec::new();
    while let Some(event) = self.try_next() {
      events.push(event);
    }
    events
  }
}
