//! Tracking for background fetches (prefetch and revalidation).

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::filters::Signature;

struct TrackedTask {
  signature: Signature,
  handle: JoinHandle<()>,
}

/// Background tasks of one session, grouped by filter signature so work for
/// a filter set the user has left can be cancelled.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  tasks: Arc<Mutex<Vec<TrackedTask>>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Vec<TrackedTask>> {
    self.tasks.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn spawn<F>(&self, signature: Signature, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(task);
    let mut tasks = self.lock();
    tasks.retain(|t| !t.handle.is_finished());
    tasks.push(TrackedTask { signature, handle });
  }

  /// Abort unfinished tasks working for `signature`. Returns how many.
  pub fn abort_signature(&self, signature: &Signature) -> usize {
    let mut tasks = self.lock();
    let mut aborted = 0;
    tasks.retain(|t| {
      if &t.signature != signature {
        return !t.handle.is_finished();
      }
      if !t.handle.is_finished() {
        t.handle.abort();
        aborted += 1;
      }
      false
    });
    if aborted > 0 {
      debug!(signature = signature.short(), aborted, "Cancelled background fetches");
    }
    aborted
  }

  pub fn abort_all(&self) {
    for task in self.lock().drain(..) {
      task.handle.abort();
    }
  }

  /// Number of tasks that have not finished yet.
  pub fn pending(&self) -> usize {
    self.lock().iter().filter(|t| !t.handle.is_finished()).count()
  }

  /// Wait until every tracked task, including ones spawned meanwhile, is done.
  pub async fn drain(&self) {
    loop {
      let handles: Vec<JoinHandle<()>> = self.lock().drain(..).map(|t| t.handle).collect();
      if handles.is_empty() {
        break;
      }
      // Aborted tasks resolve with a JoinError, which is expected here
      let _ = futures::future::join_all(handles).await;
    }
  }
}
