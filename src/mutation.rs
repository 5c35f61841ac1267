//! Optimistic mutations with exact rollback, and the single-flight save
//! pipeline.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::types::{FieldUpdate, Role, User, UserDraft, UserId};
use crate::api::{with_timeout, UsersApi};
use crate::cache::{CacheStore, DatasetSnapshot};
use crate::error::{ListError, Result};
use crate::event::{EventSender, ListEvent};
use crate::filters::CacheKey;
use crate::view::ViewHandle;

/// What a mutation does to its targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
  Update(FieldUpdate),
  Delete,
}

/// An optimistic change to the visible page, carrying enough state to undo it.
#[derive(Debug, Clone)]
pub struct MutationIntent {
  /// Page the change was applied to
  pub key: CacheKey,
  pub target_ids: Vec<UserId>,
  pub kind: MutationKind,
  pub before: Arc<DatasetSnapshot>,
  pub after: Arc<DatasetSnapshot>,
}

impl MutationIntent {
  pub fn new(
    key: CacheKey,
    before: Arc<DatasetSnapshot>,
    target_ids: Vec<UserId>,
    kind: MutationKind,
  ) -> Result<Self> {
    if target_ids.is_empty() {
      return Err(ListError::validation("ids", "no users selected"));
    }
    if let Some(missing) = target_ids.iter().find(|id| before.find(id).is_none()) {
      return Err(ListError::validation(
        "ids",
        format!("user {} is not on this page", missing),
      ));
    }

    let mut after = (*before).clone();
    match kind {
      MutationKind::Update(update) => {
        for user in after.items.iter_mut().filter(|u| target_ids.contains(&u.id)) {
          update.apply(user);
        }
      }
      MutationKind::Delete => {
        after.items.retain(|u| !target_ids.contains(&u.id));
        after.total_items = after.total_items.saturating_sub(target_ids.len() as u64);
      }
    }

    Ok(Self {
      key,
      target_ids,
      kind,
      before,
      after: Arc::new(after),
    })
  }

  /// The optimistic snapshot.
  pub fn apply(&self) -> Arc<DatasetSnapshot> {
    self.after.clone()
  }

  /// Undo this intent on `current`.
  ///
  /// If nothing else changed the page since `apply`, the exact `before`
  /// snapshot comes back. Otherwise only this intent's effect is reverted,
  /// so other in-flight optimistic changes survive.
  pub fn rollback(&self, current: &Arc<DatasetSnapshot>) -> Arc<DatasetSnapshot> {
    if Arc::ptr_eq(current, &self.after) || **current == *self.after {
      return self.before.clone();
    }

    let mut restored = (**current).clone();
    match self.kind {
      MutationKind::Update(update) => {
        for user in restored
          .items
          .iter_mut()
          .filter(|u| self.target_ids.contains(&u.id))
        {
          if let Some(before) = self.before.find(&user.id) {
            update.restore(user, before);
          }
        }
      }
      MutationKind::Delete => {
        let mut reinserted = 0u64;
        for (index, user) in self.before.items.iter().enumerate() {
          if !self.target_ids.contains(&user.id) || restored.find(&user.id).is_some() {
            continue;
          }
          let at = index.min(restored.items.len());
          restored.items.insert(at, user.clone());
          reinserted += 1;
        }
        restored.total_items += reinserted;
      }
    }
    Arc::new(restored)
  }
}

/// Result of a mutation that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
  Applied,
  /// The user declined a confirmation; nothing was sent
  Cancelled,
}

/// Question put to the user before a bulk mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmPrompt {
  ChangeRole { count: usize, role: Role },
  Delete { count: usize },
  /// Second prompt for deletes
  DeleteIrreversible { count: usize },
}

/// Asks the user to confirm a bulk mutation.
pub trait Confirm: Send + Sync {
  fn confirm(&self, prompt: &ConfirmPrompt) -> bool;
}

/// Confirms everything. For non-interactive callers that already asked.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
  fn confirm(&self, _prompt: &ConfirmPrompt) -> bool {
    true
  }
}

/// Which save is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
  Create,
  Update,
}

/// Save pipeline state. At most one `Saving` at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SaveState {
  #[default]
  Idle,
  Saving(SaveKind),
  Succeeded,
  Failed(String),
}

/// A create or update of one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveRequest {
  Create(UserDraft),
  Update { id: UserId, draft: UserDraft },
}

impl SaveRequest {
  pub fn kind(&self) -> SaveKind {
    match self {
      SaveRequest::Create(_) => SaveKind::Create,
      SaveRequest::Update { .. } => SaveKind::Update,
    }
  }

  pub fn draft(&self) -> &UserDraft {
    match self {
      SaveRequest::Create(draft) => draft,
      SaveRequest::Update { draft, .. } => draft,
    }
  }
}

/// Moves the save state out of `Saving` even if the save future is dropped.
struct SaveFlight {
  state: Arc<Mutex<SaveState>>,
  events: EventSender,
  finished: bool,
}

impl SaveFlight {
  fn finish(mut self, state: SaveState) {
    self.finished = true;
    self.set(state);
  }

  fn set(&self, state: SaveState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
    let _ = self.events.send(ListEvent::SaveState(state));
  }
}

impl Drop for SaveFlight {
  fn drop(&mut self) {
    if !self.finished {
      self.set(SaveState::Failed("save cancelled".to_string()));
    }
  }
}

/// Applies mutations optimistically to the visible page and reconciles the
/// cache once the server answers.
#[derive(Clone)]
pub struct MutationCoordinator {
  api: Arc<dyn UsersApi>,
  store: CacheStore,
  view: ViewHandle,
  events: EventSender,
  timeout: Duration,
  save_state: Arc<Mutex<SaveState>>,
}

impl MutationCoordinator {
  pub fn new(
    api: Arc<dyn UsersApi>,
    store: CacheStore,
    view: ViewHandle,
    events: EventSender,
    timeout: Duration,
  ) -> Self {
    Self {
      api,
      store,
      view,
      events,
      timeout,
      save_state: Arc::new(Mutex::new(SaveState::Idle)),
    }
  }

  /// Flip the verified flag of one visible user.
  pub async fn toggle_verified(&self, id: &str) -> Result<MutationOutcome> {
    let verified = self
      .view
      .snapshot()
      .and_then(|snapshot| snapshot.find(id).map(|u| u.verified))
      .ok_or_else(|| ListError::validation("id", format!("user {} is not on this page", id)))?;
    self.update_one(id, FieldUpdate::Verified(!verified)).await
  }

  /// Set one field of one visible user.
  pub async fn update_one(&self, id: &str, update: FieldUpdate) -> Result<MutationOutcome> {
    self
      .run(vec![id.to_string()], MutationKind::Update(update), false)
      .await
  }

  /// Change the role of every selected user, after one confirmation.
  pub async fn bulk_set_role(
    &self,
    ids: &[UserId],
    role: Role,
    confirm: &dyn Confirm,
  ) -> Result<MutationOutcome> {
    let ids = dedup(ids)?;
    if !confirm.confirm(&ConfirmPrompt::ChangeRole {
      count: ids.len(),
      role,
    }) {
      return Ok(MutationOutcome::Cancelled);
    }
    self
      .run(ids, MutationKind::Update(FieldUpdate::Role(role)), true)
      .await
  }

  /// Delete every selected user, after two confirmations.
  pub async fn bulk_delete(&self, ids: &[UserId], confirm: &dyn Confirm) -> Result<MutationOutcome> {
    let ids = dedup(ids)?;
    let count = ids.len();
    if !confirm.confirm(&ConfirmPrompt::Delete { count })
      || !confirm.confirm(&ConfirmPrompt::DeleteIrreversible { count })
    {
      return Ok(MutationOutcome::Cancelled);
    }
    self.run(ids, MutationKind::Delete, true).await
  }

  async fn run(&self, ids: Vec<UserId>, kind: MutationKind, batch: bool) -> Result<MutationOutcome> {
    let intent = self.begin(ids, kind)?;

    let call = async {
      match kind {
        MutationKind::Update(update) => self.api.update_field(&intent.target_ids, update).await,
        MutationKind::Delete => self.api.delete(&intent.target_ids).await,
      }
    };
    let result = with_timeout(self.timeout, call).await;

    match result {
      Ok(()) => {
        self.settle(&intent);
        info!(count = intent.target_ids.len(), ?kind, "Mutation confirmed");
        // Any page of any filter set may contain the changed rows
        self.store.invalidate_all()?;
        Ok(MutationOutcome::Applied)
      }
      Err(error) => {
        self.roll_back(&intent, &error, batch);
        if matches!(error, ListError::NotFound(_)) {
          self.store.invalidate_all()?;
        }
        Err(error)
      }
    }
  }

  /// Apply the intent to the visible page and mark its rows pending.
  fn begin(&self, ids: Vec<UserId>, kind: MutationKind) -> Result<MutationIntent> {
    let mut view = self.view.lock();
    let (Some(key), Some(current)) = (view.key.clone(), view.snapshot.clone()) else {
      return Err(ListError::validation("page", "no page is loaded"));
    };
    if let Some(busy) = ids.iter().find(|id| view.pending.contains(*id)) {
      return Err(ListError::Conflict(format!(
        "a change to user {} is still pending",
        busy
      )));
    }

    let intent = MutationIntent::new(key, current, ids, kind)?;
    view.snapshot = Some(intent.apply());
    for id in &intent.target_ids {
      view.pending.insert(id.clone());
      view.row_errors.remove(id);
    }
    view.batch_error = None;
    Ok(intent)
  }

  fn settle(&self, intent: &MutationIntent) {
    let mut view = self.view.lock();
    for id in &intent.target_ids {
      view.pending.remove(id);
    }
  }

  fn roll_back(&self, intent: &MutationIntent, error: &ListError, batch: bool) {
    let mut view = self.view.lock();
    for id in &intent.target_ids {
      view.pending.remove(id);
    }

    if view.key.as_ref() == Some(&intent.key) {
      if let Some(current) = view.snapshot.clone() {
        view.snapshot = Some(intent.rollback(&current));
      }
    }

    if batch {
      view.batch_error = Some(error.clone());
    } else {
      for id in &intent.target_ids {
        view.row_errors.insert(id.clone(), error.clone());
      }
    }
    drop(view);

    warn!(
      count = intent.target_ids.len(),
      kind = ?intent.kind,
      error = %error,
      "Mutation failed, rolled back"
    );
    let _ = self.events.send(ListEvent::RolledBack {
      ids: intent.target_ids.clone(),
      error: error.clone(),
    });
  }

  pub fn save_state(&self) -> SaveState {
    self
      .save_state
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Return a finished save pipeline to `Idle`.
  pub fn acknowledge_save(&self) {
    let mut state = self.save_state.lock().unwrap_or_else(|e| e.into_inner());
    if matches!(*state, SaveState::Succeeded | SaveState::Failed(_)) {
      *state = SaveState::Idle;
    }
  }

  /// Create or update a user.
  ///
  /// Rejected with `ListError::Conflict` without touching the network while
  /// another save is in flight.
  pub async fn save(&self, request: SaveRequest) -> Result<User> {
    request.draft().validate()?;

    let flight = {
      let mut state = self.save_state.lock()?;
      if let SaveState::Saving(kind) = *state {
        debug!(?kind, "Save rejected, another save is in flight");
        return Err(ListError::Conflict("a save is already in flight".to_string()));
      }
      *state = SaveState::Saving(request.kind());
      SaveFlight {
        state: self.save_state.clone(),
        events: self.events.clone(),
        finished: false,
      }
    };
    let _ = self
      .events
      .send(ListEvent::SaveState(SaveState::Saving(request.kind())));

    let result = match &request {
      SaveRequest::Create(draft) => with_timeout(self.timeout, self.api.create(draft)).await,
      SaveRequest::Update { id, draft } => {
        with_timeout(self.timeout, self.api.update(id, draft)).await
      }
    };

    match result {
      Ok(user) => {
        let invalidated = self.store.invalidate_all();
        flight.finish(SaveState::Succeeded);
        info!(id = %user.id, "Saved user");
        invalidated?;
        Ok(user)
      }
      Err(error) => {
        flight.finish(SaveState::Failed(error.to_string()));
        warn!(error = %error, "Save failed");
        if matches!(error, ListError::NotFound(_)) {
          self.store.invalidate_all()?;
        }
        Err(error)
      }
    }
  }
}

fn dedup(ids: &[UserId]) -> Result<Vec<UserId>> {
  let mut seen = BTreeSet::new();
  let ids: Vec<UserId> = ids
    .iter()
    .filter(|id| seen.insert(id.as_str()))
    .cloned()
    .collect();
  if ids.is_empty() {
    return Err(ListError::validation("ids", "no users selected"));
  }
  Ok(ids)
}
