//! In-memory users API for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::types::{FieldUpdate, ListPage, ListRequest, Role, User, UserDraft, UserId, UserType};
use super::UsersApi;
use crate::error::{ListError, Result};
use crate::filters::FilterSet;

#[derive(Default)]
pub struct FakeUsersApi {
  users: Mutex<Vec<User>>,
  list_log: Mutex<Vec<ListRequest>>,
  mutation_calls: AtomicUsize,
  list_failure: Mutex<Option<ListError>>,
  mutation_failure: Mutex<Option<ListError>>,
  list_delay: Mutex<Duration>,
  list_gate: Mutex<Option<Arc<Semaphore>>>,
  mutation_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeUsersApi {
  /// `count` users with ids `u1..=u{count}`.
  pub fn seeded(count: usize) -> Arc<Self> {
    let users = (1..=count)
      .map(|i| User {
        id: format!("u{}", i),
        email: format!("user{}@example.com", i),
        name: format!("User {}", i),
        role: if i % 4 == 0 { Role::Admin } else { Role::Member },
        user_type: if i % 3 == 0 {
          UserType::Business
        } else {
          UserType::Individual
        },
        verified: i % 2 == 0,
        created_at: format!("2024-01-{:02}T00:00:00Z", (i % 28) + 1),
      })
      .collect();
    Arc::new(Self {
      users: Mutex::new(users),
      ..Self::default()
    })
  }

  pub fn list_calls(&self) -> usize {
    self.list_log.lock().unwrap().len()
  }

  pub fn list_log(&self) -> Vec<ListRequest> {
    self.list_log.lock().unwrap().clone()
  }

  /// Number of list calls for one page of one filter set.
  pub fn list_calls_for(&self, page: u32, filters: &FilterSet) -> usize {
    let signature = filters.signature();
    self
      .list_log
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.page == page && r.filters.signature() == signature)
      .count()
  }

  pub fn mutation_calls(&self) -> usize {
    self.mutation_calls.load(Ordering::SeqCst)
  }

  pub fn user(&self, id: &str) -> Option<User> {
    self.users.lock().unwrap().iter().find(|u| u.id == id).cloned()
  }

  pub fn remove_user(&self, id: &str) {
    self.users.lock().unwrap().retain(|u| u.id != id);
  }

  pub fn fail_lists(&self, error: Option<ListError>) {
    *self.list_failure.lock().unwrap() = error;
  }

  pub fn fail_mutations(&self, error: Option<ListError>) {
    *self.mutation_failure.lock().unwrap() = error;
  }

  pub fn set_list_delay(&self, delay: Duration) {
    *self.list_delay.lock().unwrap() = delay;
  }

  /// Block list calls until `release_lists` hands out permits.
  pub fn hold_lists(&self) {
    *self.list_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release_lists(&self, calls: usize) {
    if let Some(gate) = self.list_gate.lock().unwrap().as_ref() {
      gate.add_permits(calls);
    }
  }

  /// Block mutation calls until `release_mutations` hands out permits.
  pub fn hold_mutations(&self) {
    *self.mutation_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release_mutations(&self, calls: usize) {
    if let Some(gate) = self.mutation_gate.lock().unwrap().as_ref() {
      gate.add_permits(calls);
    }
  }

  async fn pass(gate: &Mutex<Option<Arc<Semaphore>>>) {
    let gate = gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }
  }

  async fn begin_mutation(&self) -> Result<()> {
    self.mutation_calls.fetch_add(1, Ordering::SeqCst);
    Self::pass(&self.mutation_gate).await;
    match self.mutation_failure.lock().unwrap().clone() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }

  fn require_all(users: &[User], ids: &[UserId]) -> Result<()> {
    for id in ids {
      if !users.iter().any(|u| &u.id == id) {
        return Err(ListError::NotFound(format!("user {}", id)));
      }
    }
    Ok(())
  }
}

fn matches(user: &User, filters: &FilterSet) -> bool {
  if filters.role.is_some_and(|role| user.role != role) {
    return false;
  }
  if filters.verified.is_some_and(|verified| user.verified != verified) {
    return false;
  }
  if filters.user_type.is_some_and(|t| user.user_type != t) {
    return false;
  }
  let search = filters.normalized_search();
  search.is_empty()
    || user.name.to_lowercase().contains(&search)
    || user.email.to_lowercase().contains(&search)
}

#[async_trait]
impl UsersApi for FakeUsersApi {
  async fn list(&self, request: &ListRequest) -> Result<ListPage> {
    self.list_log.lock().unwrap().push(request.clone());
    let delay = *self.list_delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    Self::pass(&self.list_gate).await;

    if let Some(error) = self.list_failure.lock().unwrap().clone() {
      return Err(error);
    }

    let users = self.users.lock().unwrap();
    let matching: Vec<&User> = users.iter().filter(|u| matches(u, &request.filters)).collect();
    let total = matching.len() as u64;
    let page_size = request.page_size.max(1) as usize;
    let total_pages = matching.len().div_ceil(page_size) as u32;
    let start = (request.page.saturating_sub(1) as usize) * page_size;
    let items = matching
      .into_iter()
      .skip(start)
      .take(page_size)
      .cloned()
      .collect();

    Ok(ListPage {
      items,
      total,
      total_pages,
    })
  }

  async fn update_field(&self, ids: &[UserId], update: FieldUpdate) -> Result<()> {
    self.begin_mutation().await?;
    let mut users = self.users.lock().unwrap();
    Self::require_all(&users, ids)?;
    for user in users.iter_mut().filter(|u| ids.contains(&u.id)) {
      update.apply(user);
    }
    Ok(())
  }

  async fn delete(&self, ids: &[UserId]) -> Result<()> {
    self.begin_mutation().await?;
    let mut users = self.users.lock().unwrap();
    Self::require_all(&users, ids)?;
    users.retain(|u| !ids.contains(&u.id));
    Ok(())
  }

  async fn create(&self, draft: &UserDraft) -> Result<User> {
    self.begin_mutation().await?;
    let mut users = self.users.lock().unwrap();
    let user = User {
      id: format!("u{}", users.len() + 1000),
      email: draft.email.clone(),
      name: draft.name.clone(),
      role: draft.role,
      user_type: draft.user_type,
      verified: draft.verified,
      created_at: "2024-06-01T00:00:00Z".to_string(),
    };
    users.push(user.clone());
    Ok(user)
  }

  async fn update(&self, id: &str, draft: &UserDraft) -> Result<User> {
    self.begin_mutation().await?;
    let mut users = self.users.lock().unwrap();
    let user = users
      .iter_mut()
      .find(|u| u.id == id)
      .ok_or_else(|| ListError::NotFound(format!("user {}", id)))?;
    user.email = draft.email.clone();
    user.name = draft.name.clone();
    user.role = draft.role;
    user.user_type = draft.user_type;
    user.verified = draft.verified;
    Ok(user.clone())
  }
}
