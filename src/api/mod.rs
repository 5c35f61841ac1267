//! Remote users API: the list-fetch endpoint and the mutation endpoints.

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod types;
pub mod wire;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{ListError, Result};
use types::{FieldUpdate, ListPage, ListRequest, User, UserDraft, UserId};

pub use client::HttpUsersApi;

/// Remote data store behind the users list.
///
/// Every mutation is all-or-nothing per call.
#[async_trait]
pub trait UsersApi: Send + Sync {
  /// Fetch one page. Read-only and idempotent.
  async fn list(&self, request: &ListRequest) -> Result<ListPage>;

  /// Set one field to the same value on every id.
  async fn update_field(&self, ids: &[UserId], update: FieldUpdate) -> Result<()>;

  async fn delete(&self, ids: &[UserId]) -> Result<()>;

  async fn create(&self, draft: &UserDraft) -> Result<User>;

  async fn update(&self, id: &str, draft: &UserDraft) -> Result<User>;
}

/// Bound a network call, reporting an elapsed deadline as a network error.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T>
where
  F: Future<Output = Result<T>>,
{
  tokio::time::timeout(timeout, call)
    .await
    .map_err(|_| ListError::Network(format!("request timed out after {:?}", timeout)))?
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_timeout_is_a_network_error() {
    let result: Result<()> = with_timeout(Duration::from_millis(10), async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(())
    })
    .await;
    assert!(matches!(result, Err(ListError::Network(_))));
  }

  #[tokio::test]
  async fn test_timeout_passes_through_results() {
    let ok = with_timeout(Duration::from_secs(1), async { Ok(5) }).await;
    assert_eq!(ok, Ok(5));

    let err: Result<()> = with_timeout(Duration::from_secs(1), async {
      Err(ListError::NotFound("user 1".into()))
    })
    .await;
    assert_eq!(err, Err(ListError::NotFound("user 1".into())));
  }
}
