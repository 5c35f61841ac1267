//! Serde types matching the users API payloads.
//!
//! These types are separate from domain types to allow lenient
//! deserialization while keeping domain types focused on application needs.

use serde::{Deserialize, Deserializer, Serialize};

use super::types::{ListPage, User, UserId};
use crate::error::{ListError, Result};

// ============================================================================
// List endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiUser {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: UserId,
  #[serde(default)]
  pub email: String,
  #[serde(default)]
  pub name: String,
  pub role: String,
  #[serde(alias = "userType", default)]
  pub user_type: Option<String>,
  #[serde(alias = "isVerified", alias = "is_verified", default)]
  pub verified: bool,
  #[serde(alias = "createdAt", default)]
  pub created_at: String,
}

impl ApiUser {
  pub fn into_user(self) -> Result<User> {
    let user_type = match self.user_type.as_deref() {
      Some(t) if !t.is_empty() => t.parse()?,
      _ => super::types::UserType::Individual,
    };
    Ok(User {
      role: self.role.parse().map_err(|_| {
        ListError::Network(format!("Unexpected role '{}' for user {}", self.role, self.id))
      })?,
      id: self.id,
      email: self.email,
      name: self.name,
      user_type,
      verified: self.verified,
      created_at: self.created_at,
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiListResponse {
  #[serde(default)]
  pub items: Vec<ApiUser>,
  #[serde(default)]
  pub total: u64,
  #[serde(rename = "totalPages", alias = "total_pages", default)]
  pub total_pages: u32,
}

impl ApiListResponse {
  pub fn into_page(self) -> Result<ListPage> {
    let items = self
      .items
      .into_iter()
      .map(ApiUser::into_user)
      .collect::<Result<Vec<_>>>()?;
    Ok(ListPage {
      items,
      total: self.total,
      total_pages: self.total_pages,
    })
  }
}

// ============================================================================
// Mutation request bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiUpdateFieldRequest<'a> {
  pub ids: &'a [UserId],
  pub field: &'static str,
  pub value: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ApiDeleteRequest<'a> {
  pub ids: &'a [UserId],
}

// ============================================================================
// Error body
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ApiErrorBody {
  #[serde(alias = "error", default)]
  pub message: String,
  #[serde(default)]
  pub field: Option<String>,
}

/// Ids arrive as strings or numbers depending on the backing store.
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<UserId, D::Error>
where
  D: Deserializer<'de>,
{
  match serde_json::Value::deserialize(deserializer)? {
    serde_json::Value::String(s) => Ok(s),
    serde_json::Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}
