//! Domain types of the users list.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ListError, Result};
use crate::filters::FilterSet;

pub type UserId = String;

/// Access role of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Admin,
  Moderator,
  Member,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Admin => "admin",
      Role::Moderator => "moderator",
      Role::Member => "member",
    }
  }
}

impl FromStr for Role {
  type Err = ListError;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "admin" => Ok(Role::Admin),
      "moderator" => Ok(Role::Moderator),
      "member" => Ok(Role::Member),
      other => Err(ListError::validation("role", format!("unknown role '{}'", other))),
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Account kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
  Individual,
  Business,
}

impl UserType {
  pub fn as_str(&self) -> &'static str {
    match self {
      UserType::Individual => "individual",
      UserType::Business => "business",
    }
  }
}

impl FromStr for UserType {
  type Err = ListError;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "individual" => Ok(UserType::Individual),
      "business" => Ok(UserType::Business),
      other => Err(ListError::validation(
        "user_type",
        format!("unknown user type '{}'", other),
      )),
    }
  }
}

impl fmt::Display for UserType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A row of the users list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: UserId,
  pub email: String,
  pub name: String,
  pub role: Role,
  pub user_type: UserType,
  pub verified: bool,
  #[serde(default)]
  pub created_at: String,
}

/// A single-field change applied to one or more users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate {
  Role(Role),
  Verified(bool),
  UserType(UserType),
}

impl FieldUpdate {
  /// Wire name of the updated field
  pub fn field(&self) -> &'static str {
    match self {
      FieldUpdate::Role(_) => "role",
      FieldUpdate::Verified(_) => "verified",
      FieldUpdate::UserType(_) => "user_type",
    }
  }

  /// Wire value of the update
  pub fn value(&self) -> serde_json::Value {
    match self {
      FieldUpdate::Role(role) => serde_json::Value::from(role.as_str()),
      FieldUpdate::Verified(verified) => serde_json::Value::from(*verified),
      FieldUpdate::UserType(user_type) => serde_json::Value::from(user_type.as_str()),
    }
  }

  pub fn apply(&self, user: &mut User) {
    match *self {
      FieldUpdate::Role(role) => user.role = role,
      FieldUpdate::Verified(verified) => user.verified = verified,
      FieldUpdate::UserType(user_type) => user.user_type = user_type,
    }
  }

  /// Copy only the field this update touches from `before` into `user`.
  pub fn restore(&self, user: &mut User, before: &User) {
    match self {
      FieldUpdate::Role(_) => user.role = before.role,
      FieldUpdate::Verified(_) => user.verified = before.verified,
      FieldUpdate::UserType(_) => user.user_type = before.user_type,
    }
  }
}

/// Editable fields of a user, used by create and update saves
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserDraft {
  pub email: String,
  pub name: String,
  pub role: Role,
  pub user_type: UserType,
  pub verified: bool,
}

impl UserDraft {
  pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      email: email.into(),
      name: name.into(),
      role: Role::Member,
      user_type: UserType::Individual,
      verified: false,
    }
  }

  /// Gate a save: only well-formed drafts reach the network.
  pub fn validate(&self) -> Result<()> {
    let email = self.email.trim();
    match email.split_once('@') {
      Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
      _ => {
        return Err(ListError::validation(
          "email",
          format!("'{}' is not an email address", email),
        ))
      }
    }

    if self.name.trim().is_empty() {
      return Err(ListError::validation("name", "must not be blank"));
    }

    Ok(())
  }
}

/// Parameters of one list-fetch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
  pub page: u32,
  pub page_size: u32,
  pub filters: FilterSet,
}

/// One page as returned by the list endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
  pub items: Vec<User>,
  pub total: u64,
  pub total_pages: u32,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn user() -> User {
    User {
      id: "u1".to_string(),
      email: "ada@example.com".to_string(),
      name: "Ada".to_string(),
      role: Role::Member,
      user_type: UserType::Individual,
      verified: false,
      created_at: "2024-01-01T00:00:00Z".to_string(),
    }
  }

  #[test]
  fn test_role_parse_is_case_insensitive() {
    assert_eq!("Admin".parse::<Role>().ok(), Some(Role::Admin));
    assert_eq!(" member ".parse::<Role>().ok(), Some(Role::Member));
    assert!("owner".parse::<Role>().is_err());
  }

  #[test]
  fn test_restore_only_touches_updated_field() {
    let before = user();
    let mut current = before.clone();
    FieldUpdate::Verified(true).apply(&mut current);
    current.name = "Ada L.".to_string();

    FieldUpdate::Verified(true).restore(&mut current, &before);
    assert!(!current.verified);
    assert_eq!(current.name, "Ada L.");
  }

  #[test]
  fn test_draft_validation() {
    assert!(UserDraft::new("ada@example.com", "Ada").validate().is_ok());
    assert!(UserDraft::new("ada.example.com", "Ada").validate().is_err());
    assert!(UserDraft::new("@example.com", "Ada").validate().is_err());
    assert!(UserDraft::new("ada@example.com", "   ").validate().is_err());
  }

  #[test]
  fn test_update_wire_values() {
    assert_eq!(FieldUpdate::Role(Role::Admin).field(), "role");
    assert_eq!(FieldUpdate::Role(Role::Admin).value(), serde_json::json!("admin"));
    assert_eq!(FieldUpdate::Verified(true).value(), serde_json::json!(true));
  }
}
