//! Filter criteria and the cache keys derived from them.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::api::types::{Role, UserType};

/// Named criteria narrowing the users list.
///
/// `None` / empty values mean "no constraint" and are the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FilterSet {
  pub role: Option<Role>,
  pub search: String,
  pub verified: Option<bool>,
  pub user_type: Option<UserType>,
}

impl FilterSet {
  pub fn with_role(mut self, role: Role) -> Self {
    self.role = Some(role);
    self
  }

  pub fn with_search(mut self, search: impl Into<String>) -> Self {
    self.search = search.into();
    self
  }

  pub fn with_verified(mut self, verified: bool) -> Self {
    self.verified = Some(verified);
    self
  }

  pub fn with_user_type(mut self, user_type: UserType) -> Self {
    self.user_type = Some(user_type);
    self
  }

  /// Normalized search text, empty when the search box is blank.
  pub fn normalized_search(&self) -> String {
    normalize_search(&self.search)
  }

  /// Non-default criteria as sorted name/value pairs.
  pub fn canonical_pairs(&self) -> BTreeMap<&'static str, String> {
    let mut pairs = BTreeMap::new();
    if let Some(role) = self.role {
      pairs.insert("role", role.as_str().to_string());
    }
    let search = self.normalized_search();
    if !search.is_empty() {
      pairs.insert("search", search);
    }
    if let Some(verified) = self.verified {
      pairs.insert("verified", verified.to_string());
    }
    if let Some(user_type) = self.user_type {
      pairs.insert("user_type", user_type.as_str().to_string());
    }
    pairs
  }

  /// Stable, order-independent identity of this filter set.
  pub fn signature(&self) -> Signature {
    let input = self
      .canonical_pairs()
      .iter()
      .map(|(name, value)| format!("{}={}", name, value))
      .collect::<Vec<_>>()
      .join("&");

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Signature(hex::encode(hasher.finalize()))
  }
}

/// Normalize search text for consistent hashing.
/// Collapses whitespace and lowercases for case-insensitive matching.
fn normalize_search(search: &str) -> String {
  search
    .split_whitespace()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase()
}

/// Canonical filter-set signature (hex SHA-256 of the sorted criteria).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(String);

impl Signature {
  pub fn from_hex(hex: impl Into<String>) -> Self {
    Self(hex.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Short form for log lines.
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(12)]
  }
}

impl fmt::Display for Signature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identity of one cached page.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
  pub signature: Signature,
  pub page_size: u32,
  pub page: u32,
}

impl CacheKey {
  pub fn new(page: u32, page_size: u32, filters: &FilterSet) -> Self {
    Self {
      signature: filters.signature(),
      page_size,
      page,
    }
  }

  /// Same filter set and page size, different page.
  pub fn sibling(&self, page: u32) -> Self {
    Self {
      signature: self.signature.clone(),
      page_size: self.page_size,
      page,
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}:{}:{}",
      self.signature.short(),
      self.page_size,
      self.page
    )
  }
}
