//! Error taxonomy shared by the cache, the coordinators and the API client.

use thiserror::Error;

/// Errors surfaced by list reads, mutations and saves.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListError {
  /// Transport failure, timeout or unexpected server response.
  /// Eligible for silent stale fallback or user retry.
  #[error("Network error: {0}")]
  Network(String),

  /// Rejected input. Never retried, raised before any mutation is attempted.
  #[error("Invalid {field}: {reason}")]
  Validation { field: String, reason: String },

  /// A save is already in flight for this session.
  #[error("Busy: {0}")]
  Conflict(String),

  /// The referenced entity no longer exists on the server.
  #[error("Not found: {0}")]
  NotFound(String),

  /// Cache backend failure (lock poisoned, SQLite error, corrupt row).
  #[error("Cache storage error: {0}")]
  Storage(String),
}

impl ListError {
  pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::Validation {
      field: field.into(),
      reason: reason.into(),
    }
  }

  /// Whether the user may reasonably retry the same operation.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Network(_))
  }

  /// Whether this is the single-flight "busy" rejection rather than a failure.
  pub fn is_busy(&self) -> bool {
    matches!(self, Self::Conflict(_))
  }
}

impl From<rusqlite::Error> for ListError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Storage(err.to_string())
  }
}

impl<T> From<std::sync::PoisonError<T>> for ListError {
  fn from(err: std::sync::PoisonError<T>) -> Self {
    Self::Storage(format!("Lock poisoned: {}", err))
  }
}

pub type Result<T> = std::result::Result<T, ListError>;
