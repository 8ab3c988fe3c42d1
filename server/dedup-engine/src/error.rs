//! Structured error types for the dedup engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  /// Malformed input; rejected before any record is touched.
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  /// The ledger could not complete an operation (I/O failure, timeout, contention).
  #[error("store unavailable: {0}")]
  StoreUnavailable(String),

  /// Escalation delivery failed after the escalation was committed.
  #[error("notifier: {0}")]
  Notifier(String),

  #[error("config: {key}: {reason}")]
  Config { key: String, reason: String },

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl EngineError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn store(msg: impl Into<String>) -> Self {
    Self::StoreUnavailable(msg.into())
  }

  pub fn notifier(msg: impl Into<String>) -> Self {
    Self::Notifier(msg.into())
  }

  pub fn config(key: &str, reason: impl Into<String>) -> Self {
    Self::Config {
      key: key.to_string(),
      reason: reason.into(),
    }
  }
}

impl From<sqlx_core::Error> for EngineError {
  fn from(e: sqlx_core::Error) -> Self {
    Self::StoreUnavailable(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, EngineError>;
