//! Error types for the cache and outbox engine.

use thiserror::Error;

/// A failed network call.
///
/// Cloneable so a single failure can be handed to every caller that was
/// waiting on the same deduplicated request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("Request failed: {0}")]
  Request(String),

  #[error("Server returned {status}: {body}")]
  Status { status: u16, body: String },

  #[error("Invalid response body: {0}")]
  Decode(String),

  #[error("No apply function registered for operation type '{0}'")]
  NoRoute(String),
}

/// Engine error type
#[derive(Error, Debug)]
pub enum SyncError {
  /// Transient failure, retried on the next drain.
  #[error("Network error: {0}")]
  Network(#[from] NetworkError),

  /// Retry budget exhausted; the operation was dropped from the queue.
  #[error("Operation {id} ({op_type}) failed permanently after {retries} attempts: {reason}")]
  PermanentApply {
    id: String,
    op_type: String,
    retries: u32,
    reason: String,
  },

  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Lock poisoned: {0}")]
  LockPoisoned(String),
}

impl SyncError {
  /// Whether a later drain may succeed where this one failed.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Network(_))
  }
}

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;
