//! Queued operation record and its lifecycle states.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
  /// Waiting for the next drain
  Pending,
  /// Apply in progress
  Syncing,
  /// Last apply failed, will be retried
  Failed,
  /// Applied; the record is deleted right after
  Completed,
}

impl OperationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Failed => "failed",
      Self::Completed => "completed",
    }
  }

  /// Parse a stored status. Unknown values load as pending so the record is retried.
  pub fn parse(s: &str) -> Self {
    match s {
      "syncing" => Self::Syncing,
      "failed" => Self::Failed,
      "completed" => Self::Completed,
      _ => Self::Pending,
    }
  }

  /// Whether a drain should attempt this operation.
  pub fn is_retryable(&self) -> bool {
    // A record left in `syncing` means the process died mid-apply.
    !matches!(self, Self::Completed)
  }
}

impl std::fmt::Display for OperationStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.pad(self.as_str())
  }
}

/// A mutation waiting to be replayed against the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: String,
  #[serde(rename = "type")]
  pub op_type: String,
  pub payload: Value,
  /// Creation time in milliseconds since the Unix epoch
  pub timestamp: i64,
  pub retries: u32,
  pub status: OperationStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl QueuedOperation {
  /// Create a new pending operation with a fresh id.
  pub fn new(op_type: impl Into<String>, payload: Value) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      op_type: op_type.into(),
      payload,
      timestamp: Utc::now().timestamp_millis(),
      retries: 0,
      status: OperationStatus::Pending,
      last_error: None,
    }
  }
}
