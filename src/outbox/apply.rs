//! Host-supplied mapping from operation type to network call.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::operation::QueuedOperation;
use crate::error::NetworkError;

pub type ApplyFuture = BoxFuture<'static, Result<(), NetworkError>>;

type ApplyFn = Arc<dyn Fn(QueuedOperation) -> ApplyFuture + Send + Sync>;

/// Table of apply functions, one per operation type.
///
/// The engine treats payloads as opaque; only these functions know how a
/// queued operation turns into a request.
#[derive(Clone, Default)]
pub struct ApplyRegistry {
  handlers: HashMap<String, ApplyFn>,
}

impl ApplyRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the apply function for `op_type`, replacing any previous one.
  pub fn register<F, Fut>(&mut self, op_type: impl Into<String>, apply: F) -> &mut Self
  where
    F: Fn(QueuedOperation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), NetworkError>> + Send + 'static,
  {
    let handler: ApplyFn = Arc::new(move |op| apply(op).boxed());
    self.handlers.insert(op_type.into(), handler);
    self
  }

  /// Builder form of [`register`](Self::register).
  pub fn with<F, Fut>(mut self, op_type: impl Into<String>, apply: F) -> Self
  where
    F: Fn(QueuedOperation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), NetworkError>> + Send + 'static,
  {
    self.register(op_type, apply);
    self
  }

  pub fn contains(&self, op_type: &str) -> bool {
    self.handlers.contains_key(op_type)
  }

  pub fn types(&self) -> impl Iterator<Item = &str> {
    self.handlers.keys().map(String::as_str)
  }

  /// Run the apply function for `op`.
  ///
  /// A type with nothing registered fails like a network error so the
  /// operation is retried and eventually dead-lettered rather than lost.
  pub async fn apply(&self, op: &QueuedOperation) -> Result<(), NetworkError> {
    match self.handlers.get(&op.op_type) {
      Some(handler) => handler(op.clone()).await,
      None => Err(NetworkError::NoRoute(op.op_type.clone())),
    }
  }
}

impl fmt::Debug for ApplyRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut types: Vec<&str> = self.types().collect();
    types.sort_unstable();
    f.debug_struct("ApplyRegistry").field("types", &types).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_dispatches_by_type() {
    let registry = ApplyRegistry::new()
      .with("sale", |_op| async { Ok(()) })
      .with("refund", |op: QueuedOperation| async move {
        Err(NetworkError::Request(format!("refund {} rejected", op.payload["id"])))
      });

    assert!(registry.contains("sale"));
    assert!(registry
      .apply(&QueuedOperation::new("sale", json!({})))
      .await
      .is_ok());
    assert_eq!(
      registry
        .apply(&QueuedOperation::new("refund", json!({"id": 4})))
        .await,
      Err(NetworkError::Request("refund 4 rejected".to_string()))
    );
  }

  #[tokio::test]
  async fn test_unregistered_type_fails() {
    let registry = ApplyRegistry::new();
    let result = registry
      .apply(&QueuedOperation::new("payroll_run", json!({})))
      .await;
    assert_eq!(
      result,
      Err(NetworkError::NoRoute("payroll_run".to_string()))
    );
  }
}
