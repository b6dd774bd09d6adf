//! Durable write-behind queue and its drain loop.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::apply::ApplyRegistry;
use super::operation::{OperationStatus, QueuedOperation};
use crate::db::Store;
use crate::error::{NetworkError, SyncError, SyncResult};

/// Configuration for the outbox.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
  /// Failed attempts after which an operation is dead-lettered
  pub max_retries: u32,
  /// Stop a drain at the first failure so nothing replays ahead of it
  pub stop_on_failure: bool,
  /// Dead letters kept until taken; the oldest are dropped past this
  pub max_dead_letters: usize,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      stop_on_failure: true,
      max_dead_letters: 100,
    }
  }
}

/// An operation dropped after exhausting its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
  pub operation: QueuedOperation,
  pub error: NetworkError,
}

impl DeadLetter {
  pub fn into_error(self) -> SyncError {
    SyncError::PermanentApply {
      id: self.operation.id,
      op_type: self.operation.op_type,
      retries: self.operation.retries,
      reason: self.error.to_string(),
    }
  }
}

/// Result of a single drain.
#[derive(Debug, Default)]
pub struct DrainReport {
  /// Ids applied and removed from the queue
  pub applied: Vec<String>,
  /// Ids that failed and stay queued for the next drain
  pub failed: Vec<String>,
  /// Operations dropped this drain
  pub dead_lettered: Vec<DeadLetter>,
  /// Another drain was already running; nothing was attempted
  pub skipped: bool,
}

impl DrainReport {
  fn skipped() -> Self {
    Self {
      skipped: true,
      ..Self::default()
    }
  }

  pub fn attempted(&self) -> usize {
    self.applied.len() + self.failed.len() + self.dead_lettered.len()
  }
}

/// Clears the syncing flag when a drain ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Queue of pending mutations.
///
/// Every enqueue, status change and delete is written to the store before
/// it counts, so a crash mid-drain leaves the last fully written state.
///
/// Dead letters live in memory only. The host is expected to collect them
/// with [`Outbox::take_dead_letters`]; a restart loses whatever was not taken
/// (each one is also logged at `warn` when it is dropped from the queue).
pub struct Outbox<S: Store> {
  store: Arc<S>,
  registry: ApplyRegistry,
  config: OutboxConfig,
  is_syncing: AtomicBool,
  /// Set by a drain that found another one running
  rerun: AtomicBool,
  pending: watch::Sender<usize>,
  dead_letters: Mutex<VecDeque<DeadLetter>>,
}

impl<S: Store> Outbox<S> {
  /// Create an outbox over `store`, picking up whatever is already queued.
  pub fn new(store: Arc<S>, registry: ApplyRegistry, config: OutboxConfig) -> SyncResult<Self> {
    let count = store.count_operations()?;
    if count > 0 {
      info!(count, "loaded queued operations");
    }
    let (pending, _) = watch::channel(count);

    Ok(Self {
      store,
      registry,
      config,
      is_syncing: AtomicBool::new(false),
      rerun: AtomicBool::new(false),
      pending,
      dead_letters: Mutex::new(VecDeque::new()),
    })
  }

  pub fn config(&self) -> &OutboxConfig {
    &self.config
  }

  /// Persist a new pending operation and return its id.
  pub fn enqueue(&self, op_type: &str, payload: Value) -> SyncResult<String> {
    let op = QueuedOperation::new(op_type, payload);
    self.store.insert_operation(&op)?;
    debug!(id = %op.id, op_type, "queued operation");
    self.refresh_pending();
    Ok(op.id)
  }

  /// Cancel a queued operation. Returns whether it was still queued.
  pub fn remove_from_queue(&self, id: &str) -> SyncResult<bool> {
    let removed = self.store.delete_operation(id)?;
    if removed {
      info!(id, "removed queued operation");
      self.refresh_pending();
    }
    Ok(removed)
  }

  /// Remove queued operations of one type, or all of them.
  pub fn clear(&self, op_type: Option<&str>) -> SyncResult<usize> {
    let removed = self.store.clear_operations(op_type)?;
    self.refresh_pending();
    Ok(removed)
  }

  /// Queued operations in replay order.
  pub fn operations(&self) -> SyncResult<Vec<QueuedOperation>> {
    self.store.list_operations()
  }

  pub fn pending_count(&self) -> SyncResult<usize> {
    self.store.count_operations()
  }

  /// Watch the number of queued operations.
  pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
    self.pending.subscribe()
  }

  pub fn is_syncing(&self) -> bool {
    self.is_syncing.load(Ordering::Acquire)
  }

  /// Take the operations dropped since the last call.
  pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
    let mut letters = self
      .dead_letters
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    letters.drain(..).collect()
  }

  /// Replay queued operations in creation order.
  ///
  /// A drain started while another is running returns a skipped report, and
  /// the running drain makes another pass before it finishes so anything
  /// queued in the meantime is not left behind.
  pub async fn drain(&self) -> SyncResult<DrainReport> {
    let mut report = DrainReport::default();
    let mut ran = false;

    let result = loop {
      let Some(guard) = SyncingGuard::acquire(&self.is_syncing) else {
        self.rerun.store(true, Ordering::SeqCst);
        if ran {
          break Ok(());
        }
        debug!("drain already in progress");
        return Ok(DrainReport::skipped());
      };
      ran = true;

      let result = loop {
        self.rerun.store(false, Ordering::SeqCst);
        if let Err(e) = self.drain_queue(&mut report).await {
          break Err(e);
        }
        if !self.rerun.load(Ordering::SeqCst) {
          break Ok(());
        }
        debug!("operations queued during drain, draining again");
      };
      drop(guard);

      // A skipped drain may have landed between the last check and the release
      if result.is_err() || !self.rerun.load(Ordering::SeqCst) {
        break result;
      }
    };
    self.refresh_pending();

    if report.attempted() > 0 {
      info!(
        applied = report.applied.len(),
        failed = report.failed.len(),
        dead_lettered = report.dead_lettered.len(),
        "drain finished"
      );
    }

    result.map(|_| report)
  }

  async fn drain_queue(&self, report: &mut DrainReport) -> SyncResult<()> {
    let queue = self.store.list_operations()?;
    if queue.is_empty() {
      return Ok(());
    }
    debug!(count = queue.len(), "draining outbox");

    for mut op in queue {
      // Already failed earlier in this drain
      if report.failed.contains(&op.id) {
        if self.config.stop_on_failure {
          break;
        }
        continue;
      }

      if !op.status.is_retryable() {
        self.store.delete_operation(&op.id)?;
        continue;
      }

      op.status = OperationStatus::Syncing;
      if !self.store.update_operation(&op)? {
        debug!(id = %op.id, "operation removed before apply");
        continue;
      }

      match self.registry.apply(&op).await {
        Ok(()) => {
          self.store.delete_operation(&op.id)?;
          info!(id = %op.id, op_type = %op.op_type, "applied queued operation");
          report.applied.push(op.id);
        }
        Err(err) => {
          let still_queued = self.record_failure(op, err, report)?;
          if still_queued && self.config.stop_on_failure {
            break;
          }
        }
      }
    }

    Ok(())
  }

  /// Returns whether the operation remains in the queue.
  fn record_failure(
    &self,
    mut op: QueuedOperation,
    err: NetworkError,
    report: &mut DrainReport,
  ) -> SyncResult<bool> {
    op.retries += 1;
    op.status = OperationStatus::Failed;
    op.last_error = Some(err.to_string());

    if op.retries >= self.config.max_retries {
      // A false delete means it was cancelled while applying
      if self.store.delete_operation(&op.id)? {
        warn!(
          id = %op.id,
          op_type = %op.op_type,
          retries = op.retries,
          error = %err,
          "operation dead-lettered"
        );
        let letter = DeadLetter {
          operation: op,
          error: err,
        };
        self.keep_dead_letter(letter.clone());
        report.dead_lettered.push(letter);
      }
      return Ok(false);
    }

    if !self.store.update_operation(&op)? {
      debug!(id = %op.id, "operation removed while applying");
      return Ok(false);
    }

    warn!(
      id = %op.id,
      op_type = %op.op_type,
      retries = op.retries,
      error = %err,
      "apply failed, will retry"
    );
    report.failed.push(op.id);
    Ok(true)
  }

  fn keep_dead_letter(&self, letter: DeadLetter) {
    let mut letters = self
      .dead_letters
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    letters.push_back(letter);
    while letters.len() > self.config.max_dead_letters {
      if let Some(dropped) = letters.pop_front() {
        warn!(id = %dropped.operation.id, "dead letter discarded, none taken");
      }
    }
  }

  fn refresh_pending(&self) {
    match self.store.count_operations() {
      Ok(count) => {
        self.pending.send_replace(count);
      }
      Err(e) => warn!(error = %e, "failed to count queued operations"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::SqliteStore;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::Notify;

  fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
  }

  fn failing(calls: &Arc<AtomicUsize>) -> ApplyRegistry {
    let calls = Arc::clone(calls);
    ApplyRegistry::new().with("sale", move |_op| {
      calls.fetch_add(1, Ordering::SeqCst);
      async { Err(NetworkError::Request("timeout".to_string())) }
    })
  }

  #[tokio::test]
  async fn test_enqueue_persists_pending_record() {
    let store = memory_store();
    let outbox = Outbox::new(store.clone(), ApplyRegistry::new(), OutboxConfig::default()).unwrap();
    let pending = outbox.subscribe_pending();

    let id = outbox.enqueue("sale", json!({"total": 50})).unwrap();

    let stored = store.get_operation(&id).unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::Pending);
    assert_eq!(stored.retries, 0);
    assert_eq!(stored.payload, json!({"total": 50}));
    assert_eq!(outbox.pending_count().unwrap(), 1);
    assert_eq!(*pending.borrow(), 1);
  }

  #[tokio::test]
  async fn test_drain_applies_in_fifo_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let registry = ApplyRegistry::new().with("sale", move |op: QueuedOperation| {
      seen.lock().unwrap().push(op.payload["name"].as_str().unwrap().to_string());
      async { Ok(()) }
    });
    let store = memory_store();
    let outbox = Outbox::new(store.clone(), registry, OutboxConfig::default()).unwrap();

    let a = outbox.enqueue("sale", json!({"name": "A"})).unwrap();
    let b = outbox.enqueue("sale", json!({"name": "B"})).unwrap();

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.applied, vec![a, b]);
    assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
    assert_eq!(store.count_operations().unwrap(), 0);
    assert_eq!(*outbox.subscribe_pending().borrow(), 0);
  }

  #[tokio::test]
  async fn test_failed_operation_is_dead_lettered_after_max_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = memory_store();
    let outbox = Outbox::new(store.clone(), failing(&calls), OutboxConfig::default()).unwrap();
    let id = outbox.enqueue("sale", json!({"total": 50})).unwrap();

    for attempt in 1..=2u32 {
      let report = outbox.drain().await.unwrap();
      assert_eq!(report.failed, vec![id.clone()]);
      let stored = store.get_operation(&id).unwrap().unwrap();
      assert_eq!(stored.retries, attempt);
      assert_eq!(stored.status, OperationStatus::Failed);
      assert_eq!(stored.last_error.as_deref(), Some("Request failed: timeout"));
    }

    let report = outbox.drain().await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(report.dead_lettered[0].operation.retries, 3);
    assert!(store.get_operation(&id).unwrap().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.attempted(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let letters = outbox.take_dead_letters();
    assert_eq!(letters.len(), 1);
    assert!(matches!(
      letters[0].clone().into_error(),
      SyncError::PermanentApply { retries: 3, .. }
    ));
    assert!(outbox.take_dead_letters().is_empty());
  }

  #[tokio::test]
  async fn test_failure_blocks_later_operations() {
    let applied = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&applied);
    let registry = ApplyRegistry::new()
      .with("refund", |_op| async {
        Err(NetworkError::Status {
          status: 502,
          body: String::new(),
        })
      })
      .with("sale", move |_op| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
      });
    let outbox = Outbox::new(memory_store(), registry, OutboxConfig::default()).unwrap();

    outbox.enqueue("refund", json!({})).unwrap();
    outbox.enqueue("sale", json!({})).unwrap();

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(report.applied.is_empty());
    assert_eq!(applied.load(Ordering::SeqCst), 0);
    assert_eq!(outbox.pending_count().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_continue_past_failure_when_configured() {
    let registry = ApplyRegistry::new()
      .with("refund", |_op| async {
        Err(NetworkError::Request("refused".to_string()))
      })
      .with("sale", |_op| async { Ok(()) });
    let config = OutboxConfig {
      stop_on_failure: false,
      ..OutboxConfig::default()
    };
    let outbox = Outbox::new(memory_store(), registry, config).unwrap();

    outbox.enqueue("refund", json!({})).unwrap();
    let sale = outbox.enqueue("sale", json!({})).unwrap();

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.applied, vec![sale]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(outbox.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_skipped() {
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    let registry = ApplyRegistry::new().with("sale", move |_op| {
      let gate = Arc::clone(&gate);
      async move {
        gate.notified().await;
        Ok(())
      }
    });
    let outbox = Outbox::new(memory_store(), registry, OutboxConfig::default()).unwrap();
    outbox.enqueue("sale", json!({})).unwrap();

    let (first, second) = tokio::join!(outbox.drain(), async {
      let report = outbox.drain().await;
      assert!(outbox.is_syncing());
      release.notify_one();
      report
    });

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.applied.len(), 1);
    assert!(!first.skipped);
    assert!(second.skipped);
    assert_eq!(second.attempted(), 0);
    assert!(!outbox.is_syncing());
  }

  #[tokio::test]
  async fn test_skipped_drain_triggers_another_pass() {
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    let registry = ApplyRegistry::new().with("sale", move |op: QueuedOperation| {
      let gate = Arc::clone(&gate);
      async move {
        if op.payload["name"] == "A" {
          gate.notified().await;
        }
        Ok(())
      }
    });
    let outbox = Outbox::new(memory_store(), registry, OutboxConfig::default()).unwrap();
    let a = outbox.enqueue("sale", json!({"name": "A"})).unwrap();

    let (first, (b, second)) = tokio::join!(outbox.drain(), async {
      let b = outbox.enqueue("sale", json!({"name": "B"})).unwrap();
      let report = outbox.drain().await;
      release.notify_one();
      (b, report)
    });

    assert!(second.unwrap().skipped);
    assert_eq!(first.unwrap().applied, vec![a, b]);
    assert_eq!(outbox.pending_count().unwrap(), 0);
    assert!(!outbox.is_syncing());
  }

  #[tokio::test]
  async fn test_extra_pass_does_not_retry_a_failed_head() {
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let registry = ApplyRegistry::new()
      .with("refund", move |_op| {
        counter.fetch_add(1, Ordering::SeqCst);
        let gate = Arc::clone(&gate);
        async move {
          gate.notified().await;
          Err(NetworkError::Request("timeout".to_string()))
        }
      })
      .with("sale", |_op| async { Ok(()) });
    let outbox = Outbox::new(memory_store(), registry, OutboxConfig::default()).unwrap();
    let refund = outbox.enqueue("refund", json!({})).unwrap();

    let (first, _) = tokio::join!(outbox.drain(), async {
      outbox.enqueue("sale", json!({})).unwrap();
      assert!(outbox.drain().await.unwrap().skipped);
      release.notify_one();
    });

    let first = first.unwrap();
    assert_eq!(first.failed, vec![refund]);
    assert!(first.applied.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outbox.pending_count().unwrap(), 2);
  }

  #[test]
  fn test_dead_letters_are_capped() {
    let store = memory_store();
    let config = OutboxConfig {
      max_dead_letters: 2,
      ..OutboxConfig::default()
    };
    let outbox = Outbox::new(store, ApplyRegistry::new(), config).unwrap();

    for name in ["A", "B", "C"] {
      outbox.keep_dead_letter(DeadLetter {
        operation: QueuedOperation::new("sale", json!({"name": name})),
        error: NetworkError::NoRoute("sale".to_string()),
      });
    }

    let letters = outbox.take_dead_letters();
    let names: Vec<_> = letters
      .iter()
      .map(|l| l.operation.payload["name"].as_str().unwrap())
      .collect();
    assert_eq!(names, vec!["B", "C"]);
    assert!(outbox.take_dead_letters().is_empty());
  }

  #[tokio::test]
  async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offsync.db");

    let id = {
      let store = Arc::new(SqliteStore::open_at(&path).unwrap());
      let outbox = Outbox::new(store, ApplyRegistry::new(), OutboxConfig::default()).unwrap();
      outbox.enqueue("sale", json!({"total": 50})).unwrap()
    };

    let store = Arc::new(SqliteStore::open_at(&path).unwrap());
    let registry = ApplyRegistry::new().with("sale", |_op| async { Ok(()) });
    let outbox = Outbox::new(store.clone(), registry, OutboxConfig::default()).unwrap();

    let ops = outbox.operations().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].id, id);
    assert_eq!(ops[0].retries, 0);
    assert_eq!(ops[0].status, OperationStatus::Pending);
    assert_eq!(*outbox.subscribe_pending().borrow(), 1);

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.applied, vec![id]);
    assert_eq!(store.count_operations().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_interrupted_operation_is_retried() {
    let store = memory_store();
    let mut op = QueuedOperation::new("sale", json!({}));
    op.status = OperationStatus::Syncing;
    store.insert_operation(&op).unwrap();

    let registry = ApplyRegistry::new().with("sale", |_op| async { Ok(()) });
    let outbox = Outbox::new(store.clone(), registry, OutboxConfig::default()).unwrap();

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.applied, vec![op.id]);
  }

  #[tokio::test]
  async fn test_removal_during_apply_is_not_resurrected() {
    let store = memory_store();
    let remover = store.clone();
    let registry = ApplyRegistry::new().with("sale", move |op: QueuedOperation| {
      remover.delete_operation(&op.id).unwrap();
      async { Err(NetworkError::Request("timeout".to_string())) }
    });
    let outbox = Outbox::new(store.clone(), registry, OutboxConfig::default()).unwrap();
    outbox.enqueue("sale", json!({})).unwrap();

    let report = outbox.drain().await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(store.count_operations().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_remove_from_queue() {
    let outbox = Outbox::new(memory_store(), ApplyRegistry::new(), OutboxConfig::default()).unwrap();
    let id = outbox.enqueue("sale", json!({})).unwrap();

    assert!(outbox.remove_from_queue(&id).unwrap());
    assert!(!outbox.remove_from_queue(&id).unwrap());
    assert_eq!(*outbox.subscribe_pending().borrow(), 0);
  }
}
