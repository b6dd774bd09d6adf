//! Sync orchestrator: wires connectivity to the outbox and exposes the
//! caller-facing cache and queue API.

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::cache::{CacheConfig, EntityCache, ResponseCache};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivitySource};
use crate::db::Store;
use crate::error::SyncResult;
use crate::outbox::{ApplyRegistry, DeadLetter, DrainReport, Outbox, OutboxConfig, QueuedOperation};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
  pub cache: CacheConfig,
  pub outbox: OutboxConfig,
}

impl From<&Config> for EngineConfig {
  fn from(config: &Config) -> Self {
    Self {
      cache: config.cache.to_cache_config(),
      outbox: config.outbox.to_outbox_config(),
    }
  }
}

/// Offline-capable front door for reads and writes.
///
/// Construct one per application and share it by cloning.
pub struct SyncEngine<S: Store> {
  outbox: Arc<Outbox<S>>,
  monitor: Arc<ConnectivityMonitor>,
  cache: ResponseCache,
  entities: EntityCache<S>,
}

impl<S: Store> SyncEngine<S> {
  pub fn new(
    store: Arc<S>,
    registry: ApplyRegistry,
    config: EngineConfig,
    initially_online: bool,
  ) -> SyncResult<Self> {
    let outbox = Outbox::new(Arc::clone(&store), registry, config.outbox)?;

    Ok(Self {
      outbox: Arc::new(outbox),
      monitor: Arc::new(ConnectivityMonitor::new(initially_online)),
      cache: ResponseCache::new(config.cache),
      entities: EntityCache::new(store),
    })
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.cache
  }

  pub fn entities(&self) -> &EntityCache<S> {
    &self.entities
  }

  /// Queue a mutation. Drains right away when online.
  ///
  /// Once the operation is persisted this succeeds; a failing drain is
  /// logged and retried on the next trigger.
  pub async fn queue_operation(&self, op_type: &str, payload: Value) -> SyncResult<String> {
    let id = self.outbox.enqueue(op_type, payload)?;

    if self.monitor.is_online() {
      if let Err(e) = self.outbox.drain().await {
        error!(error = %e, "opportunistic drain failed");
      }
    }

    Ok(id)
  }

  /// Record reachability. Drains once on an offline to online transition.
  pub async fn set_online(&self, online: bool) -> SyncResult<Option<DrainReport>> {
    if !self.monitor.update(online) {
      return Ok(None);
    }
    debug!("connectivity regained, draining outbox");
    self.outbox.drain().await.map(Some)
  }

  /// Follow a connectivity source until it ends.
  pub async fn watch_connectivity<C: ConnectivitySource>(&self, source: C) {
    let mut events = source.into_events();
    while let Some(online) = events.next().await {
      if let Err(e) = self.set_online(online).await {
        error!(error = %e, "drain after reconnect failed");
      }
    }
  }

  pub async fn drain(&self) -> SyncResult<DrainReport> {
    self.outbox.drain().await
  }

  pub fn remove_from_queue(&self, id: &str) -> SyncResult<bool> {
    self.outbox.remove_from_queue(id)
  }

  pub fn operations(&self) -> SyncResult<Vec<QueuedOperation>> {
    self.outbox.operations()
  }

  pub fn pending_count(&self) -> SyncResult<usize> {
    self.outbox.pending_count()
  }

  pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
    self.outbox.subscribe_pending()
  }

  pub fn is_online(&self) -> bool {
    self.monitor.is_online()
  }

  pub fn subscribe_online(&self) -> watch::Receiver<bool> {
    self.monitor.subscribe()
  }

  pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
    self.outbox.take_dead_letters()
  }
}

impl<S: Store> Clone for SyncEngine<S> {
  fn clone(&self) -> Self {
    Self {
      outbox: Arc::clone(&self.outbox),
      monitor: Arc::clone(&self.monitor),
      cache: self.cache.clone(),
      entities: self.entities.clone(),
    }
  }
}
