//! In-memory response cache with in-flight request de-duplication.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::key::{cache_key, key_matches_endpoint};
use crate::error::NetworkError;

/// Outcome of a network read.
pub type FetchResult = Result<Value, NetworkError>;

/// A request future that any number of callers can await.
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Tuning knobs for [`ResponseCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// TTL used when `set` is called without one
  pub default_ttl: Duration,
  /// Entry count above which the oldest entries are evicted
  pub max_entries: usize,
  /// Age after which an unsettled in-flight request is forgotten
  pub pending_timeout: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl: Duration::from_secs(5 * 60),
      max_entries: 100,
      pending_timeout: Duration::from_secs(30),
    }
  }
}

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub created_at: Instant,
  pub expires_at: Instant,
  /// Insertion order, breaks ties between equal `created_at`
  seq: u64,
}

impl CacheEntry {
  pub fn is_valid_at(&self, now: Instant) -> bool {
    now < self.expires_at
  }
}

struct InFlightRequest {
  future: SharedFetch,
  created_at: Instant,
  token: u64,
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<String, CacheEntry>,
  in_flight: HashMap<String, InFlightRequest>,
  counter: u64,
}

impl CacheState {
  fn next_seq(&mut self) -> u64 {
    self.counter += 1;
    self.counter
  }

  fn insert(&mut self, key: String, value: Value, ttl: Duration, max_entries: usize) {
    let now = Instant::now();
    let seq = self.next_seq();
    self.entries.insert(
      key.clone(),
      CacheEntry {
        key,
        value,
        created_at: now,
        expires_at: now + ttl,
        seq,
      },
    );
    self.enforce_capacity(now, max_entries);
  }

  fn enforce_capacity(&mut self, now: Instant, max_entries: usize) {
    if self.entries.len() <= max_entries {
      return;
    }

    self.entries.retain(|_, entry| entry.is_valid_at(now));

    while self.entries.len() > max_entries {
      let oldest = self
        .entries
        .values()
        .min_by_key(|entry| (entry.created_at, entry.seq))
        .map(|entry| entry.key.clone());

      match oldest {
        Some(key) => {
          debug!(key = %key, "evicting oldest cache entry");
          self.entries.remove(&key);
        }
        None => break,
      }
    }
  }

  /// Forget in-flight requests whose future was never driven to completion.
  fn drop_stale_requests(&mut self, now: Instant, timeout: Duration) {
    let before = self.in_flight.len();
    self
      .in_flight
      .retain(|_, req| now.duration_since(req.created_at) < timeout);
    let dropped = before - self.in_flight.len();
    if dropped > 0 {
      debug!(dropped, "dropped stale in-flight requests");
    }
  }
}

/// Process-memory cache of read responses.
///
/// Entries expire lazily on read and the map is capped at
/// `max_entries`. Concurrent identical reads can share one network call
/// through the pending-request registry.
///
/// When using [`get_pending_request`](Self::get_pending_request) and
/// [`set_pending_request`](Self::set_pending_request) directly, call them
/// without awaiting in between. Otherwise two callers can both miss the
/// pending entry and issue the same request twice. [`fetch`](Self::fetch)
/// does this correctly.
#[derive(Clone)]
pub struct ResponseCache {
  state: Arc<Mutex<CacheState>>,
  config: CacheConfig,
}

impl ResponseCache {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      state: Arc::new(Mutex::new(CacheState::default())),
      config,
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    // Cache state stays consistent across a panic, so a poisoned lock is still usable
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Cached value for a request, or `None` if absent or expired.
  pub fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Option<Value> {
    let key = cache_key(endpoint, params);
    let now = Instant::now();
    let mut state = self.lock();

    if let Some(entry) = state.entries.get(&key) {
      if entry.is_valid_at(now) {
        debug!(key = %key, "cache hit");
        return Some(entry.value.clone());
      }
      debug!(key = %key, "cache entry expired");
      state.entries.remove(&key);
    }

    None
  }

  /// Store a response, replacing any previous entry for the same request.
  pub fn set(&self, endpoint: &str, data: Value, params: &[(&str, &str)], ttl: Option<Duration>) {
    let key = cache_key(endpoint, params);
    let ttl = ttl.unwrap_or(self.config.default_ttl);
    self.lock().insert(key, data, ttl, self.config.max_entries);
  }

  /// The in-flight request for an identical call, if one is registered.
  pub fn get_pending_request(&self, endpoint: &str, params: &[(&str, &str)]) -> Option<SharedFetch> {
    let key = cache_key(endpoint, params);
    let mut state = self.lock();
    state.drop_stale_requests(Instant::now(), self.config.pending_timeout);
    state.in_flight.get(&key).map(|req| req.future.clone())
  }

  /// Register `future` as the canonical in-flight call for a request.
  ///
  /// The registration is removed when the returned future settles. A future
  /// that nobody polls never settles and is dropped after the pending timeout.
  pub fn set_pending_request<F>(
    &self,
    endpoint: &str,
    params: &[(&str, &str)],
    future: F,
  ) -> SharedFetch
  where
    F: Future<Output = FetchResult> + Send + 'static,
  {
    let key = cache_key(endpoint, params);
    let mut state = self.lock();
    self.register(&mut state, key, future, false)
  }

  /// With `store_result`, a successful response is cached as the request
  /// settles, but only if its registration was not invalidated meanwhile.
  fn register<F>(&self, state: &mut CacheState, key: String, future: F, store_result: bool) -> SharedFetch
  where
    F: Future<Output = FetchResult> + Send + 'static,
  {
    let token = state.next_seq();
    let registry = Arc::downgrade(&self.state);
    let settle_key = key.clone();
    let ttl = self.config.default_ttl;
    let max_entries = self.config.max_entries;

    let shared = async move {
      let result = future.await;
      if let Some(inner) = registry.upgrade() {
        let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer registration for the same key must survive
        let current = guard
          .in_flight
          .get(&settle_key)
          .is_some_and(|req| req.token == token);
        if current {
          guard.in_flight.remove(&settle_key);
          if let (true, Ok(value)) = (store_result, &result) {
            guard.insert(settle_key, value.clone(), ttl, max_entries);
          }
        } else if store_result {
          debug!(key = %settle_key, "request invalidated while in flight, not caching");
        }
      }
      result
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key,
      InFlightRequest {
        future: shared.clone(),
        created_at: Instant::now(),
        token,
      },
    );

    shared
  }

  /// Remove cached entries.
  ///
  /// - endpoint and params: that one request
  /// - endpoint only: every request to the endpoint
  /// - neither: everything, including in-flight registrations
  pub fn invalidate(&self, endpoint: Option<&str>, params: Option<&[(&str, &str)]>) {
    let mut state = self.lock();

    match (endpoint, params) {
      (Some(endpoint), Some(params)) => {
        let key = cache_key(endpoint, params);
        state.entries.remove(&key);
        state.in_flight.remove(&key);
      }
      (Some(endpoint), None) => {
        state
          .entries
          .retain(|key, _| !key_matches_endpoint(key, endpoint));
        state
          .in_flight
          .retain(|key, _| !key_matches_endpoint(key, endpoint));
      }
      (None, _) => {
        state.entries.clear();
        state.in_flight.clear();
      }
    }
  }

  /// Read through the cache, sharing one network call between concurrent callers.
  ///
  /// Failures are handed to every waiting caller but are not cached. A
  /// response whose request was invalidated while in flight is returned to
  /// its callers but not cached either.
  pub async fn fetch<F, Fut>(
    &self,
    endpoint: &str,
    params: &[(&str, &str)],
    fetcher: F,
  ) -> FetchResult
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = FetchResult> + Send + 'static,
  {
    if let Some(value) = self.get(endpoint, params) {
      return Ok(value);
    }

    // Futures are lazy, so building one we end up discarding costs nothing
    let request = fetcher();
    let pending = {
      let key = cache_key(endpoint, params);
      let mut state = self.lock();
      state.drop_stale_requests(Instant::now(), self.config.pending_timeout);
      match state.in_flight.get(&key) {
        Some(req) => {
          debug!(key = %key, "joining in-flight request");
          req.future.clone()
        }
        None => {
          debug!(key = %key, "cache miss");
          self.register(&mut state, key, request, true)
        }
      }
    };

    pending.await
  }

  /// Number of stored entries, including expired ones not yet read.
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn in_flight_len(&self) -> usize {
    self.lock().in_flight.len()
  }
}

impl Default for ResponseCache {
  fn default() -> Self {
    Self::new(CacheConfig::default())
  }
}
