//! Cache layer that orchestrates caching logic with network fetching.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::key::CacheKey;
use super::stats::{CacheStats, Counters};
use super::storage::{CacheStorage, CachedValue, Lookup};
use super::traits::CacheResult;
use crate::error::FetchError;

type FetchOutcome = Result<Arc<Value>, FetchError>;

/// Outcome of one network call, shared by every caller waiting on it.
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

struct Inner<S> {
  storage: S,
  /// One entry per key with a network call outstanding
  in_flight: Mutex<HashMap<CacheKey, SharedFetch>>,
  counters: Counters,
}

impl<S: CacheStorage> Inner<S> {
  /// Record the outcome of a call and drop its registration.
  ///
  /// Both happen under the registry lock so no reader can see the key with
  /// neither a registration nor the freshly written entry.
  fn settle(&self, key: &CacheKey, ttl: Duration, result: &FetchOutcome) {
    let mut in_flight = self.in_flight.lock();
    match result {
      Ok(value) => {
        self.storage.set(key, Arc::clone(value), ttl);
        debug!(key = %key, ttl_secs = ttl.as_secs(), "stored response");
      }
      Err(err) => {
        self.counters.failure();
        warn!(key = %key, error = %err, "fetch failed, not caching");
      }
    }
    in_flight.remove(key);
  }
}

/// Ownership of one registry entry.
///
/// Settling stores the outcome and hands it to the waiters. Dropping an
/// unsettled registration (fetcher panic, no runtime, task cancelled)
/// removes the entry, and waiters see the closed channel as
/// [`FetchError::Aborted`]. Never dropped while the registry lock is held.
struct Registration<S: CacheStorage> {
  inner: Arc<Inner<S>>,
  key: CacheKey,
  sender: Option<oneshot::Sender<FetchOutcome>>,
}

impl<S: CacheStorage> Registration<S> {
  fn settle(mut self, ttl: Duration, result: FetchOutcome) {
    self.inner.settle(&self.key, ttl, &result);
    if let Some(sender) = self.sender.take() {
      // Every waiter may already be gone
      let _ = sender.send(result);
    }
  }
}

impl<S: CacheStorage> Drop for Registration<S> {
  fn drop(&mut self) {
    if self.sender.is_some() {
      self.inner.in_flight.lock().remove(&self.key);
      warn!(key = %self.key, "fetch ended without settling");
    }
  }
}

enum Plan<S: CacheStorage> {
  Hit(CachedValue),
  Join(SharedFetch),
  Lead(SharedFetch, Registration<S>),
}

/// Cache layer that manages caching logic and network fetching.
///
/// Concurrent reads of the same key share a single network call. The call
/// runs on its own task, so callers that stop waiting do not cancel it.
pub struct CacheLayer<S: CacheStorage> {
  inner: Arc<Inner<S>>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      inner: Arc::new(Inner {
        storage,
        in_flight: Mutex::new(HashMap::new()),
        counters: Counters::default(),
      }),
    }
  }

  /// Fetch with cache-first strategy and request coalescing.
  ///
  /// 1. Fresh entry for `key` - return it, no network
  /// 2. Call already in flight for `key` - wait for its outcome
  /// 3. Otherwise register the key, then start `fetcher` on a new task
  ///
  /// On success the value is stored for `ttl`. Failures are never stored
  /// and reach every caller sharing the call. Called outside a Tokio
  /// runtime, a read that needs the network fails with
  /// [`FetchError::Aborted`].
  pub async fn fetch<F, Fut>(
    &self,
    key: CacheKey,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<Arc<Value>>, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
  {
    match self.plan(&key) {
      Plan::Hit(cached) => {
        debug!(key = %key, "cache hit");
        Ok(CacheResult::from_cache(cached.value, cached.cached_at))
      }
      Plan::Join(shared) => {
        debug!(key = %key, "joining in-flight request");
        shared.await.map(CacheResult::coalesced)
      }
      Plan::Lead(shared, registration) => {
        debug!(key = %key, "cache miss, fetching");
        Self::start(registration, ttl, fetcher)?;
        shared.await.map(CacheResult::from_network)
      }
    }
  }

  /// Check the store, check the registry, and register a new call, all
  /// inside one critical section. Nothing in here runs caller code.
  fn plan(&self, key: &CacheKey) -> Plan<S> {
    let counters = &self.inner.counters;
    let mut in_flight = self.inner.in_flight.lock();

    match self.inner.storage.lookup(key) {
      Lookup::Hit(cached) => {
        counters.hit();
        return Plan::Hit(cached);
      }
      Lookup::Expired => {
        counters.expiration();
        counters.miss();
      }
      Lookup::Miss => counters.miss(),
    }

    if let Some(shared) = in_flight.get(key) {
      counters.coalesced();
      return Plan::Join(shared.clone());
    }

    counters.network_call();
    let (sender, receiver) = oneshot::channel();
    let shared = async move {
      match receiver.await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Aborted("fetch ended without a result".to_string())),
      }
    }
    .boxed()
    .shared();
    in_flight.insert(key.clone(), shared.clone());

    let registration = Registration {
      inner: Arc::clone(&self.inner),
      key: key.clone(),
      sender: Some(sender),
    };
    Plan::Lead(shared, registration)
  }

  /// Run `fetcher` on its own task. Runs with the registry unlocked, so a
  /// panic here only drops `registration`, which releases the key.
  fn start<F, Fut>(
    registration: Registration<S>,
    ttl: Duration,
    fetcher: F,
  ) -> Result<(), FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
  {
    let runtime = Handle::try_current().map_err(|e| FetchError::Aborted(e.to_string()))?;
    let future = fetcher();
    runtime.spawn(async move {
      let result = future.await.map(Arc::new);
      registration.settle(ttl, result);
    });
    Ok(())
  }

  /// Drop the cached entry for one key.
  ///
  /// A call already in flight for the key is unaffected and will still
  /// store its result.
  pub fn invalidate(&self, key: &CacheKey) {
    self.inner.storage.invalidate(key);
    debug!(key = %key, "invalidated");
  }

  /// Drop every cached entry whose key matches `pattern`.
  pub fn invalidate_matching(&self, pattern: &Regex) -> usize {
    let removed = self.inner.storage.invalidate_matching(pattern);
    info!(pattern = %pattern, removed, "invalidated matching entries");
    removed
  }

  /// Drop all cached entries.
  pub fn clear(&self) {
    self.inner.storage.clear();
    info!("cache cleared");
  }

  /// Number of stored entries.
  pub fn len(&self) -> usize {
    self.inner.storage.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Number of keys with a network call outstanding.
  pub fn in_flight(&self) -> usize {
    self.inner.in_flight.lock().len()
  }

  pub fn stats(&self) -> CacheStats {
    self.inner.counters.snapshot()
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::{build_key, Params};
  use crate::cache::storage::{MemoryStorage, NoopStorage};
  use crate::cache::traits::CacheSource;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  const TTL: Duration = Duration::from_secs(60);

  fn products_key() -> CacheKey {
    build_key("/products", Some(&Params::new().with("category", "brakes")))
  }

  fn counting_fetcher(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
    value: Value,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, FetchError>> {
    let calls = Arc::clone(calls);
    move || {
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(value)
      }
      .boxed()
    }
  }

  fn failing_fetcher(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, FetchError>> {
    let calls = Arc::clone(calls);
    move || {
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Err(FetchError::Status {
          status: 500,
          body: "boom".to_string(),
        })
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_second_read_is_served_from_cache() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!([1])))
      .await
      .unwrap();
    let second = layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!([2])))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::Cache);
    assert!(second.cached_at.is_some());
    assert_eq!(*second.data, json!([1]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_call() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let reads = (0..10).map(|i| {
      layer.fetch(
        products_key(),
        TTL,
        counting_fetcher(&calls, Duration::from_millis(50), json!({ "caller": i })),
      )
    });
    let results = futures::future::join_all(reads).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let values: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(values[0].source, CacheSource::Network);
    for result in &values {
      assert_eq!(*result.data, json!({ "caller": 0 }));
    }
    assert!(values[1..].iter().all(|r| r.source == CacheSource::Coalesced));

    let stats = layer.stats();
    assert_eq!(stats.network_calls, 1);
    assert_eq!(stats.coalesced, 9);
    assert_eq!(layer.in_flight(), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_reads_across_threads_share_one_call() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..32)
      .map(|_| {
        let layer = layer.clone();
        let fetcher = counting_fetcher(&calls, Duration::from_millis(50), json!("shared"));
        tokio::spawn(async move { layer.fetch(products_key(), TTL, fetcher).await })
      })
      .collect();

    for task in tasks {
      let result = task.await.unwrap().unwrap();
      assert_eq!(*result.data, json!("shared"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failure_is_not_cached() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let err = layer
      .fetch(products_key(), TTL, failing_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 500, .. }));
    assert!(layer.is_empty());
    assert_eq!(layer.in_flight(), 0);
    assert_eq!(layer.stats().failures, 1);

    // The key is not poisoned
    let ok = layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!(1)))
      .await
      .unwrap();
    assert_eq!(ok.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_reaches_every_waiting_caller() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let reads = (0..5).map(|_| {
      layer.fetch(
        products_key(),
        TTL,
        failing_fetcher(&calls, Duration::from_millis(20)),
      )
    });
    let results = futures::future::join_all(reads).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.is_err()));
    assert!(layer.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entry_triggers_new_call() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let ttl = Duration::from_secs(10);

    layer
      .fetch(products_key(), ttl, counting_fetcher(&calls, Duration::ZERO, json!(1)))
      .await
      .unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;
    let result = layer
      .fetch(products_key(), ttl, counting_fetcher(&calls, Duration::ZERO, json!(2)))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*result.data, json!(2));
    assert_eq!(layer.stats().expirations, 1);
  }

  #[tokio::test]
  async fn test_invalidate_matching_forces_refetch() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!(1)))
      .await
      .unwrap();
    let removed = layer.invalidate_matching(&Regex::new("^/products:").unwrap());
    assert_eq!(removed, 1);

    let result = layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!(2)))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_during_flight_still_stores_result() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let pending = layer.fetch(
      products_key(),
      TTL,
      counting_fetcher(&calls, Duration::from_millis(50), json!("late")),
    );
    let invalidate = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      layer.invalidate(&products_key());
    };
    let (result, ()) = tokio::join!(pending, invalidate);
    result.unwrap();

    let cached = layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!("new")))
      .await
      .unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(*cached.data, json!("late"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_caller_does_not_cancel_fetch() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let abandoned = tokio::time::timeout(
      Duration::from_millis(5),
      layer.fetch(
        products_key(),
        TTL,
        counting_fetcher(&calls, Duration::from_millis(50), json!("kept")),
      ),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(layer.in_flight(), 0);

    let cached = layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!("new")))
      .await
      .unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(*cached.data, json!("kept"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_panicking_fetch_releases_key() {
    let layer = CacheLayer::new(MemoryStorage::new());

    let err = layer
      .fetch(products_key(), TTL, || async {
        if layer_should_panic() {
          panic!("fetch panicked");
        }
        Ok(json!(null))
      })
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Aborted(_)));
    assert_eq!(layer.in_flight(), 0);
    assert!(layer.is_empty());
  }

  fn layer_should_panic() -> bool {
    true
  }

  /// Run `f` on its own thread and fail the test if it does not finish.
  fn within_deadline<T, F>(f: F) -> T
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
  {
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
      let _ = done_tx.send(f());
    });
    done_rx
      .recv_timeout(Duration::from_secs(3))
      .expect("fetch blocked instead of finishing")
  }

  #[test]
  fn test_fetcher_panic_releases_key() {
    let layer = CacheLayer::new(MemoryStorage::new());

    let worker = layer.clone();
    let panicked = within_deadline(move || {
      let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
      runtime.block_on(async {
        let read = worker.fetch(
          products_key(),
          TTL,
          || -> BoxFuture<'static, Result<Value, FetchError>> { panic!("fetcher panicked") },
        );
        std::panic::AssertUnwindSafe(read).catch_unwind().await.is_err()
      })
    });
    assert!(panicked);
    assert_eq!(layer.in_flight(), 0);

    let worker = layer.clone();
    let retry = within_deadline(move || {
      let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
      runtime.block_on(worker.fetch(products_key(), TTL, || async { Ok(json!("recovered")) }))
    });
    let retry = retry.unwrap();
    assert_eq!(retry.source, CacheSource::Network);
    assert_eq!(*retry.data, json!("recovered"));
  }

  #[test]
  fn test_fetch_outside_runtime_fails_and_releases_key() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = layer.clone();
    let fetcher = counting_fetcher(&calls, Duration::ZERO, json!(1));
    let result = within_deadline(move || {
      futures::executor::block_on(worker.fetch(products_key(), TTL, fetcher))
    });

    assert!(matches!(result, Err(FetchError::Aborted(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(layer.in_flight(), 0);
    assert!(layer.is_empty());

    // Other keys are still usable from a runtime
    let worker = layer.clone();
    let fetcher = counting_fetcher(&calls, Duration::ZERO, json!(2));
    let result = within_deadline(move || {
      let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
      runtime.block_on(worker.fetch(build_key("/brands", None), TTL, fetcher))
    });
    assert_eq!(*result.unwrap().data, json!(2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_noop_storage_still_coalesces() {
    let layer = CacheLayer::new(NoopStorage);
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
      layer.fetch(products_key(), TTL, counting_fetcher(&calls, Duration::from_millis(20), json!(1))),
      layer.fetch(products_key(), TTL, counting_fetcher(&calls, Duration::from_millis(20), json!(2))),
    );
    assert_eq!(*a.unwrap().data, json!(1));
    assert_eq!(*b.unwrap().data, json!(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!(3)))
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_clear_drops_everything() {
    let layer = CacheLayer::new(MemoryStorage::new());
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .fetch(products_key(), TTL, counting_fetcher(&calls, Duration::ZERO, json!(1)))
      .await
      .unwrap();
    layer
      .fetch(build_key("/brands", None), TTL, counting_fetcher(&calls, Duration::ZERO, json!(2)))
      .await
      .unwrap();
    assert_eq!(layer.len(), 2);

    layer.clear();
    assert!(layer.is_empty());
  }
}
