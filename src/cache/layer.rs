//! Query client: fetch execution, subscriptions and invalidation on top of
//! the cache store.

use chrono::Utc;
use futures::future::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::entry::{QueryEntry, QueryStatus};
use super::error::{QueryError, QueryResult};
use super::key::QueryKey;
use super::options::{QueryOptions, RetryPolicy};
use super::storage::{CacheStorage, NoopStorage};
use super::store::{CacheStore, Callback, FetcherFn, InFlight, SharedFetch};

/// How a fetch request treats cached data and in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
  /// Serve fresh data, otherwise join or start a request
  Cached,
  /// Ignore staleness, join an in-flight request if any
  Background,
  /// Like `Background`, but also runs for disabled queries
  Retry,
  /// Start a new request that replaces any in-flight one
  Supersede,
}

/// What a fetch request resolved to while holding the store lock.
enum Decision {
  Cached(Value),
  Pending(SharedFetch),
  Failed(QueryError),
}

struct ClientInner {
  store: CacheStore,
  storage: Arc<dyn CacheStorage>,
  defaults: QueryOptions,
  next_request_id: AtomicU64,
}

/// Handle to the query cache.
///
/// Construct one at startup and clone it wherever queries are made; clones
/// share the same cache. Methods that start requests spawn tokio tasks and
/// must be called from within a runtime.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<ClientInner>,
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("entries", &self.inner.store.len())
      .field("defaults", &self.inner.defaults)
      .finish_non_exhaustive()
  }
}

impl QueryClient {
  /// In-memory client without persistence.
  pub fn new() -> Self {
    Self::with_storage(Arc::new(NoopStorage), QueryOptions::default())
  }

  /// Client persisting successful results to `storage`.
  pub fn with_storage(storage: Arc<dyn CacheStorage>, defaults: QueryOptions) -> Self {
    Self {
      inner: Arc::new(ClientInner {
        store: CacheStore::new(),
        storage,
        defaults,
        next_request_id: AtomicU64::new(1),
      }),
    }
  }

  fn from_inner(inner: Arc<ClientInner>) -> Self {
    Self { inner }
  }

  /// Options used by resource hooks that don't override them.
  pub fn default_options(&self) -> QueryOptions {
    self.inner.defaults.clone()
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  pub fn get_entry(&self, key: &QueryKey) -> Option<QueryEntry> {
    self.inner.store.get(key)
  }

  /// Typed view of the cached data for `key`.
  pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> QueryResult<Option<T>> {
    match self.inner.store.get(key) {
      Some(entry) => entry.data_as(),
      None => Ok(None),
    }
  }

  /// Write data directly into the cache, as if it had just been fetched.
  pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> QueryResult<()> {
    let value = serde_json::to_value(data)?;
    self.inner.store.set(key, |entry| {
      entry.data = Some(value.clone());
      entry.status = QueryStatus::Success;
      entry.error = None;
      entry.last_fetched_at = Some(Instant::now());
      entry.updated_at = Some(Utc::now());
      entry.is_invalidated = false;
    });
    self.persist(key, &value);
    Ok(())
  }

  /// Fetch `key`, serving fresh cached data when possible.
  ///
  /// Concurrent callers for the same key share one request. The fetcher and
  /// options are remembered for later invalidation refetches.
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: QueryOptions,
  ) -> QueryResult<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryResult<T>> + Send + 'static,
  {
    self.hydrate(key);
    let decision = self.decide(key, Some((erase(fetcher), options)), FetchMode::Cached);
    let value = resolve(decision).await?;
    serde_json::from_value(value).map_err(QueryError::from)
  }

  /// Start a new request for `key` using its registered fetcher, superseding
  /// any request already in flight. The superseded response is discarded.
  pub async fn refetch(&self, key: &QueryKey) -> QueryResult<Value> {
    resolve(self.decide(key, None, FetchMode::Supersede)).await
  }

  /// Manually retry `key` with a fresh attempt counter. Joins a request that
  /// is already running instead of starting another.
  pub async fn retry(&self, key: &QueryKey) -> QueryResult<Value> {
    resolve(self.decide(key, None, FetchMode::Retry)).await
  }

  /// Register a subscriber for `key`.
  ///
  /// Fetches when the entry isn't fresh, starts the polling timer when
  /// `options.refetch_interval` is set and cancels a pending eviction. The
  /// callback runs on every change of the entry until the returned
  /// [`Subscription`] is dropped.
  pub fn subscribe<T, F, Fut, C>(
    &self,
    key: QueryKey,
    fetcher: F,
    options: QueryOptions,
    callback: C,
  ) -> Subscription
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryResult<T>> + Send + 'static,
    C: Fn(&QueryEntry) + Send + Sync + 'static,
  {
    self.subscribe_erased(key, erase(fetcher), options, Arc::new(callback))
  }

  fn subscribe_erased(
    &self,
    key: QueryKey,
    fetcher: FetcherFn,
    options: QueryOptions,
    callback: Callback,
  ) -> Subscription {
    self.hydrate(&key);

    let id = self.inner.store.next_subscriber_id();
    let weak = Arc::downgrade(&self.inner);

    self.inner.store.with_slot(&key, |slot| {
      slot.subscribers.push((id, callback));
      slot.entry.subscriber_count = slot.subscribers.len();
      slot.fetcher = Some(fetcher);
      slot.options = options.clone();

      if let Some(gc) = slot.gc_task.take() {
        gc.abort();
      }

      if slot.interval_task.is_none() && options.enabled {
        if let Some(period) = options.refetch_interval {
          slot.interval_task = Some(spawn_interval(weak.clone(), key.clone(), period));
        }
      }
    });

    debug!(key = %key, subscriber = id, "Subscribed");

    if options.enabled {
      // The request runs in its own task; nothing needs to await it here
      let _ = self.decide(&key, None, FetchMode::Cached);
    }

    Subscription {
      client: weak,
      key,
      id,
    }
  }

  fn unsubscribe(&self, key: &QueryKey, id: u64) {
    let weak = Arc::downgrade(&self.inner);
    let evict_now = self
      .inner
      .store
      .with_existing_slot(key, |slot| {
        let before = slot.subscribers.len();
        slot.subscribers.retain(|(sid, _)| *sid != id);
        if slot.subscribers.len() == before {
          return false;
        }
        slot.entry.subscriber_count = slot.subscribers.len();
        if slot.entry.subscriber_count > 0 {
          return false;
        }

        if let Some(task) = slot.interval_task.take() {
          task.abort();
        }
        match spawn_gc(weak, key.clone(), slot.options.gc_time) {
          Some(task) => {
            slot.gc_task = Some(task);
            false
          }
          // No runtime left to run the timer
          None => true,
        }
      })
      .unwrap_or(false);

    debug!(key = %key, subscriber = id, "Unsubscribed");

    if evict_now {
      self.inner.store.collect_garbage(key);
    }
  }

  /// Mark every entry under `prefix` stale and refetch the subscribed ones.
  /// Returns how many entries matched.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    self.invalidate_queries(std::slice::from_ref(prefix))
  }

  /// [`QueryClient::invalidate`] for several prefixes; an entry matching more
  /// than one prefix is handled once.
  pub fn invalidate_queries(&self, prefixes: &[QueryKey]) -> usize {
    let mut seen = HashSet::new();
    let keys: Vec<QueryKey> = prefixes
      .iter()
      .flat_map(|prefix| self.inner.store.keys_matching(prefix))
      .filter(|key| seen.insert(key.clone()))
      .collect();

    for key in &keys {
      let should_refetch = self
        .inner
        .store
        .with_existing_slot(key, |slot| {
          slot.entry.is_invalidated = true;
          slot.entry.subscriber_count > 0 && slot.fetcher.is_some() && slot.options.enabled
        })
        .unwrap_or(false);

      if should_refetch {
        debug!(key = %key, "Refetching invalidated query");
        let _ = self.decide(key, None, FetchMode::Background);
      } else {
        trace!(key = %key, "Marked query stale");
      }
    }

    keys.len()
  }

  /// Evict every unsubscribed entry under `prefix`, including its snapshot.
  pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
    let mut removed = 0;
    for key in self.inner.store.keys_matching(prefix) {
      if self.inner.store.remove(&key) {
        removed += 1;
        if let Err(e) = self.inner.storage.remove(&key) {
          warn!(key = %key, "Failed to delete snapshot: {}", e);
        }
      }
    }
    removed
  }

  /// Drop every entry and snapshot.
  pub fn clear(&self) {
    self.inner.store.clear();
    if let Err(e) = self.inner.storage.clear() {
      warn!("Failed to clear snapshots: {}", e);
    }
  }

  /// Seed a missing entry from its persisted snapshot. Hydrated data is
  /// shown immediately but counts as stale.
  fn hydrate(&self, key: &QueryKey) {
    if self.inner.store.contains(key) {
      return;
    }
    match self.inner.storage.load(key) {
      Ok(Some(snapshot)) => {
        let entry = QueryEntry {
          data: Some(snapshot.data),
          status: QueryStatus::Success,
          updated_at: Some(snapshot.cached_at),
          is_invalidated: true,
          ..Default::default()
        };
        if self.inner.store.insert_if_absent(key, entry) {
          debug!(key = %key, cached_at = %snapshot.cached_at, "Hydrated query from snapshot");
        }
      }
      Ok(None) => {}
      Err(e) => warn!(key = %key, "Failed to load snapshot: {}", e),
    }
  }

  fn persist(&self, key: &QueryKey, value: &Value) {
    if let Err(e) = self.inner.storage.store(key, value) {
      warn!(key = %key, "Failed to persist snapshot: {}", e);
    }
  }

  /// Decide, atomically with respect to the store, whether to serve cached
  /// data, join the in-flight request or start a new one.
  fn decide(
    &self,
    key: &QueryKey,
    registration: Option<(FetcherFn, QueryOptions)>,
    mode: FetchMode,
  ) -> Decision {
    self.inner.store.with_slot(key, |slot| {
      if let Some((fetcher, options)) = registration {
        slot.fetcher = Some(fetcher);
        slot.options = options;
      }
      let options = slot.options.clone();

      if mode == FetchMode::Cached && slot.entry.is_fresh(options.stale_time) {
        if let Some(data) = &slot.entry.data {
          trace!(key = %key, "Serving fresh cached data");
          return Decision::Cached(data.clone());
        }
      }

      let manual = matches!(mode, FetchMode::Retry | FetchMode::Supersede);
      if !options.enabled && !manual {
        return match &slot.entry.data {
          Some(data) => Decision::Cached(data.clone()),
          None => Decision::Failed(QueryError::Disabled),
        };
      }

      if mode != FetchMode::Supersede {
        if let Some(in_flight) = &slot.in_flight {
          trace!(key = %key, request = in_flight.id, "Joining in-flight request");
          return Decision::Pending(in_flight.future.clone());
        }
      }

      let fetcher = match &slot.fetcher {
        Some(fetcher) => Arc::clone(fetcher),
        None => return Decision::Failed(QueryError::Unregistered(key.to_string())),
      };

      let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
      if let Some(previous) = &slot.in_flight {
        debug!(key = %key, request = id, superseded = previous.id, "Superseding in-flight request");
      } else {
        debug!(key = %key, request = id, "Starting fetch");
      }

      let future = self.spawn_request(key.clone(), id, fetcher, options.retry);
      slot.in_flight = Some(InFlight {
        id,
        future: future.clone(),
      });
      slot.entry.is_fetching = true;
      slot.entry.failure_count = 0;
      if slot.entry.data.is_none() {
        // Background refreshes keep showing the old data
        slot.entry.status = QueryStatus::Loading;
        slot.entry.error = None;
      }

      Decision::Pending(future)
    })
  }

  fn spawn_request(
    &self,
    key: QueryKey,
    id: u64,
    fetcher: FetcherFn,
    retry: RetryPolicy,
  ) -> SharedFetch {
    let client = self.clone();
    let handle = tokio::spawn(async move { client.run_request(key, id, fetcher, retry).await });
    async move {
      handle
        .await
        .unwrap_or_else(|e| Err(QueryError::Cancelled(e.to_string())))
    }
    .boxed()
    .shared()
  }

  /// Run one request to completion, retrying retryable failures with
  /// exponential backoff, then apply the outcome to the cache.
  async fn run_request(
    self,
    key: QueryKey,
    id: u64,
    fetcher: FetcherFn,
    retry: RetryPolicy,
  ) -> QueryResult<Value> {
    let mut failures = 0u32;
    let result = loop {
      match fetcher().await {
        Ok(value) => break Ok(value),
        Err(e) if e.is_retryable() && failures < retry.count => {
          let delay = retry.delay_for(failures);
          failures += 1;
          debug!(
            key = %key,
            request = id,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "Fetch failed, retrying: {}", e
          );
          self.record_failure(&key, id, failures);
          tokio::time::sleep(delay).await;
        }
        Err(e) => {
          failures += 1;
          break Err(e);
        }
      }
    };

    self.complete_request(&key, id, &result, failures);
    result
  }

  fn record_failure(&self, key: &QueryKey, id: u64, failures: u32) {
    self.inner.store.with_existing_slot(key, |slot| {
      if slot.in_flight.as_ref().map(|f| f.id) == Some(id) {
        slot.entry.failure_count = failures;
      }
    });
  }

  /// Apply a finished request unless it was superseded or its entry evicted.
  fn complete_request(
    &self,
    key: &QueryKey,
    id: u64,
    result: &QueryResult<Value>,
    failures: u32,
  ) {
    let applied = self.inner.store.with_existing_slot(key, |slot| {
      if slot.in_flight.as_ref().map(|f| f.id) != Some(id) {
        return false;
      }
      slot.in_flight = None;
      slot.entry.is_fetching = false;
      match result {
        Ok(value) => {
          slot.entry.data = Some(value.clone());
          slot.entry.status = QueryStatus::Success;
          slot.entry.error = None;
          slot.entry.last_fetched_at = Some(Instant::now());
          slot.entry.updated_at = Some(Utc::now());
          slot.entry.is_invalidated = false;
          slot.entry.failure_count = 0;
        }
        Err(e) => {
          // Data from an earlier success stays readable
          slot.entry.status = QueryStatus::Error;
          slot.entry.error = Some(e.clone());
          slot.entry.failure_count = failures;
        }
      }
      true
    });

    match (applied, result) {
      (None, _) => trace!(key = %key, request = id, "Entry evicted, discarding response"),
      (Some(false), _) => trace!(key = %key, request = id, "Discarding stale response"),
      (Some(true), Ok(value)) => {
        debug!(key = %key, request = id, "Fetch succeeded");
        self.persist(key, value);
      }
      (Some(true), Err(e)) => {
        warn!(key = %key, request = id, attempts = failures, "Fetch failed: {}", e)
      }
    }
  }
}

/// RAII registration returned by [`QueryClient::subscribe`].
///
/// Dropping it unsubscribes; when the last subscriber of a key leaves, the
/// polling timer stops and the entry is evicted after its `gc_time`.
pub struct Subscription {
  client: Weak<ClientInner>,
  key: QueryKey,
  id: u64,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Explicit form of dropping the subscription.
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.client.upgrade() {
      QueryClient::from_inner(inner).unsubscribe(&self.key, self.id);
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish()
  }
}

async fn resolve(decision: Decision) -> QueryResult<Value> {
  match decision {
    Decision::Cached(value) => Ok(value),
    Decision::Pending(future) => future.await,
    Decision::Failed(e) => Err(e),
  }
}

/// Box a typed fetcher into one producing JSON values.
pub(crate) fn erase<T, F, Fut>(fetcher: F) -> FetcherFn
where
  T: Serialize + Send + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = QueryResult<T>> + Send + 'static,
{
  Arc::new(move || {
    let future = fetcher();
    async move {
      let data = future.await?;
      serde_json::to_value(data).map_err(QueryError::from)
    }
    .boxed()
  })
}

fn spawn_interval(client: Weak<ClientInner>, key: QueryKey, period: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      tokio::time::sleep(period).await;
      let Some(inner) = client.upgrade() else {
        break;
      };
      trace!(key = %key, "Interval refetch");
      let _ = QueryClient::from_inner(inner).decide(&key, None, FetchMode::Background);
    }
  })
}

fn spawn_gc(client: Weak<ClientInner>, key: QueryKey, gc_time: Duration) -> Option<JoinHandle<()>> {
  let runtime = tokio::runtime::Handle::try_current().ok()?;
  Some(runtime.spawn(async move {
    tokio::time::sleep(gc_time).await;
    if let Some(inner) = client.upgrade() {
      inner.store.collect_garbage(&key);
    }
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::query_key;
  use futures::future::BoxFuture;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::sync::Mutex;
  use tokio::time::sleep;

  fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
  }

  /// Fetcher that counts its calls and resolves to `value` after `delay`.
  fn counting<T>(
    calls: &Arc<AtomicU32>,
    value: T,
    delay: Duration,
  ) -> impl Fn() -> BoxFuture<'static, QueryResult<T>> + Send + Sync + 'static
  where
    T: Clone + Send + Sync + 'static,
  {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      let value = value.clone();
      async move {
        sleep(delay).await;
        Ok::<T, QueryError>(value)
      }
      .boxed()
    }
  }

  fn failing(
    calls: &Arc<AtomicU32>,
    error: QueryError,
  ) -> impl Fn() -> BoxFuture<'static, QueryResult<Value>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      let error = error.clone();
      async move { Err::<Value, QueryError>(error) }.boxed()
    }
  }

  fn no_retry() -> QueryOptions {
    QueryOptions::default().with_retry(RetryPolicy::none())
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_subscribers_share_one_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["tickets"];

    let subs: Vec<Subscription> = (0..5)
      .map(|_| {
        client.subscribe(
          key.clone(),
          counting(&calls, json!([{"id": 1}]), ms(100)),
          QueryOptions::default(),
          |_| {},
        )
      })
      .collect();

    assert!(client.get_entry(&key).unwrap().is_loading());
    sleep(ms(150)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let entry = client.get_entry(&key).unwrap();
    assert!(entry.is_success());
    assert_eq!(entry.subscriber_count, 5);
    assert_eq!(entry.data, Some(json!([{"id": 1}])));
    drop(subs);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetch_query_calls_are_deduplicated() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["usage-widget"];

    let (a, b) = tokio::join!(
      client.fetch_query(&key, counting(&calls, 7u32, ms(50)), no_retry()),
      client.fetch_query(&key, counting(&calls, 8u32, ms(50)), no_retry()),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), 7);
    assert_eq!(b.unwrap(), 7);
  }

  #[tokio::test(start_paused = true)]
  async fn test_late_response_from_superseded_request_is_discarded() {
    let client = QueryClient::new();
    let key = query_key!["leads-list", 0, 20];
    let started = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&started);
    let fetcher = move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          sleep(ms(200)).await;
          Ok::<_, QueryError>("v1".to_string())
        } else {
          sleep(ms(50)).await;
          Ok::<_, QueryError>("v2".to_string())
        }
      }
      .boxed()
    };

    let first = client.clone();
    let first_key = key.clone();
    let a = tokio::spawn(async move {
      first
        .fetch_query::<String, _, _>(&first_key, fetcher, no_retry())
        .await
    });
    sleep(ms(10)).await;

    let b = client.refetch(&key).await.unwrap();
    assert_eq!(b, json!("v2"));
    assert_eq!(
      client.get_query_data::<String>(&key).unwrap().as_deref(),
      Some("v2")
    );

    // A's caller still gets its own response, but the cache keeps v2
    assert_eq!(a.await.unwrap().unwrap(), "v1");
    assert_eq!(started.load(Ordering::SeqCst), 2);
    let entry = client.get_entry(&key).unwrap();
    assert_eq!(entry.data, Some(json!("v2")));
    assert!(!entry.is_fetching);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_refetches_only_subscribed_entries() {
    let client = QueryClient::new();
    let page0 = Arc::new(AtomicU32::new(0));
    let page1 = Arc::new(AtomicU32::new(0));
    let page2 = Arc::new(AtomicU32::new(0));
    let batches = Arc::new(AtomicU32::new(0));

    let _s0 = client.subscribe(
      query_key!["leads-list", 0, 20],
      counting(&page0, json!({"leads": []}), ms(0)),
      no_retry(),
      |_| {},
    );
    let _s1 = client.subscribe(
      query_key!["leads-list", 1, 20],
      counting(&page1, json!({"leads": []}), ms(0)),
      no_retry(),
      |_| {},
    );
    let _sb = client.subscribe(
      query_key!["batches"],
      counting(&batches, json!({"batches": []}), ms(0)),
      no_retry(),
      |_| {},
    );
    let unsubscribed = query_key!["leads-list", 2, 20];
    client
      .fetch_query(&unsubscribed, counting(&page2, json!({"leads": []}), ms(0)), no_retry())
      .await
      .unwrap();
    sleep(ms(10)).await;

    let matched = client.invalidate(&query_key!["leads-list"]);
    assert_eq!(matched, 3);
    sleep(ms(10)).await;

    assert_eq!(page0.load(Ordering::SeqCst), 2);
    assert_eq!(page1.load(Ordering::SeqCst), 2);
    assert_eq!(page2.load(Ordering::SeqCst), 1);
    assert_eq!(batches.load(Ordering::SeqCst), 1);

    assert!(client.get_entry(&unsubscribed).unwrap().is_invalidated);
    assert!(!client.get_entry(&query_key!["leads-list", 0, 20]).unwrap().is_invalidated);

    // The next query for the stale entry fetches again
    client
      .fetch_query::<Value, _, _>(
        &unsubscribed,
        counting(&page2, json!({"leads": []}), ms(0)),
        no_retry().with_stale_time(Duration::from_secs(60)),
      )
      .await
      .unwrap();
    assert_eq!(page2.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_time_controls_refetching() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["campaigns-stats"];
    let opts = no_retry().with_stale_time(ms(5000));

    client
      .fetch_query(&key, counting(&calls, 1u32, ms(0)), opts.clone())
      .await
      .unwrap();
    tokio::time::advance(ms(4000)).await;
    client
      .fetch_query(&key, counting(&calls, 1u32, ms(0)), opts.clone())
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(ms(1001)).await;
    client
      .fetch_query(&key, counting(&calls, 1u32, ms(0)), opts)
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_resubscribe_within_gc_time_reuses_entry() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["email-campaigns"];
    let opts = no_retry()
      .with_stale_time(Duration::from_secs(60))
      .with_gc_time(Duration::from_secs(10));

    let sub = client.subscribe(key.clone(), counting(&calls, json!([]), ms(0)), opts.clone(), |_| {});
    sleep(ms(10)).await;
    drop(sub);

    sleep(Duration::from_secs(5)).await;
    let entry = client.get_entry(&key).expect("eviction is deferred");
    assert_eq!(entry.subscriber_count, 0);

    let sub = client.subscribe(key.clone(), counting(&calls, json!([]), ms(0)), opts, |_| {});
    sleep(Duration::from_secs(8)).await;
    // Still cached: the pending eviction was cancelled and the data is fresh
    assert!(client.get_entry(&key).is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    sub.unsubscribe();
    sleep(Duration::from_secs(11)).await;
    assert!(client.get_entry(&key).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_exhausted_keeps_previous_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["notifications", 42];
    client.set_query_data(&key, &json!(["old"])).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_sub = Arc::clone(&seen);
    let opts = QueryOptions::default()
      .with_retry(RetryPolicy {
        count: 3,
        base_delay: ms(100),
        max_delay: ms(1000),
      })
      .enabled(false);
    // Disabled so subscribing doesn't start its own request
    let _sub = client.subscribe(
      key.clone(),
      failing(&calls, QueryError::network("connection refused")),
      opts.clone(),
      move |entry: &QueryEntry| seen_by_sub.lock().unwrap().push(entry.clone()),
    );

    let result = client.retry(&key).await;
    assert_eq!(result, Err(QueryError::network("connection refused")));
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let entry = client.get_entry(&key).unwrap();
    assert!(entry.is_error());
    assert_eq!(entry.failure_count, 4);
    assert_eq!(entry.data, Some(json!(["old"])));
    assert!(!entry.is_fetching);

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert!(last.is_error());
    assert_eq!(last.data, Some(json!(["old"])));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_query_retries_with_backoff() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["tickets"];
    let opts = QueryOptions::default().with_retry(RetryPolicy {
      count: 3,
      base_delay: ms(100),
      max_delay: ms(1000),
    });

    let started = Instant::now();
    let result = client
      .fetch_query::<Value, _, _>(&key, failing(&calls, QueryError::server(503, "busy")), opts)
      .await;

    assert_eq!(result, Err(QueryError::server(503, "busy")));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // 100 + 200 + 400
    assert!(started.elapsed() >= ms(700));
    let entry = client.get_entry(&key).unwrap();
    assert!(entry.is_error());
    assert!(entry.data.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_errors_are_not_retried() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["ticket", 9];

    let result = client
      .fetch_query::<Value, _, _>(
        &key,
        failing(&calls, QueryError::server(404, "not found")),
        QueryOptions::default(),
      )
      .await;

    assert_eq!(result.unwrap_err().status(), Some(404));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_manual_retry_resets_attempts() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["batches"];

    let counter = Arc::clone(&calls);
    let fetcher = move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < 2 {
          Err(QueryError::network("offline"))
        } else {
          Ok(json!({"batches": []}))
        }
      }
      .boxed()
    };
    let opts = QueryOptions::default().with_retry(RetryPolicy {
      count: 1,
      base_delay: ms(10),
      max_delay: ms(10),
    });

    assert!(client.fetch_query::<Value, _, _>(&key, fetcher, opts).await.is_err());
    assert_eq!(client.get_entry(&key).unwrap().failure_count, 2);

    let value = client.retry(&key).await.unwrap();
    assert_eq!(value, json!({"batches": []}));
    let entry = client.get_entry(&key).unwrap();
    assert!(entry.is_success());
    assert_eq!(entry.failure_count, 0);
    assert!(entry.error.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_interval_runs_while_subscribed() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["usage-widget"];
    let opts = no_retry().with_refetch_interval(Duration::from_secs(10));

    let sub = client.subscribe(key.clone(), counting(&calls, json!({"remaining": 5}), ms(0)), opts, |_| {});
    sleep(Duration::from_secs(35)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    drop(sub);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_background_refetch_keeps_success_status() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["tickets"];
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&statuses);

    let _sub = client.subscribe(
      key.clone(),
      counting(&calls, json!([]), ms(20)),
      no_retry(),
      move |entry: &QueryEntry| recorded.lock().unwrap().push((entry.status, entry.is_fetching)),
    );
    sleep(ms(50)).await;
    statuses.lock().unwrap().clear();

    client.invalidate(&query_key!["tickets"]);
    sleep(ms(50)).await;

    let statuses = statuses.lock().unwrap();
    assert!(statuses.iter().all(|(status, _)| *status == QueryStatus::Success));
    assert!(statuses.contains(&(QueryStatus::Success, true)));
    assert_eq!(statuses.last(), Some(&(QueryStatus::Success, false)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_query_never_fetches() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["ticket", ""];
    let opts = QueryOptions::default().enabled(false);

    let _sub = client.subscribe(key.clone(), counting(&calls, json!({}), ms(0)), opts.clone(), |_| {});
    sleep(ms(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.get_entry(&key).unwrap().status, QueryStatus::Idle);

    let result = client
      .fetch_query::<Value, _, _>(&key, counting(&calls, json!({}), ms(0)), opts)
      .await;
    assert_eq!(result, Err(QueryError::Disabled));

    client.invalidate(&key);
    sleep(ms(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_refetch_without_fetcher() {
    let client = QueryClient::new();
    let result = client.refetch(&query_key!["unknown"]).await;
    assert!(matches!(result, Err(QueryError::Unregistered(_))));
  }

  #[tokio::test(start_paused = true)]
  async fn test_typed_decode_error() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["user"];
    client
      .fetch_query::<String, _, _>(&key, counting(&calls, "alice".to_string(), ms(0)), no_retry())
      .await
      .unwrap();

    assert!(matches!(
      client.get_query_data::<u32>(&key),
      Err(QueryError::Decode(_))
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_query_data_notifies_subscribers() {
    let client = QueryClient::new();
    let key = query_key!["ticket", 3];
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);

    let _sub = client.subscribe(
      key.clone(),
      || async { Ok::<_, QueryError>(json!({"id": 3, "status": "open"})) },
      no_retry().with_stale_time(Duration::from_secs(60)),
      move |entry: &QueryEntry| recorded.lock().unwrap().push(entry.data.clone()),
    );
    sleep(ms(10)).await;

    client
      .set_query_data(&key, &json!({"id": 3, "status": "closed"}))
      .unwrap();
    assert_eq!(
      seen.lock().unwrap().last().cloned().flatten(),
      Some(json!({"id": 3, "status": "closed"}))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_snapshot_hydration_and_persistence() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let key = query_key!["leads-list", 0, 20];
    storage.store(&key, &json!({"leads": ["cached"]})).unwrap();

    let client = QueryClient::with_storage(storage.clone(), QueryOptions::default());
    let calls = Arc::new(AtomicU32::new(0));
    let _sub = client.subscribe(
      key.clone(),
      counting(&calls, json!({"leads": ["fresh"]}), ms(100)),
      no_retry(),
      |_| {},
    );

    // Snapshot is visible while the first real fetch runs
    let entry = client.get_entry(&key).unwrap();
    assert_eq!(entry.data, Some(json!({"leads": ["cached"]})));
    assert!(entry.is_success());
    assert!(entry.is_fetching);

    sleep(ms(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
      client.get_entry(&key).unwrap().data,
      Some(json!({"leads": ["fresh"]}))
    );
    assert_eq!(
      storage.load(&key).unwrap().unwrap().data,
      json!({"leads": ["fresh"]})
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_remove_queries_skips_subscribed_entries() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let client = QueryClient::with_storage(storage.clone(), QueryOptions::default());
    let calls = Arc::new(AtomicU32::new(0));

    client
      .fetch_query(&query_key!["user", "me"], counting(&calls, json!({"id": 1}), ms(0)), no_retry())
      .await
      .unwrap();
    let _sub = client.subscribe(
      query_key!["user", "settings"],
      counting(&calls, json!({}), ms(0)),
      no_retry(),
      |_| {},
    );
    sleep(ms(10)).await;

    assert_eq!(client.remove_queries(&query_key!["user"]), 1);
    assert!(client.get_entry(&query_key!["user", "me"]).is_none());
    assert!(storage.load(&query_key!["user", "me"]).unwrap().is_none());
    assert!(client.get_entry(&query_key!["user", "settings"]).is_some());

    client.clear();
    assert!(client.store().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsubscribe_does_not_abort_in_flight_request() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["email-campaigns"];

    let sub = client.subscribe(key.clone(), counting(&calls, json!([1, 2]), ms(100)), no_retry(), |_| {});
    sleep(ms(10)).await;
    drop(sub);
    sleep(ms(200)).await;

    let entry = client.get_entry(&key).unwrap();
    assert_eq!(entry.data, Some(json!([1, 2])));
    assert_eq!(entry.subscriber_count, 0);
  }
}
