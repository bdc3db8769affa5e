//! In-memory cache store: key → entry mapping with subscriber notification.

use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entry::QueryEntry;
use super::error::QueryResult;
use super::key::QueryKey;
use super::options::QueryOptions;

/// Change listener registered by a subscriber.
pub type Callback = Arc<dyn Fn(&QueryEntry) + Send + Sync>;

/// Type-erased fetcher producing the JSON value for a key.
pub(crate) type FetcherFn = Arc<dyn Fn() -> BoxFuture<'static, QueryResult<Value>> + Send + Sync>;

/// Result of a running request, awaitable by any number of callers.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, QueryResult<Value>>>;

/// The request currently allowed to write into an entry.
pub(crate) struct InFlight {
  pub id: u64,
  pub future: SharedFetch,
}

/// Everything the store keeps per key, beyond the observable entry.
pub(crate) struct Slot {
  pub entry: QueryEntry,
  pub subscribers: Vec<(u64, Callback)>,
  pub in_flight: Option<InFlight>,
  /// Latest fetcher registered for this key, reused by invalidation and polling
  pub fetcher: Option<FetcherFn>,
  pub options: QueryOptions,
  pub interval_task: Option<JoinHandle<()>>,
  pub gc_task: Option<JoinHandle<()>>,
}

impl Slot {
  fn new() -> Self {
    Self {
      entry: QueryEntry::default(),
      subscribers: Vec::new(),
      in_flight: None,
      fetcher: None,
      options: QueryOptions::default(),
      interval_task: None,
      gc_task: None,
    }
  }

  fn callbacks(&self) -> Vec<Callback> {
    self.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
  }
}

impl Drop for Slot {
  fn drop(&mut self) {
    if let Some(task) = self.interval_task.take() {
      task.abort();
    }
    if let Some(task) = self.gc_task.take() {
      task.abort();
    }
  }
}

/// Process-wide mapping from [`QueryKey`] to cached state.
///
/// Every write goes through [`CacheStore::set`] (or the crate-internal slot
/// accessors), which notify the key's subscribers synchronously, in
/// subscription order, after the internal lock has been released.
pub struct CacheStore {
  slots: Mutex<HashMap<QueryKey, Slot>>,
  next_subscriber_id: AtomicU64,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStore {
  pub fn new() -> Self {
    Self {
      slots: Mutex::new(HashMap::new()),
      next_subscriber_id: AtomicU64::new(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, Slot>> {
    // A panic while holding the lock leaves the map itself consistent
    self.slots.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Current snapshot of an entry.
  pub fn get(&self, key: &QueryKey) -> Option<QueryEntry> {
    self.lock().get(key).map(|slot| slot.entry.clone())
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.lock().contains_key(key)
  }

  /// Apply `updater` to the entry (creating an idle one if absent) and notify
  /// all subscribers of the key.
  pub fn set(&self, key: &QueryKey, updater: impl FnOnce(&mut QueryEntry)) {
    let (snapshot, callbacks) = {
      let mut slots = self.lock();
      let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
      updater(&mut slot.entry);
      (slot.entry.clone(), slot.callbacks())
    };
    notify(key, &snapshot, &callbacks);
  }

  /// Evict an entry. Refused (returns `false`) while it has subscribers.
  pub fn remove(&self, key: &QueryKey) -> bool {
    let removed = {
      let mut slots = self.lock();
      let evictable = slots
        .get(key)
        .is_some_and(|slot| slot.entry.subscriber_count == 0);
      if evictable {
        slots.remove(key)
      } else {
        None
      }
    };
    // Slot is dropped here, outside the lock, aborting its timers
    match removed {
      Some(_) => {
        debug!(key = %key, "Evicted query entry");
        true
      }
      None => false,
    }
  }

  /// Every cached key whose leading parts equal `prefix`.
  pub fn keys_matching(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    self
      .lock()
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect()
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    self.lock().keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Drop every entry, subscribed or not.
  pub fn clear(&self) {
    let drained: Vec<Slot> = self.lock().drain().map(|(_, slot)| slot).collect();
    drop(drained);
  }

  /// Run `f` against the slot for `key`, creating it if absent. Subscribers
  /// are notified if the observable entry changed.
  pub(crate) fn with_slot<R>(&self, key: &QueryKey, f: impl FnOnce(&mut Slot) -> R) -> R {
    let (result, changed) = {
      let mut slots = self.lock();
      let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
      let before = slot.entry.clone();
      let result = f(slot);
      let changed = (before != slot.entry).then(|| (slot.entry.clone(), slot.callbacks()));
      (result, changed)
    };
    if let Some((snapshot, callbacks)) = changed {
      notify(key, &snapshot, &callbacks);
    }
    result
  }

  /// Like [`CacheStore::with_slot`] but never creates a slot.
  pub(crate) fn with_existing_slot<R>(
    &self,
    key: &QueryKey,
    f: impl FnOnce(&mut Slot) -> R,
  ) -> Option<R> {
    let (result, changed) = {
      let mut slots = self.lock();
      let slot = slots.get_mut(key)?;
      let before = slot.entry.clone();
      let result = f(slot);
      let changed = (before != slot.entry).then(|| (slot.entry.clone(), slot.callbacks()));
      (result, changed)
    };
    if let Some((snapshot, callbacks)) = changed {
      notify(key, &snapshot, &callbacks);
    }
    Some(result)
  }

  /// Insert a prepared slot unless one already exists.
  pub(crate) fn insert_if_absent(&self, key: &QueryKey, entry: QueryEntry) -> bool {
    let mut slots = self.lock();
    if slots.contains_key(key) {
      return false;
    }
    let mut slot = Slot::new();
    slot.entry = entry;
    slots.insert(key.clone(), slot);
    true
  }

  /// Evict `key` if it still has no subscribers. Used by the GC timer, which
  /// must not abort itself while doing so.
  pub(crate) fn collect_garbage(&self, key: &QueryKey) -> bool {
    let removed = {
      let mut slots = self.lock();
      let evictable = slots
        .get(key)
        .is_some_and(|slot| slot.entry.subscriber_count == 0);
      if evictable {
        slots.remove(key).map(|mut slot| {
          drop(slot.gc_task.take());
          slot
        })
      } else {
        None
      }
    };
    if removed.is_some() {
      debug!(key = %key, "Garbage collected unused query entry");
    }
    removed.is_some()
  }

  pub(crate) fn next_subscriber_id(&self) -> u64 {
    self.next_subscriber_id.fetch_add(1, Ordering::Relaxed)
  }
}

/// Deliver a snapshot to every callback; a panicking callback is logged and
/// does not stop delivery to the rest.
fn notify(key: &QueryKey, snapshot: &QueryEntry, callbacks: &[Callback]) {
  for (index, callback) in callbacks.iter().enumerate() {
    if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
      warn!(key = %key, subscriber = index, "Subscriber callback panicked");
    }
  }
}
