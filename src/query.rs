//! Poll-driven view binding over the query cache.
//!
//! A `Query<T>` owns a cache subscription and turns its change notifications
//! into a typed [`QueryState`] an event loop can poll without blocking.
//!
//! # Example
//!
//! ```ignore
//! let mut usage = resources.usage();
//!
//! // In event loop tick
//! if usage.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match usage.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_usage(data),
//!     QueryState::Error { message, .. } => render_error(message),
//!     QueryState::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{
  QueryClient, QueryEntry, QueryError, QueryKey, QueryOptions, QueryResult, QueryStatus,
  Subscription,
};

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started (or is disabled)
  Idle,
  /// First fetch in progress, nothing to show yet
  Loading,
  /// Data is available
  Success(T),
  /// The last fetch failed; data from before the failure is kept
  Error { message: String, previous: Option<T> },
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error { .. })
  }

  /// Current data, including data kept across a failed refetch.
  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      QueryState::Error { previous, .. } => previous.as_ref(),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error { message, .. } => Some(message),
      _ => None,
    }
  }
}

impl<T: DeserializeOwned> QueryState<T> {
  /// Typed view of a cache entry. Data that fails to decode is reported as
  /// an error.
  pub fn from_entry(entry: &QueryEntry) -> Self {
    let data = match entry.data_as::<T>() {
      Ok(data) => data,
      Err(e) => {
        return QueryState::Error {
          message: e.to_string(),
          previous: None,
        }
      }
    };

    match (entry.status, data) {
      (QueryStatus::Error, previous) => QueryState::Error {
        message: entry
          .error
          .as_ref()
          .map(ToString::to_string)
          .unwrap_or_else(|| "Unknown error".to_string()),
        previous,
      },
      (_, Some(data)) => QueryState::Success(data),
      (QueryStatus::Loading, None) => QueryState::Loading,
      _ => QueryState::Idle,
    }
  }
}

/// Live, typed handle on one cached query.
///
/// Query<T> encapsulates:
/// - The cache subscription (dropped with the handle)
/// - Loading/success/error states
/// - Change notifications delivered through a channel
/// - Staleness according to the query's options
pub struct Query<T> {
  client: QueryClient,
  key: QueryKey,
  options: QueryOptions,
  state: QueryState<T>,
  entry: QueryEntry,
  receiver: mpsc::UnboundedReceiver<QueryEntry>,
  _subscription: Subscription,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned + Send + 'static> Query<T> {
  /// Subscribe to `key`, fetching through `fetcher` whenever the cache asks
  /// for fresh data.
  ///
  /// # Example
  ///
  /// ```ignore
  /// let api = api_client.clone();
  /// let query = Query::new(&client, query_key!["tickets"], move || {
  ///     let api = api.clone();
  ///     async move { api.tickets().await }
  /// }, QueryOptions::default());
  /// ```
  pub fn new<F, Fut>(client: &QueryClient, key: QueryKey, fetcher: F, options: QueryOptions) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryResult<T>> + Send + 'static,
  {
    let (tx, receiver) = mpsc::unbounded_channel();
    let subscription = client.subscribe(key.clone(), fetcher, options.clone(), move |entry| {
      // Ignore send errors - the handle may be going away
      let _ = tx.send(entry.clone());
    });

    let entry = client.get_entry(&key).unwrap_or_default();
    Self {
      client: client.clone(),
      key,
      options,
      state: QueryState::from_entry(&entry),
      entry,
      receiver,
      _subscription: subscription,
      _marker: PhantomData,
    }
  }
}

impl<T: DeserializeOwned> Query<T> {
  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// The raw cache entry behind the current state.
  pub fn entry(&self) -> &QueryEntry {
    &self.entry
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// A request is running, including background refreshes of shown data.
  pub fn is_fetching(&self) -> bool {
    self.entry.is_fetching
  }

  pub fn updated_at(&self) -> Option<DateTime<Utc>> {
    self.entry.updated_at
  }

  /// Check if the data is stale (older than the query's stale time).
  pub fn is_stale(&self) -> bool {
    self.entry.is_success() && !self.entry.is_fresh(self.options.stale_time)
  }

  /// Apply pending notifications.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut latest = None;
    while let Ok(entry) = self.receiver.try_recv() {
      latest = Some(entry);
    }
    match latest {
      Some(entry) => self.apply(entry),
      None => false,
    }
  }

  /// Wait until no request is running and return the settled state.
  pub async fn settled(&mut self) -> &QueryState<T> {
    self.poll();
    while self.entry.is_fetching || self.state.is_loading() {
      match self.receiver.recv().await {
        Some(entry) => {
          self.apply(entry);
        }
        None => break,
      }
    }
    &self.state
  }

  /// Wait for the next change of the entry and apply it.
  ///
  /// Returns `false` once the cache stops sending notifications.
  pub async fn changed(&mut self) -> bool {
    loop {
      match self.receiver.recv().await {
        Some(entry) => {
          if self.apply(entry) {
            return true;
          }
        }
        None => return false,
      }
    }
  }

  /// Start a new request in the background, superseding a running one.
  pub fn refetch(&self) {
    let client = self.client.clone();
    let key = self.key.clone();
    tokio::spawn(async move {
      if let Err(e) = client.refetch(&key).await {
        debug!(key = %key, "Refetch failed: {}", e);
      }
    });
  }

  /// Retry after an error with a fresh attempt counter.
  pub fn retry(&self) {
    let client = self.client.clone();
    let key = self.key.clone();
    tokio::spawn(async move {
      if let Err(e) = client.retry(&key).await {
        debug!(key = %key, "Retry failed: {}", e);
      }
    });
  }

  fn apply(&mut self, entry: QueryEntry) -> bool {
    if entry == self.entry {
      return false;
    }
    self.state = QueryState::from_entry(&entry);
    self.entry = entry;
    true
  }

  /// Resolve to the data once settled, or the error that prevented it.
  pub async fn into_result(mut self) -> QueryResult<T>
  where
    T: Clone,
  {
    self.settled().await;
    match (&self.state, &self.entry.error) {
      (QueryState::Success(data), _) => Ok(data.clone()),
      (_, Some(e)) => Err(e.clone()),
      (QueryState::Error { message, .. }, None) => Err(QueryError::Decode(message.clone())),
      _ if !self.options.enabled => Err(QueryError::Disabled),
      _ => Err(QueryError::Cancelled(self.key.to_string())),
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("is_fetching", &self.entry.is_fetching)
      .finish_non_exhaustive()
  }
}
