//! Cached state of a single query key.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use super::error::{QueryError, QueryResult};

/// Lifecycle status of a query entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
  /// Nothing has been fetched yet
  #[default]
  Idle,
  /// First fetch in progress, no data available
  Loading,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed (data from an earlier success may still be present)
  Error,
}

/// Snapshot of the cached state for one key.
///
/// Subscribers receive a reference to this on every state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryEntry {
  pub data: Option<Value>,
  pub status: QueryStatus,
  /// Present only when `status == Error`
  pub error: Option<QueryError>,
  /// Monotonic time of the last successful fetch, used for staleness
  pub last_fetched_at: Option<Instant>,
  /// Wall-clock time of the last successful fetch
  pub updated_at: Option<DateTime<Utc>>,
  /// Set by invalidation, cleared by the next successful fetch
  pub is_invalidated: bool,
  /// A request is in flight (also true during background refreshes)
  pub is_fetching: bool,
  /// Failed attempts of the current request so far
  pub failure_count: u32,
  pub subscriber_count: usize,
}

impl QueryEntry {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// Whether cached data is still fresh under the given stale time.
  pub fn is_fresh(&self, stale_time: Duration) -> bool {
    if self.status != QueryStatus::Success || self.is_invalidated {
      return false;
    }
    match self.last_fetched_at {
      Some(at) => at.elapsed() < stale_time,
      None => false,
    }
  }

  /// Decode the cached data into a concrete type.
  pub fn data_as<T: DeserializeOwned>(&self) -> QueryResult<Option<T>> {
    self
      .data
      .as_ref()
      .map(|v| serde_json::from_value(v.clone()))
      .transpose()
      .map_err(QueryError::from)
  }
}
