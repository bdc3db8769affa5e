//! Client-side data synchronization layer.
//!
//! This module provides a transport-agnostic query cache that:
//! - Keys server data by [`QueryKey`] and tracks its loading/error state
//! - Collapses concurrent requests for the same key into one
//! - Serves fresh data without fetching and refetches stale data
//! - Notifies subscribers on every change, isolating misbehaving ones
//! - Invalidates key prefixes after mutations, refetching what is on screen
//! - Polls subscribed queries and evicts unused entries after a grace period
//! - Optionally persists snapshots so a new process starts with data (offline mode)

mod entry;
mod error;
mod key;
mod layer;
mod mutation;
mod options;
mod storage;
mod store;

pub use entry::{QueryEntry, QueryStatus};
pub use error::{QueryError, QueryResult};
pub use key::{FiniteF64, KeyPart, QueryKey};
pub use layer::{QueryClient, Subscription};
pub use mutation::{Mutation, MutationState, MutationStatus};
pub use options::{QueryOptions, RetryPolicy};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage, Snapshot};
pub use store::{CacheStore, Callback};
