//! One-shot write operations that invalidate cached queries on success.

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::{QueryError, QueryResult};
use super::key::QueryKey;
use super::layer::QueryClient;

/// Lifecycle of a mutation, as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
  #[default]
  Idle,
  Pending,
  Success,
  Error,
}

/// Observable state of a [`Mutation`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MutationState {
  pub status: MutationStatus,
  pub error: Option<QueryError>,
}

impl MutationState {
  pub fn is_pending(&self) -> bool {
    self.status == MutationStatus::Pending
  }
}

type MutatorFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, QueryResult<O>> + Send + Sync>;

/// A write operation bound to the query prefixes it invalidates.
///
/// Each call to [`Mutation::mutate`] invokes the mutator exactly once; writes
/// are not assumed idempotent, so nothing is retried. The status lives as long
/// as the `Mutation` value does.
pub struct Mutation<I, O> {
  client: QueryClient,
  mutator: MutatorFn<I, O>,
  invalidates: Vec<QueryKey>,
  state: watch::Sender<MutationState>,
}

impl QueryClient {
  /// Create a mutation that invalidates every key under `invalidates` when
  /// it succeeds.
  pub fn mutation<I, O, F, Fut>(
    &self,
    mutator: F,
    invalidates: impl IntoIterator<Item = QueryKey>,
  ) -> Mutation<I, O>
  where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryResult<O>> + Send + 'static,
  {
    let (state, _) = watch::channel(MutationState::default());
    Mutation {
      client: self.clone(),
      mutator: Arc::new(move |input| mutator(input).boxed()),
      invalidates: invalidates.into_iter().collect(),
      state,
    }
  }
}

impl<I, O> Mutation<I, O> {
  /// Run the mutator once. On success the configured prefixes are
  /// invalidated before the output is returned; on failure the cache is left
  /// untouched.
  pub async fn mutate(&self, input: I) -> QueryResult<O> {
    self.state.send_replace(MutationState {
      status: MutationStatus::Pending,
      error: None,
    });

    match (self.mutator)(input).await {
      Ok(output) => {
        let invalidated = self.client.invalidate_queries(&self.invalidates);
        debug!(invalidated, "Mutation succeeded");
        self.state.send_replace(MutationState {
          status: MutationStatus::Success,
          error: None,
        });
        Ok(output)
      }
      Err(e) => {
        warn!("Mutation failed: {}", e);
        self.state.send_replace(MutationState {
          status: MutationStatus::Error,
          error: Some(e.clone()),
        });
        Err(e)
      }
    }
  }

  pub fn state(&self) -> MutationState {
    self.state.borrow().clone()
  }

  pub fn status(&self) -> MutationStatus {
    self.state.borrow().status
  }

  pub fn is_pending(&self) -> bool {
    self.status() == MutationStatus::Pending
  }

  /// Receiver notified on every status change (e.g. to disable a submit
  /// action while pending).
  pub fn watch(&self) -> watch::Receiver<MutationState> {
    self.state.subscribe()
  }

  /// Back to `Idle`, forgetting the last error.
  pub fn reset(&self) {
    self.state.send_replace(MutationState::default());
  }

  pub fn invalidates(&self) -> &[QueryKey] {
    &self.invalidates
  }
}

impl<I, O> fmt::Debug for Mutation<I, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutation")
      .field("invalidates", &self.invalidates)
      .field("state", &*self.state.borrow())
      .finish_non_exhaustive()
  }
}
