//! Error taxonomy for the query cache.

use thiserror::Error;

/// Result type alias for cache operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors surfaced by fetchers, mutators and the cache itself.
///
/// `Clone` is required because a single in-flight request hands its result to
/// every caller that attached to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  /// A query key could not be built (empty, or a non-primitive part).
  #[error("Invalid query key: {0}")]
  InvalidKey(String),

  /// A request URL could not be built from the configured base.
  #[error("Invalid request URL: {0}")]
  InvalidUrl(String),

  /// Transport-level failure (connection refused, timeout, DNS...).
  #[error("Network error: {0}")]
  Network(String),

  /// The server answered with a non-2xx status.
  #[error("Server responded with {status}: {body}")]
  Server { status: u16, body: String },

  /// Cached data could not be converted into the requested type.
  #[error("Failed to decode query data: {0}")]
  Decode(String),

  /// The query is disabled and nothing is cached for it.
  #[error("Query is disabled")]
  Disabled,

  /// A refetch was requested for a key nobody registered a fetcher for.
  #[error("No fetcher registered for {0}")]
  Unregistered(String),

  /// The task running the request was aborted before it finished.
  #[error("Request was cancelled: {0}")]
  Cancelled(String),
}

impl QueryError {
  pub fn network(msg: impl Into<String>) -> Self {
    Self::Network(msg.into())
  }

  pub fn server(status: u16, body: impl Into<String>) -> Self {
    Self::Server {
      status,
      body: body.into(),
    }
  }

  /// Whether the fetch executor may retry after this error.
  ///
  /// Transport failures and 5xx responses are retryable; everything else is
  /// either a caller mistake or a definitive answer from the server.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Network(_) => true,
      Self::Server { status, .. } => (500..600).contains(status),
      _ => false,
    }
  }

  /// HTTP status for server errors.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Server { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<serde_json::Error> for QueryError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retry_policy() {
    assert!(QueryError::network("connection reset").is_retryable());
    assert!(QueryError::server(503, "unavailable").is_retryable());
    assert!(QueryError::server(500, "").is_retryable());
    assert!(!QueryError::server(404, "not found").is_retryable());
    assert!(!QueryError::server(401, "unauthorized").is_retryable());
    assert!(!QueryError::InvalidKey("empty".into()).is_retryable());
    assert!(!QueryError::Decode("bad".into()).is_retryable());
    assert!(!QueryError::InvalidUrl("http://[::1".into()).is_retryable());
  }

  #[test]
  fn test_server_error_display() {
    let err = QueryError::server(502, "bad gateway");
    assert_eq!(err.to_string(), "Server responded with 502: bad gateway");
    assert_eq!(err.status(), Some(502));
    assert_eq!(QueryError::network("x").status(), None);
  }
}
