//! Per-query options: staleness, polling, retries and garbage collection.

use std::time::Duration;

/// Exponential backoff applied to retryable fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt (so `count + 1` attempts in total)
  pub count: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryPolicy {
  pub const fn none() -> Self {
    Self {
      count: 0,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      count: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }
}

/// Options controlling how a query is cached and refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
  /// Data younger than this is served without fetching
  pub stale_time: Duration,
  /// How long an unsubscribed entry survives before eviction
  pub gc_time: Duration,
  /// Background refetch period while subscribed
  pub refetch_interval: Option<Duration>,
  pub retry: RetryPolicy,
  /// Disabled queries never fetch; they only serve what is cached
  pub enabled: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::ZERO,
      gc_time: Duration::from_secs(5 * 60),
      refetch_interval: None,
      retry: RetryPolicy::default(),
      enabled: true,
    }
  }
}

impl QueryOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
    self.refetch_interval = Some(interval);
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_retry_count(mut self, count: u32) -> Self {
    self.retry.count = count;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      count: 10,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(5),
    };
    assert_eq!(policy.delay_for(0), Duration::from_millis(500));
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    assert_eq!(policy.delay_for(40), Duration::from_secs(5));
  }

  #[test]
  fn test_builder() {
    let opts = QueryOptions::default()
      .with_stale_time(Duration::from_secs(60))
      .with_refetch_interval(Duration::from_secs(10))
      .with_retry_count(1)
      .enabled(false);
    assert_eq!(opts.stale_time, Duration::from_secs(60));
    assert_eq!(opts.refetch_interval, Some(Duration::from_secs(10)));
    assert_eq!(opts.retry.count, 1);
    assert!(!opts.enabled);
  }
}
