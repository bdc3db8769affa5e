//! Tracing setup: daily rolling log file, optionally mirrored to stderr.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable read for the log filter
pub const LOG_ENV: &str = "LEADSYNC_LOG";
const DEFAULT_FILTER: &str = "leadsync=info";

fn env_filter(verbose: bool) -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
    EnvFilter::new(if verbose {
      "leadsync=debug"
    } else {
      DEFAULT_FILTER
    })
  })
}

/// Install the global subscriber writing to `<log_dir>/leadsync.log.<date>`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes buffered lines.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "leadsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let file_layer = fmt::layer().with_ansi(false).with_target(true).with_writer(writer);
  let stderr_layer = verbose.then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(env_filter(verbose))
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

/// Stderr-only logging, used when no data directory is available.
pub fn init_stderr(verbose: bool) -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(verbose))
    .with_writer(std::io::stderr)
    .with_target(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_init_creates_log_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    let log_dir = dir.path().join("logs");

    // Another test may have installed a subscriber first; the directory is
    // created either way.
    let _ = init(&log_dir, false);
    assert!(log_dir.is_dir());
  }
}
