use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{QueryOptions, RetryPolicy};

/// Environment variable holding the backend access token
pub const TOKEN_ENV: &str = "LEADSYNC_ACCESS_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// User whose notifications are watched
  pub user_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend base URL, e.g. "https://app.example.com"
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

/// Query defaults, overridable per resource.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  /// Keep snapshots on disk so the next start shows data immediately
  pub persist: bool,
  pub stale_time_ms: u64,
  pub gc_time_secs: u64,
  pub retry_count: u32,
  pub retry_base_delay_ms: u64,
  pub retry_max_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let options = QueryOptions::default();
    Self {
      persist: true,
      stale_time_ms: options.stale_time.as_millis() as u64,
      gc_time_secs: options.gc_time.as_secs(),
      retry_count: options.retry.count,
      retry_base_delay_ms: options.retry.base_delay.as_millis() as u64,
      retry_max_delay_ms: options.retry.max_delay.as_millis() as u64,
    }
  }
}

impl CacheConfig {
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions::default()
      .with_stale_time(Duration::from_millis(self.stale_time_ms))
      .with_gc_time(Duration::from_secs(self.gc_time_secs))
      .with_retry(RetryPolicy {
        count: self.retry_count,
        base_delay: Duration::from_millis(self.retry_base_delay_ms),
        max_delay: Duration::from_millis(self.retry_max_delay_ms),
      })
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./leadsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/leadsync/config.yaml
  /// 4. ~/.config/leadsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/leadsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("leadsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("leadsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Directory for the token file, snapshots and logs.
  pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("leadsync"))
  }

  pub fn token_path() -> Option<PathBuf> {
    Self::data_dir().map(|d| d.join("access_token"))
  }

  /// Get the backend access token.
  ///
  /// Checks LEADSYNC_ACCESS_TOKEN first, then the token file written by
  /// `leadsync login`.
  pub fn get_access_token() -> Result<String> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
      return Ok(token);
    }
    let path = Self::token_path().ok_or_else(|| eyre!("Could not determine data directory"))?;
    Self::read_access_token(&path)?.ok_or_else(|| {
      eyre!(
        "Access token not found. Run `leadsync login` or set the {} environment variable.",
        TOKEN_ENV
      )
    })
  }

  /// Get the login password from environment variables.
  ///
  /// Checks LEADSYNC_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("LEADSYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set LEADSYNC_PASSWORD environment variable."))
  }

  pub fn read_access_token(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
      Ok(contents) => {
        let token = contents.trim();
        Ok((!token.is_empty()).then(|| token.to_string()))
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(eyre!("Failed to read token file {}: {}", path.display(), e)),
    }
  }

  pub fn store_access_token(path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create directory {}: {}", parent.display(), e))?;
    }
    std::fs::write(path, token)
      .map_err(|e| eyre!("Failed to write token file {}: {}", path.display(), e))
  }

  /// Delete the token file. Returns whether one existed.
  pub fn clear_access_token(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(eyre!("Failed to delete token file {}: {}", path.display(), e)),
    }
  }
}
