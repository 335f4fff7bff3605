use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheConfig, DEFAULT_MAX_ENTRIES, DEFAULT_SCHEMA_VERSION};
use crate::engine::{Backoff, SyncPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::error::{Error, Result};

/// Environment variable overriding `api.base_url`.
pub const API_URL_ENV: &str = "OFFLINE_SYNC_API_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub network: NetworkSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL queued endpoints are resolved against
  pub base_url: String,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000/api/v1".to_string(),
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/offline-sync/offline.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub default_ttl_secs: u64,
  pub schema_version: String,
  pub max_entries: usize,
  pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      default_ttl_secs: 24 * 60 * 60,
      schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
      max_entries: DEFAULT_MAX_ENTRIES,
      sweep_interval_secs: 300,
    }
  }
}

impl CacheSettings {
  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig::new(
      Duration::from_secs(self.default_ttl_secs),
      self.schema_version.clone(),
    )
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  /// Delivery attempts per item before it is dropped
  pub max_attempts: u32,
  pub tick_interval_secs: u64,
  pub backoff_initial_ms: u64,
  pub backoff_max_secs: u64,
  pub backoff_factor: f64,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      tick_interval_secs: 30,
      backoff_initial_ms: 2_000,
      backoff_max_secs: 300,
      backoff_factor: 2.0,
    }
  }
}

impl SyncSettings {
  pub fn policy(&self) -> SyncPolicy {
    SyncPolicy {
      max_attempts: self.max_attempts.max(1),
      backoff: Backoff {
        initial: Duration::from_millis(self.backoff_initial_ms),
        max: Duration::from_secs(self.backoff_max_secs),
        // A factor below 1 would shrink the delay on every failed cycle
        factor: self.backoff_factor.max(1.0),
      },
    }
  }

  pub fn tick_interval(&self) -> Duration {
    Duration::from_secs(self.tick_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
  /// Address whose reachability stands in for network presence
  pub probe_addr: String,
  pub probe_interval_secs: u64,
  pub probe_timeout_ms: u64,
}

impl Default for NetworkSettings {
  fn default() -> Self {
    Self {
      probe_addr: "1.1.1.1:53".to_string(),
      probe_interval_secs: 10,
      probe_timeout_ms: 1_500,
    }
  }
}

impl NetworkSettings {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./offline-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-sync/config.yaml
  ///
  /// Falls back to defaults when no file is found. `OFFLINE_SYNC_API_URL`
  /// overrides the API base URL either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!("Config file not found: {}", p.display())));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(url) = std::env::var(API_URL_ENV) {
      config.api.base_url = url;
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

    Self::from_yaml(&contents)
      .map_err(|e| Error::Config(format!("Failed to parse config file {}: {}", path.display(), e)))
  }

  pub fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty document means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  pub fn api_timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs.max(1))
  }
}
