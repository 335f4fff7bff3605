//! Cache entry model and lookup results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Default time-to-live for cache writes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default schema version tag.
pub const DEFAULT_SCHEMA_VERSION: &str = "1";

/// Expiry and version settings applied to a cache write or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
  pub ttl: Duration,
  pub schema_version: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl: DEFAULT_TTL,
      schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
    }
  }
}

impl CacheConfig {
  pub fn new(ttl: Duration, schema_version: impl Into<String>) -> Self {
    Self {
      ttl,
      schema_version: schema_version.into(),
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }
}

/// A cached value as persisted in the `cache` partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub created_at: DateTime<Utc>,
  pub ttl_ms: i64,
  pub schema_version: String,
}

impl CacheEntry {
  pub fn new(key: &str, value: Value, config: &CacheConfig) -> Self {
    Self {
      key: key.to_string(),
      value,
      created_at: Utc::now(),
      ttl_ms: i64::try_from(config.ttl.as_millis()).unwrap_or(i64::MAX),
      schema_version: config.schema_version.clone(),
    }
  }

  /// Whether the entry is still inside its time-to-live at `now`.
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    (now - self.created_at).num_milliseconds() < self.ttl_ms
  }

  /// Fresh and written under the caller's current schema version.
  pub fn is_valid(&self, schema_version: &str, now: DateTime<Utc>) -> bool {
    self.is_fresh(now) && self.schema_version == schema_version
  }
}

/// Result from a cache-first read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// A valid cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Expired data served because the network fetch failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Valid cache entry
  Cache,
  /// Network unavailable, serving an expired entry
  Offline,
}
