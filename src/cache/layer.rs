//! Cache layer over the persistent store.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::entry::{CacheConfig, CacheEntry, CacheResult};
use crate::error::Result;
use crate::store::{to_document, Partition, PersistentStore};

/// Default ceiling on the number of cache entries.
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// Outcome of a sweep over the cache partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  /// Entries past their TTL
  pub expired: usize,
  /// Entries written under another schema version
  pub stale: usize,
  /// Valid entries removed oldest-first to get under the ceiling
  pub evicted: usize,
  /// Documents that no longer decode as cache entries
  pub corrupt: usize,
  /// Entries left after the sweep
  pub remaining: usize,
}

impl SweepReport {
  pub fn removed(&self) -> usize {
    self.expired + self.stale + self.evicted + self.corrupt
  }
}

/// Cache layer that manages expiry, versioning and eviction.
///
/// Reads never mutate the store; invalid entries are left in place until the
/// next sweep.
pub struct CacheLayer {
  store: Arc<dyn PersistentStore>,
  defaults: CacheConfig,
  max_entries: usize,
  /// Approximate entry count; `None` until first measured
  estimated_len: Arc<Mutex<Option<usize>>>,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(store: Arc<dyn PersistentStore>) -> Self {
    Self {
      store,
      defaults: CacheConfig::default(),
      max_entries: DEFAULT_MAX_ENTRIES,
      estimated_len: Arc::new(Mutex::new(None)),
    }
  }

  /// Set the TTL and schema version used when callers don't pass their own.
  pub fn with_defaults(mut self, defaults: CacheConfig) -> Self {
    self.defaults = defaults;
    self
  }

  /// Set the size ceiling enforced by sweeps.
  pub fn with_max_entries(mut self, max_entries: usize) -> Self {
    self.max_entries = max_entries;
    self
  }

  pub fn defaults(&self) -> &CacheConfig {
    &self.defaults
  }

  /// Cache a value with the default TTL and schema version.
  pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let config = self.defaults.clone();
    self.set_with(key, value, &config).await
  }

  /// Cache a value with an explicit TTL and schema version.
  ///
  /// Only serialization failures are returned; storage failures are logged and
  /// the write is dropped.
  pub async fn set_with<T: Serialize>(&self, key: &str, value: &T, config: &CacheConfig) -> Result<()> {
    let value = serde_json::to_value(value)?;
    let entry = CacheEntry::new(key, value, config);
    let doc = to_document(&entry)?;

    if self.over_ceiling().await {
      // Make room for the entry about to be written
      if let Err(e) = self.sweep_to(self.max_entries.saturating_sub(1)).await {
        warn!(error = %e, "cache sweep failed, continuing with write");
      }
    }

    match self.store.put(Partition::Cache, key, &doc).await {
      Ok(()) => {
        self.adjust_estimate(|n| n + 1);
        debug!(key, "cached value");
      }
      Err(e) => warn!(key, error = %e, "cache write dropped"),
    }
    Ok(())
  }

  /// Get a value if it is fresh and matches the default schema version.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let version = self.defaults.schema_version.clone();
    self.get_with_version(key, &version).await
  }

  /// Get a value if it is fresh and was written under `schema_version`.
  pub async fn get_with_version<T: DeserializeOwned>(&self, key: &str, schema_version: &str) -> Option<T> {
    let entry = self.load_entry(key).await?;
    if !entry.is_valid(schema_version, Utc::now()) {
      return None;
    }
    decode_value(entry)
  }

  /// Cache-first read with network fallback.
  ///
  /// 1. Valid cache entry - return immediately
  /// 2. Otherwise fetch from network and write through
  /// 3. On network failure, return the expired entry (offline mode) if its
  ///    schema version still matches
  pub async fn fetch<T, F, Fut>(&self, key: &str, config: &CacheConfig, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let cached = self.load_entry(key).await;

    if let Some(entry) = &cached {
      if entry.is_valid(&config.schema_version, Utc::now()) {
        if let Some(data) = decode_value(entry.clone()) {
          return Ok(CacheResult::from_cache(data, entry.created_at));
        }
      }
    }

    match fetcher().await {
      Ok(data) => {
        self.set_with(key, &data, config).await?;
        Ok(CacheResult::from_network(data))
      }
      Err(err) => {
        let fallback = cached
          .filter(|entry| entry.schema_version == config.schema_version)
          .and_then(|entry| {
            let cached_at = entry.created_at;
            decode_value(entry).map(|data| (data, cached_at))
          });

        match fallback {
          Some((data, cached_at)) => {
            warn!(key, error = %err, "fetch failed, serving expired cache entry");
            Ok(CacheResult::offline(data, cached_at))
          }
          None => Err(err),
        }
      }
    }
  }

  /// Remove a single entry.
  pub async fn remove(&self, key: &str) {
    match self.store.delete(Partition::Cache, key).await {
      Ok(()) => self.adjust_estimate(|n| n.saturating_sub(1)),
      Err(e) => warn!(key, error = %e, "cache delete failed"),
    }
  }

  /// Remove every entry.
  pub async fn clear(&self) -> Result<()> {
    self.store.clear(Partition::Cache).await?;
    self.set_estimate(0);
    info!("cache cleared");
    Ok(())
  }

  /// Sweep the cache partition.
  ///
  /// Entries are visited oldest first. Expired, wrong-version and undecodable
  /// entries are removed; if the partition is still above the ceiling the
  /// oldest valid entries are removed until it is not.
  ///
  /// "Wrong version" means anything other than this layer's configured schema
  /// version. Entries written under another version through [`Self::set_with`]
  /// stay readable with [`Self::get_with_version`] only until the next sweep.
  pub async fn sweep(&self) -> Result<SweepReport> {
    self.sweep_to(self.max_entries).await
  }

  async fn sweep_to(&self, limit: usize) -> Result<SweepReport> {
    let docs = self.store.get_all(Partition::Cache).await?;
    let mut report = SweepReport::default();
    let mut entries = Vec::with_capacity(docs.len());

    for doc in docs {
      match serde_json::from_value::<CacheEntry>(doc.clone()) {
        Ok(entry) => entries.push(entry),
        Err(_) => {
          if let Some(key) = doc.get("key").and_then(|k| k.as_str()) {
            self.store.delete(Partition::Cache, key).await?;
          }
          report.corrupt += 1;
        }
      }
    }

    entries.sort_by(|a, b| {
      a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.key.cmp(&b.key))
    });

    let now = Utc::now();
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
      if !entry.is_fresh(now) {
        self.store.delete(Partition::Cache, &entry.key).await?;
        report.expired += 1;
      } else if entry.schema_version != self.defaults.schema_version {
        self.store.delete(Partition::Cache, &entry.key).await?;
        report.stale += 1;
      } else {
        kept.push(entry);
      }
    }

    let excess = kept.len().saturating_sub(limit);
    for entry in kept.iter().take(excess) {
      self.store.delete(Partition::Cache, &entry.key).await?;
      report.evicted += 1;
    }

    report.remaining = kept.len() - excess;
    self.set_estimate(report.remaining);

    if report.removed() > 0 {
      info!(
        expired = report.expired,
        stale = report.stale,
        evicted = report.evicted,
        remaining = report.remaining,
        "cache sweep removed entries"
      );
    }
    Ok(report)
  }

  async fn load_entry(&self, key: &str) -> Option<CacheEntry> {
    let doc = match self.store.get(Partition::Cache, key).await {
      Ok(doc) => doc?,
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        return None;
      }
    };

    match serde_json::from_value(doc) {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!(key, error = %e, "ignoring undecodable cache entry");
        None
      }
    }
  }

  /// Whether a write would push the partition past the ceiling.
  async fn over_ceiling(&self) -> bool {
    let known = self.estimated_len.lock().ok().and_then(|n| *n);
    let estimate = match known {
      Some(n) => n,
      None => match self.store.get_all(Partition::Cache).await {
        Ok(docs) => {
          self.set_estimate(docs.len());
          docs.len()
        }
        Err(_) => return false,
      },
    };
    estimate >= self.max_entries
  }

  fn adjust_estimate(&self, f: impl FnOnce(usize) -> usize) {
    if let Ok(mut n) = self.estimated_len.lock() {
      *n = n.map(f);
    }
  }

  fn set_estimate(&self, len: usize) {
    if let Ok(mut n) = self.estimated_len.lock() {
      *n = Some(len);
    }
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      defaults: self.defaults.clone(),
      max_entries: self.max_entries,
      estimated_len: Arc::clone(&self.estimated_len),
    }
  }
}

fn decode_value<T: DeserializeOwned>(entry: CacheEntry) -> Option<T> {
  match serde_json::from_value(entry.value) {
    Ok(v) => Some(v),
    Err(e) => {
      warn!(key = %entry.key, error = %e, "cached value has unexpected shape");
      None
    }
  }
}
