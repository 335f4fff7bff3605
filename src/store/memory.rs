//! In-process document store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{Index, Partition, PersistentStore};
use crate::error::{Error, Result};

type Partitions = HashMap<Partition, BTreeMap<String, Value>>;

/// Store backed by in-memory maps. Nothing survives the process, but a single
/// instance can be shared (via `Arc`) to simulate a reload.
#[derive(Default)]
pub struct MemoryStore {
  data: Mutex<Partitions>,
  unavailable: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent call fail with `StorageUnavailable` (or recover).
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Number of documents in a partition.
  pub fn len(&self, partition: Partition) -> usize {
    self
      .data
      .lock()
      .map(|data| data.get(&partition).map_or(0, BTreeMap::len))
      .unwrap_or(0)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Partitions>> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(Error::StorageUnavailable("memory store disabled".into()));
    }
    self
      .data
      .lock()
      .map_err(|e| Error::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

#[async_trait]
impl PersistentStore for MemoryStore {
  async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>> {
    let data = self.lock()?;
    Ok(data.get(&partition).and_then(|p| p.get(key)).cloned())
  }

  async fn put(&self, partition: Partition, key: &str, value: &Value) -> Result<()> {
    let mut data = self.lock()?;
    data
      .entry(partition)
      .or_default()
      .insert(key.to_string(), value.clone());
    Ok(())
  }

  async fn delete(&self, partition: Partition, key: &str) -> Result<()> {
    let mut data = self.lock()?;
    if let Some(p) = data.get_mut(&partition) {
      p.remove(key);
    }
    Ok(())
  }

  async fn get_all_by_index(
    &self,
    partition: Partition,
    index: Index,
    value: &Value,
  ) -> Result<Vec<Value>> {
    if !partition.has_index(index) {
      return Err(Error::InvalidIndex {
        partition: partition.name().to_string(),
        index: index.name().to_string(),
      });
    }

    let data = self.lock()?;
    let field = index.field();
    Ok(
      data
        .get(&partition)
        .map(|p| {
          p.values()
            .filter(|doc| doc.get(field).unwrap_or(&Value::Null) == value)
            .cloned()
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn get_all(&self, partition: Partition) -> Result<Vec<Value>> {
    let data = self.lock()?;
    Ok(
      data
        .get(&partition)
        .map(|p| p.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn clear(&self, partition: Partition) -> Result<()> {
    let mut data = self.lock()?;
    data.remove(&partition);
    Ok(())
  }
}
