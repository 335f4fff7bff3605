//! Persistent document store abstraction.
//!
//! Every component that needs durability goes through [`PersistentStore`].
//! Documents are JSON values grouped into [`Partition`]s; each partition
//! exposes a fixed set of secondary [`Index`]es over top-level document
//! fields. Calls are individually atomic, there are no multi-call
//! transactions.

mod memory;
mod sqlite;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Logical partitions of the physical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// Cache entries keyed by cache key
  Cache,
  /// Offline records keyed by record id
  OfflineData,
  /// Pending mutations keyed by item id
  SyncQueue,
  /// Mutations taken by a drain and not yet settled
  InFlight,
}

impl Partition {
  pub const ALL: [Partition; 4] = [
    Partition::Cache,
    Partition::OfflineData,
    Partition::SyncQueue,
    Partition::InFlight,
  ];

  /// Physical name (table name for SQL backends).
  pub fn name(&self) -> &'static str {
    match self {
      Self::Cache => "cache",
      Self::OfflineData => "offline_data",
      Self::SyncQueue => "sync_queue",
      Self::InFlight => "in_flight",
    }
  }

  /// Indexes declared for this partition.
  pub fn indexes(&self) -> &'static [Index] {
    match self {
      Self::Cache => &[Index::Timestamp],
      Self::OfflineData => &[Index::Type, Index::Timestamp],
      Self::SyncQueue => &[Index::Timestamp, Index::Retries],
      Self::InFlight => &[Index::Timestamp],
    }
  }

  pub fn has_index(&self, index: Index) -> bool {
    self.indexes().contains(&index)
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Secondary indexes, each bound to a top-level document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
  Type,
  Timestamp,
  Retries,
}

impl Index {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Type => "type",
      Self::Timestamp => "timestamp",
      Self::Retries => "retries",
    }
  }

  /// Document field the index reads.
  pub fn field(&self) -> &'static str {
    match self {
      Self::Type => "type",
      Self::Timestamp => "created_at",
      Self::Retries => "retry_count",
    }
  }
}

impl fmt::Display for Index {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Asynchronous document store.
///
/// Any call may fail with [`crate::Error::StorageUnavailable`]; callers are
/// expected to log and degrade rather than propagate it to the user.
#[async_trait]
pub trait PersistentStore: Send + Sync {
  /// Get a document by key.
  async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>>;

  /// Insert or overwrite a document.
  async fn put(&self, partition: Partition, key: &str, value: &Value) -> Result<()>;

  /// Delete a document. Deleting a missing key is not an error.
  async fn delete(&self, partition: Partition, key: &str) -> Result<()>;

  /// All documents whose indexed field equals `value`.
  async fn get_all_by_index(
    &self,
    partition: Partition,
    index: Index,
    value: &Value,
  ) -> Result<Vec<Value>>;

  /// All documents in the partition, ordered by key.
  async fn get_all(&self, partition: Partition) -> Result<Vec<Value>>;

  /// Remove every document in the partition.
  async fn clear(&self, partition: Partition) -> Result<()>;
}

/// Serialize a value into a store document.
pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<Value> {
  Ok(serde_json::to_value(value)?)
}

/// Decode documents, skipping (and logging) any that no longer parse.
pub(crate) fn decode_all<T: DeserializeOwned>(partition: Partition, docs: Vec<Value>) -> Vec<T> {
  docs
    .into_iter()
    .filter_map(|doc| match serde_json::from_value(doc) {
      Ok(v) => Some(v),
      Err(e) => {
        warn!(%partition, error = %e, "skipping undecodable document");
        None
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partition_indexes_match_layout() {
    assert!(Partition::OfflineData.has_index(Index::Type));
    assert!(Partition::OfflineData.has_index(Index::Timestamp));
    assert!(Partition::SyncQueue.has_index(Index::Retries));
    assert!(!Partition::Cache.has_index(Index::Type));
  }

  #[test]
  fn test_decode_all_skips_bad_documents() {
    let docs = vec![serde_json::json!(1), serde_json::json!("nope"), serde_json::json!(3)];
    let decoded: Vec<u32> = decode_all(Partition::Cache, docs);
    assert_eq!(decoded, vec![1, 3]);
  }
}
