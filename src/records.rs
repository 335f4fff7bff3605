//! Offline record store.
//!
//! Records are domain objects written locally while offline (or
//! optimistically) so the UI can read them back before the server has
//! confirmed them. They are independent of the sync queue; the only link is a
//! queue item's `record_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{decode_all, to_document, Index, Partition, PersistentStore};

/// Kind of an offline record. The set is open; unknown kinds round-trip as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecordType {
  Summary,
  Voice,
  UserData,
  Other(String),
}

impl RecordType {
  pub fn as_str(&self) -> &str {
    match self {
      Self::Summary => "summary",
      Self::Voice => "voice",
      Self::UserData => "user_data",
      Self::Other(s) => s,
    }
  }
}

impl From<String> for RecordType {
  fn from(s: String) -> Self {
    match s.as_str() {
      "summary" => Self::Summary,
      "voice" => Self::Voice,
      "user_data" => Self::UserData,
      _ => Self::Other(s),
    }
  }
}

impl From<&str> for RecordType {
  fn from(s: &str) -> Self {
    Self::from(s.to_string())
  }
}

impl From<RecordType> for String {
  fn from(t: RecordType) -> Self {
    t.as_str().to_string()
  }
}

impl fmt::Display for RecordType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A locally created domain record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRecord {
  pub id: String,
  #[serde(rename = "type")]
  pub record_type: RecordType,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  /// Flips to true once, after the server confirmed the matching mutation
  pub synced: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub synced_at: Option<DateTime<Utc>>,
}

/// Record counts for the diagnostics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
  pub total: usize,
  pub unsynced: usize,
}

/// Store for offline records.
#[derive(Clone)]
pub struct OfflineRecordStore {
  store: Arc<dyn PersistentStore>,
}

/// Generate a record id: millisecond timestamp plus random suffix.
pub fn new_record_id() -> String {
  ulid::Ulid::new().to_string()
}

impl OfflineRecordStore {
  pub fn new(store: Arc<dyn PersistentStore>) -> Self {
    Self { store }
  }

  /// Store a record and return its id.
  ///
  /// Only serialization failures are returned. If the store is unavailable the
  /// record is not persisted, which is logged; use [`Self::store_durable`] when
  /// the caller needs confirmation.
  pub async fn store<T: Serialize>(&self, record_type: RecordType, payload: &T) -> Result<String> {
    let record = Self::build(record_type, payload)?;
    let id = record.id.clone();
    if let Err(e) = self.write(&record).await {
      warn!(id = %id, error = %e, "offline record not persisted");
    }
    Ok(id)
  }

  /// Store a record, failing if it could not be persisted.
  pub async fn store_durable<T: Serialize>(&self, record_type: RecordType, payload: &T) -> Result<String> {
    let record = Self::build(record_type, payload)?;
    self.write(&record).await?;
    Ok(record.id)
  }

  /// Get a record by id.
  pub async fn get(&self, id: &str) -> Option<OfflineRecord> {
    match self.store.get(Partition::OfflineData, id).await {
      Ok(Some(doc)) => serde_json::from_value(doc)
        .map_err(|e| warn!(id, error = %e, "undecodable offline record"))
        .ok(),
      Ok(None) => None,
      Err(e) => {
        warn!(id, error = %e, "offline record read failed");
        None
      }
    }
  }

  /// Records of one type, oldest first.
  pub async fn list_by_type(&self, record_type: &RecordType) -> Vec<OfflineRecord> {
    let key = Value::String(record_type.as_str().to_string());
    let docs = match self
      .store
      .get_all_by_index(Partition::OfflineData, Index::Type, &key)
      .await
    {
      Ok(docs) => docs,
      Err(e) => {
        warn!(%record_type, error = %e, "offline record scan failed");
        return Vec::new();
      }
    };
    sorted(decode_all(Partition::OfflineData, docs))
  }

  /// All records, oldest first.
  pub async fn list_all(&self) -> Vec<OfflineRecord> {
    match self.store.get_all(Partition::OfflineData).await {
      Ok(docs) => sorted(decode_all(Partition::OfflineData, docs)),
      Err(e) => {
        warn!(error = %e, "offline record scan failed");
        Vec::new()
      }
    }
  }

  /// Records still waiting for server confirmation.
  pub async fn list_unsynced(&self) -> Vec<OfflineRecord> {
    self
      .list_all()
      .await
      .into_iter()
      .filter(|r| !r.synced)
      .collect()
  }

  /// Mark a record as confirmed by the server.
  ///
  /// Idempotent: already-synced or missing records are left alone. Returns
  /// whether the flag was flipped by this call.
  pub async fn mark_synced(&self, id: &str) -> bool {
    let Some(mut record) = self.get(id).await else {
      debug!(id, "mark_synced on unknown record");
      return false;
    };
    if record.synced {
      return false;
    }

    record.synced = true;
    record.synced_at = Some(Utc::now());
    match self.write(&record).await {
      Ok(()) => {
        info!(id, record_type = %record.record_type, "offline record synced");
        true
      }
      Err(e) => {
        warn!(id, error = %e, "failed to persist synced flag");
        false
      }
    }
  }

  /// Delete a record. Missing ids are ignored.
  pub async fn delete(&self, id: &str) -> Result<()> {
    self.store.delete(Partition::OfflineData, id).await
  }

  pub async fn counts(&self) -> Result<RecordCounts> {
    let docs = self.store.get_all(Partition::OfflineData).await?;
    let records: Vec<OfflineRecord> = decode_all(Partition::OfflineData, docs);
    Ok(RecordCounts {
      total: records.len(),
      unsynced: records.iter().filter(|r| !r.synced).count(),
    })
  }

  fn build<T: Serialize>(record_type: RecordType, payload: &T) -> Result<OfflineRecord> {
    Ok(OfflineRecord {
      id: new_record_id(),
      record_type,
      payload: serde_json::to_value(payload)?,
      created_at: Utc::now(),
      synced: false,
      synced_at: None,
    })
  }

  async fn write(&self, record: &OfflineRecord) -> Result<()> {
    self
      .store
      .put(Partition::OfflineData, &record.id, &to_document(record)?)
      .await
  }
}

fn sorted(mut records: Vec<OfflineRecord>) -> Vec<OfflineRecord> {
  records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
  records
}
