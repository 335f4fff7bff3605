//! SQLite-backed document store.

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{Index, Partition, PersistentStore};
use crate::error::{Error, Result};

/// SQLite document store. One table per partition, documents stored as JSON
/// text with expression indexes over the indexed fields.
///
/// Queries run synchronously on the calling task behind a mutex. Every call
/// touches a single small table on a local file, so they are not moved to
/// `spawn_blocking`.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::StorageUnavailable(format!(
          "Failed to create store directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::StorageUnavailable(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Open a throwaway store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Default location under the user's data directory.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::StorageUnavailable("Could not determine data directory".into()))?;

    Ok(data_dir.join("offline-sync").join("offline.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn.execute_batch(&schema())?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

/// Build the schema for every partition.
fn schema() -> String {
  let mut sql = String::new();
  for partition in Partition::ALL {
    let table = partition.name();
    sql.push_str(&format!(
      "CREATE TABLE IF NOT EXISTS {table} (
          key TEXT PRIMARY KEY,
          doc TEXT NOT NULL,
          written_at TEXT NOT NULL DEFAULT (datetime('now'))
      );\n"
    ));
    for index in partition.indexes() {
      sql.push_str(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_{name} ON {table}({expr});\n",
        name = index.name(),
        expr = field_expr(*index),
      ));
    }
  }
  sql
}

fn field_expr(index: Index) -> String {
  format!("json_extract(doc, '$.{}')", index.field())
}

/// Map a JSON value onto what `json_extract` yields for it.
fn to_sql_value(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    },
    Value::String(s) => SqlValue::Text(s.clone()),
    other => SqlValue::Text(other.to_string()),
  }
}

fn parse_rows(rows: Vec<String>) -> Result<Vec<Value>> {
  rows
    .iter()
    .map(|text| serde_json::from_str(text).map_err(Error::from))
    .collect()
}

#[async_trait]
impl PersistentStore for SqliteStore {
  async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!("SELECT doc FROM {} WHERE key = ?", partition.name()))?;

    let doc: Option<String> = stmt
      .query_row(params![key], |row| row.get(0))
      .optional()?;

    match doc {
      Some(text) => Ok(Some(serde_json::from_str(&text)?)),
      None => Ok(None),
    }
  }

  async fn put(&self, partition: Partition, key: &str, value: &Value) -> Result<()> {
    let text = serde_json::to_string(value)?;
    let conn = self.lock()?;
    conn.execute(
      &format!(
        "INSERT OR REPLACE INTO {} (key, doc, written_at) VALUES (?, ?, datetime('now'))",
        partition.name()
      ),
      params![key, text],
    )?;
    debug!(%partition, key, "stored document");
    Ok(())
  }

  async fn delete(&self, partition: Partition, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      &format!("DELETE FROM {} WHERE key = ?", partition.name()),
      params![key],
    )?;
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

    let conn = self.lock()?;
    let bound = to_sql_value(value);
    let (condition, args) = match bound {
      SqlValue::Null => (format!("{} IS NULL", field_expr(index)), vec![]),
      other => (format!("{} = ?", field_expr(index)), vec![other]),
    };

    let mut stmt = conn.prepare(&format!(
      "SELECT doc FROM {} WHERE {} ORDER BY key",
      partition.name(),
      condition
    ))?;
    let rows = stmt
      .query_map(params_from_iter(args), |row| row.get::<_, String>(0))?
      .collect::<std::result::Result<Vec<_>, _>>()?;

    parse_rows(rows)
  }

  async fn get_all(&self, partition: Partition) -> Result<Vec<Value>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!("SELECT doc FROM {} ORDER BY key", partition.name()))?;
    let rows = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<std::result::Result<Vec<_>, _>>()?;

    parse_rows(rows)
  }

  async fn clear(&self, partition: Partition) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(&format!("DELETE FROM {}", partition.name()), [])?;
    debug!(%partition, "cleared partition");
    Ok(())
  }
}
