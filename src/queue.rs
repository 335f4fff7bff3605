//! Durable mutation queue.
//!
//! The in-memory mirror is the source of truth while the process runs; every
//! mutation is written through to the store so a restart resumes from the
//! last flushed state. Draining empties the queue before anything is sent;
//! the drained items sit in the `in_flight` partition until they are either
//! settled or put back on the queue, and [`SyncQueue::reload`] returns any
//! leftovers from a crashed drain to the tail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{decode_all, to_document, Partition, PersistentStore};

/// Mutation kind, mapped onto an HTTP verb at delivery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
  Create,
  Update,
  Delete,
}

impl SyncAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for SyncAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  pub id: String,
  pub action: SyncAction,
  pub endpoint: String,
  /// Request body; always `None` for deletes
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  /// Offline record confirmed by this mutation, if any
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub record_id: Option<String>,
  /// Insertion order, used to rebuild FIFO order on reload
  #[serde(default)]
  pub seq: u64,
}

/// What [`SyncQueue::reload`] found in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
  /// Items restored from the queue partition
  pub queued: usize,
  /// Items left in flight by an interrupted drain, returned to the tail
  pub recovered: usize,
}

#[derive(Default)]
struct QueueState {
  items: VecDeque<QueueItem>,
  in_flight: usize,
  next_seq: u64,
}

impl QueueState {
  fn push(&mut self, mut item: QueueItem) -> QueueItem {
    item.seq = self.next_seq;
    self.next_seq += 1;
    self.items.push_back(item.clone());
    item
  }
}

/// Ordered, durable list of pending mutations.
pub struct SyncQueue {
  store: Arc<dyn PersistentStore>,
  state: Mutex<QueueState>,
}

impl SyncQueue {
  /// Create a queue with an empty mirror. Call [`Self::reload`] to pick up
  /// persisted items, or use [`Self::open`].
  pub fn new(store: Arc<dyn PersistentStore>) -> Self {
    Self {
      store,
      state: Mutex::new(QueueState::default()),
    }
  }

  /// Create a queue and load whatever the store holds.
  pub async fn open(store: Arc<dyn PersistentStore>) -> Self {
    let queue = Self::new(store);
    if let Err(e) = queue.reload().await {
      warn!(error = %e, "sync queue reload failed, starting with an empty queue");
    }
    queue
  }

  /// Append a mutation with `retry_count = 0` and return its id.
  ///
  /// The payload is validated here: anything that cannot become JSON is
  /// rejected and never reaches the queue.
  pub async fn enqueue<T: Serialize>(
    &self,
    action: SyncAction,
    endpoint: &str,
    payload: Option<&T>,
  ) -> Result<String> {
    self.enqueue_item(action, endpoint, payload, None).await
  }

  /// Append a mutation that confirms the given offline record on success.
  pub async fn enqueue_for_record<T: Serialize>(
    &self,
    record_id: &str,
    action: SyncAction,
    endpoint: &str,
    payload: Option<&T>,
  ) -> Result<String> {
    self
      .enqueue_item(action, endpoint, payload, Some(record_id.to_string()))
      .await
  }

  async fn enqueue_item<T: Serialize>(
    &self,
    action: SyncAction,
    endpoint: &str,
    payload: Option<&T>,
    record_id: Option<String>,
  ) -> Result<String> {
    let payload = match (action, payload) {
      (SyncAction::Delete, _) | (_, None) => None,
      (_, Some(p)) => Some(serde_json::to_value(p)?),
    };

    let item = QueueItem {
      id: ulid::Ulid::new().to_string(),
      action,
      endpoint: endpoint.to_string(),
      payload,
      created_at: Utc::now(),
      retry_count: 0,
      record_id,
      seq: 0,
    };
    let doc = to_document(&item)?;

    let mut state = self.state.lock().await;
    let item = state.push(item);
    let doc = with_seq(doc, item.seq);
    if let Err(e) = self.store.put(Partition::SyncQueue, &item.id, &doc).await {
      warn!(id = %item.id, error = %e, "queued item kept in memory only");
    }
    debug!(id = %item.id, %action, endpoint, "enqueued mutation");
    Ok(item.id)
  }

  /// Take every queued item and empty the queue.
  ///
  /// Each item is recorded in the in-flight partition before the queue
  /// partition is cleared, so nothing is lost if the process stops before the
  /// item is settled.
  pub async fn drain_snapshot(&self) -> Vec<QueueItem> {
    let mut state = self.state.lock().await;
    let snapshot: Vec<QueueItem> = state.items.drain(..).collect();
    if snapshot.is_empty() {
      return snapshot;
    }

    for item in &snapshot {
      let marked = match to_document(item) {
        Ok(doc) => self.store.put(Partition::InFlight, &item.id, &doc).await,
        Err(e) => Err(e),
      };
      if let Err(e) = marked {
        warn!(id = %item.id, error = %e, "in-flight marker not persisted");
      }
    }
    if let Err(e) = self.store.clear(Partition::SyncQueue).await {
      warn!(error = %e, "failed to clear persisted queue after drain");
    }

    state.in_flight += snapshot.len();
    debug!(count = snapshot.len(), "drained sync queue");
    snapshot
  }

  /// Put a drained item back at the tail with a fresh timestamp.
  ///
  /// The caller decides the new `retry_count`.
  pub async fn requeue(&self, mut item: QueueItem) {
    item.created_at = Utc::now();

    let mut state = self.state.lock().await;
    let item = state.push(item);
    match to_document(&item) {
      Ok(doc) => {
        if let Err(e) = self.store.put(Partition::SyncQueue, &item.id, &doc).await {
          warn!(id = %item.id, error = %e, "requeued item kept in memory only");
        }
      }
      Err(e) => warn!(id = %item.id, error = %e, "requeued item kept in memory only"),
    }
    self.clear_in_flight(&mut state, &item.id).await;
  }

  /// Forget a drained item that was delivered or dropped.
  pub async fn settle(&self, id: &str) {
    let mut state = self.state.lock().await;
    self.clear_in_flight(&mut state, id).await;
  }

  async fn clear_in_flight(&self, state: &mut QueueState, id: &str) {
    state.in_flight = state.in_flight.saturating_sub(1);
    if let Err(e) = self.store.delete(Partition::InFlight, id).await {
      warn!(id, error = %e, "failed to clear in-flight marker");
    }
  }

  /// Rebuild the mirror from the store.
  ///
  /// Items found in the in-flight partition were taken by a drain that never
  /// finished; they go back to the tail without counting as an attempt.
  pub async fn reload(&self) -> Result<ReloadReport> {
    let queued_docs = self.store.get_all(Partition::SyncQueue).await?;
    let in_flight_docs = self.store.get_all(Partition::InFlight).await?;

    let mut queued: Vec<QueueItem> = decode_all(Partition::SyncQueue, queued_docs);
    queued.sort_by_key(|item| item.seq);
    let mut recovered: Vec<QueueItem> = decode_all(Partition::InFlight, in_flight_docs);
    recovered.sort_by_key(|item| item.seq);

    let mut state = self.state.lock().await;
    state.next_seq = queued.iter().map(|i| i.seq + 1).max().unwrap_or(0);
    state.items = queued.into_iter().collect();
    state.in_flight = 0;

    let queued_ids: HashSet<String> = state.items.iter().map(|i| i.id.clone()).collect();
    let mut report = ReloadReport {
      queued: state.items.len(),
      recovered: 0,
    };

    for item in recovered {
      // Already back on the queue; only the marker survived the crash
      if queued_ids.contains(&item.id) {
        self.store.delete(Partition::InFlight, &item.id).await?;
        continue;
      }
      report.recovered += 1;
      let item = state.push(item);
      self
        .store
        .put(Partition::SyncQueue, &item.id, &to_document(&item)?)
        .await?;
      self.store.delete(Partition::InFlight, &item.id).await?;
    }

    if report.recovered > 0 {
      warn!(
        recovered = report.recovered,
        "returned items from an interrupted drain to the queue"
      );
    }
    info!(queued = report.queued, "sync queue loaded");
    Ok(report)
  }

  /// Flush the whole mirror to the store.
  pub async fn persist(&self) -> Result<()> {
    let state = self.state.lock().await;
    self.store.clear(Partition::SyncQueue).await?;
    for item in &state.items {
      self
        .store
        .put(Partition::SyncQueue, &item.id, &to_document(item)?)
        .await?;
    }
    Ok(())
  }

  pub async fn len(&self) -> usize {
    self.state.lock().await.items.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.state.lock().await.items.is_empty()
  }

  /// Items taken by a drain and not yet settled or requeued.
  pub async fn in_flight(&self) -> usize {
    self.state.lock().await.in_flight
  }

  /// Copy of the queued items in delivery order.
  pub async fn items(&self) -> Vec<QueueItem> {
    self.state.lock().await.items.iter().cloned().collect()
  }
}

fn with_seq(mut doc: Value, seq: u64) -> Value {
  if let Some(obj) = doc.as_object_mut() {
    obj.insert("seq".into(), Value::from(seq));
  }
  doc
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use serde_json::json;

  fn queue() -> (Arc<MemoryStore>, SyncQueue) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), SyncQueue::new(store))
  }

  #[tokio::test]
  async fn test_enqueue_starts_with_zero_retries() {
    let (store, queue) = queue();
    let id = queue
      .enqueue(SyncAction::Create, "/summary", Some(&json!({"title": "x"})))
      .await
      .unwrap();

    let items = queue.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, id);
    assert_eq!(items[0].retry_count, 0);
    assert_eq!(store.len(Partition::SyncQueue), 1);
  }

  #[tokio::test]
  async fn test_delete_drops_payload() {
    let (_, queue) = queue();
    queue
      .enqueue(SyncAction::Delete, "/summary/1", Some(&json!({"ignored": true})))
      .await
      .unwrap();
    assert_eq!(queue.items().await[0].payload, None);
  }

  #[tokio::test]
  async fn test_unserializable_payload_is_rejected() {
    use std::collections::HashMap;

    let (store, queue) = queue();
    // Non-string map keys cannot become JSON objects
    let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
    bad.insert((1, 2), 3);

    let result = queue.enqueue(SyncAction::Create, "/x", Some(&bad)).await;
    assert!(matches!(result, Err(crate::Error::Serialization(_))));
    assert!(queue.is_empty().await);
    assert_eq!(store.len(Partition::SyncQueue), 0);
  }

  #[tokio::test]
  async fn test_drain_empties_queue_before_delivery() {
    let (store, queue) = queue();
    for n in 0..3 {
      queue
        .enqueue(SyncAction::Create, "/summary", Some(&json!({"n": n})))
        .await
        .unwrap();
    }

    let snapshot = queue.drain_snapshot().await;
    assert_eq!(snapshot.len(), 3);
    assert!(queue.is_empty().await);
    assert_eq!(store.len(Partition::SyncQueue), 0);
    assert_eq!(store.len(Partition::InFlight), 3);
    assert_eq!(queue.in_flight().await, 3);

    // A second drain sees nothing
    assert!(queue.drain_snapshot().await.is_empty());
  }

  #[tokio::test]
  async fn test_requeue_goes_to_tail() {
    let (store, queue) = queue();
    queue.enqueue(SyncAction::Create, "/a", None::<&Value>).await.unwrap();
    let mut snapshot = queue.drain_snapshot().await;
    queue.enqueue(SyncAction::Create, "/b", None::<&Value>).await.unwrap();

    let mut failed = snapshot.remove(0);
    failed.retry_count += 1;
    queue.requeue(failed).await;

    let endpoints: Vec<_> = queue.items().await.into_iter().map(|i| i.endpoint).collect();
    assert_eq!(endpoints, vec!["/b", "/a"]);
    assert_eq!(queue.items().await[1].retry_count, 1);
    assert_eq!(store.len(Partition::InFlight), 0);
    assert_eq!(queue.in_flight().await, 0);
  }

  #[tokio::test]
  async fn test_reload_restores_order() {
    let (store, queue) = queue();
    for endpoint in ["/1", "/2", "/3"] {
      queue.enqueue(SyncAction::Update, endpoint, Some(&json!({}))).await.unwrap();
    }

    let reopened = SyncQueue::open(store).await;
    let endpoints: Vec<_> = reopened.items().await.into_iter().map(|i| i.endpoint).collect();
    assert_eq!(endpoints, vec!["/1", "/2", "/3"]);

    let id = reopened.enqueue(SyncAction::Update, "/4", None::<&Value>).await.unwrap();
    assert_eq!(reopened.items().await.last().unwrap().id, id);
    assert_eq!(reopened.items().await.last().unwrap().seq, 3);
  }

  #[tokio::test]
  async fn test_reload_recovers_interrupted_drain() {
    let (store, queue) = queue();
    queue.enqueue(SyncAction::Create, "/lost", Some(&json!({}))).await.unwrap();
    let _snapshot = queue.drain_snapshot().await;
    queue.enqueue(SyncAction::Create, "/later", Some(&json!({}))).await.unwrap();
    drop(queue);

    let reopened = SyncQueue::new(store.clone());
    let report = reopened.reload().await.unwrap();
    assert_eq!(report, ReloadReport { queued: 1, recovered: 1 });

    let items = reopened.items().await;
    let endpoints: Vec<_> = items.iter().map(|i| i.endpoint.as_str()).collect();
    assert_eq!(endpoints, vec!["/later", "/lost"]);
    assert_eq!(items[1].retry_count, 0);
    assert_eq!(store.len(Partition::InFlight), 0);
    assert_eq!(store.len(Partition::SyncQueue), 2);
  }

  #[tokio::test]
  async fn test_reload_skips_marker_for_item_still_queued() {
    let (store, queue) = queue();
    queue.enqueue(SyncAction::Create, "/summaries", Some(&json!({"title": "x"}))).await.unwrap();
    // Crash between writing the marker and clearing the queue partition
    let item = queue.items().await.remove(0);
    store
      .put(Partition::InFlight, &item.id, &to_document(&item).unwrap())
      .await
      .unwrap();
    drop(queue);

    let reopened = SyncQueue::new(store.clone());
    let report = reopened.reload().await.unwrap();
    assert_eq!(report, ReloadReport { queued: 1, recovered: 0 });
    assert_eq!(reopened.len().await, 1);
    assert_eq!(store.len(Partition::InFlight), 0);
    assert_eq!(reopened.drain_snapshot().await.len(), 1);
  }

  #[tokio::test]
  async fn test_reload_after_interrupted_requeue_keeps_one_copy() {
    let (store, queue) = queue();
    queue.enqueue(SyncAction::Update, "/feedback/1", Some(&json!({}))).await.unwrap();
    let mut item = queue.drain_snapshot().await.remove(0);
    // Crash after the requeued copy is written but before its marker is cleared
    item.retry_count = 1;
    store
      .put(Partition::SyncQueue, &item.id, &to_document(&item).unwrap())
      .await
      .unwrap();
    drop(queue);

    let reopened = SyncQueue::new(store.clone());
    reopened.reload().await.unwrap();
    let items = reopened.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].retry_count, 1);
    assert_eq!(store.len(Partition::InFlight), 0);
  }

  #[tokio::test]
  async fn test_unavailable_store_keeps_memory_queue() {
    let (store, queue) = queue();
    store.set_unavailable(true);

    queue.enqueue(SyncAction::Create, "/x", Some(&json!(1))).await.unwrap();
    assert_eq!(queue.len().await, 1);
    assert_eq!(queue.drain_snapshot().await.len(), 1);
    assert!(queue.reload().await.is_err());
  }

  #[tokio::test]
  async fn test_persist_flushes_mirror() {
    let (store, queue) = queue();
    store.set_unavailable(true);
    queue.enqueue(SyncAction::Create, "/x", Some(&json!(1))).await.unwrap();
    store.set_unavailable(false);
    assert_eq!(store.len(Partition::SyncQueue), 0);

    queue.persist().await.unwrap();
    assert_eq!(store.len(Partition::SyncQueue), 1);
  }
}
