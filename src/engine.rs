//! Sync engine: drains the queue against the network.
//!
//! A drain takes a snapshot of the queue and delivers each item in order, one
//! at a time. Delivered items confirm their offline record; failed items go
//! back to the tail of the queue until they reach the attempt ceiling, after
//! which they are dropped and reported to the failure sink.
//!
//! Only one drain runs at a time. A trigger that arrives during a drain is
//! remembered and produces exactly one follow-up drain.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::error::NetworkError;
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::queue::{QueueItem, SyncQueue};
use crate::records::OfflineRecordStore;
use crate::transport::Transport;

/// Delivery attempts per item before it is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay before re-draining after a cycle that left items requeued.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
  pub initial: Duration,
  pub max: Duration,
  pub factor: f64,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      initial: Duration::from_secs(2),
      max: Duration::from_secs(300),
      factor: 2.0,
    }
  }
}

impl Backoff {
  /// Delay after `failures` consecutive cycles with failed deliveries.
  pub fn delay(&self, failures: u32) -> Duration {
    let exp = self.factor.powi(failures.saturating_sub(1).min(64) as i32);
    let secs = self.initial.as_secs_f64() * exp;
    if !secs.is_finite() || secs >= self.max.as_secs_f64() {
      self.max
    } else if secs <= 0.0 {
      Duration::ZERO
    } else {
      Duration::from_secs_f64(secs)
    }
  }
}

/// Retry policy for queued mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPolicy {
  pub max_attempts: u32,
  pub backoff: Backoff,
}

impl Default for SyncPolicy {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      backoff: Backoff::default(),
    }
  }
}

/// An item dropped after its last allowed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalFailure {
  pub item: QueueItem,
  pub error: NetworkError,
}

/// Counts for one or more drain cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub attempted: usize,
  pub delivered: usize,
  pub requeued: usize,
  pub dropped: usize,
}

impl DrainReport {
  fn merge(&mut self, other: DrainReport) {
    self.attempted += other.attempted;
    self.delivered += other.delivered;
    self.requeued += other.requeued;
    self.dropped += other.dropped;
  }
}

/// Result of a call to [`SyncEngine::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  /// This call ran `cycles` drains (more than one if triggers arrived meanwhile)
  Drained { cycles: usize, report: DrainReport },
  /// Another drain was running; it will run once more on this call's behalf
  Coalesced,
}

impl SyncOutcome {
  pub fn report(&self) -> Option<DrainReport> {
    match self {
      Self::Drained { report, .. } => Some(*report),
      Self::Coalesced => None,
    }
  }
}

/// Engine counters for the diagnostics surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
  pub terminal_failures: usize,
  pub last_drain_at: Option<DateTime<Utc>>,
  pub last_drain: Option<DrainReport>,
  /// Consecutive cycles that left at least one item requeued
  pub failing_cycles: u32,
}

/// Drain orchestrator.
pub struct SyncEngine {
  queue: Arc<SyncQueue>,
  records: OfflineRecordStore,
  transport: Arc<dyn Transport>,
  policy: SyncPolicy,
  draining: AtomicBool,
  pending: AtomicBool,
  failures: Option<mpsc::UnboundedSender<TerminalFailure>>,
  stats: Mutex<EngineStats>,
}

impl SyncEngine {
  pub fn new(queue: Arc<SyncQueue>, records: OfflineRecordStore, transport: Arc<dyn Transport>) -> Self {
    Self {
      queue,
      records,
      transport,
      policy: SyncPolicy::default(),
      draining: AtomicBool::new(false),
      pending: AtomicBool::new(false),
      failures: None,
      stats: Mutex::new(EngineStats::default()),
    }
  }

  pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Send dropped items to `sink` in addition to logging them.
  pub fn with_failure_sink(mut self, sink: mpsc::UnboundedSender<TerminalFailure>) -> Self {
    self.failures = Some(sink);
    self
  }

  pub fn policy(&self) -> &SyncPolicy {
    &self.policy
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  pub fn stats(&self) -> EngineStats {
    self.stats.lock().map(|s| s.clone()).unwrap_or_default()
  }

  /// Start a drain, or record the request if one is already running.
  pub async fn trigger(&self) -> SyncOutcome {
    let mut cycles = 0;
    let mut total = DrainReport::default();

    loop {
      if self
        .draining
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        self.pending.store(true, Ordering::Release);
        debug!("drain already running, coalescing trigger");
        return if cycles == 0 {
          SyncOutcome::Coalesced
        } else {
          SyncOutcome::Drained { cycles, report: total }
        };
      }

      loop {
        self.pending.store(false, Ordering::Release);
        let report = self.drain_cycle().await;
        cycles += 1;
        total.merge(report);

        if !self.pending.load(Ordering::Acquire) {
          break;
        }
        debug!("trigger arrived during drain, running follow-up");
      }

      self.draining.store(false, Ordering::Release);
      // A trigger may have landed between the last check and the release
      if !self.pending.load(Ordering::Acquire) {
        return SyncOutcome::Drained { cycles, report: total };
      }
    }
  }

  /// One pass over a queue snapshot.
  async fn drain_cycle(&self) -> DrainReport {
    let snapshot = self.queue.drain_snapshot().await;
    let mut report = DrainReport::default();

    for item in snapshot {
      report.attempted += 1;
      match self
        .transport
        .send(item.action, &item.endpoint, item.payload.as_ref())
        .await
      {
        Ok(()) => {
          if let Some(record_id) = &item.record_id {
            self.records.mark_synced(record_id).await;
          }
          self.queue.settle(&item.id).await;
          report.delivered += 1;
        }
        Err(err) => {
          if self.handle_failure(item, err).await {
            report.requeued += 1;
          } else {
            report.dropped += 1;
          }
        }
      }
    }

    if report.attempted > 0 {
      info!(
        attempted = report.attempted,
        delivered = report.delivered,
        requeued = report.requeued,
        dropped = report.dropped,
        "drain finished"
      );
    }
    self.record_cycle(report);
    report
  }

  /// Requeue or drop a failed item. Returns true if it was requeued.
  async fn handle_failure(&self, mut item: QueueItem, err: NetworkError) -> bool {
    item.retry_count += 1;

    if item.retry_count < self.policy.max_attempts {
      warn!(
        id = %item.id,
        endpoint = %item.endpoint,
        attempt = item.retry_count,
        error = %err,
        "delivery failed, requeueing"
      );
      self.queue.requeue(item).await;
      return true;
    }

    error!(
      id = %item.id,
      action = %item.action,
      endpoint = %item.endpoint,
      attempts = item.retry_count,
      error = %err,
      "delivery failed permanently, dropping item"
    );
    self.queue.settle(&item.id).await;
    if let Ok(mut stats) = self.stats.lock() {
      stats.terminal_failures += 1;
    }
    if let Some(sink) = &self.failures {
      let _ = sink.send(TerminalFailure { item, error: err });
    }
    false
  }

  fn record_cycle(&self, report: DrainReport) {
    if let Ok(mut stats) = self.stats.lock() {
      stats.last_drain_at = Some(Utc::now());
      stats.last_drain = Some(report);
      if report.requeued > 0 {
        stats.failing_cycles += 1;
      } else {
        stats.failing_cycles = 0;
      }
    }
  }

  /// Drive drains from monitor events until `shutdown` flips.
  ///
  /// `Online` and `SyncRequested` start a drain, `Tick` starts one only when
  /// there is something queued. Nothing is attempted while offline. After a
  /// cycle that requeued items a follow-up drain is scheduled with backoff.
  pub async fn run(self: Arc<Self>, monitor: NetworkMonitor, mut shutdown: watch::Receiver<bool>) {
    let mut events = monitor.subscribe();
    let mut retry_at: Option<Instant> = None;
    info!("sync engine started");

    loop {
      let event = tokio::select! {
        changed = shutdown.changed() => match changed {
          Ok(()) => None,
          Err(_) => break,
        },
        _ = sleep_until(retry_at) => {
          retry_at = None;
          Some(NetworkEvent::Tick)
        }
        received = events.recv() => match received {
          Ok(event) => Some(event),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(skipped, "monitor events lagged");
            Some(NetworkEvent::SyncRequested)
          }
          Err(broadcast::error::RecvError::Closed) => break,
        },
      };

      let Some(event) = event else {
        if *shutdown.borrow() {
          break;
        }
        continue;
      };

      if !event.triggers_sync() || !monitor.is_online() {
        continue;
      }
      if event == NetworkEvent::Tick && self.queue.is_empty().await {
        continue;
      }

      self.trigger().await;
      // Anything that queued up during the drain collapses into one more pass
      let mut follow_up = false;
      while let Ok(event) = events.try_recv() {
        follow_up |= event.triggers_sync();
      }
      if follow_up && monitor.is_online() {
        self.trigger().await;
      }

      let failing = self.stats().failing_cycles;
      retry_at = if failing > 0 {
        let delay = self.policy.backoff.delay(failing);
        debug!(?delay, "scheduling retry drain");
        Some(Instant::now() + delay)
      } else {
        None
      };
    }

    info!("sync engine stopped");
  }
}

async fn sleep_until(deadline: Option<Instant>) {
  match deadline {
    Some(at) => time::sleep_until(at).await,
    None => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::SyncAction;
  use crate::records::RecordType;
  use crate::store::{MemoryStore, Partition};
  use crate::testing::RecordingTransport;
  use serde_json::{json, Value};
  use tokio::sync::Semaphore;

  struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<SyncQueue>,
    records: OfflineRecordStore,
    transport: Arc<RecordingTransport>,
    engine: Arc<SyncEngine>,
  }

  fn harness_with(transport: RecordingTransport) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(SyncQueue::new(store.clone()));
    let records = OfflineRecordStore::new(store.clone());
    let transport = Arc::new(transport);
    let engine = Arc::new(SyncEngine::new(queue.clone(), records.clone(), transport.clone()));
    Harness {
      store,
      queue,
      records,
      transport,
      engine,
    }
  }

  fn harness() -> Harness {
    harness_with(RecordingTransport::new())
  }

  #[test]
  fn test_backoff_grows_and_caps() {
    let backoff = Backoff {
      initial: Duration::from_secs(1),
      max: Duration::from_secs(10),
      factor: 2.0,
    };
    assert_eq!(backoff.delay(1), Duration::from_secs(1));
    assert_eq!(backoff.delay(2), Duration::from_secs(2));
    assert_eq!(backoff.delay(3), Duration::from_secs(4));
    assert_eq!(backoff.delay(10), Duration::from_secs(10));
    assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));

    let negative = Backoff {
      factor: -2.0,
      ..backoff
    };
    assert_eq!(negative.delay(1), Duration::from_secs(1));
    assert_eq!(negative.delay(2), Duration::ZERO);
    assert_eq!(negative.delay(3), Duration::from_secs(4));
  }

  #[tokio::test]
  async fn test_successful_drain_empties_queue() {
    let h = harness();
    h.queue
      .enqueue(SyncAction::Create, "/summaries", Some(&json!({"title": "x"})))
      .await
      .unwrap();

    let outcome = h.engine.trigger().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.delivered, 1);
    assert!(h.queue.is_empty().await);
    assert_eq!(h.store.len(Partition::SyncQueue), 0);
    assert_eq!(h.store.len(Partition::InFlight), 0);

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, SyncAction::Create);
    assert_eq!(calls[0].payload, Some(json!({"title": "x"})));
  }

  #[tokio::test]
  async fn test_always_failing_item_gets_three_attempts() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut h = harness();
    h.engine = Arc::new(
      SyncEngine::new(h.queue.clone(), h.records.clone(), h.transport.clone()).with_failure_sink(tx),
    );
    h.transport.fail("/broken");
    h.queue.enqueue(SyncAction::Update, "/broken", Some(&json!({}))).await.unwrap();

    for attempt in 1..=2 {
      let report = h.engine.trigger().await.report().unwrap();
      assert_eq!(report.requeued, 1);
      assert_eq!(h.queue.items().await[0].retry_count, attempt);
    }
    let report = h.engine.trigger().await.report().unwrap();
    assert_eq!(report.dropped, 1);

    assert_eq!(h.transport.calls_to("/broken"), 3);
    assert!(h.queue.is_empty().await);
    assert_eq!(h.store.len(Partition::InFlight), 0);

    let failure = rx.try_recv().unwrap();
    assert_eq!(failure.item.endpoint, "/broken");
    assert_eq!(failure.item.retry_count, 3);
    assert_eq!(failure.error, NetworkError::Status { status: 503 });
    assert_eq!(h.engine.stats().terminal_failures, 1);

    // Nothing left to retry
    h.engine.trigger().await;
    assert_eq!(h.transport.calls_to("/broken"), 3);
  }

  #[tokio::test]
  async fn test_failing_head_does_not_block_others() {
    let h = harness();
    let a = h.records.store(RecordType::Summary, &json!({"n": "a"})).await.unwrap();
    let b = h.records.store(RecordType::Summary, &json!({"n": "b"})).await.unwrap();
    h.transport.fail("/a");
    h.queue.enqueue_for_record(&a, SyncAction::Create, "/a", Some(&json!({}))).await.unwrap();
    h.queue.enqueue_for_record(&b, SyncAction::Create, "/b", Some(&json!({}))).await.unwrap();

    let report = h.engine.trigger().await.report().unwrap();
    assert_eq!(report, DrainReport { attempted: 2, delivered: 1, requeued: 1, dropped: 0 });

    assert!(h.records.get(&b).await.unwrap().synced);
    assert!(!h.records.get(&a).await.unwrap().synced);
    let remaining = h.queue.items().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].endpoint, "/a");
  }

  #[tokio::test]
  async fn test_failed_item_is_demoted_behind_items_enqueued_mid_drain() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(RecordingTransport::gated(gate.clone()));
    h.transport.fail("/first");
    h.queue.enqueue(SyncAction::Create, "/first", None::<&Value>).await.unwrap();

    let engine = h.engine.clone();
    let drain = tokio::spawn(async move { engine.trigger().await });
    while !h.engine.is_draining() {
      tokio::task::yield_now().await;
    }
    h.queue.enqueue(SyncAction::Create, "/second", None::<&Value>).await.unwrap();

    gate.add_permits(1);
    let report = drain.await.unwrap().report().unwrap();
    assert_eq!(report.requeued, 1);

    let items = h.queue.items().await;
    let endpoints: Vec<_> = items.iter().map(|i| i.endpoint.as_str()).collect();
    assert_eq!(endpoints, vec!["/second", "/first"]);
    assert_eq!(items[1].retry_count, 1);
  }

  #[tokio::test]
  async fn test_snapshot_order_is_kept_within_a_cycle() {
    let h = harness();
    h.transport.fail("/first");
    h.queue.enqueue(SyncAction::Create, "/first", None::<&Value>).await.unwrap();
    h.engine.trigger().await;
    h.queue.enqueue(SyncAction::Update, "/first", Some(&json!({"v": 2}))).await.unwrap();

    h.transport.recover("/first");
    h.engine.trigger().await;

    // The retried create still goes out ahead of the later update
    let calls = h.transport.calls();
    let actions: Vec<_> = calls.iter().map(|c| c.action).collect();
    assert_eq!(actions, vec![SyncAction::Create, SyncAction::Create, SyncAction::Update]);
    assert!(h.queue.is_empty().await);
  }

  #[tokio::test]
  async fn test_recovered_item_is_delivered() {
    let h = harness();
    h.transport.fail("/flaky");
    h.queue.enqueue(SyncAction::Delete, "/flaky", None::<&Value>).await.unwrap();

    h.engine.trigger().await;
    h.transport.recover("/flaky");
    let report = h.engine.trigger().await.report().unwrap();

    assert_eq!(report.delivered, 1);
    assert!(h.queue.is_empty().await);
    assert_eq!(h.engine.stats().failing_cycles, 0);
  }

  #[tokio::test]
  async fn test_item_left_in_both_partitions_is_sent_once() {
    use crate::store::{to_document, PersistentStore};

    let store = Arc::new(MemoryStore::new());
    let first = SyncQueue::new(store.clone());
    first
      .enqueue(SyncAction::Create, "/summaries", Some(&json!({"title": "x"})))
      .await
      .unwrap();
    let item = first.items().await.remove(0);
    store
      .put(Partition::InFlight, &item.id, &to_document(&item).unwrap())
      .await
      .unwrap();
    drop(first);

    let queue = Arc::new(SyncQueue::open(store.clone()).await);
    assert_eq!(queue.len().await, 1);

    let transport = Arc::new(RecordingTransport::new());
    let engine = SyncEngine::new(queue.clone(), OfflineRecordStore::new(store.clone()), transport.clone());
    engine.trigger().await;

    assert_eq!(transport.calls_to("/summaries"), 1);
    assert!(queue.is_empty().await);
  }

  #[tokio::test]
  async fn test_concurrent_triggers_coalesce() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(RecordingTransport::gated(gate.clone()));
    h.queue.enqueue(SyncAction::Create, "/one", None::<&Value>).await.unwrap();

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.trigger().await });
    while !h.engine.is_draining() {
      tokio::task::yield_now().await;
    }

    assert_eq!(h.engine.trigger().await, SyncOutcome::Coalesced);
    assert_eq!(h.engine.trigger().await, SyncOutcome::Coalesced);
    h.queue.enqueue(SyncAction::Create, "/two", None::<&Value>).await.unwrap();

    gate.add_permits(2);
    let outcome = first.await.unwrap();
    match outcome {
      SyncOutcome::Drained { cycles, report } => {
        assert_eq!(cycles, 2);
        assert_eq!(report.delivered, 2);
      }
      SyncOutcome::Coalesced => panic!("first trigger should have drained"),
    }
    assert!(h.queue.is_empty().await);
    assert!(!h.engine.is_draining());
  }

  #[tokio::test]
  async fn test_run_drains_on_reconnect_and_stops() {
    let h = harness();
    let monitor = NetworkMonitor::new(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(h.engine.clone().run(monitor.clone(), shutdown_rx));

    h.queue.enqueue(SyncAction::Create, "/summaries", Some(&json!({}))).await.unwrap();
    // Offline: sync requests are ignored
    monitor.request_sync();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.transport.calls().len(), 0);

    monitor.set_online(true);
    tokio::time::timeout(Duration::from_secs(2), async {
      while !h.queue.is_empty().await || h.transport.calls().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    assert_eq!(h.transport.calls().len(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
  }
}
