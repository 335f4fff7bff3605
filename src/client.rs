//! Offline client that wires the store, cache, records, queue and sync engine
//! together behind one handle.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::cache::{cache_key, CacheLayer, CacheResult};
use crate::config::Config;
use crate::engine::{SyncEngine, SyncOutcome, TerminalFailure};
use crate::error::Result;
use crate::network::{NetworkMonitor, TcpProbe};
use crate::queue::{SyncAction, SyncQueue};
use crate::records::{OfflineRecord, OfflineRecordStore, RecordCounts, RecordType};
use crate::store::{PersistentStore, SqliteStore};
use crate::transport::{HttpTransport, Transport};

/// Snapshot for diagnostics and the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OfflineStats {
  pub total_offline_records: usize,
  pub unsynced_records: usize,
  pub sync_queue_length: usize,
  pub in_flight: usize,
  pub is_online: bool,
  pub terminal_failures: usize,
  pub last_sync_at: Option<DateTime<Utc>>,
}

/// Offline-first data layer.
///
/// Reads go through the cache, writes are recorded locally and queued, and
/// the queue is drained whenever the network allows.
pub struct OfflineClient {
  config: Config,
  cache: CacheLayer,
  records: OfflineRecordStore,
  queue: Arc<SyncQueue>,
  monitor: NetworkMonitor,
  engine: Arc<SyncEngine>,
  failures: Mutex<Option<mpsc::UnboundedReceiver<TerminalFailure>>>,
}

impl OfflineClient {
  /// Build a client over the given store and transport.
  ///
  /// Whatever the store already holds is loaded into the queue, including
  /// items a previous process left in flight.
  pub async fn new(store: Arc<dyn PersistentStore>, transport: Arc<dyn Transport>, config: Config) -> Self {
    let cache = CacheLayer::new(store.clone())
      .with_defaults(config.cache.cache_config())
      .with_max_entries(config.cache.max_entries);
    let records = OfflineRecordStore::new(store.clone());
    let queue = Arc::new(SyncQueue::open(store).await);

    let (tx, rx) = mpsc::unbounded_channel();
    let engine = SyncEngine::new(queue.clone(), records.clone(), transport)
      .with_policy(config.sync.policy())
      .with_failure_sink(tx);

    Self {
      config,
      cache,
      records,
      queue,
      monitor: NetworkMonitor::default(),
      engine: Arc::new(engine),
      failures: Mutex::new(Some(rx)),
    }
  }

  /// Open the SQLite store and HTTP transport described by `config`.
  pub async fn open(config: Config) -> Result<Self> {
    let path = match &config.storage.path {
      Some(path) => path.clone(),
      None => SqliteStore::default_path()?,
    };
    let store = Arc::new(SqliteStore::open(&path)?);
    let transport = Arc::new(HttpTransport::new(&config.api.base_url, config.api_timeout())?);
    info!(path = %path.display(), api = %config.api.base_url, "offline client opened");

    Ok(Self::new(store, transport, config).await)
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn records(&self) -> &OfflineRecordStore {
    &self.records
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn monitor(&self) -> &NetworkMonitor {
    &self.monitor
  }

  pub fn engine(&self) -> &SyncEngine {
    &self.engine
  }

  /// Take the receiving end of the terminal-failure channel. Only the first
  /// caller gets it.
  pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<TerminalFailure>> {
    self.failures.lock().ok().and_then(|mut rx| rx.take())
  }

  /// Cache a value under `key`, with the configured TTL unless one is given.
  pub async fn cache_data<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
    let config = match ttl {
      Some(ttl) => self.cache.defaults().clone().with_ttl(ttl),
      None => self.cache.defaults().clone(),
    };
    self.cache.set_with(key, value, &config).await
  }

  /// Read a valid cached value.
  pub async fn get_cached_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.cache.get(key).await
  }

  /// Cache-first read of a backend resource.
  ///
  /// The cache key is derived from `namespace` and `request` (typically the
  /// request path). A valid entry is returned without calling `fetcher`; a
  /// failed fetch falls back to an expired entry when one exists.
  pub async fn fetch_cached<T, F, Fut>(&self, namespace: &str, request: &str, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let key = cache_key(namespace, request);
    self.cache.fetch(&key, self.cache.defaults(), fetcher).await
  }

  /// Keep a record locally until it has been synced.
  pub async fn store_offline_data<T: Serialize>(&self, record_type: impl Into<RecordType>, payload: &T) -> Result<String> {
    self.records.store(record_type.into(), payload).await
  }

  /// Records of one type, or all records.
  pub async fn get_offline_data(&self, record_type: Option<&RecordType>) -> Vec<OfflineRecord> {
    match record_type {
      Some(record_type) => self.records.list_by_type(record_type).await,
      None => self.records.list_all().await,
    }
  }

  /// Queue a mutation for delivery.
  pub async fn add_to_sync_queue<T: Serialize>(
    &self,
    action: SyncAction,
    endpoint: &str,
    payload: Option<&T>,
  ) -> Result<String> {
    self.queue.enqueue(action, endpoint, payload).await
  }

  /// Queue a mutation whose delivery marks `record_id` as synced.
  pub async fn add_record_to_sync_queue<T: Serialize>(
    &self,
    record_id: &str,
    action: SyncAction,
    endpoint: &str,
    payload: Option<&T>,
  ) -> Result<String> {
    self
      .queue
      .enqueue_for_record(record_id, action, endpoint, payload)
      .await
  }

  pub async fn get_offline_stats(&self) -> OfflineStats {
    let counts = self.records.counts().await.unwrap_or_else(|e| {
      warn!(error = %e, "record counts unavailable");
      RecordCounts::default()
    });
    let engine = self.engine.stats();

    OfflineStats {
      total_offline_records: counts.total,
      unsynced_records: counts.unsynced,
      sync_queue_length: self.queue.len().await,
      in_flight: self.queue.in_flight().await,
      is_online: self.monitor.is_online(),
      terminal_failures: engine.terminal_failures,
      last_sync_at: engine.last_drain_at,
    }
  }

  /// Drain the queue now. Returns `None` while offline.
  pub async fn sync_now(&self) -> Option<SyncOutcome> {
    if !self.monitor.is_online() {
      info!("offline, sync deferred");
      return None;
    }
    Some(self.engine.trigger().await)
  }

  /// Run the background side until `shutdown` flips to true: connectivity
  /// probing, the sync tick, the sync engine and periodic cache sweeps.
  pub async fn run(&self, shutdown: watch::Receiver<bool>) {
    let network = &self.config.network;
    let probe = TcpProbe::new(network.probe_addr.clone(), network.probe_timeout());
    let tasks = vec![
      self.monitor.spawn_probe(probe, network.probe_interval()),
      self.monitor.spawn_ticker(self.config.sync.tick_interval()),
      self.spawn_sweeper(self.config.cache.sweep_interval()),
    ];

    // Items left from a previous run go out without waiting for a tick
    if self.monitor.is_online() && !self.queue.is_empty().await {
      self.engine.trigger().await;
    }

    self.engine.clone().run(self.monitor.clone(), shutdown).await;

    for task in tasks {
      task.abort();
    }
    if let Err(e) = self.queue.persist().await {
      warn!(error = %e, "failed to persist sync queue on shutdown");
    }
  }

  fn spawn_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
    let cache = self.cache.clone();
    tokio::spawn(async move {
      let mut interval = time::interval(period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        if let Err(e) = cache.sweep().await {
          warn!(error = %e, "cache sweep failed");
        }
      }
    })
  }
}
