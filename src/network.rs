//! Connectivity monitor.
//!
//! Tracks whether the device has network presence and fans out the events
//! that may start a sync: transitions, a periodic tick and explicit "sync now"
//! requests. It says nothing about whether the backend itself is healthy;
//! that shows up as delivery failures in the sync engine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default period of the sync tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 64;

/// Events produced by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
  /// Connectivity came back
  Online,
  /// Connectivity was lost
  Offline,
  /// Periodic poke in case a transition was missed
  Tick,
  /// Explicit request, e.g. from a background-sync facility
  SyncRequested,
}

impl NetworkEvent {
  /// Whether this event should start a drain (when online).
  pub fn triggers_sync(&self) -> bool {
    !matches!(self, Self::Offline)
  }
}

/// Source of the platform connectivity signal.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
  /// Whether the network is currently present.
  async fn check(&self) -> bool;
}

/// Probe that treats a successful TCP connect to a well-known address as
/// network presence.
#[derive(Debug, Clone)]
pub struct TcpProbe {
  addr: String,
  timeout: Duration,
}

impl TcpProbe {
  pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
    Self {
      addr: addr.into(),
      timeout,
    }
  }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
  async fn check(&self) -> bool {
    matches!(
      time::timeout(self.timeout, TcpStream::connect(&self.addr)).await,
      Ok(Ok(_))
    )
  }
}

struct Inner {
  online: watch::Sender<bool>,
  events: broadcast::Sender<NetworkEvent>,
}

/// Shared connectivity state and event fan-out.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<Inner>,
}

impl NetworkMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (online, _) = watch::channel(initially_online);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner { online, events }),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.inner.online.borrow()
  }

  /// Feed the platform signal. Emits `Online`/`Offline` only on an actual
  /// transition; returns whether the state changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.inner.online.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      if online {
        info!("network back online");
        self.emit(NetworkEvent::Online);
      } else {
        warn!("network offline");
        self.emit(NetworkEvent::Offline);
      }
    }
    changed
  }

  /// "Please sync now", handled like a reconnect.
  pub fn request_sync(&self) {
    debug!("sync requested");
    self.emit(NetworkEvent::SyncRequested);
  }

  pub fn tick(&self) {
    self.emit(NetworkEvent::Tick);
  }

  /// Subscribe to events emitted from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
    self.inner.events.subscribe()
  }

  /// Watch the online flag.
  pub fn watch_online(&self) -> watch::Receiver<bool> {
    self.inner.online.subscribe()
  }

  /// Emit `Tick` every `period`, starting one period from now.
  pub fn spawn_ticker(&self, period: Duration) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut interval = time::interval_at(Instant::now() + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        monitor.tick();
      }
    })
  }

  /// Poll a probe every `period` and feed the result into [`Self::set_online`].
  pub fn spawn_probe<P>(&self, probe: P, period: Duration) -> JoinHandle<()>
  where
    P: ConnectivityProbe + 'static,
  {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut interval = time::interval(period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        let online = probe.check().await;
        monitor.set_online(online);
      }
    })
  }

  fn emit(&self, event: NetworkEvent) {
    // No subscribers is fine; nobody is waiting to sync
    let _ = self.inner.events.send(event);
  }
}

impl Default for NetworkMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}
