//! Test doubles shared by the module tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::error::NetworkError;
use crate::queue::SyncAction;
use crate::transport::Transport;

/// A delivery as seen by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
  pub action: SyncAction,
  pub endpoint: String,
  pub payload: Option<Value>,
}

/// Transport that records every call and fails for chosen endpoints.
#[derive(Default)]
pub struct RecordingTransport {
  failing: Mutex<HashSet<String>>,
  calls: Mutex<Vec<Delivery>>,
  gate: Option<Arc<Semaphore>>,
}

impl RecordingTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every send waits for a permit on `gate` before completing.
  pub fn gated(gate: Arc<Semaphore>) -> Self {
    Self {
      gate: Some(gate),
      ..Self::default()
    }
  }

  pub fn fail(&self, endpoint: &str) {
    self.failing.lock().unwrap().insert(endpoint.to_string());
  }

  pub fn recover(&self, endpoint: &str) {
    self.failing.lock().unwrap().remove(endpoint);
  }

  pub fn calls(&self) -> Vec<Delivery> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, endpoint: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|d| d.endpoint == endpoint)
      .count()
  }
}

#[async_trait]
impl Transport for RecordingTransport {
  async fn send(
    &self,
    action: SyncAction,
    endpoint: &str,
    payload: Option<&Value>,
  ) -> Result<(), NetworkError> {
    if let Some(gate) = &self.gate {
      gate.acquire().await.unwrap().forget();
    }

    self.calls.lock().unwrap().push(Delivery {
      action,
      endpoint: endpoint.to_string(),
      payload: payload.cloned(),
    });

    if self.failing.lock().unwrap().contains(endpoint) {
      Err(NetworkError::Status { status: 503 })
    } else {
      Ok(())
    }
  }
}
