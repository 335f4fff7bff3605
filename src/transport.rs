//! Delivery of queued mutations to the backend.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{Error, NetworkError, Result};
use crate::queue::SyncAction;

/// Sends one mutation to the backend.
///
/// Authentication and extra headers are the caller's concern; they travel in
/// the endpoint or payload chosen at enqueue time.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(
    &self,
    action: SyncAction,
    endpoint: &str,
    payload: Option<&Value>,
  ) -> std::result::Result<(), NetworkError>;
}

/// HTTP verb for a mutation kind.
pub fn method_for(action: SyncAction) -> Method {
  match action {
    SyncAction::Create => Method::POST,
    SyncAction::Update => Method::PUT,
    SyncAction::Delete => Method::DELETE,
  }
}

/// Transport over a REST-ish JSON API.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| Error::Config(format!("Invalid API base URL '{}': {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  /// Resolve an endpoint against the base URL.
  ///
  /// Absolute URLs are used as-is; anything else is appended to the base path,
  /// so `/summary` under `http://host/api/v1` becomes `http://host/api/v1/summary`.
  pub fn resolve(&self, endpoint: &str) -> std::result::Result<Url, NetworkError> {
    if let Ok(url) = Url::parse(endpoint) {
      return Ok(url);
    }

    let joined = format!(
      "{}/{}",
      self.base_url.as_str().trim_end_matches('/'),
      endpoint.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|_| NetworkError::InvalidEndpoint(endpoint.to_string()))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(
    &self,
    action: SyncAction,
    endpoint: &str,
    payload: Option<&Value>,
  ) -> std::result::Result<(), NetworkError> {
    let url = self.resolve(endpoint)?;
    let method = method_for(action);
    debug!(%method, %url, "delivering mutation");

    let mut request = self.client.request(method, url);
    if let Some(body) = payload.filter(|_| action != SyncAction::Delete) {
      request = request.json(body);
    }

    request.send().await?.error_for_status()?;
    Ok(())
  }
}
