//! Error types for the offline data layer.

use thiserror::Error;

/// Result type alias for offline data layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the store, cache, queue and sync engine.
#[derive(Error, Debug)]
pub enum Error {
  /// The persistent store could not be reached (quota, not initialized,
  /// restricted environment). Callers degrade instead of failing.
  #[error("Storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A payload could not be turned into JSON, or a stored document could not
  /// be read back into its type.
  #[error("Serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A delivery attempt for a queued mutation failed.
  #[error(transparent)]
  Network(#[from] NetworkError),

  #[error("Partition '{partition}' has no index named '{index}'")]
  InvalidIndex { partition: String, index: String },

  #[error("Configuration error: {0}")]
  Config(String),
}

impl Error {
  /// Whether this error is a storage outage that callers should absorb.
  pub fn is_storage_unavailable(&self) -> bool {
    matches!(self, Self::StorageUnavailable(_))
  }
}

impl From<rusqlite::Error> for Error {
  fn from(err: rusqlite::Error) -> Self {
    Self::StorageUnavailable(err.to_string())
  }
}

/// Failure modes of a single HTTP delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("Server responded with status {status}")]
  Status { status: u16 },

  #[error("Request timed out")]
  Timeout,

  #[error("Connection failed: {0}")]
  Connection(String),

  #[error("Invalid endpoint '{0}'")]
  InvalidEndpoint(String),
}

impl From<reqwest::Error> for NetworkError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      Self::Timeout
    } else if let Some(status) = err.status() {
      Self::Status {
        status: status.as_u16(),
      }
    } else {
      Self::Connection(err.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rusqlite_errors_map_to_storage_unavailable() {
    let err: Error = rusqlite::Error::InvalidQuery.into();
    assert!(err.is_storage_unavailable());
  }

  #[test]
  fn test_network_error_display() {
    let err = Error::from(NetworkError::Status { status: 503 });
    assert_eq!(err.to_string(), "Server responded with status 503");
    assert!(!err.is_storage_unavailable());
  }
}
