//! Offline-first data layer.
//!
//! - [`cache`]: TTL and schema-versioned cache over the persistent store
//! - [`records`]: locally created records awaiting server confirmation
//! - [`queue`]: durable FIFO of pending mutations
//! - [`engine`]: drains the queue when the network allows
//! - [`client`]: everything above behind one handle

pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod queue;
pub mod records;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{OfflineClient, OfflineStats};
pub use config::Config;
pub use error::{Error, NetworkError, Result};
pub use queue::SyncAction;
pub use records::RecordType;
