//! Time-to-live cache with schema versioning.
//!
//! This module provides a storage-agnostic read cache that:
//! - Stores JSON values under namespaced keys with a TTL and a version tag
//! - Treats expired or wrong-version entries as absent on read
//! - Evicts invalid and excess entries in bounded sweeps
//! - Provides basic offline mode (serve expired cache when network unavailable)

mod entry;
mod key;
mod layer;

pub use entry::{CacheConfig, CacheEntry, CacheResult, CacheSource, DEFAULT_SCHEMA_VERSION, DEFAULT_TTL};
pub use key::cache_key;
pub use layer::{CacheLayer, SweepReport, DEFAULT_MAX_ENTRIES};
