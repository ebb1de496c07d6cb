//! Shoal Core Library
//!
//! Shared types, configuration, and errors for the Shoal sharded
//! key/value cluster.

pub mod config;
pub mod error;
pub mod types;

pub use config::ShoalConfig;
pub use error::{Error, Result};

/// Shoal version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of buckets a bootstrap node (no configured peers) starts with.
pub const DEFAULT_BUCKETS: u64 = 4;

/// Mask a node joining an existing cluster starts with; it grows to the
/// cluster's real mask on the first offer or mask update it receives.
pub const JOIN_MASK: u64 = 0x1;

/// Lower bound on the ideal replicas-per-node figure.  When the ideal drops
/// below this, the node splits its mask instead of migrating a bucket.
pub const MIN_BUCKETS: i64 = 4;

/// Maximum migration items in flight before the sender stops fetching more.
pub const TRANSIT_MAX: u32 = 32;

/// The sender fetches another batch only once in-flight items have drained
/// to this level.
pub const TRANSIT_MIN: u32 = 8;

/// Largest frame payload a peer may send (16 MiB).
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;
