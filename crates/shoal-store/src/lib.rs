//! Shoal Store - per-bucket in-memory key/value storage
//!
//! Each bucket replica owns one [`BucketStore`].  The store keeps:
//!
//! - items keyed by `(map_hash, key_hash)` with value, optional integer
//!   name, and expiry;
//! - string name bindings keyed by `key_hash`;
//! - a per-entry sync epoch used by the migration engine to tell "not yet
//!   sent in this migration" from "already sent";
//! - an optional parent store produced by a hash-mask split.  Sibling
//!   replicas share the parent by reference count and drain it lazily.

mod store;

pub use store::{BucketStore, MigrateEntry, StoreHandle};
