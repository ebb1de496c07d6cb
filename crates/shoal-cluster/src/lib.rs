//! Shoal Cluster - bucket management and migration
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Shoal Cluster                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐   │
//! │  │ BucketTable  │  │ NodeRegistry  │  │ Migration engine │   │
//! │  │              │  │               │  │                  │   │
//! │  │ - replicas   │  │ - conn state  │  │ - offer/stream   │   │
//! │  │ - hashmasks  │  │ - reconnects  │  │ - finalise       │   │
//! │  │ - mask split │  │ - load probes │  │ - role swap      │   │
//! │  └──────┬───────┘  └───────┬───────┘  └────────┬─────────┘   │
//! │         │                  │                   │             │
//! │         └──────────────────┼───────────────────┘             │
//! │                            │                                 │
//! │                     ┌──────┴──────┐                          │
//! │                     │  Controller │  single-owner state,     │
//! │                     │ (event loop)│  one event at a time     │
//! │                     └──────┬──────┘                          │
//! │                            │                                 │
//! │                     ┌──────┴──────┐                          │
//! │                     │  Transport  │  framed TCP links        │
//! │                     └─────────────┘                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All cluster state lives in one [`Controller`] owned by a single task.
//! Connection readers, timers, and dial attempts communicate with it
//! exclusively through its [`Event`] queue, so no state needs locking.

mod bucket;
mod controller;
mod error;
mod link;
mod migrate;
mod node;
mod rebalance;
mod shutdown;
mod timer;
mod transport;

pub use bucket::{
    BucketReplica, BucketTable, Counters, HashMaskEntry, Promotion, TransferKind, TransferPhase,
    TransferState,
};
pub use controller::{Controller, ControllerConfig, Event, Tick};
pub use error::{ClusterError, ClusterResult};
pub use link::PeerLink;
pub use node::{ConnState, Node, NodeId, NodeRegistry};
pub use timer::TimerHandle;
pub use transport::{spawn_dial, spawn_link};

// Re-export types from core
pub use shoal_core::types::{ClusterStats, HashMask, LoadReport, ReplicaRole};
