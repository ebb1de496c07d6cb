//! Load reports and cluster statistics

use serde::{Deserialize, Serialize};

/// Role a bucket replica plays on its hosting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    /// Authoritative copy; serves reads and writes.
    Primary,
    /// Passive backup fed asynchronously by the primary.
    Secondary,
    /// Slot reserved while an inbound migration streams in.
    #[default]
    Uninitialized,
}

impl ReplicaRole {
    /// Wire encoding used by `FINALISE_MIGRATION` and `BUCKET_RELOCATED`.
    pub fn to_wire(self) -> u8 {
        match self {
            ReplicaRole::Primary => 0,
            ReplicaRole::Secondary => 1,
            ReplicaRole::Uninitialized => 0xff,
        }
    }

    pub fn from_wire(level: u8) -> Option<Self> {
        match level {
            0 => Some(ReplicaRole::Primary),
            1 => Some(ReplicaRole::Secondary),
            _ => None,
        }
    }
}

/// A peer's answer to a `LOADLEVELS` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadReport {
    /// Primary replicas hosted by the peer.
    pub primary: i32,
    /// Secondary replicas hosted by the peer.
    pub backups: i32,
    /// Nonzero when the peer has a transfer in flight (either direction).
    pub transferring: i32,
}

/// Point-in-time snapshot of the controller counters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterStats {
    /// Current hash mask.
    pub mask: u64,
    /// Primary replicas hosted here.
    pub primary_buckets: i64,
    /// Secondary replicas hosted here.
    pub secondary_buckets: i64,
    /// Primaries with no backup anywhere in the cluster.
    pub unbacked_buckets: i64,
    /// Whether an outbound transfer is in flight.
    pub transferring: bool,
    /// Migration sync counter (monotonic over the node's lifetime).
    pub migrate_sync: u64,
    /// Peers with an established, greeted connection.
    pub active_nodes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_round_trip() {
        assert_eq!(
            ReplicaRole::from_wire(ReplicaRole::Primary.to_wire()),
            Some(ReplicaRole::Primary)
        );
        assert_eq!(
            ReplicaRole::from_wire(ReplicaRole::Secondary.to_wire()),
            Some(ReplicaRole::Secondary)
        );
        assert_eq!(ReplicaRole::from_wire(7), None);
    }
}
