//! Bucket replicas, the bucket table, and the hash-mask table
//!
//! The bucket table is a vector of `mask + 1` slots; slot `i` holds a
//! replica exactly when this node hosts bucket `i`.  The parallel
//! hash-mask table records which peer addresses serve each bucket in the
//! cluster's current view.

use tracing::info;

use shoal_core::types::{HashMask, ReplicaRole};
use shoal_store::{BucketStore, StoreHandle};

use crate::node::NodeId;
use crate::timer::TimerHandle;

/// Cluster-view addresses for one bucket index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashMaskEntry {
    pub primary: Option<String>,
    pub secondary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    Idle,
    Promoting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Stream contents to the target, then hand over a role.
    Migrate,
    /// Swap primary/secondary roles with the peer already holding the
    /// other copy; no data moves.
    PromoteSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// `ACCEPT_BUCKET` sent, waiting for the target to accept.
    Offered,
    /// Items are being streamed under the transit window.
    Streaming,
    /// Store drained; waiting for the target's finalisation ack.
    AwaitTarget,
    /// Waiting for the third node involved to acknowledge the relocation.
    AwaitRelocate,
}

/// Outbound transfer in flight for one replica.  At most one exists
/// process-wide at any instant.
#[derive(Debug)]
pub struct TransferState {
    pub target_link: u64,
    pub target_node: NodeId,
    pub kind: TransferKind,
    pub phase: TransferPhase,
    /// Items sent but not yet acked, bounded by the transit window.
    pub in_transit: u32,
    /// Snapshot of the migrate-sync counter taken when streaming began.
    pub sync_epoch: u64,
}

/// One hosted bucket.
#[derive(Debug)]
pub struct BucketReplica {
    pub index: u64,
    pub role: ReplicaRole,
    /// When primary: the peer holding our backup.
    pub peer_backup: Option<NodeId>,
    /// When secondary: the peer holding the primary.
    pub peer_source: Option<NodeId>,
    /// Optional change-log consumer.
    pub logging_peer: Option<NodeId>,
    pub transfer: Option<TransferState>,
    pub promotion: Promotion,
    pub shutdown_timer: Option<TimerHandle>,
    pub store: StoreHandle,
}

impl BucketReplica {
    /// Fresh primary replica, as created at bootstrap.
    pub fn primary(index: u64) -> Self {
        Self::with_role(index, ReplicaRole::Primary, BucketStore::new(index))
    }

    /// Empty slot reserved for an inbound migration.
    pub fn receiving(index: u64) -> Self {
        Self::with_role(index, ReplicaRole::Uninitialized, BucketStore::new(index))
    }

    fn with_role(index: u64, role: ReplicaRole, store: StoreHandle) -> Self {
        Self {
            index,
            role,
            peer_backup: None,
            peer_source: None,
            logging_peer: None,
            transfer: None,
            promotion: Promotion::Idle,
            shutdown_timer: None,
            store,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == ReplicaRole::Primary
    }

    /// True when this replica can be offered to the rebalancer: not
    /// already moving and not draining.
    pub fn is_settled(&self) -> bool {
        self.transfer.is_none()
            && self.shutdown_timer.is_none()
            && self.promotion == Promotion::Idle
    }
}

/// Replica counters maintained transactionally with table changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub primary: i64,
    pub secondary: i64,
    /// Primaries with no backup anywhere.
    pub unbacked: i64,
}

impl Counters {
    /// Derive the counters from the table.  Used after wholesale changes
    /// (bootstrap, split) and by tests to check the increments stayed
    /// honest.
    pub fn recount(table: &BucketTable) -> Self {
        let mut counters = Counters::default();
        for replica in table.iter() {
            match replica.role {
                ReplicaRole::Primary => {
                    counters.primary += 1;
                    if replica.peer_backup.is_none() {
                        counters.unbacked += 1;
                    }
                }
                ReplicaRole::Secondary => counters.secondary += 1,
                ReplicaRole::Uninitialized => {}
            }
        }
        counters
    }
}

/// The bucket table and its parallel hash-mask table.
#[derive(Debug)]
pub struct BucketTable {
    mask: HashMask,
    slots: Vec<Option<BucketReplica>>,
    entries: Vec<HashMaskEntry>,
}

impl BucketTable {
    /// Empty table: this node hosts nothing yet.
    pub fn new(mask: HashMask) -> Self {
        let count = mask.bucket_count() as usize;
        Self {
            mask,
            slots: (0..count).map(|_| None).collect(),
            entries: vec![HashMaskEntry::default(); count],
        }
    }

    /// Bootstrap table: this node is primary for every bucket.
    pub fn bootstrap(mask: HashMask, advertised: &str) -> Self {
        let count = mask.bucket_count() as usize;
        Self {
            mask,
            slots: (0..count as u64).map(|i| Some(BucketReplica::primary(i))).collect(),
            entries: vec![
                HashMaskEntry {
                    primary: Some(advertised.to_string()),
                    secondary: None,
                };
                count
            ],
        }
    }

    pub fn mask(&self) -> HashMask {
        self.mask
    }

    pub fn replica(&self, index: u64) -> Option<&BucketReplica> {
        self.slots.get(index as usize)?.as_ref()
    }

    pub fn replica_mut(&mut self, index: u64) -> Option<&mut BucketReplica> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    /// Install a replica into an empty slot.
    pub fn insert(&mut self, replica: BucketReplica) {
        let index = replica.index as usize;
        assert!(
            self.slots[index].is_none(),
            "bucket {:#x} already hosted",
            replica.index
        );
        self.slots[index] = Some(replica);
    }

    /// Remove and return the replica at `index`.
    pub fn take(&mut self, index: u64) -> Option<BucketReplica> {
        self.slots.get_mut(index as usize)?.take()
    }

    pub fn entry(&self, index: u64) -> &HashMaskEntry {
        &self.entries[index as usize]
    }

    pub fn entry_mut(&mut self, index: u64) -> &mut HashMaskEntry {
        &mut self.entries[index as usize]
    }

    /// Swap the primary and secondary addresses for `index`, mirroring a
    /// role swap between the two nodes hosting it.
    pub fn switch_entry(&mut self, index: u64) {
        let entry = &mut self.entries[index as usize];
        std::mem::swap(&mut entry.primary, &mut entry.secondary);
    }

    pub fn iter(&self) -> impl Iterator<Item = &BucketReplica> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Number of hosted replicas.
    pub fn hosted(&self) -> usize {
        self.iter().count()
    }

    pub fn hosted_indices(&self) -> Vec<u64> {
        self.iter().map(|r| r.index).collect()
    }

    /// Grow the table to `new_mask`, which must be strictly larger.
    ///
    /// Every new index `i` derives from old index `i & old_mask`: the
    /// hash-mask entry is copied, and a hosted old slot produces a new
    /// replica sharing the old store through a reference-counted parent
    /// chain, so reads keep seeing the same contents until per-key
    /// rehashing isolates the siblings.
    ///
    /// The caller must ensure no transfer is in flight and no replica is
    /// draining; splitting mid-transfer would corrupt both.
    pub fn split_to(&mut self, new_mask: HashMask) -> shoal_core::Result<()> {
        if new_mask <= self.mask {
            return Err(shoal_core::Error::MaskNotGrowing {
                current: self.mask.get(),
                new: new_mask.get(),
            });
        }

        info!(
            old_mask = %self.mask,
            new_mask = %new_mask,
            "splitting bucket table"
        );

        let old_mask = self.mask;
        let old_slots = std::mem::take(&mut self.slots);
        let old_entries = std::mem::take(&mut self.entries);

        let count = new_mask.bucket_count() as usize;
        let mut slots: Vec<Option<BucketReplica>> = Vec::with_capacity(count);
        let mut entries = Vec::with_capacity(count);

        for i in 0..count as u64 {
            let old_index = (i & old_mask.get()) as usize;
            entries.push(old_entries[old_index].clone());

            slots.push(old_slots[old_index].as_ref().map(|old| {
                assert!(old.transfer.is_none(), "split with transfer in flight");
                let mut replica = BucketReplica::with_role(
                    i,
                    old.role,
                    BucketStore::split_child(&old.store, i),
                );
                replica.peer_backup = old.peer_backup;
                replica.peer_source = old.peer_source;
                replica.logging_peer = old.logging_peer;
                replica
            }));
        }

        // the old replicas drop here; their stores stay alive as parents
        // of the new stores until both siblings drain them
        self.mask = new_mask;
        self.slots = slots;
        self.entries = entries;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn mask(v: u64) -> HashMask {
        HashMask::new(v).unwrap()
    }

    #[test]
    fn test_bootstrap_all_primaries() {
        let table = BucketTable::bootstrap(mask(0x3), "a:1");
        assert_eq!(table.hosted(), 4);
        for (i, replica) in table.iter().enumerate() {
            assert_eq!(replica.index, i as u64);
            assert!(replica.is_primary());
        }
        assert_eq!(table.entry(2).primary.as_deref(), Some("a:1"));

        let counters = Counters::recount(&table);
        assert_eq!(counters.primary, 4);
        assert_eq!(counters.unbacked, 4);
        assert_eq!(counters.secondary, 0);
    }

    #[test]
    fn test_switch_entry() {
        let mut table = BucketTable::bootstrap(mask(0x3), "a:1");
        table.entry_mut(1).secondary = Some("b:1".to_string());
        table.switch_entry(1);
        assert_eq!(table.entry(1).primary.as_deref(), Some("b:1"));
        assert_eq!(table.entry(1).secondary.as_deref(), Some("a:1"));
    }

    #[test]
    fn test_split_copies_entries_and_replicas() {
        let mut table = BucketTable::bootstrap(mask(0x3), "a:1");
        table.entry_mut(2).secondary = Some("b:1".to_string());
        table.replica_mut(2).unwrap().peer_backup = Some(0);

        table.split_to(mask(0x7)).unwrap();

        assert_eq!(table.mask().get(), 0x7);
        assert_eq!(table.hosted(), 8);
        // index 6 derives from old index 2
        assert_eq!(table.entry(6).secondary.as_deref(), Some("b:1"));
        assert_eq!(table.replica(6).unwrap().peer_backup, Some(0));
        assert_eq!(table.replica(6).unwrap().index, 6);

        let counters = Counters::recount(&table);
        assert_eq!(counters.primary, 8);
        assert_eq!(counters.unbacked, 6);
    }

    #[test]
    fn test_split_preserves_reads() {
        let mut table = BucketTable::bootstrap(mask(0x3), "a:1");
        // keys 0x2 and 0x6 both live in bucket 2 under mask 0x3
        table
            .replica(2)
            .unwrap()
            .store
            .set(1, 0x2, Bytes::from_static(b"two"), 0, 0);
        table
            .replica(2)
            .unwrap()
            .store
            .set(1, 0x6, Bytes::from_static(b"six"), 0, 0);

        table.split_to(mask(0x7)).unwrap();

        // each key resolves to exactly one new bucket and is still there
        assert_eq!(
            table.replica(0x2).unwrap().store.get(1, 0x2),
            Some(Bytes::from_static(b"two"))
        );
        assert_eq!(
            table.replica(0x6).unwrap().store.get(1, 0x6),
            Some(Bytes::from_static(b"six"))
        );
    }

    #[test]
    fn test_split_rejects_smaller_mask() {
        let mut table = BucketTable::bootstrap(mask(0x7), "a:1");
        assert!(table.split_to(mask(0x3)).is_err());
        assert!(table.split_to(mask(0x7)).is_err());
    }

    #[test]
    fn test_empty_table_split() {
        let mut table = BucketTable::new(mask(0x1));
        table.split_to(mask(0x7)).unwrap();
        assert_eq!(table.hosted(), 0);
        assert_eq!(table.mask().get(), 0x7);
    }
}
