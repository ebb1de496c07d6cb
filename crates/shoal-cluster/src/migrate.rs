//! Streaming bucket migration
//!
//! The sending side of a transfer.  One transfer runs at a time: the
//! rebalancer offers a bucket (`ACCEPT_BUCKET`), the target accepts, the
//! sender streams items under the transit window, and the roles are
//! settled in a finalisation exchange.  A third node is told where the
//! moved replica went before the source copy is destroyed.
//!
//! ```text
//! Offered ──accept──▶ Streaming ──drained──▶ AwaitTarget ──ack──▶ AwaitRelocate ──ack──▶ gone
//!    │                    │                      │
//!    └────── link loss ───┴──────────────────────┘──▶ aborted, replica kept
//! ```

use tracing::{debug, info, warn};

use shoal_core::types::ReplicaRole;
use shoal_proto::Message;
use shoal_store::MigrateEntry;

use crate::bucket::{TransferKind, TransferPhase, TransferState};
use crate::controller::Controller;
use crate::node::NodeId;

impl Controller {
    /// Offer `index` to a peer and mark the transfer in flight.
    pub(crate) fn begin_migrate(&mut self, index: u64, node: NodeId, link_id: u64) {
        let mask = self.table.mask().get();
        let target_addr = self
            .nodes
            .get(node)
            .map(|n| n.addr.clone())
            .unwrap_or_default();
        let Some(replica) = self.table.replica_mut(index) else {
            return;
        };
        assert!(replica.transfer.is_none(), "transfer already in flight");
        assert!(!self.transfer_active, "second concurrent transfer");

        info!(
            bucket = format_args!("{:#x}", index),
            to = %target_addr,
            "migrating bucket"
        );
        replica.transfer = Some(TransferState {
            target_link: link_id,
            target_node: node,
            kind: TransferKind::Migrate,
            phase: TransferPhase::Offered,
            in_transit: 0,
            sync_epoch: 0,
        });
        self.transfer_active = true;
        self.send_to(link_id, &Message::AcceptBucket { mask, hash: index });
    }

    /// Start a role swap with the peer backing `index`; no data moves.
    pub(crate) fn begin_swap(&mut self, index: u64, node: NodeId, link_id: u64) {
        let mask = self.table.mask().get();
        let target_addr = self
            .nodes
            .get(node)
            .map(|n| n.addr.clone())
            .unwrap_or_default();
        let Some(replica) = self.table.replica_mut(index) else {
            return;
        };
        assert!(replica.transfer.is_none(), "transfer already in flight");
        assert!(!self.transfer_active, "second concurrent transfer");

        info!(
            bucket = format_args!("{:#x}", index),
            with = %target_addr,
            "switching bucket roles"
        );
        replica.transfer = Some(TransferState {
            target_link: link_id,
            target_node: node,
            kind: TransferKind::PromoteSwap,
            phase: TransferPhase::AwaitTarget,
            in_transit: 0,
            sync_epoch: 0,
        });
        self.transfer_active = true;
        self.send_to(
            link_id,
            &Message::ControlBucket {
                mask,
                hash: index,
                level: 0,
            },
        );
    }

    /// The target accepted our offer; start streaming.
    pub(crate) fn on_accepting_bucket(&mut self, link_id: u64, mask: u64, hash: u64) {
        if mask != self.table.mask().get() || hash > mask {
            warn!(
                theirs = format_args!("{:#x}", mask),
                "acceptance under a mismatched mask; cancelling transfer"
            );
            self.abort_transfers_for_link(link_id);
            return;
        }
        let next_epoch = self.migrate_sync + 1;
        let Some(replica) = self.table.replica_mut(hash) else {
            return;
        };
        let Some(ts) = replica.transfer.as_mut() else {
            warn!(
                bucket = format_args!("{:#x}", hash),
                "acceptance for a bucket not transferring"
            );
            return;
        };
        if ts.target_link != link_id
            || ts.kind != TransferKind::Migrate
            || ts.phase != TransferPhase::Offered
        {
            warn!(bucket = format_args!("{:#x}", hash), "unexpected acceptance");
            return;
        }

        // bump the sync counter: every item in the store is now older than
        // this epoch and will be enumerated exactly once
        self.migrate_sync = next_epoch;
        ts.sync_epoch = next_epoch;
        ts.phase = TransferPhase::Streaming;
        debug!(
            bucket = format_args!("{:#x}", hash),
            sync = next_epoch,
            "bucket accepted; streaming"
        );
        self.pump_transfer(hash);
    }

    /// Keep the transit window full; finalise once the store drains.
    pub(crate) fn pump_transfer(&mut self, index: u64) {
        let mask = self.table.mask().get();
        let (store, epoch, in_transit, link_id) = {
            let Some(replica) = self.table.replica(index) else {
                return;
            };
            let Some(ts) = replica.transfer.as_ref() else {
                return;
            };
            if ts.phase != TransferPhase::Streaming {
                return;
            }
            (
                replica.store.clone(),
                ts.sync_epoch,
                ts.in_transit,
                ts.target_link,
            )
        };

        // only fetch more work once the window has drained far enough
        if in_transit > self.cfg.transit_min {
            return;
        }
        let avail = (self.cfg.transit_max - in_transit) as usize;
        let entries = store.take_migratable(index, mask, epoch, avail);

        if entries.is_empty() {
            if in_transit == 0 {
                self.finalise_transfer(index);
            }
            return;
        }

        let mut sent = 0u32;
        for entry in entries {
            let msg = match entry {
                MigrateEntry::Name { hash, name } => Message::SyncName { hash, name },
                MigrateEntry::Item {
                    map,
                    hash,
                    value,
                    name_int,
                    expires,
                } => Message::Sync {
                    map,
                    hash,
                    name_int,
                    expires,
                    value,
                },
            };
            self.send_to(link_id, &msg);
            sent += 1;
        }
        if let Some(ts) = self
            .table
            .replica_mut(index)
            .and_then(|r| r.transfer.as_mut())
        {
            ts.in_transit += sent;
        }
    }

    /// An item (or name) was acked.  During a migration this opens window
    /// space; outside one it is the tail of normal backup replication.
    pub(crate) fn on_sync_ack(&mut self, link_id: u64, hash: u64) {
        let index = self.table.mask().bucket_of(hash);
        let Some(replica) = self.table.replica_mut(index) else {
            debug!(
                bucket = format_args!("{:#x}", index),
                "sync ack for a bucket no longer hosted"
            );
            return;
        };
        match replica.transfer.as_mut() {
            Some(ts) if ts.target_link == link_id => {
                ts.in_transit = ts.in_transit.saturating_sub(1);
                self.pump_transfer(index);
            }
            _ => {
                // backup replication ack; nothing to do
            }
        }
    }

    /// The store is drained: settle roles with the target.
    fn finalise_transfer(&mut self, index: u64) {
        let mask = self.table.mask().get();
        let Some(replica) = self.table.replica_mut(index) else {
            return;
        };
        let Some(ts) = replica.transfer.as_mut() else {
            return;
        };
        debug_assert_eq!(ts.kind, TransferKind::Migrate);

        let new_role = match (replica.role, replica.peer_backup) {
            // an unbacked primary keeps its role; the target becomes the
            // backup copy
            (ReplicaRole::Primary, None) => ReplicaRole::Secondary,
            // a backed primary hands the primary role over
            (ReplicaRole::Primary, Some(_)) => ReplicaRole::Primary,
            // a secondary moves; the target becomes the new backup
            (ReplicaRole::Secondary, _) => ReplicaRole::Secondary,
            (ReplicaRole::Uninitialized, _) => {
                warn!(
                    bucket = format_args!("{:#x}", index),
                    "cannot finalise an uninitialised replica"
                );
                return;
            }
        };
        ts.phase = TransferPhase::AwaitTarget;
        let link_id = ts.target_link;
        debug!(
            bucket = format_args!("{:#x}", index),
            role = ?new_role,
            "store drained; finalising migration"
        );
        self.send_to(
            link_id,
            &Message::FinaliseMigration {
                mask,
                hash: index,
                new_role: new_role.to_wire(),
            },
        );
    }

    /// The target holds the bucket and its assigned role.
    pub(crate) fn on_migration_ack(&mut self, link_id: u64, mask: u64, hash: u64) {
        if mask != self.table.mask().get() || hash > mask {
            warn!(
                theirs = format_args!("{:#x}", mask),
                "migration ack under a mismatched mask"
            );
            return;
        }
        let target_info = {
            let Some(replica) = self.table.replica(hash) else {
                return;
            };
            let Some(ts) = replica.transfer.as_ref() else {
                return;
            };
            if ts.target_link != link_id || ts.phase != TransferPhase::AwaitTarget {
                warn!(bucket = format_args!("{:#x}", hash), "unexpected migration ack");
                return;
            }
            (ts.target_node, replica.role, replica.peer_backup, replica.peer_source)
        };
        let (target_node, role, peer_backup, peer_source) = target_info;
        let target_addr = self
            .nodes
            .get(target_node)
            .map(|n| n.addr.clone())
            .unwrap_or_default();

        match (role, peer_backup) {
            (ReplicaRole::Primary, None) => {
                // the only finalise path that keeps the source replica:
                // we stay primary, the target is now our backup
                let replica = self.table.replica_mut(hash).expect("replica just resolved");
                replica.peer_backup = Some(target_node);
                replica.transfer = None;
                self.counters.unbacked -= 1;
                self.table.entry_mut(hash).secondary = Some(target_addr);
                self.transfer_active = false;
                info!(
                    bucket = format_args!("{:#x}", hash),
                    "bucket now has a backup copy"
                );
                self.broadcast_entry(hash);
                self.publish_metrics();
                // reopen the rebalance loop promptly
                self.send_to(link_id, &Message::LoadLevels);
            }
            (ReplicaRole::Primary, Some(backup)) => {
                // point the existing backup at its new primary before
                // destroying anything here
                self.notify_relocation(hash, backup, ReplicaRole::Primary, target_addr);
            }
            (ReplicaRole::Secondary, _) => match peer_source {
                Some(source) => {
                    self.notify_relocation(hash, source, ReplicaRole::Secondary, target_addr)
                }
                None => {
                    warn!(
                        bucket = format_args!("{:#x}", hash),
                        "secondary migrated with no known primary"
                    );
                    self.finish_outbound_relocation(hash);
                }
            },
            (ReplicaRole::Uninitialized, _) => {
                warn!(bucket = format_args!("{:#x}", hash), "impossible finalise state");
            }
        }
    }

    /// Tell the third node involved where the replica moved.
    fn notify_relocation(&mut self, index: u64, node: NodeId, moved: ReplicaRole, new_addr: String) {
        if let Some(ts) = self
            .table
            .replica_mut(index)
            .and_then(|r| r.transfer.as_mut())
        {
            ts.phase = TransferPhase::AwaitRelocate;
        }
        let peer_link = self.nodes.get(node).and_then(|n| n.link);
        match peer_link {
            Some(link_id) => {
                debug!(
                    bucket = format_args!("{:#x}", index),
                    "notifying relocation"
                );
                self.send_to(
                    link_id,
                    &Message::BucketRelocated {
                        mask: self.table.mask().get(),
                        hash: index,
                        moved_role: moved.to_wire(),
                        new_addr,
                    },
                );
            }
            None => {
                // unreachable third node; the broadcast hash-mask updates
                // will have to reach it when it returns
                warn!(
                    bucket = format_args!("{:#x}", index),
                    "third node unreachable; completing relocation blind"
                );
                self.finish_outbound_relocation(index);
            }
        }
    }

    /// The third node acknowledged the relocation notice.
    pub(crate) fn on_relocated_ack(&mut self, _link_id: u64, mask: u64, hash: u64) {
        if mask != self.table.mask().get() || hash > mask {
            return;
        }
        let phase_ok = self
            .table
            .replica(hash)
            .and_then(|r| r.transfer.as_ref())
            .is_some_and(|ts| ts.phase == TransferPhase::AwaitRelocate);
        if !phase_ok {
            warn!(bucket = format_args!("{:#x}", hash), "unexpected relocation ack");
            return;
        }
        self.finish_outbound_relocation(hash);
    }

    /// Complete a relocation whose notice is pending.  Used when the third
    /// node answers with `REPLY_UNKNOWN` instead of the expected ack.
    pub(crate) fn finish_pending_relocation(&mut self) {
        let pending = self
            .table
            .iter()
            .find(|r| {
                r.transfer
                    .as_ref()
                    .is_some_and(|ts| ts.phase == TransferPhase::AwaitRelocate)
            })
            .map(|r| r.index);
        if let Some(index) = pending {
            self.finish_outbound_relocation(index);
        }
    }

    /// Drop the migrated-away replica and settle counters and tables.
    fn finish_outbound_relocation(&mut self, index: u64) {
        let Some((target_link, target_node)) = self
            .table
            .replica(index)
            .and_then(|r| r.transfer.as_ref())
            .map(|ts| (ts.target_link, ts.target_node))
        else {
            return;
        };
        let Some(replica) = self.table.take(index) else {
            return;
        };
        let target_addr = self
            .nodes
            .get(target_node)
            .map(|n| n.addr.clone())
            .unwrap_or_default();

        match replica.role {
            ReplicaRole::Primary => {
                self.counters.primary -= 1;
                self.table.entry_mut(index).primary = Some(target_addr);
            }
            ReplicaRole::Secondary => {
                self.counters.secondary -= 1;
                self.table.entry_mut(index).secondary = Some(target_addr);
            }
            ReplicaRole::Uninitialized => {}
        }
        // any late SYNC for this bucket is acked and dropped from here on
        replica.store.clear();
        self.transfer_active = false;
        info!(
            bucket = format_args!("{:#x}", index),
            "bucket migration complete"
        );
        self.broadcast_entry(index);
        self.publish_metrics();
        self.send_to(target_link, &Message::LoadLevels);
    }

    /// The peer completed a role switch we initiated.
    pub(crate) fn on_control_complete(&mut self, link_id: u64, mask: u64, hash: u64) {
        if mask != self.table.mask().get() || hash > mask {
            warn!(
                theirs = format_args!("{:#x}", mask),
                "switch completion under a mismatched mask"
            );
            return;
        }
        {
            let Some(replica) = self.table.replica_mut(hash) else {
                return;
            };
            let Some(ts) = replica.transfer.as_ref() else {
                warn!(
                    bucket = format_args!("{:#x}", hash),
                    "switch completion for a bucket not transferring"
                );
                return;
            };
            if ts.target_link != link_id || ts.kind != TransferKind::PromoteSwap {
                warn!(bucket = format_args!("{:#x}", hash), "unexpected switch completion");
                return;
            }

            match replica.role {
                ReplicaRole::Primary => {
                    replica.role = ReplicaRole::Secondary;
                    replica.peer_source = replica.peer_backup.take();
                    self.counters.primary -= 1;
                    self.counters.secondary += 1;
                }
                ReplicaRole::Secondary => {
                    replica.role = ReplicaRole::Primary;
                    replica.peer_backup = replica.peer_source.take();
                    self.counters.primary += 1;
                    self.counters.secondary -= 1;
                }
                ReplicaRole::Uninitialized => {
                    warn!(bucket = format_args!("{:#x}", hash), "switch on an uninitialised replica");
                    return;
                }
            }
            replica.transfer = None;
        }
        self.transfer_active = false;
        self.table.switch_entry(hash);
        info!(bucket = format_args!("{:#x}", hash), "bucket switching complete");
        self.broadcast_entry(hash);
        self.publish_metrics();
        self.send_to(link_id, &Message::LoadLevels);
    }

    /// A link died; cancel any transfer targeting it.  The source replica
    /// is untouched and no data is lost.
    pub(crate) fn abort_transfers_for_link(&mut self, link_id: u64) {
        for index in self.table.hosted_indices() {
            let replica = self.table.replica_mut(index).expect("index just listed");
            let targets_link = replica
                .transfer
                .as_ref()
                .is_some_and(|ts| ts.target_link == link_id);
            if targets_link {
                warn!(
                    bucket = format_args!("{:#x}", index),
                    "transfer target lost; cancelling"
                );
                replica.transfer = None;
                self.transfer_active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::controller::testing::*;
    use crate::controller::Event;
    use bytes::Bytes;
    use shoal_core::types::ReplicaRole;
    use shoal_proto::{command, Message};

    #[tokio::test]
    async fn test_backpressure_window() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        ctrl.cfg.transit_max = 2;
        ctrl.cfg.transit_min = 0;
        let (b, link, mut rx) = attach_peer(&mut ctrl, "b:1");
        drain(&mut rx);

        // five items in bucket 0
        for i in 0..5u64 {
            ctrl.store_value(1, i << 2, Bytes::from_static(b"v"), 0, 0)
                .unwrap();
        }

        ctrl.begin_migrate(0, b, link.id());
        drain(&mut rx);
        accept_bucket(&mut ctrl, &link, 0x3, 0);

        // only the window's worth goes out
        let first = drain(&mut rx);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|m| matches!(m, Message::Sync { .. })));

        // acking opens space for more; window refills when it drains
        let mut sent = first;
        while sent.iter().any(|m| matches!(m, Message::Sync { .. })) {
            let mut acked = false;
            for msg in std::mem::take(&mut sent) {
                if let Message::Sync { map, hash, .. } = msg {
                    ctrl.handle_event(Event::Frame {
                        link_id: link.id(),
                        header: reply_header(command::REPLY_SYNC_ACK, command::SYNC),
                        msg: Message::SyncAck { map, hash },
                    });
                    acked = true;
                }
            }
            assert!(acked);
            sent = drain(&mut rx);
        }

        // the drain finalised with the target as our backup
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::FinaliseMigration { new_role: 1, .. })));
    }

    #[tokio::test]
    async fn test_mutation_during_stream_is_resent() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let (b, link, mut rx) = attach_peer(&mut ctrl, "b:1");
        drain(&mut rx);

        ctrl.store_value(1, 0x4, Bytes::from_static(b"old"), 0, 0)
            .unwrap();
        ctrl.begin_migrate(0, b, link.id());
        drain(&mut rx);
        accept_bucket(&mut ctrl, &link, 0x3, 0);
        assert_eq!(drain(&mut rx).len(), 1);

        // the key is rewritten while its first copy is in flight
        ctrl.store_value(1, 0x4, Bytes::from_static(b"new"), 0, 0)
            .unwrap();

        ctrl.handle_event(Event::Frame {
            link_id: link.id(),
            header: reply_header(command::REPLY_SYNC_ACK, command::SYNC),
            msg: Message::SyncAck { map: 1, hash: 0x4 },
        });
        let resent = drain(&mut rx);
        assert!(
            resent.iter().any(
                |m| matches!(m, Message::Sync { hash: 0x4, value, .. } if value.as_ref() == b"new")
            ),
            "rewritten key must be resent: {:?}",
            resent
        );
    }

    #[tokio::test]
    async fn test_backed_primary_relocates_through_backup() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let (b, link_b, mut rx_b) = attach_peer(&mut ctrl, "b:1");
        let (c, link_c, mut rx_c) = attach_peer(&mut ctrl, "c:1");
        drain(&mut rx_b);
        drain(&mut rx_c);

        // bucket 1 is primary here with its backup on c
        {
            let replica = ctrl.table.replica_mut(1).unwrap();
            replica.peer_backup = Some(c);
            ctrl.table.entry_mut(1).secondary = Some("c:1".to_string());
            ctrl.counters = crate::bucket::Counters::recount(&ctrl.table);
        }

        ctrl.begin_migrate(1, b, link_b.id());
        drain(&mut rx_b);
        accept_bucket(&mut ctrl, &link_b, 0x3, 1);
        // empty store: finalise straight away, handing the primary role over
        let msgs = drain(&mut rx_b);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::FinaliseMigration { hash: 1, new_role: 0, .. })));

        ctrl.handle_event(Event::Frame {
            link_id: link_b.id(),
            header: reply_header(command::REPLY_MIGRATION_ACK, command::FINALISE_MIGRATION),
            msg: Message::MigrationAck { mask: 0x3, hash: 1 },
        });

        // the existing backup is told where its primary went
        let notice = drain(&mut rx_c);
        assert!(
            notice.iter().any(|m| matches!(
                m,
                Message::BucketRelocated { hash: 1, moved_role: 0, new_addr, .. }
                    if new_addr == "b:1"
            )),
            "backup must be notified: {:?}",
            notice
        );
        // the local replica survives until the backup acks
        assert!(ctrl.table.replica(1).is_some());

        ctrl.handle_event(Event::Frame {
            link_id: link_c.id(),
            header: reply_header(command::REPLY_RELOCATED_ACK, command::BUCKET_RELOCATED),
            msg: Message::RelocatedAck { mask: 0x3, hash: 1 },
        });

        assert!(ctrl.table.replica(1).is_none());
        assert!(!ctrl.transfer_active);
        assert_eq!(ctrl.counters.primary, 3);
        assert_eq!(ctrl.table.entry(1).primary.as_deref(), Some("b:1"));
        assert_eq!(ctrl.table.entry(1).secondary.as_deref(), Some("c:1"));
        assert_eq!(
            ctrl.counters,
            crate::bucket::Counters::recount(&ctrl.table)
        );
    }

    #[tokio::test]
    async fn test_secondary_migration_notifies_primary() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let (b, link_b, mut rx_b) = attach_peer(&mut ctrl, "b:1");
        let (c, link_c, mut rx_c) = attach_peer(&mut ctrl, "c:1");
        drain(&mut rx_b);
        drain(&mut rx_c);

        // bucket 2 is a secondary here, fed by the primary on c
        {
            let replica = ctrl.table.replica_mut(2).unwrap();
            replica.role = ReplicaRole::Secondary;
            replica.peer_source = Some(c);
            let entry = ctrl.table.entry_mut(2);
            entry.primary = Some("c:1".to_string());
            entry.secondary = Some("a:1".to_string());
            ctrl.counters = crate::bucket::Counters::recount(&ctrl.table);
        }

        ctrl.begin_migrate(2, b, link_b.id());
        drain(&mut rx_b);
        accept_bucket(&mut ctrl, &link_b, 0x3, 2);
        let msgs = drain(&mut rx_b);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::FinaliseMigration { hash: 2, new_role: 1, .. })));

        ctrl.handle_event(Event::Frame {
            link_id: link_b.id(),
            header: reply_header(command::REPLY_MIGRATION_ACK, command::FINALISE_MIGRATION),
            msg: Message::MigrationAck { mask: 0x3, hash: 2 },
        });
        let notice = drain(&mut rx_c);
        assert!(notice.iter().any(|m| matches!(
            m,
            Message::BucketRelocated { hash: 2, moved_role: 1, new_addr, .. } if new_addr == "b:1"
        )));

        ctrl.handle_event(Event::Frame {
            link_id: link_c.id(),
            header: reply_header(command::REPLY_RELOCATED_ACK, command::BUCKET_RELOCATED),
            msg: Message::RelocatedAck { mask: 0x3, hash: 2 },
        });

        assert!(ctrl.table.replica(2).is_none());
        assert_eq!(ctrl.counters.secondary, 0);
        assert_eq!(ctrl.table.entry(2).secondary.as_deref(), Some("b:1"));
    }

    #[tokio::test]
    async fn test_declined_offer_cancels_transfer() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let (b, link, mut rx) = attach_peer(&mut ctrl, "b:1");
        drain(&mut rx);

        ctrl.begin_migrate(0, b, link.id());
        assert!(ctrl.transfer_active);

        ctrl.handle_event(Event::Frame {
            link_id: link.id(),
            header: reply_header(command::REPLY_UNKNOWN, command::ACCEPT_BUCKET),
            msg: Message::Unknown,
        });
        assert!(!ctrl.transfer_active);
        assert!(ctrl.table.replica(0).unwrap().transfer.is_none());
    }
}
