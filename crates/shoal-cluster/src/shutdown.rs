//! Cooperative drain
//!
//! Per-bucket shutdown reassigns primaries by promoting their backups (or
//! pushing out an unbacked bucket first), then frees the slot.  Per-node
//! shutdown waits out pending connects and live links before the registry
//! entry is freed.  Both are driven by a tick that re-arms until done.

use std::time::Duration;

use tracing::{debug, info, warn};

use shoal_core::types::ReplicaRole;
use shoal_proto::Message;

use crate::bucket::Promotion;
use crate::controller::{Controller, Event, Tick};
use crate::node::{ConnState, NodeId};
use crate::timer::TimerHandle;

impl Controller {
    /// Drain everything: every bucket and every node.
    pub fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(
            buckets = self.table.hosted(),
            nodes = self.nodes.len(),
            "node shutdown initiated"
        );
        for index in self.table.hosted_indices() {
            self.bucket_shutdown(index);
        }
        for id in self.nodes.ids() {
            self.node_shutdown(id);
        }
    }

    /// Start draining one bucket.  Idempotent.
    pub fn bucket_shutdown(&mut self, index: u64) {
        let events = self.events.clone();
        let Some(replica) = self.table.replica_mut(index) else {
            return;
        };
        if replica.shutdown_timer.is_some() {
            return;
        }
        info!(bucket = format_args!("{:#x}", index), "bucket shutdown initiated");
        replica.shutdown_timer = Some(TimerHandle::spawn(
            events,
            Duration::ZERO,
            Event::Tick(Tick::BucketShutdown(index)),
        ));
    }

    pub(crate) fn on_bucket_shutdown_tick(&mut self, index: u64) {
        let Some(replica) = self.table.replica(index) else {
            return;
        };

        // wait out any in-flight transfer before touching the replica
        if replica.transfer.is_some() {
            self.rearm_bucket_shutdown(index);
            return;
        }

        match replica.role {
            // a backup copy can simply be dropped
            ReplicaRole::Secondary => self.finish_bucket_shutdown(index),
            // a partially received bucket is abandoned
            ReplicaRole::Uninitialized => {
                if let Some((bucket, _)) = self.inbound_transfer {
                    if bucket == index {
                        self.inbound_transfer = None;
                    }
                }
                self.finish_bucket_shutdown(index);
            }
            ReplicaRole::Primary => {
                // nowhere to hand it off: drop it with the node
                if self.active_nodes == 0 {
                    self.finish_bucket_shutdown(index);
                    return;
                }

                let backup_link = replica
                    .peer_backup
                    .and_then(|id| self.nodes.get(id))
                    .and_then(|n| n.link);
                if let Some(link_id) = backup_link {
                    if replica.promotion == Promotion::Idle {
                        debug!(
                            bucket = format_args!("{:#x}", index),
                            "promoting backup before shutdown"
                        );
                        self.send_to(link_id, &Message::Promote { hash: index });
                        self.table
                            .replica_mut(index)
                            .expect("replica just resolved")
                            .promotion = Promotion::Promoting;
                    }
                    // done once the backup acks the promotion
                    self.rearm_bucket_shutdown(index);
                } else {
                    // no backup: push the bucket to any connected peer and
                    // come back once it has a second copy
                    if !self.transfer_active {
                        if let Some((node, link_id)) = self.nodes.first_connected() {
                            self.begin_migrate(index, node, link_id);
                        }
                    }
                    self.rearm_bucket_shutdown(index);
                }
            }
        }
    }

    fn rearm_bucket_shutdown(&mut self, index: u64) {
        let events = self.events.clone();
        let tick = self.cfg.shutdown_tick;
        if let Some(replica) = self.table.replica_mut(index) {
            replica.shutdown_timer = Some(TimerHandle::spawn(
                events,
                tick,
                Event::Tick(Tick::BucketShutdown(index)),
            ));
        }
    }

    /// Destroy the replica's contents, clear this node out of the
    /// hash-mask entry, and free the slot.
    fn finish_bucket_shutdown(&mut self, index: u64) {
        let Some(replica) = self.table.take(index) else {
            return;
        };
        match replica.role {
            ReplicaRole::Primary => {
                self.counters.primary -= 1;
                if replica.peer_backup.is_none() {
                    self.counters.unbacked -= 1;
                }
            }
            ReplicaRole::Secondary => self.counters.secondary -= 1,
            ReplicaRole::Uninitialized => {}
        }
        replica.store.clear();

        let me = self.cfg.advertised.clone();
        let entry = self.table.entry_mut(index);
        if entry.primary.as_deref() == Some(me.as_str()) {
            entry.primary = None;
        }
        if entry.secondary.as_deref() == Some(me.as_str()) {
            entry.secondary = None;
        }
        info!(bucket = format_args!("{:#x}", index), "bucket shut down");
        self.broadcast_entry(index);
        self.publish_metrics();
    }

    /// The backup acknowledged a shutdown promotion: it is primary now and
    /// our copy can go.
    pub(crate) fn on_promote_ack(&mut self, link_id: u64) {
        let Some(node_id) = self.nodes.find_by_link(link_id) else {
            return;
        };
        let promoted = self
            .table
            .iter()
            .find(|r| r.promotion == Promotion::Promoting && r.peer_backup == Some(node_id))
            .map(|r| r.index);
        let Some(index) = promoted else {
            warn!("promotion ack without a promoting bucket");
            return;
        };

        let backup_addr = self
            .nodes
            .get(node_id)
            .map(|n| n.addr.clone())
            .unwrap_or_default();
        let Some(replica) = self.table.take(index) else {
            return;
        };
        self.counters.primary -= 1;
        replica.store.clear();

        let entry = self.table.entry_mut(index);
        entry.primary = Some(backup_addr);
        entry.secondary = None;
        info!(
            bucket = format_args!("{:#x}", index),
            "backup promoted; bucket released"
        );
        self.broadcast_entry(index);
        self.publish_metrics();
    }

    /// Start draining one registry entry.  Idempotent.
    pub fn node_shutdown(&mut self, id: NodeId) {
        let events = self.events.clone();
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.shutdown_timer.is_some() {
            return;
        }
        node.shutting_down = true;
        debug!(peer = %node.addr, "node entry shutdown initiated");
        node.shutdown_timer = Some(TimerHandle::spawn(
            events,
            Duration::ZERO,
            Event::Tick(Tick::NodeShutdown(id)),
        ));
    }

    pub(crate) fn on_node_shutdown_tick(&mut self, id: NodeId) {
        let hosted = self.table.hosted();
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        match node.state {
            // let a pending connect settle first
            ConnState::Connecting => self.rearm_node_shutdown(id),
            ConnState::Waiting => {
                node.wait_timer = None;
                self.remove_node(id);
            }
            ConnState::Active => {
                if hosted > 0 {
                    // bucket drains may still need this connection
                    self.rearm_node_shutdown(id);
                    return;
                }
                if let Some(link_id) = node.link.take() {
                    self.links.remove(&link_id);
                }
                if node.active_counted {
                    node.active_counted = false;
                    self.active_nodes -= 1;
                }
                self.remove_node(id);
            }
            ConnState::Disconnected => self.remove_node(id),
        }
    }

    fn rearm_node_shutdown(&mut self, id: NodeId) {
        let events = self.events.clone();
        let tick = self.cfg.shutdown_tick;
        if let Some(node) = self.nodes.get_mut(id) {
            node.shutdown_timer = Some(TimerHandle::spawn(
                events,
                tick,
                Event::Tick(Tick::NodeShutdown(id)),
            ));
        }
    }

    fn remove_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            info!(peer = %node.addr, "node entry freed");
        }
        self.publish_metrics();
    }
}

#[cfg(test)]
mod tests {
    use crate::controller::testing::*;
    use crate::controller::{Event, Tick};
    use crate::node::ConnState;
    use shoal_core::types::ReplicaRole;
    use shoal_proto::{command, Message};

    #[tokio::test]
    async fn test_secondary_drops_immediately() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let (c, _link_c, mut rx_c) = attach_peer(&mut ctrl, "c:1");
        drain(&mut rx_c);
        {
            let replica = ctrl.table.replica_mut(3).unwrap();
            replica.role = ReplicaRole::Secondary;
            replica.peer_source = Some(c);
            ctrl.table.entry_mut(3).secondary = Some("a:1".to_string());
            ctrl.counters = crate::bucket::Counters::recount(&ctrl.table);
        }

        ctrl.bucket_shutdown(3);
        ctrl.handle_event(Event::Tick(Tick::BucketShutdown(3)));

        assert!(ctrl.table.replica(3).is_none());
        assert_eq!(ctrl.counters.secondary, 0);
        assert_eq!(ctrl.table.entry(3).secondary, None);
        let msgs = drain(&mut rx_c);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::HashmaskUpdate { hash: 3, .. })));
    }

    #[tokio::test]
    async fn test_lone_primary_drops_with_node() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        ctrl.bucket_shutdown(0);
        ctrl.handle_event(Event::Tick(Tick::BucketShutdown(0)));
        assert!(ctrl.table.replica(0).is_none());
        assert_eq!(ctrl.counters.primary, 3);
        assert_eq!(ctrl.counters.unbacked, 3);
    }

    #[tokio::test]
    async fn test_primary_with_backup_promotes() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let (b, link, mut rx) = attach_peer(&mut ctrl, "b:1");
        drain(&mut rx);
        {
            let replica = ctrl.table.replica_mut(1).unwrap();
            replica.peer_backup = Some(b);
            ctrl.table.entry_mut(1).secondary = Some("b:1".to_string());
            ctrl.counters = crate::bucket::Counters::recount(&ctrl.table);
        }
        let active_before = ctrl.active_nodes;

        ctrl.bucket_shutdown(1);
        ctrl.handle_event(Event::Tick(Tick::BucketShutdown(1)));

        let msgs = drain(&mut rx);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::Promote { hash: 1 })));
        assert!(ctrl.table.replica(1).is_some(), "kept until the ack");

        // a second tick must not resend the promotion
        ctrl.handle_event(Event::Tick(Tick::BucketShutdown(1)));
        assert!(!drain(&mut rx)
            .iter()
            .any(|m| matches!(m, Message::Promote { .. })));

        ctrl.handle_event(Event::Frame {
            link_id: link.id(),
            header: reply_header(command::REPLY_ACK, command::PROMOTE),
            msg: Message::Ack,
        });

        assert!(ctrl.table.replica(1).is_none());
        assert_eq!(ctrl.counters.primary, 3);
        assert_eq!(ctrl.active_nodes, active_before);
        assert_eq!(ctrl.table.entry(1).primary.as_deref(), Some("b:1"));
        assert_eq!(ctrl.table.entry(1).secondary, None);
        let msgs = drain(&mut rx);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::HashmaskUpdate { hash: 1, .. })));
    }

    #[tokio::test]
    async fn test_unbacked_primary_migrates_before_shutdown() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let (_b, _link, mut rx) = attach_peer(&mut ctrl, "b:1");
        drain(&mut rx);

        ctrl.bucket_shutdown(2);
        ctrl.handle_event(Event::Tick(Tick::BucketShutdown(2)));

        // the drain starts by getting a second copy out
        assert!(ctrl.transfer_active);
        let msgs = drain(&mut rx);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::AcceptBucket { hash: 2, .. })));
        assert!(ctrl.table.replica(2).is_some());
    }

    #[tokio::test]
    async fn test_waiting_node_freed_on_shutdown() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let id = ctrl.nodes.add("b:1".to_string());
        ctrl.nodes.get_mut(id).unwrap().state = ConnState::Waiting;

        ctrl.node_shutdown(id);
        ctrl.handle_event(Event::Tick(Tick::NodeShutdown(id)));
        assert!(ctrl.nodes.get(id).is_none());
    }

    #[tokio::test]
    async fn test_full_drain_two_nodes() {
        let (mut ctrl, _events) = bootstrap_controller("a:1");
        let (b, link, mut rx) = attach_peer(&mut ctrl, "b:1");
        drain(&mut rx);
        for index in 0..4u64 {
            let replica = ctrl.table.replica_mut(index).unwrap();
            replica.peer_backup = Some(b);
            ctrl.table.entry_mut(index).secondary = Some("b:1".to_string());
        }
        ctrl.counters = crate::bucket::Counters::recount(&ctrl.table);

        ctrl.handle_event(Event::Shutdown);
        for index in 0..4u64 {
            ctrl.handle_event(Event::Tick(Tick::BucketShutdown(index)));
        }
        // every bucket promoted its backup
        let sent = drain(&mut rx);
        assert_eq!(
            sent.iter()
                .filter(|m| matches!(m, Message::Promote { .. }))
                .count(),
            4
        );
        for _ in 0..4 {
            ctrl.handle_event(Event::Frame {
                link_id: link.id(),
                header: reply_header(command::REPLY_ACK, command::PROMOTE),
                msg: Message::Ack,
            });
        }
        assert_eq!(ctrl.table.hosted(), 0);

        // with the buckets gone, the node entry closes its link and frees
        ctrl.handle_event(Event::Tick(Tick::NodeShutdown(b)));
        assert!(ctrl.nodes.is_empty());
        assert_eq!(ctrl.active_nodes, 0);
    }
}
