//! Rebalancing decisions
//!
//! Every `REPLY_LOADLEVELS` from a peer runs the decision procedure: first
//! consider swapping roles with a peer drowning in backups, then get a
//! second copy of any unbacked primary out fast, then move replicas toward
//! the ideal per-node count.  When the ideal falls below the configured
//! floor, the mask is split instead of migrating anything.
//!
//! Candidate scans walk the table in ascending index order and take the
//! first qualifying bucket, so identical inputs make identical choices.

use tracing::{debug, info};

use shoal_core::types::{LoadReport, ReplicaRole};

use crate::controller::Controller;
use crate::node::NodeId;

impl Controller {
    /// Decision procedure on a peer's load report.
    pub(crate) fn on_load_report(&mut self, link_id: u64, report: LoadReport) {
        let Some(node_id) = self.nodes.find_by_link(link_id) else {
            return;
        };

        // one transfer at a time, on each side
        if self.transfer_active || self.inbound_transfer.is_some() || report.transferring != 0 {
            debug!(
                local = self.transfer_active,
                peer = report.transferring,
                "transfer in flight; skipping rebalance"
            );
            return;
        }

        let counters = self.counters;

        // 1. the peer has more backups than primaries: promote one of ours
        //    that it backs, if that leaves us stable
        if counters.primary - 1 >= counters.secondary + 1 && report.backups > report.primary {
            if let Some(index) = self.find_swap_candidate(node_id) {
                self.begin_swap(index, node_id, link_id);
                return;
            }
        }

        // 2. an unbacked primary takes priority over load shaping
        let bucket_count = self.table.mask().bucket_count() as i64;
        if counters.unbacked > 0
            && i64::from(report.primary) + i64::from(report.backups) < bucket_count
        {
            if let Some(index) = self.find_unbacked_candidate() {
                self.begin_migrate(index, node_id, link_id);
                return;
            }
        }

        // 3. move toward the ideal replica count per node
        if self.active_nodes <= 0 {
            return;
        }
        let ideal = (self.table.mask().bucket_count() as i64 * 2) / self.active_nodes;
        if ideal < self.cfg.min_buckets {
            // too few buckets to spread around; grow the fan-out instead
            let new_mask = self.table.mask().doubled();
            info!(
                ideal,
                floor = self.cfg.min_buckets,
                %new_mask,
                "ideal per-node count below floor; splitting mask"
            );
            if let Err(e) = self.apply_split(new_mask) {
                tracing::error!(%e, "mask split failed");
            }
            return;
        }

        if i64::from(report.primary) + i64::from(report.backups) >= ideal {
            return;
        }
        if counters.primary + counters.secondary <= ideal {
            return;
        }

        let send_role = if counters.secondary >= counters.primary {
            ReplicaRole::Secondary
        } else {
            ReplicaRole::Primary
        };
        if let Some(index) = self.find_balance_candidate(node_id, send_role) {
            self.begin_migrate(index, node_id, link_id);
        }
    }

    /// A primary whose backup lives on `node`: swapping roles moves the
    /// primary load without moving data.
    fn find_swap_candidate(&self, node: NodeId) -> Option<u64> {
        self.table
            .iter()
            .find(|r| r.is_primary() && r.peer_backup == Some(node) && r.is_settled())
            .map(|r| r.index)
    }

    /// Any primary with no backup copy anywhere.
    fn find_unbacked_candidate(&self) -> Option<u64> {
        self.table
            .iter()
            .find(|r| r.is_primary() && r.peer_backup.is_none() && r.is_settled())
            .map(|r| r.index)
    }

    /// A replica of `role` that can move to `node` without putting both
    /// copies of a bucket on one host.
    fn find_balance_candidate(&self, node: NodeId, role: ReplicaRole) -> Option<u64> {
        self.table
            .iter()
            .find(|r| {
                if r.role != role || !r.is_settled() {
                    return false;
                }
                match role {
                    ReplicaRole::Primary => {
                        r.peer_backup.is_some() && r.peer_backup != Some(node)
                    }
                    ReplicaRole::Secondary => {
                        r.peer_source.is_some() && r.peer_source != Some(node)
                    }
                    ReplicaRole::Uninitialized => false,
                }
            })
            .map(|r| r.index)
    }
}
