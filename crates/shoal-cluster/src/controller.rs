//! The cluster controller
//!
//! Owns every piece of cluster state: the bucket table, the hash-mask
//! table, the node registry, and the process-wide counters.  All mutation
//! happens on one task, one event at a time; readers, timers, and dialers
//! only ever enqueue [`Event`]s.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use metrics::gauge;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use shoal_core::config::ShoalConfig;
use shoal_core::types::{ClusterStats, HashMask, LoadReport, ReplicaRole};
use shoal_proto::{command, Header, Message};

use crate::bucket::{BucketReplica, BucketTable, Counters};
use crate::error::{ClusterError, ClusterResult};
use crate::link::PeerLink;
use crate::node::{ConnState, NodeId, NodeRegistry};
use crate::timer::TimerHandle;
use crate::transport;

/// Everything the controller needs from the node configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub advertised: String,
    pub peers: Vec<String>,
    pub initial_buckets: u64,
    pub min_buckets: i64,
    pub transit_max: u32,
    pub transit_min: u32,
    pub connect_timeout: Duration,
    pub reconnect_wait: Duration,
    pub loadlevel_interval: Duration,
    pub shutdown_tick: Duration,
}

impl ControllerConfig {
    pub fn from_config(config: &ShoalConfig) -> Self {
        let c = &config.cluster;
        Self {
            advertised: config.advertised(),
            peers: c.peers.clone(),
            initial_buckets: c.initial_buckets,
            min_buckets: c.min_buckets,
            transit_max: c.transit_max,
            transit_min: c.transit_min,
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            reconnect_wait: Duration::from_millis(c.reconnect_wait_ms),
            loadlevel_interval: Duration::from_millis(c.loadlevel_interval_ms),
            shutdown_tick: Duration::from_millis(c.shutdown_tick_ms),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_config(&ShoalConfig::default())
    }
}

/// Deferred work delivered by a [`TimerHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Retry connecting to a peer after the wait period.
    Reconnect(NodeId),
    /// Probe a peer's load levels.
    LoadLevel(NodeId),
    /// Drive the drain of one bucket.
    BucketShutdown(u64),
    /// Drive the drain of one peer entry.
    NodeShutdown(NodeId),
}

/// Everything that can happen to the controller.
#[derive(Debug)]
pub enum Event {
    /// An inbound connection was accepted.
    LinkOpened { link: PeerLink },
    /// A connection closed (either direction).
    LinkClosed { link_id: u64 },
    /// A decoded frame arrived.
    Frame {
        link_id: u64,
        header: Header,
        msg: Message,
    },
    /// A frame arrived whose payload could not be decoded.
    BadFrame { link_id: u64, header: Header },
    /// An outbound dial completed.
    Dialed { node: NodeId, link: PeerLink },
    /// An outbound dial failed or timed out.
    DialFailed { node: NodeId },
    Tick(Tick),
    /// Begin the cooperative drain of the whole node.
    Shutdown,
}

pub struct Controller {
    pub(crate) cfg: ControllerConfig,
    pub(crate) table: BucketTable,
    pub(crate) nodes: NodeRegistry,
    /// All open connections (peers and clients) by link id.
    pub(crate) links: HashMap<u64, PeerLink>,
    pub(crate) counters: Counters,
    /// True while an outbound transfer is in flight; serialises migrations.
    pub(crate) transfer_active: bool,
    /// `(bucket, link)` of an inbound migration being received.
    pub(crate) inbound_transfer: Option<(u64, u64)>,
    /// Monotonic migration sync counter.
    pub(crate) migrate_sync: u64,
    /// Peers with a completed greeting.
    pub(crate) active_nodes: i64,
    pub(crate) events: mpsc::UnboundedSender<Event>,
    pub(crate) shutting_down: bool,
}

impl Controller {
    pub fn new(cfg: ControllerConfig, events: mpsc::UnboundedSender<Event>) -> ClusterResult<Self> {
        let table = if cfg.peers.is_empty() {
            let mask = HashMask::from_buckets(cfg.initial_buckets)?;
            info!(%mask, "bootstrapping a new cluster; this node owns all buckets");
            BucketTable::bootstrap(mask, &cfg.advertised)
        } else {
            BucketTable::new(HashMask::new(shoal_core::JOIN_MASK)?)
        };
        let counters = Counters::recount(&table);

        let mut nodes = NodeRegistry::new();
        for addr in &cfg.peers {
            nodes.add(addr.clone());
        }

        Ok(Self {
            cfg,
            table,
            nodes,
            links: HashMap::new(),
            counters,
            transfer_active: false,
            inbound_transfer: None,
            migrate_sync: 0,
            active_nodes: 0,
            events,
            shutting_down: false,
        })
    }

    /// Kick off outbound connections to every configured peer.
    pub fn start(&mut self) {
        info!(
            advertised = %self.cfg.advertised,
            mask = %self.table.mask(),
            peers = self.nodes.len(),
            "cluster controller starting"
        );
        for id in self.nodes.ids() {
            self.start_connect(id);
        }
        self.publish_metrics();
    }

    /// Consume events until shutdown completes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        self.start();
        while let Some(event) = events.recv().await {
            self.handle_event(event);
            if self.shutting_down && self.table.hosted() == 0 && self.nodes.is_empty() {
                break;
            }
        }
        info!("cluster controller stopped");
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::LinkOpened { link } => {
                debug!(link = link.id(), "connection opened");
                self.links.insert(link.id(), link);
            }
            Event::LinkClosed { link_id } => self.on_link_closed(link_id),
            Event::Frame {
                link_id,
                header,
                msg,
            } => {
                if header.is_reply() {
                    self.handle_reply(link_id, header, msg);
                } else {
                    self.handle_request(link_id, header, msg);
                }
            }
            Event::BadFrame { link_id, header } => {
                warn!(
                    command = format_args!("{:#06x}", header.command),
                    "undecodable frame"
                );
                self.reply_to(link_id, &header, &Message::Unknown);
            }
            Event::Dialed { node, link } => self.on_dialed(node, link),
            Event::DialFailed { node } => self.on_dial_failed(node),
            Event::Tick(tick) => self.on_tick(tick),
            Event::Shutdown => self.begin_shutdown(),
        }
    }

    fn on_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Reconnect(id) => self.on_reconnect_tick(id),
            Tick::LoadLevel(id) => self.on_loadlevel_tick(id),
            Tick::BucketShutdown(index) => self.on_bucket_shutdown_tick(index),
            Tick::NodeShutdown(id) => self.on_node_shutdown_tick(id),
        }
    }

    // ---------------------------------------------------------------- links

    pub(crate) fn send_to(&self, link_id: u64, msg: &Message) -> bool {
        match self.links.get(&link_id) {
            Some(link) => link.send(msg),
            None => false,
        }
    }

    pub(crate) fn reply_to(&self, link_id: u64, to: &Header, msg: &Message) -> bool {
        match self.links.get(&link_id) {
            Some(link) => link.reply(to, msg),
            None => false,
        }
    }

    /// Push the current hash-mask entry for `index` to every connection.
    pub(crate) fn broadcast_entry(&self, index: u64) {
        let entry = self.table.entry(index);
        let msg = Message::HashmaskUpdate {
            mask: self.table.mask().get(),
            hash: index,
            primary: entry.primary.clone().unwrap_or_default(),
            secondary: entry.secondary.clone().unwrap_or_default(),
        };
        for link in self.links.values() {
            link.send(&msg);
        }
    }

    fn on_link_closed(&mut self, link_id: u64) {
        self.links.remove(&link_id);
        self.abort_transfers_for_link(link_id);

        if let Some((bucket, source_link)) = self.inbound_transfer {
            if source_link == link_id {
                warn!(
                    bucket = format_args!("{:#x}", bucket),
                    "inbound migration source lost; dropping partial bucket"
                );
                if let Some(replica) = self.table.take(bucket) {
                    replica.store.clear();
                }
                self.inbound_transfer = None;
            }
        }

        let Some(id) = self.nodes.find_by_link(link_id) else {
            return;
        };

        let (addr, node_shutting) = {
            let node = self.nodes.get_mut(id).expect("node just resolved");
            node.link = None;
            node.loadlevel_timer = None;
            if node.active_counted {
                node.active_counted = false;
                self.active_nodes -= 1;
            }
            (node.addr.clone(), node.shutting_down)
        };
        info!(peer = %addr, active = self.active_nodes, "node disconnected");

        // backups held by the departed peer are gone; the rebalance loop
        // will arrange replacements
        let mut lost = 0;
        for index in self.table.hosted_indices() {
            let replica = self.table.replica_mut(index).expect("index just listed");
            if replica.role == ReplicaRole::Primary && replica.peer_backup == Some(id) {
                replica.peer_backup = None;
                self.counters.unbacked += 1;
                lost += 1;
            }
        }
        if lost > 0 {
            warn!(peer = %addr, buckets = lost, "backup copies lost with node");
        }

        let node = self.nodes.get_mut(id).expect("node just resolved");
        if self.shutting_down || node_shutting {
            node.state = ConnState::Disconnected;
        } else {
            node.state = ConnState::Waiting;
            self.arm_wait(id);
        }
        self.publish_metrics();
    }

    // ---------------------------------------------------------- connections

    pub(crate) fn start_connect(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.link.is_some() || node.state == ConnState::Connecting {
            return;
        }
        node.state = ConnState::Connecting;
        node.connect_attempts += 1;
        let addr = node.addr.clone();
        info!(peer = %addr, attempt = node.connect_attempts, "connecting to node");
        transport::spawn_dial(self.events.clone(), id, addr, self.cfg.connect_timeout);
    }

    fn on_dialed(&mut self, id: NodeId, link: PeerLink) {
        let link_id = link.id();
        self.links.insert(link_id, link);
        let Some(node) = self.nodes.get_mut(id) else {
            // the node was freed while the dial was in flight
            self.links.remove(&link_id);
            return;
        };
        info!(peer = %node.addr, "connected to node");
        node.state = ConnState::Active;
        node.link = Some(link_id);
        node.connect_attempts = 0;
        node.last_seen = Some(Utc::now());

        let hello = Message::ServerHello {
            addr: self.cfg.advertised.clone(),
            capabilities: 0,
        };
        self.send_to(link_id, &hello);
        self.arm_loadlevel(id);
    }

    fn on_dial_failed(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        warn!(peer = %node.addr, "unable to connect to node");
        node.state = ConnState::Waiting;
        self.arm_wait(id);
    }

    fn arm_wait(&mut self, id: NodeId) {
        let jitter = Duration::from_millis(rand::random_range(0..500));
        let delay = self.cfg.reconnect_wait + jitter;
        let events = self.events.clone();
        if let Some(node) = self.nodes.get_mut(id) {
            node.wait_timer = Some(TimerHandle::spawn(
                events,
                delay,
                Event::Tick(Tick::Reconnect(id)),
            ));
        }
    }

    pub(crate) fn arm_loadlevel(&mut self, id: NodeId) {
        let delay = self.cfg.loadlevel_interval;
        let events = self.events.clone();
        if let Some(node) = self.nodes.get_mut(id) {
            node.loadlevel_timer = Some(TimerHandle::spawn(
                events,
                delay,
                Event::Tick(Tick::LoadLevel(id)),
            ));
        }
    }

    fn on_reconnect_tick(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.wait_timer = None;
        if self.shutting_down || node.shutting_down || node.link.is_some() {
            return;
        }
        node.state = ConnState::Disconnected;
        self.start_connect(id);
    }

    fn on_loadlevel_tick(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        let Some(link_id) = node.link else {
            return;
        };
        self.send_to(link_id, &Message::LoadLevels);
        self.arm_loadlevel(id);
    }

    // ------------------------------------------------------------- requests

    fn handle_request(&mut self, link_id: u64, header: Header, msg: Message) {
        match msg {
            Message::ServerHello { addr, .. } => self.on_server_hello(link_id, header, addr),
            Message::LoadLevels => {
                let reply = Message::ReplyLoadLevels {
                    primary: self.counters.primary as i32,
                    backups: self.counters.secondary as i32,
                    transferring: i32::from(
                        self.transfer_active || self.inbound_transfer.is_some(),
                    ),
                };
                self.reply_to(link_id, &header, &reply);
            }
            Message::AcceptBucket { mask, hash } => {
                self.on_accept_bucket(link_id, header, mask, hash)
            }
            Message::ControlBucket { mask, hash, .. } => {
                self.on_control_bucket(link_id, header, mask, hash)
            }
            Message::SyncName { hash, name } => {
                let index = self.table.mask().bucket_of(hash);
                match self.table.replica(index) {
                    Some(replica) => replica.store.set_name(hash, name),
                    // the replica moved on; the name lives at its new home
                    None => debug!(
                        bucket = format_args!("{:#x}", index),
                        "name sync for bucket no longer hosted"
                    ),
                }
                self.reply_to(link_id, &header, &Message::SyncNameAck { hash });
            }
            Message::Sync {
                map,
                hash,
                name_int,
                expires,
                value,
            } => {
                let index = self.table.mask().bucket_of(hash);
                match self.table.replica(index) {
                    Some(replica) => replica.store.set(map, hash, value, name_int, expires),
                    None => debug!(
                        bucket = format_args!("{:#x}", index),
                        "sync for bucket no longer hosted"
                    ),
                }
                self.reply_to(link_id, &header, &Message::SyncAck { map, hash });
            }
            Message::FinaliseMigration {
                mask,
                hash,
                new_role,
            } => self.on_finalise_migration(link_id, header, mask, hash, new_role),
            Message::Promote { hash } => self.on_promote(link_id, header, hash),
            Message::HashmaskUpdate {
                mask,
                hash,
                primary,
                secondary,
            } => self.on_hashmask_update(mask, hash, primary, secondary),
            Message::BucketRelocated {
                mask,
                hash,
                moved_role,
                new_addr,
            } => self.on_bucket_relocated(link_id, header, mask, hash, moved_role, new_addr),
            Message::Get { map, hash } => {
                let reply = match self.get_value(map, hash) {
                    Ok(Some(value)) => Message::Value { map, hash, value },
                    Ok(None) => Message::Value {
                        map,
                        hash,
                        value: Bytes::new(),
                    },
                    Err(e) => Message::Moved {
                        addr: e.redirect().unwrap_or_default().to_string(),
                    },
                };
                self.reply_to(link_id, &header, &reply);
            }
            Message::Set {
                map,
                hash,
                expires,
                value,
            } => {
                let reply = match self.store_value(map, hash, value, 0, expires) {
                    Ok(()) => Message::Stored { map, hash },
                    Err(e) => Message::Moved {
                        addr: e.redirect().unwrap_or_default().to_string(),
                    },
                };
                self.reply_to(link_id, &header, &reply);
            }
            other => {
                warn!(command = format_args!("{:#06x}", other.command()), "unexpected request");
                self.reply_to(link_id, &header, &Message::Unknown);
            }
        }
    }

    fn on_server_hello(&mut self, link_id: u64, header: Header, addr: String) {
        let id = self
            .nodes
            .find_by_addr(&addr)
            .unwrap_or_else(|| self.nodes.add(addr.clone()));
        {
            let node = self.nodes.get_mut(id).expect("node just resolved");
            node.link = Some(link_id);
            node.state = ConnState::Active;
            node.wait_timer = None;
            node.last_seen = Some(Utc::now());
            if !node.active_counted {
                node.active_counted = true;
                self.active_nodes += 1;
            }
        }
        info!(peer = %addr, active = self.active_nodes, "node greeted");
        // both sides probe load levels so either can initiate rebalancing
        self.arm_loadlevel(id);
        self.reply_to(link_id, &header, &Message::Ack);
        self.publish_metrics();
    }

    /// Receiving side of a migration offer.
    fn on_accept_bucket(&mut self, link_id: u64, header: Header, mask: u64, hash: u64) {
        if self.shutting_down || self.transfer_active || self.inbound_transfer.is_some() {
            debug!(
                bucket = format_args!("{:#x}", hash),
                "declining bucket offer while busy"
            );
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        }

        let ours = self.table.mask().get();
        if mask > ours {
            // the cluster's fan-out grew past us; catch up before accepting
            let grown = match HashMask::new(mask) {
                Ok(m) => m,
                Err(e) => {
                    warn!(%e, "bad mask in bucket offer");
                    self.reply_to(link_id, &header, &Message::Unknown);
                    return;
                }
            };
            if let Err(e) = self.apply_split(grown) {
                error!(%e, "failed to catch up to offered mask");
                self.reply_to(link_id, &header, &Message::Unknown);
                return;
            }
        } else if mask < ours {
            warn!(
                theirs = format_args!("{:#x}", mask),
                ours = format_args!("{:#x}", ours),
                "peer offered a bucket under a stale mask"
            );
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        }

        if hash > self.table.mask().get() || self.table.replica(hash).is_some() {
            warn!(
                bucket = format_args!("{:#x}", hash),
                "cannot accept offered bucket"
            );
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        }

        let mut replica = BucketReplica::receiving(hash);
        replica.peer_source = self.nodes.find_by_link(link_id);
        self.table.insert(replica);
        self.inbound_transfer = Some((hash, link_id));
        info!(bucket = format_args!("{:#x}", hash), "accepting inbound bucket");
        self.reply_to(
            link_id,
            &header,
            &Message::AcceptingBucket {
                mask: self.table.mask().get(),
                hash,
            },
        );
    }

    /// Receiving side of a promote-swap: this secondary becomes primary.
    fn on_control_bucket(&mut self, link_id: u64, header: Header, mask: u64, hash: u64) {
        if mask != self.table.mask().get() || hash > mask {
            warn!(
                theirs = format_args!("{:#x}", mask),
                "control bucket under a mismatched mask"
            );
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        }
        {
            let Some(replica) = self.table.replica_mut(hash) else {
                warn!(
                    bucket = format_args!("{:#x}", hash),
                    "control for a bucket not hosted here"
                );
                self.reply_to(link_id, &header, &Message::Unknown);
                return;
            };
            if replica.role != ReplicaRole::Secondary {
                warn!(
                    bucket = format_args!("{:#x}", hash),
                    role = ?replica.role,
                    "control switch requires the secondary replica"
                );
                self.reply_to(link_id, &header, &Message::Unknown);
                return;
            }
            replica.role = ReplicaRole::Primary;
            replica.peer_backup = replica.peer_source.take();
            self.counters.primary += 1;
            self.counters.secondary -= 1;
            if replica.peer_backup.is_none() {
                self.counters.unbacked += 1;
            }
        }
        self.table.switch_entry(hash);
        info!(bucket = format_args!("{:#x}", hash), "promoted by control switch");
        self.broadcast_entry(hash);
        self.reply_to(
            link_id,
            &header,
            &Message::ControlBucketComplete { mask, hash },
        );
        self.publish_metrics();
    }

    /// Receiving side of migration finalisation: adopt the assigned role.
    fn on_finalise_migration(
        &mut self,
        link_id: u64,
        header: Header,
        mask: u64,
        hash: u64,
        new_role: u8,
    ) {
        if mask != self.table.mask().get() || hash > mask {
            warn!(
                theirs = format_args!("{:#x}", mask),
                "finalise under a mismatched mask"
            );
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        }
        let Some(role) = ReplicaRole::from_wire(new_role) else {
            warn!(new_role, "finalise with an invalid role");
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        };

        let source = self.nodes.find_by_link(link_id);
        let source_addr = source
            .and_then(|id| self.nodes.get(id))
            .map(|n| n.addr.clone());
        // for a primary handover, the existing backup is whoever the
        // hash-mask entry names; adopt it if we can see that node
        let existing_backup = self
            .table
            .entry(hash)
            .secondary
            .clone()
            .and_then(|addr| self.nodes.find_by_addr(&addr))
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .is_some_and(crate::node::Node::is_connected)
            });
        let me = self.cfg.advertised.clone();

        {
            let Some(replica) = self.table.replica_mut(hash) else {
                warn!(
                    bucket = format_args!("{:#x}", hash),
                    "finalise for a bucket not hosted here"
                );
                self.reply_to(link_id, &header, &Message::Unknown);
                return;
            };
            match role {
                ReplicaRole::Secondary => {
                    replica.role = ReplicaRole::Secondary;
                    replica.peer_source = source;
                    replica.peer_backup = None;
                    self.counters.secondary += 1;
                }
                ReplicaRole::Primary => {
                    replica.role = ReplicaRole::Primary;
                    replica.peer_source = None;
                    replica.peer_backup = existing_backup;
                    self.counters.primary += 1;
                    if replica.peer_backup.is_none() {
                        self.counters.unbacked += 1;
                    }
                }
                ReplicaRole::Uninitialized => unreachable!("filtered by from_wire"),
            }
        }

        let entry = self.table.entry_mut(hash);
        match role {
            ReplicaRole::Secondary => {
                entry.secondary = Some(me);
                if let Some(addr) = source_addr {
                    entry.primary = Some(addr);
                }
            }
            _ => entry.primary = Some(me),
        }

        if self.inbound_transfer == Some((hash, link_id)) {
            self.inbound_transfer = None;
        }
        info!(
            bucket = format_args!("{:#x}", hash),
            role = ?role,
            "bucket migration finalised"
        );
        self.broadcast_entry(hash);
        self.reply_to(link_id, &header, &Message::MigrationAck { mask, hash });
        self.publish_metrics();
    }

    /// Receiving side of a shutdown promotion: this backup takes over.
    fn on_promote(&mut self, link_id: u64, header: Header, hash: u64) {
        if hash > self.table.mask().get() {
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        }
        {
            let Some(replica) = self.table.replica_mut(hash) else {
                warn!(
                    bucket = format_args!("{:#x}", hash),
                    "promote for a bucket not hosted here"
                );
                self.reply_to(link_id, &header, &Message::Unknown);
                return;
            };
            if replica.role != ReplicaRole::Secondary {
                warn!(
                    bucket = format_args!("{:#x}", hash),
                    role = ?replica.role,
                    "promote requires the secondary replica"
                );
                self.reply_to(link_id, &header, &Message::Unknown);
                return;
            }
            // the old primary is going away entirely
            replica.role = ReplicaRole::Primary;
            replica.peer_source = None;
            replica.peer_backup = None;
            self.counters.primary += 1;
            self.counters.secondary -= 1;
            self.counters.unbacked += 1;
        }
        let me = self.cfg.advertised.clone();
        let entry = self.table.entry_mut(hash);
        entry.primary = Some(me);
        entry.secondary = None;
        info!(bucket = format_args!("{:#x}", hash), "promoted to primary");
        self.broadcast_entry(hash);
        self.reply_to(link_id, &header, &Message::Ack);
        self.publish_metrics();
    }

    fn on_hashmask_update(&mut self, mask: u64, hash: u64, primary: String, secondary: String) {
        let ours = self.table.mask().get();
        if mask > ours {
            match HashMask::new(mask) {
                Ok(m) => {
                    if let Err(e) = self.apply_split(m) {
                        error!(%e, "failed to apply pushed mask");
                        return;
                    }
                }
                Err(e) => {
                    warn!(%e, "bad mask in hashmask update");
                    return;
                }
            }
        } else if mask < ours {
            debug!(
                theirs = format_args!("{:#x}", mask),
                "stale hashmask update ignored"
            );
            return;
        }
        if hash > self.table.mask().get() {
            return;
        }
        let entry = self.table.entry_mut(hash);
        entry.primary = (!primary.is_empty()).then_some(primary);
        entry.secondary = (!secondary.is_empty()).then_some(secondary);
    }

    /// A replica we hold the other copy of has moved to a new node.
    fn on_bucket_relocated(
        &mut self,
        link_id: u64,
        header: Header,
        mask: u64,
        hash: u64,
        moved_role: u8,
        new_addr: String,
    ) {
        if mask != self.table.mask().get() || hash > mask {
            warn!(
                theirs = format_args!("{:#x}", mask),
                "relocation notice under a mismatched mask"
            );
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        }
        let Some(role) = ReplicaRole::from_wire(moved_role) else {
            self.reply_to(link_id, &header, &Message::Unknown);
            return;
        };

        let new_node = match self.nodes.find_by_addr(&new_addr) {
            Some(id) => id,
            None => {
                let id = self.nodes.add(new_addr.clone());
                if !self.shutting_down {
                    self.start_connect(id);
                }
                id
            }
        };

        if let Some(replica) = self.table.replica_mut(hash) {
            match role {
                ReplicaRole::Primary => {
                    if replica.role == ReplicaRole::Secondary {
                        replica.peer_source = Some(new_node);
                    }
                    self.table.entry_mut(hash).primary = Some(new_addr.clone());
                }
                ReplicaRole::Secondary => {
                    if replica.role == ReplicaRole::Primary {
                        replica.peer_backup = Some(new_node);
                    }
                    self.table.entry_mut(hash).secondary = Some(new_addr.clone());
                }
                ReplicaRole::Uninitialized => unreachable!("filtered by from_wire"),
            }
            info!(
                bucket = format_args!("{:#x}", hash),
                moved = ?role,
                to = %new_addr,
                "peer replica relocated"
            );
            self.broadcast_entry(hash);
        } else {
            debug!(
                bucket = format_args!("{:#x}", hash),
                "relocation notice for a bucket not hosted here"
            );
        }
        self.reply_to(link_id, &header, &Message::RelocatedAck { mask, hash });
    }

    // -------------------------------------------------------------- replies

    fn handle_reply(&mut self, link_id: u64, header: Header, msg: Message) {
        match msg {
            Message::Ack => self.on_ack(link_id, header),
            Message::Unknown => self.on_unknown(link_id, header),
            Message::ReplyLoadLevels {
                primary,
                backups,
                transferring,
            } => self.on_load_report(
                link_id,
                LoadReport {
                    primary,
                    backups,
                    transferring,
                },
            ),
            Message::AcceptingBucket { mask, hash } => {
                self.on_accepting_bucket(link_id, mask, hash)
            }
            Message::ControlBucketComplete { mask, hash } => {
                self.on_control_complete(link_id, mask, hash)
            }
            Message::SyncNameAck { hash } => self.on_sync_ack(link_id, hash),
            Message::SyncAck { hash, .. } => self.on_sync_ack(link_id, hash),
            Message::MigrationAck { mask, hash } => self.on_migration_ack(link_id, mask, hash),
            Message::RelocatedAck { mask, hash } => self.on_relocated_ack(link_id, mask, hash),
            Message::Value { .. } | Message::Stored { .. } | Message::Moved { .. } => {
                debug!("client-style reply ignored");
            }
            other => {
                warn!(
                    command = format_args!("{:#06x}", other.command()),
                    "unexpected reply"
                );
            }
        }
    }

    fn on_ack(&mut self, link_id: u64, header: Header) {
        match header.reply_cmd {
            command::SERVERHELLO => {
                if let Some(id) = self.nodes.find_by_link(link_id) {
                    let node = self.nodes.get_mut(id).expect("node just resolved");
                    node.last_seen = Some(Utc::now());
                    if !node.active_counted {
                        node.active_counted = true;
                        self.active_nodes += 1;
                    }
                    info!(active = self.active_nodes, "active cluster node connections");
                    self.publish_metrics();
                }
            }
            command::PROMOTE => self.on_promote_ack(link_id),
            _ => {}
        }
    }

    fn on_unknown(&mut self, link_id: u64, header: Header) {
        warn!(
            reply_cmd = format_args!("{:#06x}", header.reply_cmd),
            "peer did not recognise command"
        );
        match header.reply_cmd {
            // a declined or failed migration step cancels the transfer
            command::ACCEPT_BUCKET | command::CONTROL_BUCKET | command::FINALISE_MIGRATION => {
                self.abort_transfers_for_link(link_id);
            }
            // the third node could not process the notice; proceed anyway,
            // the broadcast hash-mask updates will reach it
            command::BUCKET_RELOCATED => self.finish_pending_relocation(),
            _ => {}
        }
    }

    // ------------------------------------------------------------- dispatch

    /// Read a value.  Errors carry the redirect address.
    pub fn get_value(&self, map: u64, key_hash: u64) -> ClusterResult<Option<Bytes>> {
        let index = self.table.mask().bucket_of(key_hash);
        let Some(replica) = self.table.replica(index) else {
            return Err(ClusterError::NotOwned {
                index,
                primary: self.table.entry(index).primary.clone(),
            });
        };
        if replica.role != ReplicaRole::Primary {
            return Err(ClusterError::NotPrimary {
                index,
                primary: self.table.entry(index).primary.clone(),
            });
        }
        Ok(replica.store.get(map, key_hash))
    }

    /// Store a value, replicating asynchronously to the backup when one
    /// exists.  The store takes ownership of `value`.
    pub fn store_value(
        &self,
        map: u64,
        key_hash: u64,
        value: Bytes,
        name_int: i64,
        expires: i32,
    ) -> ClusterResult<()> {
        let index = self.table.mask().bucket_of(key_hash);
        let Some(replica) = self.table.replica(index) else {
            return Err(ClusterError::NotOwned {
                index,
                primary: self.table.entry(index).primary.clone(),
            });
        };

        let backup_link = replica
            .peer_backup
            .and_then(|id| self.nodes.get(id))
            .and_then(|n| n.link);
        if let Some(link_id) = backup_link {
            self.send_to(
                link_id,
                &Message::Sync {
                    map,
                    hash: key_hash,
                    name_int,
                    expires,
                    value: value.clone(),
                },
            );
        }

        replica.store.set(map, key_hash, value, name_int, expires);
        Ok(())
    }

    /// Bind a string name; valid on either replica role (names are
    /// idempotent imports during migration).
    pub fn store_name_str(&self, key_hash: u64, name: String) -> ClusterResult<()> {
        let index = self.table.mask().bucket_of(key_hash);
        let Some(replica) = self.table.replica(index) else {
            return Err(ClusterError::NotOwned {
                index,
                primary: self.table.entry(index).primary.clone(),
            });
        };
        replica.store.set_name(key_hash, name);
        Ok(())
    }

    /// Bind an integer name; valid on either replica role.
    pub fn store_name_int(&self, key_hash: u64, name_int: i64) -> ClusterResult<()> {
        let index = self.table.mask().bucket_of(key_hash);
        let Some(replica) = self.table.replica(index) else {
            return Err(ClusterError::NotOwned {
                index,
                primary: self.table.entry(index).primary.clone(),
            });
        };
        replica.store.set_name_int(key_hash, name_int);
        Ok(())
    }

    /// Where the primary for `key_hash` lives.  `None` means this node
    /// (and the bucket is not on its way out).
    pub fn lookup_primary(&self, key_hash: u64) -> Option<String> {
        let index = self.table.mask().bucket_of(key_hash);
        match self.table.replica(index) {
            Some(replica) if replica.is_primary() && replica.transfer.is_none() => None,
            _ => self.table.entry(index).primary.clone(),
        }
    }

    // ---------------------------------------------------------------- state

    /// Grow the mask, rebuild the tables, and tell everyone.
    pub(crate) fn apply_split(&mut self, new_mask: HashMask) -> ClusterResult<()> {
        if self.transfer_active || self.inbound_transfer.is_some() {
            return Err(ClusterError::TransferConflict);
        }
        self.table.split_to(new_mask)?;
        self.counters = Counters::recount(&self.table);
        for index in self.table.hosted_indices() {
            self.broadcast_entry(index);
        }
        self.publish_metrics();
        Ok(())
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            mask: self.table.mask().get(),
            primary_buckets: self.counters.primary,
            secondary_buckets: self.counters.secondary,
            unbacked_buckets: self.counters.unbacked,
            transferring: self.transfer_active,
            migrate_sync: self.migrate_sync,
            active_nodes: self.active_nodes,
        }
    }

    /// Log a full dump of the bucket and hash-mask tables.
    pub fn dump(&self) {
        let stats = self.stats();
        info!(
            mask = format_args!("{:#x}", stats.mask),
            primary = stats.primary_buckets,
            secondary = stats.secondary_buckets,
            unbacked = stats.unbacked_buckets,
            transferring = stats.transferring,
            migrate_sync = stats.migrate_sync,
            active = stats.active_nodes,
            "bucket summary"
        );
        for replica in self.table.iter() {
            info!(
                bucket = format_args!("{:#x}", replica.index),
                role = ?replica.role,
                backup = ?replica.peer_backup,
                source = ?replica.peer_source,
                "replica"
            );
        }
        for index in 0..=self.table.mask().get() {
            let entry = self.table.entry(index);
            info!(
                bucket = format_args!("{:#x}", index),
                primary = entry.primary.as_deref().unwrap_or(""),
                secondary = entry.secondary.as_deref().unwrap_or(""),
                "hashmask"
            );
        }
    }

    pub(crate) fn publish_metrics(&self) {
        gauge!("shoal_primary_buckets").set(self.counters.primary as f64);
        gauge!("shoal_secondary_buckets").set(self.counters.secondary as f64);
        gauge!("shoal_unbacked_buckets").set(self.counters.unbacked as f64);
        gauge!("shoal_active_nodes").set(self.active_nodes as f64);
        gauge!("shoal_migrate_sync").set(self.migrate_sync as f64);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the controller-level tests: fake peers are plain
    //! channel-backed links, so every scenario runs without sockets.

    use super::*;
    use crate::node::NodeId;
    use shoal_proto::Frame;

    pub(crate) fn bootstrap_controller(
        advertised: &str,
    ) -> (Controller, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut cfg = ControllerConfig::default();
        cfg.advertised = advertised.to_string();
        let ctrl = Controller::new(cfg, tx).expect("controller");
        (ctrl, rx)
    }

    pub(crate) fn joining_controller(
        advertised: &str,
        peer: &str,
    ) -> (Controller, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut cfg = ControllerConfig::default();
        cfg.advertised = advertised.to_string();
        cfg.peers = vec![peer.to_string()];
        let ctrl = Controller::new(cfg, tx).expect("controller");
        (ctrl, rx)
    }

    pub(crate) fn request_header(command: u16) -> Header {
        Header {
            command,
            reply_cmd: 0,
            request_id: 1,
            payload_len: 0,
        }
    }

    pub(crate) fn reply_header(command: u16, reply_cmd: u16) -> Header {
        Header {
            command,
            reply_cmd,
            request_id: 1,
            payload_len: 0,
        }
    }

    /// Connect a fake peer: open a link and greet, exactly as the
    /// transport and a real peer would.
    pub(crate) fn attach_peer(
        ctrl: &mut Controller,
        addr: &str,
    ) -> (NodeId, PeerLink, mpsc::UnboundedReceiver<Frame>) {
        let (link, rx) = PeerLink::new();
        ctrl.handle_event(Event::LinkOpened { link: link.clone() });
        ctrl.handle_event(Event::Frame {
            link_id: link.id(),
            header: request_header(command::SERVERHELLO),
            msg: Message::ServerHello {
                addr: addr.to_string(),
                capabilities: 0,
            },
        });
        let id = ctrl.nodes.find_by_addr(addr).expect("peer registered");
        (id, link, rx)
    }

    /// Decode everything queued toward a fake peer.
    pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame.message().expect("well-formed frame"));
        }
        out
    }

    pub(crate) fn deliver_load_report(
        ctrl: &mut Controller,
        link: &PeerLink,
        primary: i32,
        backups: i32,
        transferring: i32,
    ) {
        ctrl.handle_event(Event::Frame {
            link_id: link.id(),
            header: reply_header(command::REPLY_LOADLEVELS, command::LOADLEVELS),
            msg: Message::ReplyLoadLevels {
                primary,
                backups,
                transferring,
            },
        });
    }

    pub(crate) fn accept_bucket(ctrl: &mut Controller, link: &PeerLink, mask: u64, hash: u64) {
        ctrl.handle_event(Event::Frame {
            link_id: link.id(),
            header: reply_header(command::REPLY_ACCEPTING_BUCKET, command::ACCEPT_BUCKET),
            msg: Message::AcceptingBucket { mask, hash },
        });
    }

    /// Give every primary a backup on `node`.
    pub(crate) fn back_all_buckets(ctrl: &mut Controller, node: NodeId, addr: &str) {
        for index in ctrl.table.hosted_indices() {
            let replica = ctrl.table.replica_mut(index).expect("index just listed");
            if replica.role == ReplicaRole::Primary {
                replica.peer_backup = Some(node);
                ctrl.table.entry_mut(index).secondary = Some(addr.to_string());
            }
        }
        ctrl.counters = Counters::recount(&ctrl.table);
    }
}
