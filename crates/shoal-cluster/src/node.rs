//! Node registry and per-peer connection state
//!
//! Each known peer cycles through `Disconnected → Connecting → Active →
//! Waiting → Connecting …`.  While Active, a periodic timer probes the
//! peer's load levels, which is what drives the rebalance loop.

use chrono::{DateTime, Utc};

use crate::timer::TimerHandle;

/// Stable handle to a registry slot.  Handles are validated on lookup;
/// a freed slot simply resolves to `None`.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Active,
    Waiting,
}

/// One known peer.
#[derive(Debug)]
pub struct Node {
    /// host:port the peer listens on.
    pub addr: String,
    pub state: ConnState,
    /// Link id of the established connection, if any.
    pub link: Option<u64>,
    pub connect_attempts: u32,
    /// Whether this peer is counted in `active_nodes` (greeting completed).
    pub active_counted: bool,
    pub shutting_down: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub wait_timer: Option<TimerHandle>,
    pub loadlevel_timer: Option<TimerHandle>,
    pub shutdown_timer: Option<TimerHandle>,
}

impl Node {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            state: ConnState::Disconnected,
            link: None,
            connect_attempts: 0,
            active_counted: false,
            shutting_down: false,
            last_seen: None,
            wait_timer: None,
            loadlevel_timer: None,
            shutdown_timer: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

/// The set of known peers.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    slots: Vec<Option<Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer, reusing a freed slot when one exists.
    pub fn add(&mut self, addr: String) -> NodeId {
        let node = Node::new(addr);
        if let Some(id) = self.slots.iter().position(Option::is_none) {
            self.slots[id] = Some(node);
            id
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id)?.as_mut()
    }

    pub fn find_by_addr(&self, addr: &str) -> Option<NodeId> {
        self.iter().find(|(_, n)| n.addr == addr).map(|(id, _)| id)
    }

    pub fn find_by_link(&self, link_id: u64) -> Option<NodeId> {
        self.iter()
            .find(|(_, n)| n.link == Some(link_id))
            .map(|(id, _)| id)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.slots.get_mut(id)?.take()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|n| (id, n)))
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// First peer with an established connection, if any.
    pub fn first_connected(&self) -> Option<(NodeId, u64)> {
        self.iter()
            .find_map(|(id, n)| n.link.map(|link| (id, link)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_find() {
        let mut reg = NodeRegistry::new();
        let a = reg.add("10.0.0.1:13600".to_string());
        let b = reg.add("10.0.0.2:13600".to_string());
        assert_ne!(a, b);
        assert_eq!(reg.find_by_addr("10.0.0.2:13600"), Some(b));
        assert_eq!(reg.find_by_addr("10.0.0.9:13600"), None);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_remove_reuses_slot() {
        let mut reg = NodeRegistry::new();
        let a = reg.add("a:1".to_string());
        let _b = reg.add("b:1".to_string());
        reg.remove(a);
        assert!(reg.get(a).is_none());
        let c = reg.add("c:1".to_string());
        assert_eq!(c, a);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_find_by_link() {
        let mut reg = NodeRegistry::new();
        let a = reg.add("a:1".to_string());
        reg.get_mut(a).unwrap().link = Some(42);
        assert_eq!(reg.find_by_link(42), Some(a));
        assert_eq!(reg.find_by_link(43), None);
        assert_eq!(reg.first_connected(), Some((a, 42)));
    }
}
