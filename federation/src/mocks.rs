//! Static in-memory registry for tests and examples.

use crate::registry::{EndpointRegistry, HandlerRef, NodeId, PortId};
use fedsim_core::{Addr, Port};
use std::collections::{HashMap, HashSet};

/// An [EndpointRegistry] backed by plain maps. Hosting and bindings are
/// declared up front; dynamic allocation hands out ports from a counter.
/// Instruments its slow-path calls so tests can assert the cache kept
/// them from happening.
pub struct StaticRegistry {
    hosts: HashMap<Addr, NodeId>,
    bound: HashSet<(NodeId, PortId)>,
    directory: HashMap<(Addr, Port), HandlerRef>,
    drop_target: HandlerRef,
    next_dynamic: PortId,
    lookups: u64,
    /// Peer-port announcements applied, in arrival order.
    pub peer_ports: Vec<(Addr, Port, Addr, Port)>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self {
            hosts: HashMap::new(),
            bound: HashSet::new(),
            directory: HashMap::new(),
            drop_target: HandlerRef { node: -1, port: -1 },
            next_dynamic: 49152,
            lookups: 0,
            peer_ports: Vec::new(),
        }
    }

    /// Declare `addr` hosted by `node` on this federate.
    pub fn host(mut self, addr: Addr, node: NodeId) -> Self {
        self.hosts.insert(addr, node);
        self
    }

    /// Declare a handler bound at `node:port`.
    pub fn bind(mut self, node: NodeId, port: PortId) -> Self {
        self.bound.insert((node, port));
        self
    }

    /// Make `addr:port` discoverable only through the full search, the way
    /// endpoints outside the fast host map are in a real directory.
    pub fn know(mut self, addr: Addr, port: Port, handler: HandlerRef) -> Self {
        self.directory.insert((addr, port), handler);
        self
    }

    /// Number of slow-path lookups performed so far.
    pub fn lookups(&self) -> u64 {
        self.lookups
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry for StaticRegistry {
    fn resolve_local(&self, addr: Addr) -> Option<NodeId> {
        self.hosts.get(&addr).copied()
    }

    fn find_bound_handler(&self, node: NodeId, port: Port) -> Option<HandlerRef> {
        self.bound
            .contains(&(node, port))
            .then_some(HandlerRef { node, port })
    }

    fn lookup(&mut self, addr: Addr, port: Port) -> Option<HandlerRef> {
        self.lookups += 1;
        if let Some(handler) = self.directory.get(&(addr, port)) {
            return Some(*handler);
        }
        let node = self.hosts.get(&addr).copied()?;
        self.bound
            .contains(&(node, port))
            .then_some(HandlerRef { node, port })
    }

    fn allocate_dynamic(
        &mut self,
        addr: Addr,
        _peer: Addr,
        _peer_port: Port,
    ) -> Option<HandlerRef> {
        let node = self.hosts.get(&addr).copied()?;
        let port = self.next_dynamic;
        self.next_dynamic += 1;
        self.bound.insert((node, port));
        Some(HandlerRef { node, port })
    }

    fn drop_target(&self) -> HandlerRef {
        self.drop_target
    }

    fn set_peer_port(&mut self, agent_addr: Addr, agent_port: Port, peer: Addr, peer_port: Port) {
        self.peer_ports
            .push((agent_addr, agent_port, peer, peer_port));
    }
}
