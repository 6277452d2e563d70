//! The endpoint directory the router resolves against.

use fedsim_core::{Addr, Port};

/// Identifies a simulated node hosted somewhere in the federation.
pub type NodeId = i32;

/// A port binding on a node. Distinct from the wire-level [Port] value: a
/// `PortId` always names a concrete binding.
pub type PortId = i32;

/// A locally-deliverable endpoint: the bound agent a packet is handed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerRef {
    pub node: NodeId,
    pub port: PortId,
}

/// Directory of simulated endpoints, maintained by the surrounding
/// simulation's configuration layer.
///
/// [EndpointRegistry::resolve_local] is the cheap map probe the router
/// tries first; [EndpointRegistry::lookup] is the expensive full search
/// behind the decision cache. Registrations happen before the run starts;
/// only dynamic port allocation mutates the directory afterwards.
pub trait EndpointRegistry {
    /// Node hosting `addr` on this federate, if any.
    fn resolve_local(&self, addr: Addr) -> Option<NodeId>;

    /// The handler bound to `port` on `node`, if one is.
    fn find_bound_handler(&self, node: NodeId, port: Port) -> Option<HandlerRef>;

    /// Full search for a handler serving `addr:port`. Slow; callers cache
    /// the result.
    fn lookup(&mut self, addr: Addr, port: Port) -> Option<HandlerRef>;

    /// Satisfy a wildcard (port `0`) connect to `addr` by binding a fresh
    /// port for the peer at `peer:peer_port`. Returns the new endpoint.
    fn allocate_dynamic(&mut self, addr: Addr, peer: Addr, peer_port: Port)
        -> Option<HandlerRef>;

    /// The catch-all observation endpoint traffic to unbound ports is
    /// redirected to instead of being discarded.
    fn drop_target(&self) -> HandlerRef;

    /// Point the agent bound at `agent_addr:agent_port` at
    /// `peer:peer_port`. Applied when a remote federate announces a
    /// dynamically allocated port out of band.
    fn set_peer_port(&mut self, agent_addr: Addr, agent_port: Port, peer: Addr, peer_port: Port);
}
