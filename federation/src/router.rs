//! Decides, for every packet, whether it is addressed to a locally-hosted
//! endpoint, and if not, which link carries it toward one that can.
//!
//! Resolution order: unset destinations stay local, then the endpoint
//! registry's fast host map, then the ordered route table, then the
//! decision cache in front of the registry's expensive full search, then
//! passthrough relay routes, then the default route. Tables are append-only
//! during a run; the cache is never invalidated: a binding that changes
//! under a cached entry serves stale results. That risk is documented
//! rather than papered over with an eviction policy nothing tunes.

use crate::registry::{EndpointRegistry, HandlerRef};
use fedsim_core::wire::OobMessage;
use fedsim_core::{Addr, LinkId, Mask, Port, RoutedPacket, PORT_ANY};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, warn};

/// One ordered route: a packet matches when its destination (and, for a
/// non-zero `source_mask`, its source) agree under the masks.
#[derive(Clone, Copy, Debug)]
pub struct RouteEntry {
    pub target: Addr,
    pub target_mask: Mask,
    pub source: Addr,
    pub source_mask: Mask,
    pub link: LinkId,
}

#[derive(Clone, Copy, Debug)]
struct PassthroughEntry {
    target: Addr,
    mask: Mask,
    source: Addr,
    source_mask: Mask,
    link: LinkId,
}

/// Why a packet was dropped rather than delivered or forwarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Nothing matched and no default route is configured. Fatal for
    /// locally-originated traffic; the caller escalates.
    NoRoute,
}

/// Where a packet goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Hand the packet to this local endpoint.
    Delivered(HandlerRef),
    /// Send the packet out this link.
    Forwarded(LinkId),
    Dropped(DropReason),
}

/// A routing decision plus any control message it produced (dynamic port
/// allocation announces the chosen port back to the originator).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Outcome {
    pub decision: Decision,
    pub notify: Option<OobMessage>,
}

impl Outcome {
    fn decided(decision: Decision) -> Self {
        Self {
            decision,
            notify: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Cached {
    Endpoint(HandlerRef),
    Relay(LinkId),
}

/// Coarsening netmask probes tried against the passthrough table before
/// the full scan.
const PROBE_MASKS: [Mask; 3] = [0xffff_ff00, 0xffff_0000, 0xff00_0000];

pub struct Router {
    routes: Vec<RouteEntry>,
    default_link: Option<LinkId>,
    // Relay routes keyed by masked target; several entries can share a key.
    passthrough: BTreeMap<u32, Vec<PassthroughEntry>>,
    cache: HashMap<(Addr, Port), Cached>,
    cache_hits: Counter,
    cache_misses: Counter,
    slow_lookups: Counter,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            default_link: None,
            passthrough: BTreeMap::new(),
            cache: HashMap::new(),
            cache_hits: Counter::default(),
            cache_misses: Counter::default(),
            slow_lookups: Counter::default(),
        }
    }

    /// Register this router's counters.
    pub fn register(&self, registry: &mut Registry) {
        registry.register("route_cache_hits", "decision cache hits", self.cache_hits.clone());
        registry.register(
            "route_cache_misses",
            "decision cache misses",
            self.cache_misses.clone(),
        );
        registry.register(
            "route_slow_lookups",
            "full registry searches performed",
            self.slow_lookups.clone(),
        );
    }

    /// Append a route. The first route added becomes the default.
    pub fn add_route(&mut self, entry: RouteEntry) {
        if self.default_link.is_none() {
            self.default_link = Some(entry.link);
        }
        self.routes.push(entry);
    }

    /// Replace the default route.
    pub fn set_default(&mut self, link: LinkId) {
        self.default_link = Some(link);
    }

    /// Add a relay route for destinations no federate hosts directly.
    pub fn add_passthrough(
        &mut self,
        target: Addr,
        mask: Mask,
        source: Addr,
        source_mask: Mask,
        link: LinkId,
    ) {
        self.passthrough
            .entry(target.masked(mask))
            .or_default()
            .push(PassthroughEntry {
                target,
                mask,
                source,
                source_mask,
                link,
            });
    }

    /// Remove the relay routes registered for exactly `target`/`mask`.
    pub fn remove_passthrough(&mut self, target: Addr, mask: Mask) {
        let key = target.masked(mask);
        if let Some(entries) = self.passthrough.get_mut(&key) {
            entries.retain(|e| e.mask != mask || e.target != target);
            if entries.is_empty() {
                self.passthrough.remove(&key);
            }
        }
    }

    /// Slow-path searches performed, for cache-coherence assertions.
    pub fn slow_lookups(&self) -> u64 {
        self.slow_lookups.get()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.get()
    }

    /// Resolve one packet.
    pub fn route(
        &mut self,
        registry: &mut impl EndpointRegistry,
        packet: &RoutedPacket,
    ) -> Outcome {
        let (src, dst) = (packet.src, packet.dst);

        // Administrative traffic carries no destination; it stays local on
        // the catch-all endpoint.
        if dst.is_unset() {
            return Outcome::decided(Decision::Delivered(registry.drop_target()));
        }

        let external = self.match_table(src, dst);
        let local = registry.resolve_local(dst);

        // A configured route overrides local hosting.
        if let Some(link) = external {
            return Outcome::decided(Decision::Forwarded(link));
        }
        if let Some(node) = local {
            if let Some(handler) = registry.find_bound_handler(node, packet.dst_port) {
                return Outcome::decided(Decision::Delivered(handler));
            }
        }

        // No concrete local endpoint from the fast path. The decision
        // cache fronts the expensive full search.
        match self.cache.get(&(dst, packet.dst_port)) {
            Some(Cached::Endpoint(handler)) => {
                self.cache_hits.inc();
                return Outcome::decided(Decision::Delivered(*handler));
            }
            Some(Cached::Relay(link)) => {
                self.cache_hits.inc();
                return Outcome::decided(Decision::Forwarded(*link));
            }
            None => {
                self.cache_misses.inc();
            }
        }

        self.slow_path(registry, packet, local)
    }

    fn slow_path(
        &mut self,
        registry: &mut impl EndpointRegistry,
        packet: &RoutedPacket,
        local: Option<crate::registry::NodeId>,
    ) -> Outcome {
        let (src, dst) = (packet.src, packet.dst);
        self.slow_lookups.inc();
        debug!(%dst, port = packet.dst_port, "cache miss, taking slow path");

        if let Some(handler) = registry.lookup(dst, packet.dst_port) {
            self.cache
                .insert((dst, packet.dst_port), Cached::Endpoint(handler));
            return Outcome::decided(Decision::Delivered(handler));
        }

        // Wildcard connect: bind a fresh port and tell the originator
        // which one was chosen.
        if packet.dst_port == PORT_ANY {
            if let Some(handler) = registry.allocate_dynamic(dst, src, packet.src_port) {
                debug!(%dst, port = handler.port, "dynamically allocated port");
                self.cache
                    .insert((dst, PORT_ANY), Cached::Endpoint(handler));
                return Outcome {
                    decision: Decision::Delivered(handler),
                    notify: Some(OobMessage::SetPeerPort {
                        agent_addr: src,
                        agent_port: packet.src_port,
                        peer_addr: dst,
                        peer_port: handler.port,
                    }),
                };
            }
        }

        // Hosted here but nothing answers the port: redirected, not
        // discarded, so unreachable-port traffic stays observable. Never
        // cached.
        if let Some(node) = local {
            warn!(%dst, port = packet.dst_port, node, "no handler bound, redirecting to drop target");
            return Outcome::decided(Decision::Delivered(registry.drop_target()));
        }

        if let Some(link) = self.match_passthrough(src, dst) {
            self.cache
                .insert((dst, packet.dst_port), Cached::Relay(link));
            return Outcome::decided(Decision::Forwarded(link));
        }

        if let Some(link) = self.default_link {
            warn!(%dst, ?link, "no route matched, using default route");
            return Outcome::decided(Decision::Forwarded(link));
        }

        error!(%dst, port = packet.dst_port, "no route and no default route");
        Outcome::decided(Decision::Dropped(DropReason::NoRoute))
    }

    /// Ordered first-match scan: entries with a source filter are
    /// considered before destination-only entries.
    fn match_table(&self, src: Addr, dst: Addr) -> Option<LinkId> {
        for entry in self.routes.iter().filter(|e| e.source_mask != 0) {
            if dst.masked(entry.target_mask) == entry.target.masked(entry.target_mask)
                && src.masked(entry.source_mask) == entry.source.masked(entry.source_mask)
            {
                return Some(entry.link);
            }
        }
        for entry in self.routes.iter().filter(|e| e.source_mask == 0) {
            if dst.masked(entry.target_mask) == entry.target.masked(entry.target_mask) {
                return Some(entry.link);
            }
        }
        None
    }

    /// Longest-to-shortest masked-key probes, then a full scan. Among
    /// candidates, a matching source filter beats insertion order.
    fn match_passthrough(&self, src: Addr, dst: Addr) -> Option<LinkId> {
        for mask in PROBE_MASKS {
            if let Some(candidates) = self.passthrough.get(&dst.masked(mask)) {
                if let Some(link) = pick(candidates.iter().filter(|e| e.mask == mask), src) {
                    return Some(link);
                }
            }
        }
        pick(
            self.passthrough
                .values()
                .flatten()
                .filter(|e| dst.masked(e.mask) == e.target.masked(e.mask)),
            src,
        )
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn pick<'a>(
    candidates: impl Iterator<Item = &'a PassthroughEntry>,
    src: Addr,
) -> Option<LinkId> {
    let mut first = None;
    for entry in candidates {
        if entry.source_mask != 0
            && src.masked(entry.source_mask) == entry.source.masked(entry.source_mask)
        {
            return Some(entry.link);
        }
        if first.is_none() {
            first = Some(entry.link);
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::StaticRegistry;
    use bytes::Bytes;
    use fedsim_core::FederateId;

    fn packet(src: Addr, dst: Addr, dst_port: Port) -> RoutedPacket {
        RoutedPacket {
            src,
            src_port: 4000,
            dst,
            dst_port,
            origin: FederateId(0),
            payload: Bytes::new(),
        }
    }

    fn dest_route(target: Addr, target_mask: Mask, link: LinkId) -> RouteEntry {
        RouteEntry {
            target,
            target_mask,
            source: Addr::UNSET,
            source_mask: 0,
            link,
        }
    }

    #[test]
    fn test_local_delivery() {
        let mut registry = StaticRegistry::new()
            .host(Addr::from_octets(10, 0, 0, 2), 3)
            .bind(3, 5000);
        let mut router = Router::new();
        let outcome = router.route(
            &mut registry,
            &packet(Addr::from_octets(10, 0, 0, 1), Addr::from_octets(10, 0, 0, 2), 5000),
        );
        assert_eq!(
            outcome.decision,
            Decision::Delivered(HandlerRef { node: 3, port: 5000 })
        );
    }

    #[test]
    fn test_unbound_port_redirects_to_drop_target() {
        let mut registry = StaticRegistry::new().host(Addr::from_octets(10, 0, 0, 2), 3);
        let mut router = Router::new();
        let outcome = router.route(
            &mut registry,
            &packet(Addr::from_octets(10, 0, 0, 1), Addr::from_octets(10, 0, 0, 2), 9999),
        );
        assert_eq!(
            outcome.decision,
            Decision::Delivered(registry.drop_target())
        );
    }

    #[test]
    fn test_route_determinism() {
        let mut registry = StaticRegistry::new();
        let mut router = Router::new();
        router.add_route(dest_route(Addr::from_octets(10, 0, 1, 0), 0xffff_ff00, LinkId(1)));
        router.add_route(dest_route(Addr::from_octets(10, 0, 0, 0), 0xff00_0000, LinkId(2)));

        let p = packet(
            Addr::from_octets(10, 0, 0, 1),
            Addr::from_octets(10, 0, 1, 7),
            5000,
        );
        let first = router.route(&mut registry, &p).decision;
        assert_eq!(first, Decision::Forwarded(LinkId(1)));
        for _ in 0..10 {
            assert_eq!(router.route(&mut registry, &p).decision, first);
        }
    }

    #[test]
    fn test_source_filtered_routes_scanned_first() {
        let mut registry = StaticRegistry::new();
        let mut router = Router::new();
        // Inserted later, but its source filter puts it in the first pass.
        router.add_route(dest_route(Addr::from_octets(10, 0, 1, 0), 0xffff_ff00, LinkId(1)));
        router.add_route(RouteEntry {
            target: Addr::from_octets(10, 0, 1, 0),
            target_mask: 0xffff_ff00,
            source: Addr::from_octets(192, 168, 0, 0),
            source_mask: 0xffff_0000,
            link: LinkId(2),
        });

        let from_filtered = packet(
            Addr::from_octets(192, 168, 3, 4),
            Addr::from_octets(10, 0, 1, 7),
            5000,
        );
        assert_eq!(
            router.route(&mut registry, &from_filtered).decision,
            Decision::Forwarded(LinkId(2))
        );

        let from_elsewhere = packet(
            Addr::from_octets(172, 16, 0, 1),
            Addr::from_octets(10, 0, 1, 7),
            5000,
        );
        assert_eq!(
            router.route(&mut registry, &from_elsewhere).decision,
            Decision::Forwarded(LinkId(1))
        );
    }

    #[test]
    fn test_passthrough_longest_mask_wins_with_removal_fallback() {
        let mut registry = StaticRegistry::new();
        let mut router = Router::new();
        let net = Addr::from_octets(10, 0, 0, 0);
        router.add_passthrough(net, 0xffff_ff00, Addr::UNSET, 0, LinkId(24));
        router.add_passthrough(net, 0xffff_0000, Addr::UNSET, 0, LinkId(16));
        router.add_passthrough(net, 0xff00_0000, Addr::UNSET, 0, LinkId(8));

        let src = Addr::from_octets(192, 168, 0, 1);
        let dst = Addr::from_octets(10, 0, 0, 5);
        let p = packet(src, dst, 5000);
        assert_eq!(router.route(&mut registry, &p).decision, Decision::Forwarded(LinkId(24)));

        router.remove_passthrough(net, 0xffff_ff00);
        // The stale cache entry still answers; probe with a fresh port to
        // reach the table again.
        let p = packet(src, dst, 5001);
        assert_eq!(router.route(&mut registry, &p).decision, Decision::Forwarded(LinkId(16)));

        router.remove_passthrough(net, 0xffff_0000);
        let p = packet(src, dst, 5002);
        assert_eq!(router.route(&mut registry, &p).decision, Decision::Forwarded(LinkId(8)));
    }

    #[test]
    fn test_passthrough_source_filter_beats_first_entry() {
        let mut registry = StaticRegistry::new();
        let mut router = Router::new();
        let net = Addr::from_octets(10, 0, 0, 0);
        router.add_passthrough(net, 0xffff_ff00, Addr::UNSET, 0, LinkId(1));
        router.add_passthrough(
            net,
            0xffff_ff00,
            Addr::from_octets(192, 168, 0, 0),
            0xffff_0000,
            LinkId(2),
        );

        let filtered = packet(
            Addr::from_octets(192, 168, 1, 1),
            Addr::from_octets(10, 0, 0, 5),
            5000,
        );
        assert_eq!(router.route(&mut registry, &filtered).decision, Decision::Forwarded(LinkId(2)));

        let other = packet(
            Addr::from_octets(172, 16, 0, 1),
            Addr::from_octets(10, 0, 0, 6),
            5000,
        );
        assert_eq!(router.route(&mut registry, &other).decision, Decision::Forwarded(LinkId(1)));
    }

    #[test]
    fn test_cache_skips_slow_path() {
        let dst = Addr::from_octets(10, 2, 0, 9);
        let handler = HandlerRef { node: 12, port: 7000 };
        let mut registry = StaticRegistry::new().know(dst, 7000, handler);
        let mut router = Router::new();

        let p = packet(Addr::from_octets(10, 0, 0, 1), dst, 7000);
        assert_eq!(router.route(&mut registry, &p).decision, Decision::Delivered(handler));
        assert_eq!(registry.lookups(), 1);
        assert_eq!(router.slow_lookups(), 1);

        assert_eq!(router.route(&mut registry, &p).decision, Decision::Delivered(handler));
        assert_eq!(registry.lookups(), 1);
        assert_eq!(router.slow_lookups(), 1);
        assert_eq!(router.cache_hits(), 1);
    }

    #[test]
    fn test_wildcard_port_allocates_and_notifies() {
        let dst = Addr::from_octets(10, 3, 0, 1);
        let src = Addr::from_octets(10, 0, 0, 1);
        let mut registry = StaticRegistry::new().host(dst, 4);
        let mut router = Router::new();

        let outcome = router.route(&mut registry, &packet(src, dst, PORT_ANY));
        let Decision::Delivered(handler) = outcome.decision else {
            panic!("expected delivery, got {:?}", outcome.decision);
        };
        assert_eq!(handler.node, 4);
        assert_eq!(
            outcome.notify,
            Some(OobMessage::SetPeerPort {
                agent_addr: src,
                agent_port: 4000,
                peer_addr: dst,
                peer_port: handler.port,
            })
        );

        // The allocation is cached: a second wildcard connect reuses it
        // without allocating again.
        let again = router.route(&mut registry, &packet(src, dst, PORT_ANY));
        assert_eq!(again.decision, Decision::Delivered(handler));
        assert_eq!(again.notify, None);
        assert_eq!(router.slow_lookups(), 1);
    }

    #[test]
    fn test_default_route_fallback_and_fatal_drop() {
        let mut registry = StaticRegistry::new();
        let mut router = Router::new();
        let p = packet(
            Addr::from_octets(10, 0, 0, 1),
            Addr::from_octets(172, 16, 9, 9),
            5000,
        );
        assert_eq!(
            router.route(&mut registry, &p).decision,
            Decision::Dropped(DropReason::NoRoute)
        );

        // The first route added doubles as the default.
        router.add_route(dest_route(Addr::from_octets(10, 0, 1, 0), 0xffff_ff00, LinkId(9)));
        assert_eq!(
            router.route(&mut registry, &p).decision,
            Decision::Forwarded(LinkId(9))
        );
    }
}
