//! Conservative time synchronization for one federate.
//!
//! The coordinator owns the local scheduler, the links, and the router,
//! and drives them against the group substrate. There is no blocking
//! grant-wait: [Coordinator::step] performs one request/tick/dispatch
//! round and reports what it dispatched, so tests and drivers control
//! interleaving; [Coordinator::run] is the spin-wait composition.

use crate::registry::{EndpointRegistry, HandlerRef};
use crate::router::{Decision, DropReason, Router};
use crate::Error;
use fedsim_core::wire::{Envelope, OobMessage, Payload};
use fedsim_core::{EventPayload, LinkId, MapScheduler, RoutedPacket, SimTime};
use fedsim_transport::buffer::{shared_pool, BufferSource, MessageBuffer, SharedPool};
use fedsim_transport::link::{LinkConfig, LinkForwarder};
use fedsim_transport::substrate::{GroupId, Substrate};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// One federate's participation in a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Joining,
    Running,
    Draining,
    Terminated,
}

/// Coordinator configuration.
pub struct Config {
    /// Group carrying out-of-band control messages.
    pub oob_group: GroupId,
    /// Operator override for the lookahead. When unset, the lookahead is
    /// the minimum propagation delay over the local links.
    pub forced_lookahead: Option<f64>,
    /// Prometheus registry to register metrics in.
    pub registry: Arc<Mutex<Registry>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oob_group: 0,
            forced_lookahead: None,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

/// Something [Coordinator::step] dispatched.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    /// A packet due for a local endpoint; the caller hands it to the
    /// endpoint's protocol agent.
    Delivered {
        handler: HandlerRef,
        packet: RoutedPacket,
    },
    /// A packet sent over a link, stamped `timestamp`.
    Forwarded { link: LinkId, timestamp: SimTime },
    /// A relayed packet with no route and no default; logged and skipped.
    Dropped(RoutedPacket),
    /// A link finished transmitting and can take the next packet.
    LinkFree(LinkId),
    /// An opaque timer for an external protocol agent.
    Callback(u64),
}

pub struct Coordinator<S: Substrate, R: EndpointRegistry> {
    substrate: S,
    endpoints: R,
    router: Router,
    scheduler: MapScheduler,
    pool: SharedPool,
    links: Vec<LinkForwarder>,
    groups: HashMap<GroupId, LinkId>,
    oob_group: GroupId,
    forced_lookahead: Option<f64>,
    lookahead: f64,
    phase: Phase,
    clock: SimTime,
    granted: SimTime,
    halted: bool,
    dispatched: Counter,
    reflected: Counter,
    echoes: Counter,
}

impl<S: Substrate, R: EndpointRegistry> Coordinator<S, R> {
    pub fn new(substrate: S, endpoints: R, config: Config) -> Self {
        let router = Router::new();
        let pool = shared_pool();
        let dispatched = Counter::default();
        let reflected = Counter::default();
        let echoes = Counter::default();
        {
            let mut registry = config.registry.lock().unwrap();
            router.register(&mut registry);
            pool.lock().unwrap().register(&mut registry);
            registry.register("events_dispatched", "events dispatched", dispatched.clone());
            registry.register(
                "events_reflected",
                "remote events accepted",
                reflected.clone(),
            );
            registry.register(
                "echoes_dropped",
                "own broadcast echoes ignored",
                echoes.clone(),
            );
        }
        Self {
            substrate,
            endpoints,
            router,
            scheduler: MapScheduler::new(),
            pool,
            links: Vec::new(),
            groups: HashMap::new(),
            oob_group: config.oob_group,
            forced_lookahead: config.forced_lookahead,
            lookahead: 0.0,
            phase: Phase::Uninitialized,
            clock: SimTime::ZERO,
            granted: SimTime::ZERO,
            halted: false,
            dispatched,
            reflected,
            echoes,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn clock(&self) -> SimTime {
        self.clock
    }

    pub fn granted(&self) -> SimTime {
        self.granted
    }

    /// The announced lookahead. Zero until joined.
    pub fn lookahead(&self) -> f64 {
        self.lookahead
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn endpoints(&self) -> &R {
        &self.endpoints
    }

    #[cfg(test)]
    fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Register an outbound link before joining.
    pub fn add_link(&mut self, config: LinkConfig) -> Result<LinkId, Error> {
        self.expect_phase(Phase::Uninitialized)?;
        let id = LinkId(self.links.len() as u32);
        self.groups.insert(config.group, id);
        self.links.push(LinkForwarder::new(id, config));
        Ok(id)
    }

    /// Override the computed lookahead. Once the lookahead has been
    /// announced to the group it can never change.
    pub fn force_lookahead(&mut self, lookahead: f64) -> Result<(), Error> {
        if self.phase != Phase::Uninitialized {
            return Err(Error::LookaheadLocked);
        }
        self.forced_lookahead = Some(lookahead);
        Ok(())
    }

    /// Schedule a local event.
    pub fn schedule(&mut self, time: SimTime, payload: EventPayload) -> u64 {
        self.scheduler.schedule(time, payload)
    }

    /// Cancel a not-yet-dispatched local event.
    pub fn cancel(&mut self, id: u64) -> bool {
        self.scheduler.cancel(id).is_some()
    }

    /// Join the federation: create, publish, and subscribe the groups in
    /// three barrier-separated phases, then resolve and announce the
    /// lookahead.
    pub fn join(&mut self) -> Result<(), Error> {
        self.expect_phase(Phase::Uninitialized)?;
        self.phase = Phase::Joining;

        self.substrate.create_group(self.oob_group);
        for link in &self.links {
            self.substrate.create_group(link.group());
        }
        self.substrate.barrier();

        self.substrate.publish_group(self.oob_group);
        for link in &self.links {
            self.substrate.publish_group(link.group());
        }
        self.substrate.barrier();

        self.substrate.subscribe(self.oob_group, self.pool.clone());
        for link in &self.links {
            self.substrate.subscribe(link.group(), self.pool.clone());
        }
        self.substrate.barrier();

        let lookahead = match self.forced_lookahead {
            Some(forced) => forced,
            None => self
                .links
                .iter()
                .map(LinkForwarder::delay)
                .fold(f64::INFINITY, f64::min),
        };
        if !lookahead.is_finite() || lookahead <= 0.0 {
            return Err(Error::InvalidLookahead(lookahead));
        }
        self.lookahead = lookahead;
        self.substrate.set_lookahead(lookahead);
        self.phase = Phase::Running;
        info!(federate = %self.substrate.federate(), lookahead, "joined federation");
        Ok(())
    }

    /// Route a locally-originated packet at the current clock. A packet
    /// this federate produced with no route anywhere is fatal.
    pub fn send(&mut self, mut packet: RoutedPacket) -> Result<Option<Dispatch>, Error> {
        packet.origin = self.substrate.federate();
        self.route_packet(packet)
    }

    /// Drive one round of the conservative loop: request a time advance if
    /// the earliest local event is past the grant, poll the substrate
    /// once, absorb inbound messages, then dispatch every event the grant
    /// now covers, in timestamp order.
    pub fn step(&mut self) -> Result<Vec<Dispatch>, Error> {
        if !matches!(self.phase, Phase::Running | Phase::Draining) {
            return Err(Error::WrongPhase {
                expected: Phase::Running,
                actual: self.phase,
            });
        }

        // With an empty queue the request is for the end of time; the
        // grant is still bounded by the other federates.
        let target = self
            .scheduler
            .peek_earliest()
            .map(|event| event.time)
            .unwrap_or(SimTime::END_OF_TIME);
        if target > self.granted {
            self.substrate.request_time_advance(target);
        }

        let tick = self.substrate.tick();
        if let Some(granted) = tick.granted {
            self.granted = self.granted.max(granted);
        }
        for (group, buffer) in tick.inbound {
            self.handle_inbound(group, buffer)?;
        }

        // Re-peek after absorbing inbound: messages can enqueue events
        // earlier than the requested target.
        let mut dispatches = Vec::new();
        loop {
            let due = matches!(
                self.scheduler.peek_earliest(),
                Some(event) if event.time <= self.granted
            );
            if !due {
                break;
            }
            let Some(event) = self.scheduler.dequeue_earliest() else {
                break;
            };
            if event.time < self.clock {
                return Err(Error::ClockRegression {
                    clock: self.clock,
                    event: event.time,
                });
            }
            self.clock = event.time;
            self.dispatched.inc();
            match event.payload {
                EventPayload::Packet(packet) => {
                    if let Some(dispatch) = self.route_packet(packet)? {
                        dispatches.push(dispatch);
                    }
                }
                EventPayload::LinkFree(link) => dispatches.push(Dispatch::LinkFree(link)),
                EventPayload::Callback(tag) => dispatches.push(Dispatch::Callback(tag)),
            }
        }
        Ok(dispatches)
    }

    /// Spin [Coordinator::step] until the closure asks to halt (by
    /// returning `true` for some dispatch).
    pub fn run(&mut self, mut on_dispatch: impl FnMut(Dispatch) -> bool) -> Result<(), Error> {
        while !self.halted {
            for dispatch in self.step()? {
                if on_dispatch(dispatch) {
                    self.halted = true;
                }
            }
        }
        Ok(())
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Start the termination drain: from here on, every step requests the
    /// end of time.
    pub fn begin_drain(&mut self) -> Result<(), Error> {
        self.expect_phase(Phase::Running)?;
        self.phase = Phase::Draining;
        Ok(())
    }

    /// Whether every federate has agreed to the end of time.
    pub fn drained(&self) -> bool {
        self.granted >= SimTime::END_OF_TIME
    }

    /// Finish the drain: spin this federate's ticks until the terminal
    /// grant arrives, then pass the final barrier. With a cooperative
    /// in-process substrate, interleave [Coordinator::step] across
    /// federates until [Coordinator::drained] before calling this.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.expect_phase(Phase::Draining)?;
        while !self.drained() {
            self.step()?;
        }
        self.substrate.barrier();
        self.phase = Phase::Terminated;
        debug!(federate = %self.substrate.federate(), "terminated");
        Ok(())
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), Error> {
        if self.phase != expected {
            return Err(Error::WrongPhase {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    fn route_packet(&mut self, packet: RoutedPacket) -> Result<Option<Dispatch>, Error> {
        let outcome = self.router.route(&mut self.endpoints, &packet);
        if let Some(message) = outcome.notify {
            self.send_oob(message);
        }
        match outcome.decision {
            Decision::Delivered(handler) => Ok(Some(Dispatch::Delivered { handler, packet })),
            Decision::Forwarded(link) => {
                // Route entries are caller-supplied; the link id may not
                // name anything this coordinator registered.
                let forwarder = self
                    .links
                    .get(link.0 as usize)
                    .ok_or(Error::UnknownLink(link))?;
                let timestamp = forwarder.send(
                    &mut self.substrate,
                    &self.pool,
                    &mut self.scheduler,
                    self.clock,
                    self.lookahead,
                    packet,
                )?;
                Ok(Some(Dispatch::Forwarded { link, timestamp }))
            }
            Decision::Dropped(DropReason::NoRoute) => {
                if packet.origin == self.substrate.federate() {
                    Err(Error::NoRoute(packet.dst))
                } else {
                    Ok(Some(Dispatch::Dropped(packet)))
                }
            }
        }
    }

    fn handle_inbound(&mut self, group: GroupId, buffer: MessageBuffer) -> Result<(), Error> {
        let decoded = if group == self.oob_group {
            fedsim_transport::link::decode_envelope(buffer.as_slice(), false)
        } else {
            match self.groups.get(&group) {
                Some(link) => match self.links.get(link.0 as usize) {
                    Some(forwarder) => forwarder.decode(buffer.as_slice()),
                    None => {
                        self.pool.lock().unwrap().release(buffer);
                        return Err(Error::UnknownLink(*link));
                    }
                },
                None => {
                    warn!(group, "message on unknown group, ignoring");
                    self.pool.lock().unwrap().release(buffer);
                    return Ok(());
                }
            }
        };
        // Back on the free-list whether or not the decode succeeded.
        self.pool.lock().unwrap().release(buffer);
        let envelope = decoded?;

        // Broadcast groups echo a federate's own messages back; silence
        // is deliberate.
        if envelope.origin == self.substrate.federate() {
            self.echoes.inc();
            return Ok(());
        }

        match envelope.payload {
            Payload::Oob(OobMessage::SetPeerPort {
                agent_addr,
                agent_port,
                peer_addr,
                peer_port,
            }) => {
                trace!(%agent_addr, agent_port, %peer_addr, peer_port, "applying peer port");
                self.endpoints
                    .set_peer_port(agent_addr, agent_port, peer_addr, peer_port);
            }
            Payload::Packet(bytes) => {
                let packet = RoutedPacket::read(&mut &bytes[..])?;
                if envelope.timestamp < self.clock {
                    return Err(Error::ClockRegression {
                        clock: self.clock,
                        event: envelope.timestamp,
                    });
                }
                // Delivery of a message at t implies the group has granted
                // at least t.
                self.granted = self.granted.max(envelope.timestamp);
                self.reflected.inc();
                self.scheduler
                    .schedule(envelope.timestamp, EventPayload::Packet(packet));
            }
        }
        Ok(())
    }

    // send_oob broadcasts on the control group; control messages carry
    // the same conservative stamp as packets.
    fn send_oob(&mut self, message: OobMessage) {
        let envelope = Envelope {
            timestamp: self.clock.offset(self.lookahead),
            origin: self.substrate.federate(),
            payload: Payload::Oob(message),
        };
        let mut buffer = self.pool.lock().unwrap().acquire(envelope.encoded_len());
        envelope.write(buffer.as_mut_vec());
        self.substrate.publish(self.oob_group, buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::StaticRegistry;
    use crate::router::RouteEntry;
    use bytes::Bytes;
    use fedsim_core::{Addr, FederateId, PORT_ANY};
    use fedsim_transport::simulated::{Hub, SimulatedSubstrate};

    const GROUP_AB: GroupId = 1;

    fn setup_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn config() -> Config {
        Config {
            forced_lookahead: Some(0.01),
            ..Config::default()
        }
    }

    fn link_ab() -> LinkConfig {
        LinkConfig {
            group: GROUP_AB,
            bandwidth: f64::INFINITY,
            delay: 0.02,
            compress: false,
        }
    }

    fn packet_to(dst: Addr, dst_port: i32) -> RoutedPacket {
        RoutedPacket {
            src: Addr::from_octets(10, 0, 0, 1),
            src_port: 4000,
            dst,
            dst_port,
            origin: FederateId(0),
            payload: Bytes::from_static(b"data"),
        }
    }

    fn pair(
        hub: &mut Hub,
    ) -> (
        Coordinator<SimulatedSubstrate, StaticRegistry>,
        Coordinator<SimulatedSubstrate, StaticRegistry>,
    ) {
        let dst = Addr::from_octets(10, 0, 0, 2);
        let mut a = Coordinator::new(hub.join(), StaticRegistry::new(), config());
        let link = a.add_link(link_ab()).unwrap();
        a.router_mut().add_route(RouteEntry {
            target: dst,
            target_mask: 0xffff_ffff,
            source: Addr::UNSET,
            source_mask: 0,
            link,
        });

        let registry = StaticRegistry::new().host(dst, 1).bind(1, 5000);
        let mut b = Coordinator::new(hub.join(), registry, config());
        b.add_link(link_ab()).unwrap();
        (a, b)
    }

    #[test]
    fn test_end_to_end_delivery_at_lookahead_bound() {
        setup_logging();
        let mut hub = Hub::new();
        let (mut a, mut b) = pair(&mut hub);
        a.join().unwrap();
        b.join().unwrap();

        let dst = Addr::from_octets(10, 0, 0, 2);
        a.schedule(SimTime::ZERO, EventPayload::Packet(packet_to(dst, 5000)));

        // The forward is followed by the link-free event the send
        // scheduled; at infinite bandwidth it is due immediately.
        let sent = a.step().unwrap();
        assert_eq!(sent.len(), 2);
        let Dispatch::Forwarded { timestamp, .. } = &sent[0] else {
            panic!("expected forward, got {:?}", sent[0]);
        };
        // send 0.0 + transit 0.02 + lookahead 0.01
        assert_eq!(*timestamp, SimTime::from_secs(0.03));
        assert!(matches!(sent[1], Dispatch::LinkFree(_)));

        let received = b.step().unwrap();
        assert_eq!(received.len(), 1);
        let Dispatch::Delivered { handler, packet } = &received[0] else {
            panic!("expected delivery, got {:?}", received[0]);
        };
        assert_eq!(*handler, HandlerRef { node: 1, port: 5000 });
        assert_eq!(packet.payload, Bytes::from_static(b"data"));
        assert_eq!(b.clock(), SimTime::from_secs(0.03));
        assert!(b.clock() <= b.granted());
    }

    #[test]
    fn test_dispatch_in_timestamp_order() {
        let mut hub = Hub::new();
        let mut only = Coordinator::new(hub.join(), StaticRegistry::new(), config());
        only.join().unwrap();

        only.schedule(SimTime::from_secs(1.0), EventPayload::Callback(1));
        only.schedule(SimTime::from_secs(0.5), EventPayload::Callback(2));

        let first = only.step().unwrap();
        assert_eq!(first, vec![Dispatch::Callback(2)]);
        assert_eq!(only.clock(), SimTime::from_secs(0.5));

        let second = only.step().unwrap();
        assert_eq!(second, vec![Dispatch::Callback(1)]);
        assert_eq!(only.clock(), SimTime::from_secs(1.0));
        assert!(only.clock() <= only.granted());
    }

    #[test]
    fn test_clock_regression_is_fatal() {
        let mut hub = Hub::new();
        let mut only = Coordinator::new(hub.join(), StaticRegistry::new(), config());
        only.join().unwrap();

        only.schedule(SimTime::from_secs(1.0), EventPayload::Callback(1));
        only.step().unwrap();
        assert_eq!(only.clock(), SimTime::from_secs(1.0));

        only.schedule(SimTime::from_secs(0.5), EventPayload::Callback(2));
        assert!(matches!(
            only.step(),
            Err(Error::ClockRegression { .. })
        ));
    }

    #[test]
    fn test_lookahead_rules() {
        let mut hub = Hub::new();

        // Forced lookahead must be positive and finite.
        let mut bad = Coordinator::new(
            hub.join(),
            StaticRegistry::new(),
            Config {
                forced_lookahead: Some(-1.0),
                ..Config::default()
            },
        );
        assert!(matches!(bad.join(), Err(Error::InvalidLookahead(_))));

        // Unforced, the lookahead is the minimum link delay.
        let mut computed =
            Coordinator::new(hub.join(), StaticRegistry::new(), Config::default());
        computed
            .add_link(LinkConfig {
                group: 2,
                bandwidth: f64::INFINITY,
                delay: 0.05,
                compress: false,
            })
            .unwrap();
        computed
            .add_link(LinkConfig {
                group: 3,
                bandwidth: f64::INFINITY,
                delay: 0.02,
                compress: false,
            })
            .unwrap();
        computed.join().unwrap();
        assert_eq!(computed.lookahead(), 0.02);

        // Announced means locked.
        assert!(matches!(
            computed.force_lookahead(0.5),
            Err(Error::LookaheadLocked)
        ));
    }

    #[test]
    fn test_unroutable_local_packet_is_fatal() {
        let mut hub = Hub::new();
        let mut only = Coordinator::new(hub.join(), StaticRegistry::new(), config());
        only.join().unwrap();

        let stray = packet_to(Addr::from_octets(172, 16, 9, 9), 5000);
        assert!(matches!(only.send(stray), Err(Error::NoRoute(_))));
    }

    #[test]
    fn test_route_to_unregistered_link_is_an_error() {
        let mut hub = Hub::new();
        let mut only = Coordinator::new(hub.join(), StaticRegistry::new(), config());
        only.join().unwrap();

        // The entry names a link that was never added.
        only.router_mut().add_route(RouteEntry {
            target: Addr::from_octets(10, 9, 0, 0),
            target_mask: 0xffff_0000,
            source: Addr::UNSET,
            source_mask: 0,
            link: LinkId(7),
        });
        let stray = packet_to(Addr::from_octets(10, 9, 0, 1), 5000);
        assert!(matches!(
            only.send(stray),
            Err(Error::UnknownLink(LinkId(7)))
        ));
    }

    #[test]
    fn test_malformed_inbound_releases_buffer() {
        setup_logging();
        let mut hub = Hub::new();
        let mut a = Coordinator::new(hub.join(), StaticRegistry::new(), config());
        a.add_link(link_ab()).unwrap();
        let mut raw = hub.join();
        a.join().unwrap();

        let scratch = fedsim_transport::buffer::shared_pool();
        let mut garbage = scratch.lock().unwrap().acquire(3);
        garbage.as_mut_vec().extend_from_slice(&[1, 2, 3]);
        raw.publish(GROUP_AB, garbage);

        assert!(matches!(a.step(), Err(Error::Link(_))));
        // The receive buffer still went back on the free-list.
        assert_eq!(a.pool().lock().unwrap().free_len(), 1);
    }

    #[test]
    fn test_drain_agreement() {
        let mut hub = Hub::new();
        let (mut a, mut b) = pair(&mut hub);
        a.join().unwrap();
        b.join().unwrap();

        a.begin_drain().unwrap();
        b.begin_drain().unwrap();
        for _ in 0..10 {
            if a.drained() && b.drained() {
                break;
            }
            a.step().unwrap();
            b.step().unwrap();
        }
        assert!(a.drained() && b.drained());
        a.finish().unwrap();
        b.finish().unwrap();
        assert_eq!(a.phase(), Phase::Terminated);
        assert_eq!(b.phase(), Phase::Terminated);
    }

    #[test]
    fn test_self_echo_silently_dropped() {
        let mut hub = Hub::new();
        let (mut a, mut b) = pair(&mut hub);
        a.join().unwrap();
        b.join().unwrap();

        let dst = Addr::from_octets(10, 0, 0, 2);
        a.send(packet_to(dst, 5000)).unwrap();

        // The hub echoes the broadcast back to A; A must not schedule it.
        // Only the pending link-free event dispatches.
        let echoed = a.step().unwrap();
        assert_eq!(echoed, vec![Dispatch::LinkFree(LinkId(0))]);
        assert_eq!(a.clock(), SimTime::ZERO);

        let received = b.step().unwrap();
        assert!(matches!(received[0], Dispatch::Delivered { .. }));
    }

    #[test]
    fn test_wildcard_connect_announces_port() {
        let mut hub = Hub::new();
        let (mut a, mut b) = pair(&mut hub);
        a.join().unwrap();
        b.join().unwrap();

        let dst = Addr::from_octets(10, 0, 0, 2);
        a.send(packet_to(dst, PORT_ANY)).unwrap();

        // B resolves the wildcard, delivers, and broadcasts the chosen
        // port out of band.
        let received = b.step().unwrap();
        let Dispatch::Delivered { handler, .. } = &received[0] else {
            panic!("expected delivery, got {:?}", received[0]);
        };
        let handler = *handler;
        assert_eq!(handler.node, 1);
        assert!(handler.port >= 49152);

        // A applies the announcement to its registry.
        a.step().unwrap();
        assert_eq!(
            a.endpoints().peer_ports,
            vec![(Addr::from_octets(10, 0, 0, 1), 4000, dst, handler.port)]
        );
    }
}
