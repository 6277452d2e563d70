//! In-process group-communication substrate.
//!
//! Every federate shares one [Hub]; messages and grants move only when a
//! federate ticks its handle, so tests can interleave federates
//! deterministically from a single thread. Grants are conservative:
//! a federate asking for `t` receives at most
//! `min(t, min over other federates of (their horizon + their lookahead))`,
//! where a federate's horizon is its pending request (a promise that it has
//! no earlier local work) or its last granted time.

use crate::buffer::{BufferSource, MessageBuffer, SharedPool};
use crate::substrate::{GroupId, Substrate, Tick};
use fedsim_core::{FederateId, SimTime};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

#[derive(Default)]
struct FederateState {
    lookahead: f64,
    request: Option<SimTime>,
    granted: SimTime,
    subscriptions: HashSet<GroupId>,
    mailbox: VecDeque<(GroupId, Vec<u8>)>,
    pool: Option<SharedPool>,
    barriers: u64,
}

impl FederateState {
    /// Earliest time this federate could still inject a message at,
    /// before its lookahead is added.
    fn horizon(&self) -> SimTime {
        self.request.unwrap_or(self.granted).max(self.granted)
    }
}

#[derive(Default)]
struct State {
    federates: BTreeMap<u32, FederateState>,
    sent: Counter,
    delivered: Counter,
}

impl State {
    /// Largest time `federate` may be granted, bounded by every other
    /// federate's horizon plus its announced lookahead. `None` when no
    /// other federate constrains it.
    fn bound(&self, federate: u32) -> Option<SimTime> {
        self.federates
            .iter()
            .filter(|(id, _)| **id != federate)
            .map(|(_, other)| other.horizon().offset(other.lookahead))
            .min()
    }
}

/// The shared side of the simulated substrate. Register one handle per
/// federate before starting any of them.
#[derive(Default)]
pub struct Hub {
    state: Arc<Mutex<State>>,
    next: u32,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register this hub's counters.
    pub fn register(&self, registry: &mut Registry) {
        let state = self.state.lock().unwrap();
        registry.register("messages_sent", "messages published", state.sent.clone());
        registry.register(
            "messages_delivered",
            "messages placed in a mailbox",
            state.delivered.clone(),
        );
    }

    /// Add a federate, returning its substrate handle.
    pub fn join(&mut self) -> SimulatedSubstrate {
        let id = self.next;
        self.next += 1;
        self.state
            .lock()
            .unwrap()
            .federates
            .insert(id, FederateState::default());
        SimulatedSubstrate {
            id: FederateId(id),
            state: self.state.clone(),
        }
    }
}

/// One federate's handle onto the [Hub].
pub struct SimulatedSubstrate {
    id: FederateId,
    state: Arc<Mutex<State>>,
}

impl Substrate for SimulatedSubstrate {
    fn federate(&self) -> FederateId {
        self.id
    }

    fn create_group(&mut self, group: GroupId) {
        trace!(federate = %self.id, group, "create group");
    }

    fn publish_group(&mut self, group: GroupId) {
        trace!(federate = %self.id, group, "publish group");
    }

    fn subscribe(&mut self, group: GroupId, buffers: SharedPool) {
        let mut state = self.state.lock().unwrap();
        let federate = state
            .federates
            .get_mut(&self.id.0)
            .expect("federate not registered");
        federate.subscriptions.insert(group);
        federate.pool = Some(buffers);
    }

    fn barrier(&mut self) {
        let mut state = self.state.lock().unwrap();
        let federate = state
            .federates
            .get_mut(&self.id.0)
            .expect("federate not registered");
        federate.barriers += 1;
        trace!(federate = %self.id, generation = federate.barriers, "barrier");
    }

    fn set_lookahead(&mut self, lookahead: f64) {
        let mut state = self.state.lock().unwrap();
        state
            .federates
            .get_mut(&self.id.0)
            .expect("federate not registered")
            .lookahead = lookahead;
    }

    fn request_time_advance(&mut self, time: SimTime) {
        let mut state = self.state.lock().unwrap();
        state
            .federates
            .get_mut(&self.id.0)
            .expect("federate not registered")
            .request = Some(time);
        trace!(federate = %self.id, %time, "time advance requested");
    }

    fn publish(&mut self, group: GroupId, buffer: MessageBuffer) {
        let mut state = self.state.lock().unwrap();
        state.sent.inc();
        let bytes = buffer.as_slice().to_vec();
        let mut delivered = 0u64;
        // Broadcast: every subscriber sees the message, the sender
        // included (receivers drop their own echo by origin tag).
        for federate in state.federates.values_mut() {
            if federate.subscriptions.contains(&group) {
                federate.mailbox.push_back((group, bytes.clone()));
                delivered += 1;
            }
        }
        state.delivered.inc_by(delivered);
        if delivered == 0 {
            debug!(federate = %self.id, group, "dropping message: no subscribers");
        }
        // Recycle the send buffer through the publisher's own pool.
        let pool = state
            .federates
            .get(&self.id.0)
            .and_then(|f| f.pool.clone());
        drop(state);
        if let Some(pool) = pool {
            pool.lock().unwrap().release(buffer);
        }
    }

    fn tick(&mut self) -> Tick {
        let mut tick = Tick::default();

        // Deliver mailbox contents first so a grant never outruns a
        // message already in flight toward this federate.
        let (messages, pool) = {
            let mut state = self.state.lock().unwrap();
            let federate = state
                .federates
                .get_mut(&self.id.0)
                .expect("federate not registered");
            let messages: Vec<_> = federate.mailbox.drain(..).collect();
            (messages, federate.pool.clone())
        };
        if let Some(pool) = pool {
            let mut pool = pool.lock().unwrap();
            for (group, message) in messages {
                let mut buffer = pool.acquire(message.len());
                buffer.as_mut_vec().extend_from_slice(&message);
                tick.inbound.push((group, buffer));
            }
        } else if !messages.is_empty() {
            debug!(federate = %self.id, "dropping inbound: no buffer pool");
        }

        let mut state = self.state.lock().unwrap();
        if let Some(request) = state
            .federates
            .get(&self.id.0)
            .expect("federate not registered")
            .request
        {
            let grant = match state.bound(self.id.0) {
                Some(bound) => request.min(bound),
                None => request,
            };
            let federate = state
                .federates
                .get_mut(&self.id.0)
                .expect("federate not registered");
            if grant > federate.granted {
                federate.granted = grant;
                if grant >= request {
                    federate.request = None;
                }
                trace!(federate = %self.id, %grant, "time advance granted");
                tick.granted = Some(grant);
            }
        }
        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::shared_pool;

    #[test]
    fn test_grant_bounded_by_lookahead() {
        let mut hub = Hub::new();
        let mut a = hub.join();
        let mut b = hub.join();
        a.set_lookahead(0.01);
        b.set_lookahead(0.05);

        // A wants 1.0 but B has promised nothing past 0.0: A is granted
        // only up to B's horizon plus B's lookahead.
        a.request_time_advance(SimTime::from_secs(1.0));
        let tick = a.tick();
        assert_eq!(tick.granted, Some(SimTime::from_secs(0.05)));

        // Once B asks for a time of its own, its horizon moves and A can
        // be granted in full.
        b.request_time_advance(SimTime::from_secs(2.0));
        a.request_time_advance(SimTime::from_secs(1.0));
        let tick = a.tick();
        assert_eq!(tick.granted, Some(SimTime::from_secs(1.0)));

        let tick = b.tick();
        assert_eq!(tick.granted, Some(SimTime::from_secs(1.01)));
    }

    #[test]
    fn test_single_federate_granted_in_full() {
        let mut hub = Hub::new();
        let mut only = hub.join();
        only.set_lookahead(0.01);
        only.request_time_advance(SimTime::END_OF_TIME);
        assert_eq!(only.tick().granted, Some(SimTime::END_OF_TIME));
    }

    #[test]
    fn test_broadcast_includes_sender() {
        let mut hub = Hub::new();
        let mut a = hub.join();
        let mut b = hub.join();
        let pool_a = shared_pool();
        let pool_b = shared_pool();
        a.subscribe(7, pool_a.clone());
        b.subscribe(7, pool_b);

        let mut buffer = pool_a.lock().unwrap().acquire(4);
        buffer.as_mut_vec().extend_from_slice(&[1, 2, 3]);
        a.publish(7, buffer);

        let got = b.tick().inbound;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 7);
        assert_eq!(got[0].1.as_slice(), &[1, 2, 3]);

        // The sender subscribes to its own broadcast group too.
        let echo = a.tick().inbound;
        assert_eq!(echo.len(), 1);
        assert_eq!(echo[0].1.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_no_grant_without_progress() {
        let mut hub = Hub::new();
        let mut a = hub.join();
        let mut b = hub.join();
        a.set_lookahead(0.01);
        b.set_lookahead(0.01);

        a.request_time_advance(SimTime::from_secs(5.0));
        assert_eq!(a.tick().granted, Some(SimTime::from_secs(0.01)));
        // Nothing moved: re-ticking yields no new grant.
        assert_eq!(a.tick().granted, None);
        let _ = b;
    }
}
