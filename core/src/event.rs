//! Timestamped units of simulation work and the map-backed local scheduler.

use crate::net::LinkId;
use crate::packet::RoutedPacket;
use crate::time::SimTime;
use std::collections::{BTreeMap, HashMap};

/// What happens when an event becomes due.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    /// A packet to run through the event router when the event fires.
    Packet(RoutedPacket),
    /// The named remote link has finished transmitting and may accept the
    /// next packet (link-bandwidth modeling).
    LinkFree(LinkId),
    /// Opaque tag dispatched back to the external protocol layer
    /// (timers, application callbacks).
    Callback(u64),
}

/// A timestamped unit of simulation work.
///
/// Owned by the scheduler until dispatched; the `id` is unique and
/// monotonically assigned, and is the key used for cancellation.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub time: SimTime,
    pub id: u64,
    pub payload: EventPayload,
}

/// Map-backed event queue.
///
/// Events order by `(time, id)`, so same-time events dispatch in insertion
/// order. A secondary id index supports cancellation of any event that has
/// not yet been dequeued.
#[derive(Debug, Default)]
pub struct MapScheduler {
    queue: BTreeMap<(SimTime, u64), Event>,
    index: HashMap<u64, SimTime>,
    next_id: u64,
}

impl MapScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue work at `time`, returning the assigned event id.
    pub fn schedule(&mut self, time: SimTime, payload: EventPayload) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.insert((time, id), Event { time, id, payload });
        self.index.insert(id, time);
        id
    }

    /// The earliest queued event, if any.
    pub fn peek_earliest(&self) -> Option<&Event> {
        self.queue.values().next()
    }

    /// Remove and return the earliest queued event.
    pub fn dequeue_earliest(&mut self) -> Option<Event> {
        let key = *self.queue.keys().next()?;
        let event = self.queue.remove(&key);
        if let Some(event) = &event {
            self.index.remove(&event.id);
        }
        event
    }

    /// Cancel a pending event by id. Returns the event if it was still
    /// queued; already-dispatched ids return `None`.
    pub fn cancel(&mut self, id: u64) -> Option<Event> {
        let time = self.index.remove(&id)?;
        self.queue.remove(&(time, id))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
