//! Simulation time, events, addressing, and wire formats for federated simulations.
//!
//! A federate is one participant process in a distributed discrete-event
//! simulation. Each federate runs its own scheduler and logical clock; the
//! types in this crate are the vocabulary shared by every federate: the
//! totally-ordered [SimTime], the [event::MapScheduler] that orders local
//! work, the [packet::RoutedPacket] that crosses federate boundaries, and
//! the [wire::Envelope] it travels in.

pub mod event;
pub mod net;
pub mod packet;
pub mod pending;
pub mod time;
pub mod wire;

pub use event::{Event, EventPayload, MapScheduler};
pub use net::{Addr, FederateId, LinkId, Mask, Port, PORT_ANY, PORT_UNSET};
pub use packet::RoutedPacket;
pub use time::SimTime;
