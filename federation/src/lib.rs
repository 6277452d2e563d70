//! Event routing and conservative time synchronization for one federate.
//!
//! A [coordinator::Coordinator] owns a federate's local scheduler, its
//! links, and its [router::Router], and drives them against a group
//! substrate: it requests time advances, dispatches locally-due events in
//! timestamp order, and relays off-federate packets over their links. The
//! [registry::EndpointRegistry] trait is the seam to the surrounding
//! simulation's endpoint directory; [mocks] provides a static in-memory
//! implementation for tests.

use fedsim_core::{wire, Addr, LinkId, SimTime};
use thiserror::Error;

pub mod coordinator;
pub mod mocks;
pub mod registry;
pub mod router;

pub use coordinator::{Config, Coordinator, Dispatch, Phase};
pub use registry::{EndpointRegistry, HandlerRef, NodeId, PortId};
pub use router::{Decision, DropReason, Outcome, RouteEntry, Router};

/// Conditions a federate cannot continue past. Anything recoverable is
/// logged and folded into a [Dispatch] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// An event would have been dispatched behind the clock. Processing it
    /// would break timestamp order, which conservative synchronization can
    /// never repair.
    #[error("clock regression: event at {event} behind clock {clock}")]
    ClockRegression { clock: SimTime, event: SimTime },
    /// A locally-originated packet matched no route and no default route
    /// exists.
    #[error("no route to {0} and no default route")]
    NoRoute(Addr),
    /// A route or passthrough entry names a link that was never
    /// registered with [Coordinator::add_link].
    #[error("route names unregistered link {0:?}")]
    UnknownLink(LinkId),
    /// The lookahead cannot be changed once it has been announced.
    #[error("lookahead is locked after initialization")]
    LookaheadLocked,
    /// A lookahead must be a finite, strictly positive number of seconds.
    #[error("invalid lookahead: {0}")]
    InvalidLookahead(f64),
    /// An operation was invoked in a lifecycle phase that does not permit
    /// it.
    #[error("operation requires phase {expected:?}, coordinator is {actual:?}")]
    WrongPhase { expected: Phase, actual: Phase },
    #[error("link: {0}")]
    Link(#[from] fedsim_transport::link::Error),
    #[error("malformed inbound message: {0}")]
    Wire(#[from] wire::Error),
}
