//! Message buffers, zero-run compression, and group-communication transport
//! for federated simulations.
//!
//! The pieces here move one serialized event across a federate boundary:
//! the [buffer::Pool] recycles the receive/send buffers the group layer
//! demands, [compress] elides the zero runs that dominate simulated packet
//! headers, the [substrate::Substrate] trait is the seam to the group
//! communication runtime, and the [link::LinkForwarder] ties them together
//! for one remote link. [simulated] provides an in-process substrate for
//! tests, in the spirit of a simulated network: every federate lives in one
//! process and time advances only by explicit ticks.

pub mod buffer;
pub mod compress;
pub mod link;
pub mod simulated;
pub mod substrate;

pub use buffer::{BufferSource, MessageBuffer, Pool, SharedPool};
pub use link::{LinkConfig, LinkForwarder};
pub use substrate::{GroupId, Substrate, Tick};
