//! The seam to the group-communication runtime.

use crate::buffer::{MessageBuffer, SharedPool};
use fedsim_core::{FederateId, SimTime};

/// Identifies one broadcast group (one per remote link, plus the
/// out-of-band control group).
pub type GroupId = u32;

/// What one poll of the communication substrate produced.
#[derive(Debug, Default)]
pub struct Tick {
    /// The most recent time-advance grant, if one arrived.
    pub granted: Option<SimTime>,
    /// Received messages, tagged with the group they arrived on, each in a
    /// buffer drawn from the pool handed to [Substrate::subscribe]. The
    /// caller owns the buffers and returns them to the pool after decoding.
    pub inbound: Vec<(GroupId, MessageBuffer)>,
}

/// Group-communication substrate for one federate.
///
/// Join is three barrier-separated phases: every federate creates its
/// groups, then publishes them, then subscribes, so no publish can race a
/// missing group. After joining, the federate announces its lookahead and
/// drives the protocol by alternating [Substrate::request_time_advance]
/// and [Substrate::tick]; the substrate never invokes callbacks, it
/// reports grants and messages from `tick` so a caller can step it
/// deterministically.
pub trait Substrate {
    /// This federate's origin tag.
    fn federate(&self) -> FederateId;

    fn create_group(&mut self, group: GroupId);

    fn publish_group(&mut self, group: GroupId);

    /// Join `group`, supplying the pool receive buffers are drawn from.
    fn subscribe(&mut self, group: GroupId, buffers: SharedPool);

    /// Wait until every federate has reached the same barrier.
    fn barrier(&mut self);

    /// Announce the minimum delay this federate guarantees on anything it
    /// sends. Must be called once, after joining and before the first
    /// time-advance request.
    fn set_lookahead(&mut self, lookahead: f64);

    /// Ask the group for permission to advance to `time`. The grant (which
    /// may be for an earlier, still-safe time) arrives through a later
    /// [Substrate::tick].
    fn request_time_advance(&mut self, time: SimTime);

    /// Broadcast `buffer` to the subscribers of `group`.
    fn publish(&mut self, group: GroupId, buffer: MessageBuffer);

    /// Poll the substrate once.
    fn tick(&mut self) -> Tick;
}
