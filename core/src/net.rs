//! Addresses and identifiers shared across federates.

use std::fmt;

/// Netmask applied to an [Addr] during route matching.
pub type Mask = u32;

/// A transport port. Negative values are sentinels: [PORT_UNSET] marks a
/// destination that has not been resolved, [PORT_ANY] requests dynamic
/// allocation on the receiving federate.
pub type Port = i32;

/// Destination port not yet known (administrative or out-of-band traffic).
pub const PORT_UNSET: Port = -1;

/// Wildcard "connect to any" port, resolved by dynamic allocation.
pub const PORT_ANY: Port = 0;

/// An IPv4-style 32-bit simulation address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(pub u32);

impl Addr {
    /// The unset/broadcast sentinel. Packets addressed here are treated as
    /// already locally addressed (out-of-band traffic).
    pub const UNSET: Self = Self(0);

    pub fn from_octets(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(u32::from_be_bytes([a, b, c, d]))
    }

    /// The address under `mask`, for prefix comparisons.
    pub fn masked(&self, mask: Mask) -> u32 {
        self.0 & mask
    }

    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Identifies one federate within the synchronization group. Stamped on
/// every outbound message so a federate can discard its own broadcast echo.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FederateId(pub u32);

impl fmt::Display for FederateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for a remote link (one whose far end lives on another federate).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinkId(pub u32);
