//! The cross-federate message envelope and out-of-band control messages.

use crate::net::{Addr, FederateId, Port};
use crate::time::SimTime;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

/// Error type for wire decoding.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),
    #[error("unknown out-of-band message: {0}")]
    UnknownOob(u8),
    #[error("invalid timestamp")]
    InvalidTimestamp,
}

/// Prefix byte for a simulation-packet envelope.
const KIND_PACKET: u8 = 0;
/// Prefix byte for an out-of-band control envelope.
const KIND_OOB: u8 = 1;

/// What an [Envelope] carries.
///
/// Packet bytes are a serialized [crate::RoutedPacket], either raw or
/// zero-run compressed; whether compression is in use is per-link
/// configuration agreed out of band, never negotiated per message.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Packet(Bytes),
    Oob(OobMessage),
}

/// Control messages broadcast outside the packet path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OobMessage {
    /// Announces the port chosen by dynamic allocation after a wildcard
    /// (port 0) connect. Applied on the federate hosting `agent_addr`:
    /// the agent bound at `agent_port` is pointed at `peer_addr:peer_port`.
    SetPeerPort {
        agent_addr: Addr,
        agent_port: Port,
        peer_addr: Addr,
        peer_port: Port,
    },
}

/// Prefix byte for [OobMessage::SetPeerPort].
const OOB_SET_PEER_PORT: u8 = 0;

impl OobMessage {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::SetPeerPort {
                agent_addr,
                agent_port,
                peer_addr,
                peer_port,
            } => {
                buf.put_u8(OOB_SET_PEER_PORT);
                buf.put_u32(agent_addr.0);
                buf.put_i32(*agent_port);
                buf.put_u32(peer_addr.0);
                buf.put_i32(*peer_port);
            }
        }
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < 1 {
            return Err(Error::EndOfBuffer);
        }
        match buf.get_u8() {
            OOB_SET_PEER_PORT => {
                if buf.remaining() < 16 {
                    return Err(Error::EndOfBuffer);
                }
                Ok(Self::SetPeerPort {
                    agent_addr: Addr(buf.get_u32()),
                    agent_port: buf.get_i32(),
                    peer_addr: Addr(buf.get_u32()),
                    peer_port: buf.get_i32(),
                })
            }
            kind => Err(Error::UnknownOob(kind)),
        }
    }
}

/// The message envelope exchanged through the group-communication layer:
/// a logical timestamp, the sender's origin tag, and a payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub timestamp: SimTime,
    pub origin: FederateId,
    pub payload: Payload,
}

impl Envelope {
    pub fn encoded_len(&self) -> usize {
        8 + 4
            + 1
            + match &self.payload {
                Payload::Packet(bytes) => bytes.len(),
                Payload::Oob(_) => 17,
            }
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_f64(self.timestamp.as_secs());
        buf.put_u32(self.origin.0);
        match &self.payload {
            Payload::Packet(bytes) => {
                buf.put_u8(KIND_PACKET);
                buf.put_slice(bytes);
            }
            Payload::Oob(oob) => {
                buf.put_u8(KIND_OOB);
                oob.write(buf);
            }
        }
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < 13 {
            return Err(Error::EndOfBuffer);
        }
        let timestamp = buf.get_f64();
        if !timestamp.is_finite() {
            return Err(Error::InvalidTimestamp);
        }
        let origin = FederateId(buf.get_u32());
        let payload = match buf.get_u8() {
            KIND_PACKET => Payload::Packet(buf.copy_to_bytes(buf.remaining())),
            KIND_OOB => Payload::Oob(OobMessage::read(buf)?),
            kind => return Err(Error::UnknownKind(kind)),
        };
        Ok(Self {
            timestamp: SimTime::from_secs(timestamp),
            origin,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_round_trip() {
        let envelope = Envelope {
            timestamp: SimTime::from_secs(0.03),
            origin: FederateId(2),
            payload: Payload::Packet(Bytes::from_static(&[1, 2, 3, 4])),
        };
        let mut buf = Vec::with_capacity(envelope.encoded_len());
        envelope.write(&mut buf);
        assert_eq!(buf.len(), envelope.encoded_len());
        let decoded = Envelope::read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_oob_round_trip() {
        let envelope = Envelope {
            timestamp: SimTime::from_secs(1.25),
            origin: FederateId(0),
            payload: Payload::Oob(OobMessage::SetPeerPort {
                agent_addr: Addr::from_octets(10, 0, 0, 1),
                agent_port: 4000,
                peer_addr: Addr::from_octets(10, 0, 0, 2),
                peer_port: 5001,
            }),
        };
        let mut buf = Vec::new();
        envelope.write(&mut buf);
        let decoded = Envelope::read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_bad_input() {
        assert_eq!(Envelope::read(&mut &[0u8; 5][..]), Err(Error::EndOfBuffer));

        let mut buf = Vec::new();
        buf.put_f64(0.0);
        buf.put_u32(7);
        buf.put_u8(9);
        assert_eq!(
            Envelope::read(&mut buf.as_slice()),
            Err(Error::UnknownKind(9))
        );

        let mut buf = Vec::new();
        buf.put_f64(f64::NAN);
        buf.put_u32(0);
        buf.put_u8(KIND_PACKET);
        assert_eq!(
            Envelope::read(&mut buf.as_slice()),
            Err(Error::InvalidTimestamp)
        );
    }
}
