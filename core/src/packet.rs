//! The payload unit that crosses federate boundaries.

use crate::net::{Addr, FederateId, Port};
use crate::wire::Error;
use bytes::{Buf, BufMut, Bytes};

/// A simulation packet with the routing metadata the federation core needs.
///
/// The `payload` is opaque to routing and transport: it is the protocol
/// header/data region produced by the local protocol agents. Destination
/// address and port are either a concrete local endpoint or are resolved by
/// the router before the packet reaches a local handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedPacket {
    pub src: Addr,
    pub src_port: Port,
    pub dst: Addr,
    pub dst_port: Port,
    /// Federate that put this packet on the wire. Used to suppress
    /// re-processing of a federate's own broadcast echo.
    pub origin: FederateId,
    pub payload: Bytes,
}

impl RoutedPacket {
    pub fn encoded_len(&self) -> usize {
        4 + 4 + 4 + 4 + 4 + 4 + self.payload.len()
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.src.0);
        buf.put_i32(self.src_port);
        buf.put_u32(self.dst.0);
        buf.put_i32(self.dst_port);
        buf.put_u32(self.origin.0);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < 24 {
            return Err(Error::EndOfBuffer);
        }
        let src = Addr(buf.get_u32());
        let src_port = buf.get_i32();
        let dst = Addr(buf.get_u32());
        let dst_port = buf.get_i32();
        let origin = FederateId(buf.get_u32());
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Error::EndOfBuffer);
        }
        let payload = buf.copy_to_bytes(len);
        Ok(Self {
            src,
            src_port,
            dst,
            dst_port,
            origin,
            payload,
        })
    }
}
