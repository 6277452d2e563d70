//! Cross-federate link forwarding.
//!
//! A [LinkForwarder] models one outbound link: it serializes a packet into
//! an envelope, stamps it with the conservative delivery time, publishes it
//! to the link's group, and schedules a local `LinkFree` event once the
//! transmit time has elapsed. The receive side decodes envelopes pulled off
//! the substrate and hands packets back to the caller.

use crate::buffer::{BufferSource, SharedPool};
use crate::compress;
use crate::substrate::{GroupId, Substrate};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fedsim_core::wire::{self, Envelope, Payload};
use fedsim_core::{EventPayload, LinkId, MapScheduler, RoutedPacket, SimTime};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed envelope: {0}")]
    Wire(#[from] wire::Error),
    #[error("corrupt compressed payload: {0}")]
    Compress(#[from] compress::Error),
    #[error("compressed payload truncated")]
    TruncatedPayload,
}

/// Static parameters of a link, fixed at registration.
#[derive(Clone, Copy, Debug)]
pub struct LinkConfig {
    /// Group the remote endpoint subscribes to.
    pub group: GroupId,
    /// Bits per second. Non-finite or non-positive means zero transmit time.
    pub bandwidth: f64,
    /// Propagation delay in seconds.
    pub delay: f64,
    /// Whether packet headers on this link are zero-run compressed. Both
    /// endpoints must agree; there is no per-message negotiation.
    pub compress: bool,
}

pub struct LinkForwarder {
    id: LinkId,
    config: LinkConfig,
}

impl LinkForwarder {
    pub fn new(id: LinkId, config: LinkConfig) -> Self {
        Self { id, config }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn group(&self) -> GroupId {
        self.config.group
    }

    /// Propagation delay, the link's contribution to the lookahead floor.
    pub fn delay(&self) -> f64 {
        self.config.delay
    }

    /// Seconds spent putting `bytes` on the wire.
    pub fn transmit_time(&self, bytes: usize) -> f64 {
        if self.config.bandwidth.is_finite() && self.config.bandwidth > 0.0 {
            (bytes as f64) * 8.0 / self.config.bandwidth
        } else {
            0.0
        }
    }

    /// Forward `packet` over this link.
    ///
    /// The envelope is stamped `now + transmit + delay + lookahead`: the
    /// receiver may never see a timestamp below its granted time, so the
    /// full conservative offset is added at the sender. Returns the stamp.
    /// A `LinkFree` event fires locally once the transmit time has passed.
    pub fn send(
        &self,
        substrate: &mut dyn Substrate,
        pool: &SharedPool,
        scheduler: &mut MapScheduler,
        now: SimTime,
        lookahead: f64,
        packet: RoutedPacket,
    ) -> Result<SimTime, Error> {
        let mut header = BytesMut::with_capacity(packet.encoded_len());
        packet.write(&mut header);
        let transmit = self.transmit_time(header.len());
        let timestamp = now.offset(transmit + self.config.delay + lookahead);

        let body = if self.config.compress {
            compress_payload(&header)?
        } else {
            header.freeze()
        };
        let envelope = Envelope {
            timestamp,
            origin: substrate.federate(),
            payload: Payload::Packet(body),
        };
        let mut buffer = pool.lock().unwrap().acquire(envelope.encoded_len());
        envelope.write(buffer.as_mut_vec());
        trace!(
            link = ?self.id,
            group = self.config.group,
            %timestamp,
            bytes = buffer.len(),
            "forwarding packet"
        );
        substrate.publish(self.config.group, buffer);
        scheduler.schedule(now.offset(transmit), EventPayload::LinkFree(self.id));
        Ok(timestamp)
    }

    /// Decode an inbound envelope received on this link, reconstructing the
    /// packet when the envelope carries one.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, Error> {
        decode_envelope(bytes, self.config.compress)
    }
}

/// Decode an envelope, decompressing the packet header when the link it
/// arrived on runs compressed.
pub fn decode_envelope(bytes: &[u8], compressed: bool) -> Result<Envelope, Error> {
    let mut envelope = Envelope::read(&mut &bytes[..])?;
    if compressed {
        if let Payload::Packet(body) = envelope.payload {
            envelope.payload = Payload::Packet(decompress_payload(&body)?);
        }
    }
    Ok(envelope)
}

/// Pack bytes into little-endian words (zero padded), zero-run compress
/// them, and frame with the raw byte length.
fn compress_payload(raw: &[u8]) -> Result<Bytes, Error> {
    let mut words = vec![0u32; raw.len().div_ceil(4)];
    for (word, chunk) in words.iter_mut().zip(raw.chunks(4)) {
        let mut le = [0u8; 4];
        le[..chunk.len()].copy_from_slice(chunk);
        *word = u32::from_le_bytes(le);
    }
    let packed = compress::encode(&words)?;
    let mut out = BytesMut::with_capacity(4 + packed.len() * 4);
    out.put_u32(raw.len() as u32);
    for word in packed {
        out.put_u32_le(word);
    }
    Ok(out.freeze())
}

fn decompress_payload(framed: &[u8]) -> Result<Bytes, Error> {
    let mut framed = &framed[..];
    if framed.remaining() < 4 {
        return Err(Error::TruncatedPayload);
    }
    let raw_len = framed.get_u32() as usize;
    if framed.remaining() % 4 != 0 {
        return Err(Error::TruncatedPayload);
    }
    let mut packed = Vec::with_capacity(framed.remaining() / 4);
    while framed.has_remaining() {
        packed.push(framed.get_u32_le());
    }
    let mut words = vec![0u32; raw_len.div_ceil(4)];
    compress::decode(&packed, &mut words)?;
    let mut raw = BytesMut::with_capacity(words.len() * 4);
    for word in &words {
        raw.put_slice(&word.to_le_bytes());
    }
    raw.truncate(raw_len);
    Ok(raw.freeze())
}
