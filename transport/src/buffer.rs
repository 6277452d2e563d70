//! Reuse free-list for externally-managed message buffers.
//!
//! The group-communication layer asks its subscriber for a buffer to store
//! each received message, and allocation is expensive inside the simulation
//! hot path, so buffers cycle through a free-list instead: `acquire` pops a
//! reusable buffer (growing it if it is smaller than requested), `release`
//! pushes it back without shrinking. The free-list is unbounded; a driver
//! that cares can watch [Pool::free_len].

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};

/// A raw byte region recycled through the [Pool].
///
/// Capacity is retained across reuse; contents are cleared on acquire.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    data: Vec<u8>,
}

impl MessageBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access for encoding into the buffer (`Vec<u8>` implements
    /// `bytes::BufMut`).
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

/// Supplier of receive buffers, injected into the group-communication
/// substrate at subscription time.
pub trait BufferSource {
    /// A cleared buffer with capacity for at least `min_size` bytes.
    fn acquire(&mut self, min_size: usize) -> MessageBuffer;

    /// Return a buffer for reuse.
    fn release(&mut self, buffer: MessageBuffer);
}

/// LIFO free-list of [MessageBuffer]s.
#[derive(Debug, Default)]
pub struct Pool {
    free: Vec<MessageBuffer>,
    allocations: Counter,
    reuses: Counter,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register this pool's counters.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "buffer_allocations",
            "Buffers allocated fresh",
            self.allocations.clone(),
        );
        registry.register(
            "buffer_reuses",
            "Buffers served from the free-list",
            self.reuses.clone(),
        );
    }

    /// Fresh allocations performed so far.
    pub fn allocations(&self) -> u64 {
        self.allocations.get()
    }

    /// Buffers currently parked on the free-list.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}

impl BufferSource for Pool {
    fn acquire(&mut self, min_size: usize) -> MessageBuffer {
        match self.free.pop() {
            Some(mut buffer) => {
                buffer.data.clear();
                // Re-validate capacity before reuse: the next message may
                // exceed what this buffer last held.
                if buffer.capacity() < min_size {
                    buffer.data.reserve(min_size);
                }
                self.reuses.inc();
                buffer
            }
            None => {
                self.allocations.inc();
                MessageBuffer::with_capacity(min_size)
            }
        }
    }

    fn release(&mut self, buffer: MessageBuffer) {
        self.free.push(buffer);
    }
}

/// A [Pool] shared between the substrate (receive side) and the link
/// forwarders (send side) of one federate.
pub type SharedPool = Arc<Mutex<Pool>>;

pub fn shared_pool() -> SharedPool {
    Arc::new(Mutex::new(Pool::new()))
}
