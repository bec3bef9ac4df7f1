//! A circular scatter-gather send buffer.
//!
//! [`CircularIovecBuffer`] holds a ring of not-yet-transmitted byte ranges.
//! Ranges are [`Bytes`], so queueing one moves ownership into the ring without
//! copying, and a range is released the moment [`CircularIovecBuffer::sent`]
//! consumes its last byte. The transport drains the ring through
//! [`CircularIovecBuffer::fill_transmit_descriptor`], which exposes up to
//! [`IOV_MAX`] ranges for one vectored write, combining many small payloads
//! into few system calls.
//!
//! ```
//! use bytes::Bytes;
//! use rmi::buffer::iovec::CircularIovecBuffer;
//!
//! let mut ring = CircularIovecBuffer::new();
//! ring.write(Bytes::from_static(b"hello "));
//! ring.write(Bytes::from_static(b"world"));
//!
//! let mut slices = Vec::new();
//! assert_eq!(ring.fill_transmit_descriptor(&mut slices), 11);
//! assert_eq!(slices.len(), 2);
//! drop(slices);
//!
//! // A short write leaves the tail of the first range at the head.
//! ring.sent(4);
//! let mut slices = Vec::new();
//! ring.fill_transmit_descriptor(&mut slices);
//! assert_eq!(&*slices[0], b"o ");
//! ```
use std::io::IoSlice;

use bytes::Bytes;
use tracing::error;

/// Ranges exposed per vectored write.
pub const IOV_MAX: usize = 1024;

const INITIAL_CAPACITY: usize = 4096;

pub struct CircularIovecBuffer {
    ring: Vec<Option<Bytes>>,
    /// First unsent range.
    head: usize,
    /// Next free slot.
    tail: usize,
    /// Ranges queued.
    len: usize,
    /// Bytes of the head range already sent.
    head_offset: usize,
    /// Bytes queued and not yet sent.
    pending_bytes: usize,
}

impl Default for CircularIovecBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CircularIovecBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// `capacity` is rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            ring: vec![None; capacity],
            head: 0,
            tail: 0,
            len: 0,
            head_offset: 0,
            pending_bytes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Number of queued ranges.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes queued and not yet reported sent.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    fn mask(&self) -> usize {
        self.ring.len() - 1
    }

    /// Queues `bytes` for transmission. Empty ranges are dropped.
    pub fn write(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.reserve(1);
        self.pending_bytes += bytes.len();
        self.ring[self.tail] = Some(bytes);
        self.tail = (self.tail + 1) & self.mask();
        self.len += 1;
    }

    /// Ensures room for `additional` more ranges, doubling the ring as needed.
    /// A wrapped ring is linearized into the new allocation, preserving order.
    fn reserve(&mut self, additional: usize) {
        let needed = self.len + additional;
        if needed <= self.ring.len() {
            return;
        }
        let capacity = needed.next_power_of_two().max(self.ring.len() * 2);
        let mut ring = Vec::with_capacity(capacity);
        let mask = self.mask();
        ring.extend((0..self.len).map(|i| self.ring[(self.head + i) & mask].take()));
        ring.resize(capacity, None);
        self.ring = ring;
        self.head = 0;
        self.tail = self.len;
    }

    /// Exposes queued ranges, starting at the unsent head, for one vectored
    /// write. Stops at the end of the ring storage, at the tail, or after
    /// [`IOV_MAX`] ranges. Returns the number of bytes exposed.
    pub fn fill_transmit_descriptor<'a>(&'a self, slices: &mut Vec<IoSlice<'a>>) -> usize {
        slices.clear();
        if self.is_empty() {
            return 0;
        }
        let contiguous = if self.head < self.tail {
            self.tail - self.head
        } else {
            self.ring.len() - self.head
        };
        let count = contiguous.min(IOV_MAX);
        let mut exposed = 0;
        for (i, range) in self.ring[self.head..self.head + count].iter().enumerate() {
            let Some(range) = range else { break };
            let range = if i == 0 { &range[self.head_offset..] } else { &range[..] };
            exposed += range.len();
            slices.push(IoSlice::new(range));
        }
        exposed
    }

    /// Advances the head past `n` transmitted bytes, releasing every range
    /// fully consumed.
    ///
    /// # Panics
    ///
    /// Reporting more bytes than are queued is a bookkeeping inconsistency
    /// and aborts.
    pub fn sent(&mut self, mut n: usize) {
        if n > self.pending_bytes {
            error!(sent = n, pending = self.pending_bytes, "sent more bytes than queued");
            panic!("sent {n} bytes with only {} queued", self.pending_bytes);
        }
        self.pending_bytes -= n;
        while n > 0 {
            let Some(head) = self.ring[self.head].as_ref() else {
                unreachable!("pending bytes without a queued range");
            };
            let remaining = head.len() - self.head_offset;
            if n < remaining {
                self.head_offset += n;
                return;
            }
            n -= remaining;
            self.ring[self.head] = None;
            self.head = (self.head + 1) & self.mask();
            self.head_offset = 0;
            self.len -= 1;
        }
    }
}
