//! The per-peer receiver.
//!
//! A [`StreamReceiver`] reassembles one connection's byte stream. Bytes are
//! read straight into its working buffer; after each read the buffer is
//! scanned for complete packets, and the complete prefix is cut off, without
//! copying, as a [`PacketChunk`] for the dispatcher. Only the incomplete
//! suffix stays behind.
//!
//! When the next packet's header declares more bytes than the buffer can
//! hold, the buffer grows to fit exactly that packet, so memory is bounded by
//! the largest packet in flight rather than by the connection's history.
//!
//! ```
//! use rmi::packet::{PacketHeader, PacketMask};
//! use rmi::stream::receive::StreamReceiver;
//!
//! let mut packet = PacketHeader { len: 3, src: 1, mask: PacketMask::NONE, key: 0 }
//!     .to_bytes()
//!     .to_vec();
//! packet.extend_from_slice(b"abc");
//!
//! let mut receiver = StreamReceiver::new(1, 1024);
//! assert!(receiver.receive(&packet[..5]).is_none());
//! let chunk = receiver.receive(&packet[5..]).unwrap();
//! assert_eq!(&chunk.packets().next().unwrap().body[..], b"abc");
//! ```
use std::sync::{atomic::Ordering, Arc};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
};
use tracing::{instrument, trace};

use crate::{
    control::Session,
    dispatch::multiplexer::KeyCursors,
    packet::{PacketChunk, PacketHeader, ProcId, HEADER_LEN},
};

pub struct StreamReceiver {
    source: ProcId,
    buffer: BytesMut,
    /// Stream offset of `buffer[0]`.
    stream_offset: u64,
    bytes_received: u64,
    min_capacity: usize,
    closed: bool,
}

impl StreamReceiver {
    pub fn new(source: ProcId, min_capacity: usize) -> Self {
        let min_capacity = min_capacity.max(HEADER_LEN);
        Self {
            source,
            buffer: BytesMut::with_capacity(min_capacity),
            stream_offset: 0,
            bytes_received: 0,
            min_capacity,
            closed: false,
        }
    }

    pub fn source(&self) -> ProcId {
        self.source
    }

    /// Bytes taken from the connection so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Bytes held while waiting for the rest of a packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Appends `bytes` read elsewhere and returns the packets they complete.
    pub fn receive(&mut self, bytes: &[u8]) -> Option<PacketChunk> {
        if self.closed {
            return None;
        }
        self.buffer.extend_from_slice(bytes);
        self.bytes_received += bytes.len() as u64;
        self.advance_buffer()
    }

    /// Reads once from `reader` into the working buffer. Returns the number
    /// of bytes read, zero at end of stream.
    pub(crate) async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let n = reader.read_buf(&mut self.buffer).await?;
        self.bytes_received += n as u64;
        Ok(n)
    }

    /// Cuts every complete packet off the front of the buffer and reserves
    /// room for the next one.
    pub fn advance_buffer(&mut self) -> Option<PacketChunk> {
        let mut complete = 0;
        while let Some(header) = PacketHeader::decode(&self.buffer[complete..]) {
            if complete + header.packet_len() > self.buffer.len() {
                break;
            }
            complete += header.packet_len();
        }

        let chunk = (complete > 0).then(|| {
            let chunk = PacketChunk {
                source: self.source,
                offset: self.stream_offset,
                bytes: self.buffer.split_to(complete).freeze(),
            };
            self.stream_offset += complete as u64;
            chunk
        });

        match PacketHeader::decode(&self.buffer) {
            Some(header) if header.packet_len() > self.buffer.capacity() => {
                let additional = header.packet_len() - self.buffer.len();
                trace!(source = self.source, packet_len = header.packet_len(), "growing receive buffer");
                self.buffer.reserve(additional);
            }
            _ if self.buffer.capacity() - self.buffer.len() < HEADER_LEN => {
                self.buffer.reserve(self.min_capacity);
            }
            _ => {}
        }
        chunk
    }

    /// Releases the working buffer. Further input is ignored.
    pub fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.buffer = BytesMut::new();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed
    }
}

/// Reads `reader` until it closes or the session shuts down, dispatching
/// every complete packet.
#[instrument(skip(session, reader), level = "debug")]
pub(crate) async fn receive_loop<R>(session: Arc<Session>, source: ProcId, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut receiver = StreamReceiver::new(source, session.config.receive_buffer_size);
    let mut cursors = KeyCursors::new(source);
    loop {
        let read = select! {
            biased;
            _ = session.shutdown.cancelled() => break,
            read = receiver.read_from(&mut reader) => read,
        };
        match read {
            Ok(0) => {
                session.connection_closed(source, None);
                break;
            }
            Ok(n) => {
                session
                    .network_bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                if let Some(chunk) = receiver.advance_buffer() {
                    session.multiplexer.process(&session, &mut cursors, chunk).await;
                }
            }
            Err(err) => {
                session.connection_closed(source, Some(err));
                break;
            }
        }
    }
    receiver.shutdown();
}
