//! Wire framing.
//!
//! Every message exchanged between two nodes is a packet: a fixed 8 byte
//! header followed by `len` body bytes.
//!
//! ```text
//! [len: u32][src: u16][packet_type_mask: u8][sequentialization_key: u8][body]
//! ```
//!
//! All integers are little endian.
//!
//! # Features:
//! - [`PacketHeader`]: Encodes and decodes the fixed header.
//! - [`PacketMask`]: The packet type bitmask (control vs. data, request vs.
//!   reply, POD-encoded vs. generically serialized).
//! - [`PacketChunk`]: A contiguous run of complete packets cut from a
//!   connection's byte stream, iterable as [`Packet`]s.
//!
//! ```
//! use rmi::packet::{PacketHeader, PacketMask, HEADER_LEN};
//!
//! let header = PacketHeader {
//!     len: 12,
//!     src: 3,
//!     mask: PacketMask::CONTROL | PacketMask::FLUSH,
//!     key: 7,
//! };
//! let encoded = header.to_bytes();
//! assert_eq!(encoded.len(), HEADER_LEN);
//! assert_eq!(PacketHeader::decode(&encoded), Some(header));
//! ```
use std::{fmt, ops};

use bytes::{BufMut, Bytes};
use tracing::error;

/// Identifies one node of a session, `0..numprocs`.
pub type ProcId = u16;

/// Size of the encoded [`PacketHeader`].
pub const HEADER_LEN: usize = 8;

/// The packet type bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketMask(u8);

impl PacketMask {
    /// No flags: a counted, generically serialized data call.
    pub const NONE: Self = Self(0);
    /// Runtime bookkeeping (barrier votes, consensus tokens, replies). Control
    /// packets are dispatched immediately and are never counted as calls.
    pub const CONTROL: Self = Self(0x01);
    /// The sender awaits a reply; the body carries a request handle.
    pub const REQUEST: Self = Self(0x02);
    /// A reply to an earlier request.
    pub const REPLY: Self = Self(0x04);
    /// Arguments are postcard-encoded regardless of the session serializer.
    pub const POD: Self = Self(0x08);
    /// Ask the sender to push its buffers out as soon as possible.
    pub const FLUSH: Self = Self(0x10);
    /// The call targets a distributed object; the body carries an object id.
    pub const METHOD: Self = Self(0x20);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_control(self) -> bool {
        self.contains(Self::CONTROL)
    }
}

impl ops::BitOr for PacketMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for PacketMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PacketMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PacketMask, &str); 6] = [
            (PacketMask::CONTROL, "CONTROL"),
            (PacketMask::REQUEST, "REQUEST"),
            (PacketMask::REPLY, "REPLY"),
            (PacketMask::POD, "POD"),
            (PacketMask::FLUSH, "FLUSH"),
            (PacketMask::METHOD, "METHOD"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// The fixed-size header preceding every packet body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Body length in bytes, header excluded.
    pub len: u32,
    /// The sending node.
    pub src: ProcId,
    pub mask: PacketMask,
    /// Calls sharing a key are dispatched in send order.
    pub key: u8,
}

impl PacketHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.encode_into(&mut out);
        out
    }

    /// Writes the header into the first [`HEADER_LEN`] bytes of `out`.
    ///
    /// Used to patch a header slot reserved before the body length was known.
    pub fn encode_into(&self, out: &mut [u8]) {
        let mut out = &mut out[..HEADER_LEN];
        out.put_u32_le(self.len);
        out.put_u16_le(self.src);
        out.put_u8(self.mask.bits());
        out.put_u8(self.key);
    }

    /// Decodes a header from the front of `bytes`, or `None` if fewer than
    /// [`HEADER_LEN`] bytes are available.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: &[u8; HEADER_LEN] = bytes.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self {
            len: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            src: u16::from_le_bytes([raw[4], raw[5]]),
            mask: PacketMask::from_bits(raw[6]),
            key: raw[7],
        })
    }

    /// Total encoded size of the packet, header included.
    pub fn packet_len(&self) -> usize {
        HEADER_LEN + self.len as usize
    }
}

/// One decoded packet.
#[derive(Clone, Debug)]
pub struct Packet {
    pub header: PacketHeader,
    /// Byte offset of the packet's header within its connection stream.
    pub offset: u64,
    pub body: Bytes,
}

/// A contiguous run of complete packets received from one source.
#[derive(Clone, Debug)]
pub struct PacketChunk {
    pub source: ProcId,
    /// Stream offset of the first byte of `bytes`.
    pub offset: u64,
    pub bytes: Bytes,
}

impl PacketChunk {
    /// Iterates the packets of the chunk in stream order.
    ///
    /// # Panics
    ///
    /// A chunk always holds whole packets. A truncated trailing packet or a
    /// header whose source disagrees with the connection means the peers run
    /// incompatible builds, which is fatal.
    pub fn packets(&self) -> Packets {
        Packets {
            source: self.source,
            offset: self.offset,
            rest: self.bytes.clone(),
        }
    }
}

/// Iterator over the packets of a [`PacketChunk`].
pub struct Packets {
    source: ProcId,
    offset: u64,
    rest: Bytes,
}

impl Iterator for Packets {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        if self.rest.is_empty() {
            return None;
        }
        let header = match PacketHeader::decode(&self.rest) {
            Some(header) if header.packet_len() <= self.rest.len() => header,
            _ => {
                error!(source = self.source, offset = self.offset, remaining = self.rest.len(), "truncated packet in chunk");
                panic!("truncated packet from node {} at offset {}", self.source, self.offset);
            }
        };
        if header.src != self.source {
            error!(source = self.source, claimed = header.src, "packet source does not match connection");
            panic!("packet claims source {} on connection from {}", header.src, self.source);
        }
        let mut packet = self.rest.split_to(header.packet_len());
        let body = packet.split_off(HEADER_LEN);
        let offset = self.offset;
        self.offset += header.packet_len() as u64;
        Some(Packet {
            header,
            offset,
            body,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(src: ProcId, key: u8, body: &[u8]) -> Vec<u8> {
        let mut out = PacketHeader {
            len: body.len() as u32,
            src,
            mask: PacketMask::NONE,
            key,
        }
        .to_bytes()
        .to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn it_lays_out_header_little_endian() {
        let header = PacketHeader {
            len: 0x0403_0201,
            src: 0x0605,
            mask: PacketMask::REQUEST | PacketMask::FLUSH,
            key: 0x09,
        };
        assert_eq!(header.to_bytes(), [1, 2, 3, 4, 5, 6, 0x12, 9]);
    }

    #[test]
    fn it_rejects_short_headers() {
        assert_eq!(PacketHeader::decode(&[0u8; HEADER_LEN - 1]), None);
    }

    #[test]
    fn it_iterates_packets_with_offsets() {
        let mut stream = encode(2, 0, b"hello");
        stream.extend(encode(2, 1, b""));
        stream.extend(encode(2, 1, b"world!"));
        let chunk = PacketChunk {
            source: 2,
            offset: 100,
            bytes: Bytes::from(stream),
        };

        let packets = chunk.packets().collect::<Vec<_>>();
        assert_eq!(packets.len(), 3);
        assert_eq!(&packets[0].body[..], b"hello");
        assert_eq!(packets[0].offset, 100);
        assert_eq!(packets[1].offset, 100 + 13);
        assert!(packets[1].body.is_empty());
        assert_eq!(&packets[2].body[..], b"world!");
        assert_eq!(packets[2].header.key, 1);
    }

    #[test]
    #[should_panic(expected = "truncated packet")]
    fn it_panics_on_truncated_chunk() {
        let mut stream = encode(0, 0, b"abcdef");
        stream.truncate(stream.len() - 1);
        let chunk = PacketChunk {
            source: 0,
            offset: 0,
            bytes: Bytes::from(stream),
        };
        chunk.packets().for_each(drop);
    }

    #[test]
    fn it_formats_mask_flags() {
        let mask = PacketMask::CONTROL | PacketMask::REPLY;
        assert_eq!(format!("{mask:?}"), "{CONTROL, REPLY}");
        assert!(mask.is_control());
        assert!(!PacketMask::POD.is_control());
    }
}
