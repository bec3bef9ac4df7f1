//! Encoding of call arguments and return values.
//!
//! Packet bodies are opaque to the RPC core: handlers' arguments and results
//! go through the [`Serializer`] the session was configured with, and only the
//! fixed-layout prefix of a call (handler id, object id, request handle) is
//! written by hand. Packets flagged POD are always encoded with postcard,
//! whatever the session's choice, so control traffic has one fixed format.
//!
//! ```rust
//! use rmi::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Edge {
//!    from: u32,
//!    to: u32,
//! }
//!
//! let edge = Edge { from: 3, to: 7 };
//! let bytes = Serializer::Cbor.to_bytes(&edge).unwrap();
//! let decoded: Edge = Serializer::Cbor.from_bytes(&bytes).unwrap();
//! assert_eq!((decoded.from, decoded.to), (3, 7));
//! ```
//!
//! Calls are encoded straight into the sender's packet buffer, behind the
//! bytes already there:
//!
//! ```rust
//! use bytes::BytesMut;
//! use rmi::serializer::Serializer;
//!
//! let mut buf = BytesMut::from(&b"header"[..]);
//! Serializer::Postcard.serialize_into(&mut buf, &(41u64, "x")).unwrap();
//! let (n, s): (u64, String) = Serializer::Postcard.from_bytes(&buf[6..]).unwrap();
//! assert_eq!((n, s.as_str()), (41, "x"));
//! ```

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// A value that can cross the wire as a handler argument, a return value or a
/// collective's payload.
///
/// Values are decoded into owned types on handler fibers and worker threads,
/// hence `DeserializeOwned`, `Send` and `Sync`.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// A wire encoding.
///
/// Both ends of a session must agree on the serializer; the wire format does
/// not carry it, except that POD-flagged packets are always postcard.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// Encodes `value` into a fresh buffer.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf, value)?;
        Ok(buf.freeze())
    }

    /// Appends the encoding of `value` to `buf`.
    ///
    /// On error `buf` may hold a partial encoding; callers that share the
    /// buffer are expected to truncate back to their starting length.
    #[instrument(skip(buf, value), level = "trace")]
    pub fn serialize_into<T: Serialize + ?Sized>(&self, buf: &mut BytesMut, value: &T) -> Result<()> {
        match self {
            Self::Postcard => {
                postcard::to_io(value, buf.writer())?;
            }
            Self::Cbor => ciborium::into_writer(value, buf.writer())?,
        }
        Ok(())
    }

    /// Decodes one `T` from `bytes`.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}
