//! Per-connection byte stream handling.
//!
//! Each peer connection is served by one sender task and one receiver task.
//!
//! # Features:
//! - [`send`]: Drains the thread-local buffers destined to one peer through a
//!   [`CircularIovecBuffer`](crate::buffer::iovec::CircularIovecBuffer) into
//!   vectored writes, on a poll interval or on demand.
//! - [`receive`]: Reassembles the incoming byte stream into runs of whole
//!   packets and hands them to the dispatcher.
pub mod receive;
pub(crate) mod send;
