//! Send-side buffering.
//!
//! # Features:
//! - [`lock_free`]: The multi-producer, single-consumer queue that carries
//!   filled send buffers from calling threads to a destination's sender.
//! - [`iovec`]: The circular scatter-gather buffer the sender drains into
//!   vectored writes.
//! - `thread_local`: Per-thread, per-destination archives in which outgoing
//!   calls are serialized without contending with other callers.
pub mod iovec;
pub mod lock_free;
pub(crate) mod thread_local;
