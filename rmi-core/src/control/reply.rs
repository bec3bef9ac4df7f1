//! Reply bookkeeping for outstanding requests.
//!
//! Every request is registered in the [`ReplyTable`] under a fresh handle that
//! travels in the request body. The remote dispatcher answers with a reply
//! packet carrying the handle back; delivering it removes the entry, so a
//! handle is satisfied at most once. Replies for unknown handles are logged
//! and dropped.
//!
//! A [`RequestFuture`] can be awaited (from a fiber or any async context) or,
//! outside of fibers, waited on synchronously.
//!
//! # Reply body
//!
//! ```text
//! [handle: u64][status: u8][payload]
//! ```
//!
//! Status `0` carries the handler's encoded return value, status `1` the
//! handler's error message as UTF-8.
use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    task::{Context, Poll},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::task::AtomicWaker;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use crate::{
    common::lock,
    fiber,
    handler::{Result, RpcError},
    packet::ProcId,
    serializer::Serializer,
};

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

/// A value-or-pending box satisfied exactly once.
pub(crate) struct ReplySlot {
    value: Mutex<Option<Result<Bytes>>>,
    ready: Condvar,
    waker: AtomicWaker,
}

impl ReplySlot {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
            waker: AtomicWaker::new(),
        }
    }

    fn complete(&self, handle: u64, result: Result<Bytes>) {
        {
            let mut value = lock(&self.value);
            if value.is_some() {
                warn!(handle, "request already completed; dropping second completion");
                return;
            }
            *value = Some(result);
        }
        self.ready.notify_all();
        self.waker.wake();
    }

    fn is_ready(&self) -> bool {
        lock(&self.value).is_some()
    }
}

struct PendingReply {
    target: ProcId,
    slot: Arc<ReplySlot>,
}

#[derive(Default)]
pub(crate) struct ReplyTable {
    next: AtomicU64,
    pending: DashMap<u64, PendingReply>,
}

impl ReplyTable {
    /// Allocates a handle for a request to `target`.
    pub(crate) fn register(&self, target: ProcId) -> (u64, Arc<ReplySlot>) {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ReplySlot::new());
        self.pending.insert(
            handle,
            PendingReply {
                target,
                slot: slot.clone(),
            },
        );
        (handle, slot)
    }

    /// Drops a handle whose request was never sent.
    pub(crate) fn cancel(&self, handle: u64) {
        self.pending.remove(&handle);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Completes the request a reply packet from `source` answers.
    ///
    /// # Panics
    ///
    /// A reply body too short to hold a handle and status is a protocol
    /// violation.
    pub(crate) fn deliver(&self, source: ProcId, mut body: Bytes) {
        if body.len() < 9 {
            error!(source, len = body.len(), "malformed reply");
            panic!("reply of {} bytes from node {source} is malformed", body.len());
        }
        let handle = body.get_u64_le();
        let status = body.get_u8();
        let result = match status {
            STATUS_OK => Ok(body),
            _ => Err(RpcError::Remote {
                peer: source,
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        };
        match self.pending.remove(&handle) {
            Some((_, pending)) => pending.slot.complete(handle, result),
            None => warn!(source, handle, "reply for unknown request handle"),
        }
    }

    /// Fails every request outstanding towards `peer`.
    pub(crate) fn fail_peer(&self, peer: ProcId) {
        let handles = self
            .pending
            .iter()
            .filter(|entry| entry.target == peer)
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        for handle in handles {
            if let Some((_, pending)) = self.pending.remove(&handle) {
                pending
                    .slot
                    .complete(handle, Err(RpcError::ConnectionLost { peer }));
            }
        }
    }

    /// Fails every outstanding request.
    pub(crate) fn fail_all(&self, error: impl Fn(ProcId) -> RpcError) {
        let handles = self.pending.iter().map(|entry| *entry.key()).collect::<Vec<_>>();
        for handle in handles {
            if let Some((_, pending)) = self.pending.remove(&handle) {
                pending.slot.complete(handle, Err(error(pending.target)));
            }
        }
    }
}

/// Encodes a reply body answering `handle`.
pub(crate) fn encode_reply(buf: &mut BytesMut, handle: u64, result: &anyhow::Result<Bytes>) {
    buf.put_u64_le(handle);
    match result {
        Ok(payload) => {
            buf.put_u8(STATUS_OK);
            buf.put_slice(payload);
        }
        Err(err) => {
            buf.put_u8(STATUS_ERR);
            buf.put_slice(format!("{err:#}").as_bytes());
        }
    }
}

/// The pending result of a request.
///
/// Resolves to the decoded return value, to [`RpcError::Remote`] if the
/// handler failed, or to [`RpcError::ConnectionLost`] if the target went away
/// first.
pub struct RequestFuture<T> {
    slot: Arc<ReplySlot>,
    serializer: Serializer,
    _output: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RequestFuture<T> {
    pub(crate) fn new(slot: Arc<ReplySlot>, serializer: Serializer) -> Self {
        Self {
            slot,
            serializer,
            _output: PhantomData,
        }
    }

    /// Whether the reply has arrived.
    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Blocks the calling OS thread until the reply arrives.
    ///
    /// Inside a fiber this would stall every fiber of the worker, so it fails
    /// with [`RpcError::BlockingWaitInFiber`]; await the future instead.
    pub fn wait(self) -> Result<T> {
        if fiber::in_fiber() {
            return Err(RpcError::BlockingWaitInFiber);
        }
        let result = {
            let mut value = lock(&self.slot.value);
            loop {
                if let Some(result) = value.take() {
                    break result;
                }
                value = self
                    .slot
                    .ready
                    .wait(value)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        self.decode(result)
    }

    fn decode(&self, result: Result<Bytes>) -> Result<T> {
        self.serializer
            .from_bytes(&result?)
            .map_err(RpcError::Serialization)
    }
}

impl<T: DeserializeOwned> Future for RequestFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.waker.register(cx.waker());
        let result = lock(&self.slot.value).take();
        match result {
            Some(result) => Poll::Ready(self.decode(result)),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use super::*;

    fn reply(handle: u64, result: anyhow::Result<Bytes>) -> Bytes {
        let mut buf = BytesMut::new();
        encode_reply(&mut buf, handle, &result);
        buf.freeze()
    }

    fn ok_reply(handle: u64, value: u64) -> Bytes {
        reply(handle, Serializer::Postcard.to_bytes(&value))
    }

    #[tokio::test]
    async fn it_resolves_each_handle_once() {
        let table = ReplyTable::default();
        let (first, slot) = table.register(1);
        let future = RequestFuture::<u64>::new(slot, Serializer::Postcard);
        let (second, _) = table.register(1);
        assert_ne!(first, second);

        table.deliver(1, ok_reply(first, 42));
        // A duplicate reply finds no pending entry and is dropped.
        table.deliver(1, ok_reply(first, 7));
        assert_eq!(future.await.unwrap(), 42);
        assert_eq!(table.outstanding(), 1);
    }

    #[test]
    fn it_wakes_blocking_waiters() {
        let table = Arc::new(ReplyTable::default());
        let (handle, slot) = table.register(2);
        let future = RequestFuture::<u64>::new(slot, Serializer::Postcard);
        assert!(!future.is_ready());
        let replier = {
            let table = table.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                table.deliver(2, ok_reply(handle, 9));
            })
        };
        assert_eq!(future.wait().unwrap(), 9);
        replier.join().unwrap();
    }

    #[tokio::test]
    async fn it_reports_remote_failures_and_lost_peers() {
        let table = ReplyTable::default();
        let (failing, slot) = table.register(3);
        let failed = RequestFuture::<u64>::new(slot, Serializer::Postcard);
        let (_, slot) = table.register(3);
        let lost = RequestFuture::<u64>::new(slot, Serializer::Postcard);
        let (_, slot) = table.register(4);
        let unaffected = RequestFuture::<u64>::new(slot, Serializer::Postcard);

        table.deliver(3, reply(failing, Err(anyhow::anyhow!("no such key"))));
        table.fail_peer(3);

        match failed.await {
            Err(RpcError::Remote { peer: 3, message }) => assert_eq!(message, "no such key"),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(lost.await, Err(RpcError::ConnectionLost { peer: 3 })));
        assert!(!unaffected.is_ready());
    }
}
