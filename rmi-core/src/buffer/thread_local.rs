//! Thread-local send buffers.
//!
//! Each OS thread that issues calls owns one [`ThreadLocalBuffer`] per
//! session, holding one archive per destination. Building a message is
//! [`ThreadLocalBuffer::acquire`] (reserve a header slot and hand out an
//! [`OutArchive`]) followed by [`SendPath::release`] (patch the header, count
//! the call). Neither blocks on other callers: the archive lock is only ever
//! contended by the destination's sender while it swaps a filled archive out.
//!
//! Full archives are handed to the destination's [`LockFreeQueue`]. The
//! sender drains that queue, after first pushing the partially filled archive
//! of every registered thread into it, so that per-thread FIFO order survives
//! the hand-off. When a thread exits its archives are pushed to the queues and
//! its byte counts are folded into the session totals.
use std::{
    cell::RefCell,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Notify;
use tracing::{error, trace};

use super::lock_free::{Batch, LockFreeQueue};
use crate::{
    common::lock,
    control::counters::CallCounters,
    packet::{PacketHeader, PacketMask, ProcId, HEADER_LEN},
};

/// Sizing knobs of the send path.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SendLimits {
    pub full_buffer_size_limit: usize,
    pub num_full_buffer_limit: usize,
    pub initial_capacity: usize,
}

/// The per-session send machinery shared by every calling thread and by the
/// per-destination senders.
pub(crate) struct SendPath {
    procid: ProcId,
    queues: Vec<LockFreeQueue<Bytes>>,
    wakeups: Vec<Notify>,
    buffers: Mutex<Vec<Arc<ThreadLocalBuffer>>>,
    retired_bytes_sent: Vec<AtomicU64>,
    counters: Arc<CallCounters>,
    limits: SendLimits,
}

thread_local! {
    static LOCAL_BUFFERS: RefCell<LocalBuffers> = RefCell::new(LocalBuffers::default());
}

#[derive(Default)]
struct LocalBuffers {
    entries: Vec<(Weak<SendPath>, Arc<ThreadLocalBuffer>)>,
}

impl Drop for LocalBuffers {
    fn drop(&mut self) {
        for (path, buffer) in self.entries.drain(..) {
            if let Some(path) = path.upgrade() {
                path.retire(&buffer);
            }
        }
    }
}

impl SendPath {
    pub(crate) fn new(
        procid: ProcId,
        numprocs: usize,
        counters: Arc<CallCounters>,
        limits: SendLimits,
    ) -> Self {
        Self {
            procid,
            queues: (0..numprocs).map(|_| LockFreeQueue::new()).collect(),
            wakeups: (0..numprocs).map(|_| Notify::new()).collect(),
            buffers: Mutex::new(Vec::new()),
            retired_bytes_sent: (0..numprocs).map(|_| AtomicU64::new(0)).collect(),
            counters,
            limits,
        }
    }

    fn numprocs(&self) -> usize {
        self.queues.len()
    }

    /// The calling thread's buffer for this session, created and registered
    /// on first use.
    pub(crate) fn local_buffer(self: &Arc<Self>) -> Arc<ThreadLocalBuffer> {
        LOCAL_BUFFERS
            .try_with(|local| {
                let mut local = local.borrow_mut();
                local.entries.retain(|(path, _)| path.strong_count() > 0);
                if let Some((_, buffer)) = local
                    .entries
                    .iter()
                    .find(|(path, _)| std::ptr::eq(path.as_ptr(), Arc::as_ptr(self)))
                {
                    return buffer.clone();
                }
                let buffer = Arc::new(ThreadLocalBuffer::new(self.procid, self.numprocs(), true));
                lock(&self.buffers).push(buffer.clone());
                local.entries.push((Arc::downgrade(self), buffer.clone()));
                trace!(procid = self.procid, "registered thread-local send buffer");
                buffer
            })
            // Thread-local storage is already torn down on this thread.
            .unwrap_or_else(|_| self.detached_buffer())
    }

    /// A buffer outside the per-thread set. Every message released from it
    /// is queued for its sender at once, so messages from one issuer keep
    /// their order whichever threads they were built on.
    pub(crate) fn detached_buffer(&self) -> Arc<ThreadLocalBuffer> {
        Arc::new(ThreadLocalBuffer::new(self.procid, self.numprocs(), false))
    }

    /// Commits a message built with [`ThreadLocalBuffer::acquire`].
    ///
    /// `counted` calls increment the session's `calls_sent` for the target.
    ///
    /// # Panics
    ///
    /// A body longer than `u32::MAX` bytes cannot be framed and aborts.
    pub(crate) fn release(&self, mut archive: OutArchive<'_>, counted: bool) {
        let target = archive.target;
        let body_len = archive.data.len() - archive.start - HEADER_LEN;
        let Ok(len) = u32::try_from(body_len) else {
            error!(target, body_len, "packet body exceeds the u32 length field");
            panic!("packet body of {body_len} bytes cannot be framed");
        };
        let header = PacketHeader {
            len,
            ..archive.header
        };
        let start = archive.start;
        header.encode_into(&mut archive.data[start..]);
        archive.committed = true;

        let bytes_sent = if archive.buffer.registered {
            &archive.buffer.bytes_sent[target as usize]
        } else {
            &self.retired_bytes_sent[target as usize]
        };
        bytes_sent.fetch_add(body_len as u64, Ordering::Relaxed);
        if counted {
            self.counters.inc_sent(target);
        }

        let hand_off = archive.data.len() >= self.limits.full_buffer_size_limit
            || !archive.buffer.registered;
        let chunk = hand_off.then(|| archive.data.split().freeze());
        drop(archive);

        if let Some(chunk) = chunk {
            self.enqueue(target, chunk);
        }
        if header.mask.contains(PacketMask::FLUSH) {
            self.flush_soon(target);
        }
    }

    fn enqueue(&self, target: ProcId, chunk: Bytes) {
        let queue = &self.queues[target as usize];
        queue.enqueue(chunk);
        if queue.approx_len() > self.limits.num_full_buffer_limit {
            self.flush_soon(target);
        }
    }

    /// Wakes the sender for `target` without waiting for it.
    pub(crate) fn flush_soon(&self, target: ProcId) {
        self.wakeups[target as usize].notify_one();
    }

    pub(crate) fn wakeup(&self, target: ProcId) -> &Notify {
        &self.wakeups[target as usize]
    }

    /// Moves every thread's pending bytes for `target` into its queue and
    /// detaches the queue's contents.
    ///
    /// With `wait` unset, archives currently being written are skipped and
    /// picked up by a later call.
    pub(crate) fn collect(&self, target: ProcId, wait: bool) -> Batch<'_, Bytes> {
        let queue = &self.queues[target as usize];
        let buffers = lock(&self.buffers).clone();
        for buffer in buffers {
            if let Some(chunk) = buffer.take(target, wait) {
                queue.enqueue(chunk);
            }
        }
        queue.dequeue_all()
    }

    /// Payload bytes committed for `target`, counted at release time.
    pub(crate) fn bytes_sent_to(&self, target: ProcId) -> u64 {
        let live: u64 = lock(&self.buffers)
            .iter()
            .map(|buffer| buffer.bytes_sent[target as usize].load(Ordering::Relaxed))
            .sum();
        live + self.retired_bytes_sent[target as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        (0..self.numprocs() as ProcId).map(|t| self.bytes_sent_to(t)).sum()
    }

    /// Unregisters an exiting thread's buffer, handing off what it holds.
    fn retire(&self, buffer: &Arc<ThreadLocalBuffer>) {
        lock(&self.buffers).retain(|b| !Arc::ptr_eq(b, buffer));
        for target in 0..self.numprocs() {
            self.retired_bytes_sent[target]
                .fetch_add(buffer.bytes_sent[target].load(Ordering::Relaxed), Ordering::Relaxed);
            if let Some(chunk) = buffer.take(target as ProcId, true) {
                self.enqueue(target as ProcId, chunk);
                self.flush_soon(target as ProcId);
            }
        }
    }
}

/// One thread's archives, one per destination.
pub(crate) struct ThreadLocalBuffer {
    procid: ProcId,
    archives: Vec<Mutex<BytesMut>>,
    bytes_sent: Vec<AtomicU64>,
    registered: bool,
}

impl ThreadLocalBuffer {
    fn new(procid: ProcId, numprocs: usize, registered: bool) -> Self {
        Self {
            procid,
            archives: (0..numprocs).map(|_| Mutex::new(BytesMut::new())).collect(),
            bytes_sent: (0..numprocs).map(|_| AtomicU64::new(0)).collect(),
            registered,
        }
    }

    /// Starts a message to `target`, reserving its header slot.
    pub(crate) fn acquire(&self, target: ProcId, mask: PacketMask, key: u8) -> OutArchive<'_> {
        let mut data = lock(&self.archives[target as usize]);
        let start = data.len();
        data.reserve(HEADER_LEN + 64);
        data.put_bytes(0, HEADER_LEN);
        OutArchive {
            buffer: self,
            data,
            target,
            start,
            header: PacketHeader {
                len: 0,
                src: self.procid,
                mask,
                key,
            },
            committed: false,
        }
    }

    fn take(&self, target: ProcId, wait: bool) -> Option<Bytes> {
        let archive = &self.archives[target as usize];
        let mut data = if wait {
            lock(archive)
        } else {
            archive.try_lock().ok()?
        };
        (!data.is_empty()).then(|| data.split().freeze())
    }
}

/// A message under construction. Dereferences to the archive's byte buffer,
/// positioned after the reserved header.
///
/// Dropping an archive without releasing it discards the partial message.
pub(crate) struct OutArchive<'a> {
    buffer: &'a ThreadLocalBuffer,
    data: MutexGuard<'a, BytesMut>,
    target: ProcId,
    start: usize,
    header: PacketHeader,
    committed: bool,
}

impl Deref for OutArchive<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.data
    }
}

impl DerefMut for OutArchive<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

impl Drop for OutArchive<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let start = self.start;
            self.data.truncate(start);
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::packet::PacketChunk;

    fn path(numprocs: usize, limits: SendLimits) -> Arc<SendPath> {
        Arc::new(SendPath::new(0, numprocs, Arc::new(CallCounters::new(numprocs)), limits))
    }

    const LIMITS: SendLimits = SendLimits {
        full_buffer_size_limit: 1 << 20,
        num_full_buffer_limit: 64,
        initial_capacity: 4096,
    };

    fn send(path: &Arc<SendPath>, target: ProcId, key: u8, body: &[u8]) {
        let local = path.local_buffer();
        let mut archive = local.acquire(target, PacketMask::NONE, key);
        archive.extend_from_slice(body);
        path.release(archive, true);
    }

    fn collect_bodies(path: &SendPath, target: ProcId) -> Vec<Vec<u8>> {
        path.collect(target, true)
            .flat_map(|bytes| {
                PacketChunk {
                    source: 0,
                    offset: 0,
                    bytes,
                }
                .packets()
                .map(|p| p.body.to_vec())
                .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn it_frames_released_messages() {
        let path = path(2, LIMITS);
        send(&path, 1, 3, b"abc");
        send(&path, 1, 3, b"");
        assert_eq!(path.bytes_sent_to(1), 3);
        assert_eq!(path.counters.sent_to(1), 2);
        assert_eq!(collect_bodies(&path, 1), vec![b"abc".to_vec(), vec![]]);
        assert!(collect_bodies(&path, 1).is_empty());
    }

    #[test]
    fn it_discards_unreleased_messages() {
        let path = path(2, LIMITS);
        let local = path.local_buffer();
        {
            let mut archive = local.acquire(1, PacketMask::NONE, 0);
            archive.extend_from_slice(b"partial");
        }
        send(&path, 1, 0, b"whole");
        assert_eq!(collect_bodies(&path, 1), vec![b"whole".to_vec()]);
    }

    #[test]
    fn it_hands_off_full_buffers_in_order() {
        let path = path(
            2,
            SendLimits {
                full_buffer_size_limit: 32,
                ..LIMITS
            },
        );
        let bodies = (0..20u8).map(|i| vec![i; 10]).collect::<Vec<_>>();
        for body in &bodies {
            send(&path, 1, 1, body);
        }
        assert!(path.queues[1].approx_len() > 0);
        assert_eq!(collect_bodies(&path, 1), bodies);
    }

    #[test]
    fn it_queues_detached_messages_as_released() {
        let path = path(2, LIMITS);
        send(&path, 1, 0, b"buffered");
        for body in [&b"first"[..], b"second"] {
            let detached = path.detached_buffer();
            let mut archive = detached.acquire(1, PacketMask::NONE, 4);
            archive.extend_from_slice(body);
            path.release(archive, true);
        }
        assert_eq!(path.queues[1].approx_len(), 2);
        assert_eq!(path.bytes_sent_to(1), 8 + 5 + 6);
        assert_eq!(path.counters.sent_to(1), 3);
        assert_eq!(
            collect_bodies(&path, 1),
            vec![b"first".to_vec(), b"second".to_vec(), b"buffered".to_vec()]
        );
    }

    #[test]
    fn it_flushes_buffers_of_exited_threads() {
        let path = path(2, LIMITS);
        let handles = (0..4u8)
            .map(|t| {
                let path = path.clone();
                thread::spawn(move || {
                    for i in 0..50u8 {
                        send(&path, 1, t, &[t, i]);
                    }
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().for_each(|h| h.join().unwrap());

        assert!(lock(&path.buffers).is_empty());
        assert_eq!(path.bytes_sent_to(1), 4 * 50 * 2);
        let mut per_thread = vec![Vec::new(); 4];
        for body in collect_bodies(&path, 1) {
            per_thread[body[0] as usize].push(body[1]);
        }
        for seen in per_thread {
            assert_eq!(seen, (0..50).collect::<Vec<_>>());
        }
    }
}
