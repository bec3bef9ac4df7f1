//! A multi-producer, single-consumer queue built on an intrusive linked list.
//!
//! Producers append with a single atomic exchange on the tail pointer and
//! never take a lock. The consumer detaches everything enqueued so far in one
//! step with [`LockFreeQueue::dequeue_all`] and walks the batch in FIFO order.
//!
//! # Memory-ordering contract
//!
//! The list always starts at a heap-allocated sentinel node. `enqueue`
//! publishes a node in two steps: it swaps itself into `tail` (`AcqRel`) and
//! then stores itself into the previous node's `next` (`Release`). Between the
//! two steps the list is momentarily broken, so the consumer, after loading a
//! `next` pointer with `Acquire`, spins with [`Backoff`] while it observes a
//! null link in the middle of a batch. `dequeue_all` detaches a batch by
//! re-enqueueing the sentinel: every node enqueued before that exchange
//! belongs to the batch and ends with a link to the sentinel; every node
//! enqueued after it follows the sentinel and waits for the next batch.
//!
//! ```
//! use std::{sync::Arc, thread};
//! use rmi::buffer::lock_free::LockFreeQueue;
//!
//! let queue = Arc::new(LockFreeQueue::new());
//! let producers = (0..4)
//!     .map(|p| {
//!         let queue = queue.clone();
//!         thread::spawn(move || (0..100).for_each(|i| queue.enqueue(p * 100 + i)))
//!     })
//!     .collect::<Vec<_>>();
//! producers.into_iter().for_each(|p| p.join().unwrap());
//!
//! let mut all = queue.dequeue_all().collect::<Vec<_>>();
//! all.sort();
//! assert_eq!(all, (0..400).collect::<Vec<_>>());
//! ```
use std::{
    marker::PhantomData,
    ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use crossbeam::utils::{Backoff, CachePadded};

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

pub struct LockFreeQueue<T> {
    sentinel: *mut Node<T>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    len: AtomicUsize,
    consumer: Mutex<()>,
    _owns: PhantomData<Box<Node<T>>>,
}

// Values move between threads through the queue, and the raw pointers are only
// dereferenced under the protocol described in the module docs.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeQueue<T> {
    pub fn new() -> Self {
        let sentinel = Node::boxed(None);
        Self {
            sentinel,
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            len: AtomicUsize::new(0),
            consumer: Mutex::new(()),
            _owns: PhantomData,
        }
    }

    /// Appends `value`. Safe to call from any number of threads.
    pub fn enqueue(&self, value: T) {
        self.len.fetch_add(1, Ordering::Relaxed);
        self.link(Node::boxed(Some(value)));
    }

    fn link(&self, node: *mut Node<T>) {
        // SAFETY: `node` is either a freshly boxed node or the sentinel, whose
        // `next` only the consumer touches while it is detached.
        unsafe { (*node).next.store(ptr::null_mut(), Ordering::Relaxed) };
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` stays alive until the consumer has followed its link,
        // which cannot happen before this store.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Number of values enqueued and not yet drained. Approximate while
    /// producers are active.
    pub fn approx_len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        // SAFETY: the sentinel lives as long as `self`.
        unsafe { (*self.sentinel).next.load(Ordering::Acquire).is_null() }
    }

    /// Detaches every value enqueued so far.
    ///
    /// Consumers are serialized by a lock held for the lifetime of the batch;
    /// producers never touch it.
    pub fn dequeue_all(&self) -> Batch<'_, T> {
        let consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: the sentinel lives as long as `self`.
        let head = unsafe { (*self.sentinel).next.load(Ordering::Acquire) };
        if !head.is_null() {
            // The sentinel's link was already set, so the enqueue that set it
            // has completed and the sentinel is no longer the tail.
            // Re-enqueue it to mark the end of this batch.
            self.link(self.sentinel);
        }
        Batch {
            queue: self,
            cursor: head,
            _consumer: consumer,
        }
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        self.dequeue_all().for_each(drop);
        // SAFETY: allocated in `new`, and no batch can outlive `self`.
        unsafe { drop(Box::from_raw(self.sentinel)) };
    }
}

/// A detached run of values, yielded in enqueue order.
///
/// Dropping a batch drops the values not yet yielded.
pub struct Batch<'a, T> {
    queue: &'a LockFreeQueue<T>,
    cursor: *mut Node<T>,
    _consumer: MutexGuard<'a, ()>,
}

impl<T> Iterator for Batch<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.cursor.is_null() || self.cursor == self.queue.sentinel {
            return None;
        }
        let node = self.cursor;
        let backoff = Backoff::new();
        let next = loop {
            // SAFETY: `node` belongs to this batch and has not been freed.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if !next.is_null() {
                break next;
            }
            // A producer swapped the tail but has not linked its node yet.
            backoff.snooze();
        };
        // SAFETY: every batch node other than the sentinel was boxed by
        // `enqueue` and is visited exactly once.
        let mut node = unsafe { Box::from_raw(node) };
        self.cursor = next;
        self.queue.len.fetch_sub(1, Ordering::Relaxed);
        node.value.take()
    }
}

impl<T> Drop for Batch<'_, T> {
    fn drop(&mut self) {
        self.for_each(drop);
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn it_drains_in_fifo_order() {
        let queue = LockFreeQueue::new();
        assert!(queue.dequeue_all().next().is_none());
        for i in 0..10 {
            queue.enqueue(i);
        }
        assert_eq!(queue.approx_len(), 10);
        assert_eq!(queue.dequeue_all().collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());

        queue.enqueue(42);
        assert_eq!(queue.dequeue_all().collect::<Vec<_>>(), vec![42]);
        assert_eq!(queue.approx_len(), 0);
    }

    #[test]
    fn it_keeps_values_enqueued_after_detach_for_next_batch() {
        let queue = LockFreeQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        let first = queue.dequeue_all().collect::<Vec<_>>();
        queue.enqueue(3);
        assert_eq!(first, vec![1, 2]);
        assert_eq!(queue.dequeue_all().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn it_drops_undrained_values() {
        let marker = Arc::new(());
        {
            let queue = LockFreeQueue::new();
            for _ in 0..5 {
                queue.enqueue(marker.clone());
            }
            let mut batch = queue.dequeue_all();
            batch.next();
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn it_delivers_every_value_exactly_once_under_contention() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 20_000;

        let queue = Arc::new(LockFreeQueue::new());
        let handles = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.enqueue((p, i, vec![p as u8; 16]));
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        let mut last = vec![None; PRODUCERS];
        while seen.len() < PRODUCERS * PER_PRODUCER {
            for (p, i, payload) in queue.dequeue_all() {
                assert_eq!(payload, vec![p as u8; 16]);
                // Values from one producer arrive in enqueue order.
                assert!(last[p].map_or(true, |l| l < i));
                last[p] = Some(i);
                assert!(seen.insert((p, i)), "value {p}/{i} observed twice");
            }
        }
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert!(queue.dequeue_all().next().is_none());
    }
}
