//! Per-peer call accounting.
//!
//! Every counted (non-control) call increments `calls_sent[target]` when it is
//! committed to a send buffer and `calls_received[source]` once its handler
//! has completed on the receiving node. The totals feed both
//! [`full_barrier`](crate::control::DistObject::full_barrier) and the
//! termination-detection token ring.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::packet::ProcId;

pub struct CallCounters {
    calls_sent: Vec<AtomicU64>,
    calls_received: Vec<AtomicU64>,
    watchers: AtomicUsize,
    received: Notify,
}

impl CallCounters {
    pub fn new(numprocs: usize) -> Self {
        Self {
            calls_sent: (0..numprocs).map(|_| AtomicU64::new(0)).collect(),
            calls_received: (0..numprocs).map(|_| AtomicU64::new(0)).collect(),
            watchers: AtomicUsize::new(0),
            received: Notify::new(),
        }
    }

    pub(crate) fn inc_sent(&self, target: ProcId) {
        self.calls_sent[target as usize].fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn inc_received(&self, source: ProcId) {
        self.calls_received[source as usize].fetch_add(1, Ordering::SeqCst);
        if self.watchers.load(Ordering::SeqCst) > 0 {
            self.received.notify_waiters();
        }
    }

    /// Total calls sent to all peers.
    pub fn calls_sent(&self) -> u64 {
        self.calls_sent.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    /// Total calls received from all peers and completed.
    pub fn calls_received(&self) -> u64 {
        self.calls_received.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    pub fn sent_to(&self, target: ProcId) -> u64 {
        self.calls_sent[target as usize].load(Ordering::SeqCst)
    }

    pub fn received_from(&self, source: ProcId) -> u64 {
        self.calls_received[source as usize].load(Ordering::SeqCst)
    }

    pub(crate) fn sent_snapshot(&self) -> Vec<u64> {
        self.calls_sent.iter().map(|c| c.load(Ordering::SeqCst)).collect()
    }

    /// Whether every peer's completed-call count has reached `expected`.
    pub(crate) fn received_at_least(&self, expected: &[u64]) -> bool {
        self.calls_received
            .iter()
            .zip(expected)
            .all(|(received, expected)| received.load(Ordering::SeqCst) >= *expected)
    }

    /// Enables wake-ups on [`Self::received_notify`] for the guard's lifetime.
    pub(crate) fn watch(&self) -> WatchGuard<'_> {
        self.watchers.fetch_add(1, Ordering::SeqCst);
        WatchGuard { counters: self }
    }

    pub(crate) fn received_notify(&self) -> &Notify {
        &self.received
    }
}

pub(crate) struct WatchGuard<'a> {
    counters: &'a CallCounters,
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.counters.watchers.fetch_sub(1, Ordering::SeqCst);
    }
}
