//! Routing of received packets to handler queues.
//!
//! Control packets (barrier votes, consensus tokens) and replies run inline on
//! the receiving connection's task. Data calls are routed to one of the
//! session's handler queues, each drained by one handler fiber:
//!
//! - calls with sequentialization key 0 carry no ordering constraint and are
//!   striped round-robin over the queues, each launched as its own fiber;
//! - calls with key `k` always go to queue `k % n` and are run to completion
//!   one after another, which preserves their send order.
//!
//! Every packet's stream offset is checked against the next offset expected
//! for its key, so a packet can never be dispatched twice or ahead of an
//! earlier packet on the same key.
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use tokio::{select, sync::mpsc};
use tracing::{debug_span, error, Instrument};

use crate::{
    common::lock,
    control::Session,
    fiber::{Affinity, FiberError},
    packet::{Packet, PacketChunk, PacketMask, ProcId},
};

/// Next expected stream offset per sequentialization key, for one source.
pub(crate) struct KeyCursors {
    source: ProcId,
    next: [u64; 256],
}

impl KeyCursors {
    pub(crate) fn new(source: ProcId) -> Self {
        Self {
            source,
            next: [0; 256],
        }
    }

    /// # Panics
    ///
    /// A packet at or behind an offset already accepted for its key would be
    /// a duplicate or reordered delivery, which is fatal.
    fn accept(&mut self, packet: &Packet) {
        let key = packet.header.key as usize;
        if packet.offset < self.next[key] {
            error!(
                source = self.source,
                key,
                offset = packet.offset,
                expected = self.next[key],
                "packet delivered out of order"
            );
            panic!(
                "packet from node {} on key {key} at offset {} precedes expected offset {}",
                self.source, packet.offset, self.next[key]
            );
        }
        self.next[key] = packet.offset + packet.header.packet_len() as u64;
    }
}

/// A run of packets routed to one handler queue, in stream order.
pub(crate) struct CallBlock {
    packets: Vec<Packet>,
}

pub(crate) struct Multiplexer {
    queues: Vec<mpsc::UnboundedSender<CallBlock>>,
    receivers: std::sync::Mutex<Vec<mpsc::UnboundedReceiver<CallBlock>>>,
    /// Round-robin position for key 0, per source.
    stripes: Vec<AtomicUsize>,
    bytes_received: AtomicU64,
}

impl Multiplexer {
    pub(crate) fn new(numprocs: usize, handler_threads: usize) -> Self {
        let (queues, receivers) = (0..handler_threads.max(1))
            .map(|_| mpsc::unbounded_channel())
            .unzip();
        Self {
            queues,
            receivers: std::sync::Mutex::new(receivers),
            stripes: (0..numprocs).map(|source| AtomicUsize::new(source)).collect(),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub(crate) fn num_queues(&self) -> usize {
        self.queues.len()
    }

    /// Payload bytes of data calls received.
    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn queue_for(&self, source: ProcId, key: u8) -> usize {
        let n = self.queues.len();
        match key {
            0 => self.stripes[source as usize].fetch_add(1, Ordering::Relaxed) % n,
            key => key as usize % n,
        }
    }

    /// Dispatches the packets of `chunk`.
    pub(crate) async fn process(
        &self,
        session: &Arc<Session>,
        cursors: &mut KeyCursors,
        chunk: PacketChunk,
    ) {
        let mut blocks: Vec<Vec<Packet>> = vec![Vec::new(); self.queues.len()];
        for packet in chunk.packets() {
            cursors.accept(&packet);
            let mask = packet.header.mask;
            if mask.is_control() || mask.contains(PacketMask::REPLY) {
                session.execute(packet).await;
                continue;
            }
            self.bytes_received
                .fetch_add(packet.header.len as u64, Ordering::Relaxed);
            blocks[self.queue_for(packet.header.src, packet.header.key)].push(packet);
        }
        for (queue, packets) in self.queues.iter().zip(blocks) {
            if !packets.is_empty() {
                // Fails only once the handler fibers have stopped at shutdown.
                let _ = queue.send(CallBlock { packets });
            }
        }
    }

    /// Launches one handler fiber per queue, pinned round-robin to the fiber
    /// workers.
    pub(crate) fn start_handlers(&self, session: &Arc<Session>) -> Result<(), FiberError> {
        let receivers = std::mem::take(&mut *lock(&self.receivers));
        let workers = session.fibers.num_workers();
        for (index, receiver) in receivers.into_iter().enumerate() {
            let worker = index % workers;
            let fiber = handler_loop(session.clone(), worker, receiver)
                .instrument(debug_span!("handler", procid = session.procid, index));
            session.fibers.launch(fiber, &Affinity::single(worker))?;
        }
        Ok(())
    }
}

async fn handler_loop(
    session: Arc<Session>,
    worker: usize,
    mut receiver: mpsc::UnboundedReceiver<CallBlock>,
) {
    loop {
        let block = select! {
            biased;
            _ = session.shutdown.cancelled() => return,
            block = receiver.recv() => match block {
                Some(block) => block,
                None => return,
            },
        };
        for packet in block.packets {
            if packet.header.key == 0 {
                let call = {
                    let session = session.clone();
                    async move { session.execute(packet).await }
                };
                if let Err(err) = session.fibers.launch(call, &Affinity::single(worker)) {
                    error!(%err, "could not launch call fiber");
                    return;
                }
            } else {
                session.execute(packet).await;
            }
        }
    }
}
