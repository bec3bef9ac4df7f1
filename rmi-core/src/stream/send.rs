//! The per-peer sender.
//!
//! A [`BufferedStreamSender`] owns the write half of one connection. It wakes
//! when a release asks for a flush, when too many full buffers are queued for
//! its peer, or when the poll interval elapses, then moves everything pending
//! for the peer into its [`CircularIovecBuffer`] and writes it out with
//! vectored writes.
//!
//! Synchronous flushes are tracked with epochs: [`SenderState::flush`] bumps
//! the requested epoch, and the sender publishes each epoch it has fully
//! written. A round that serves a pending flush waits for archives currently
//! being written instead of skipping them.
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::watch,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use crate::{
    buffer::{iovec::CircularIovecBuffer, thread_local::SendPath},
    packet::ProcId,
};

/// Flush bookkeeping shared between a sender task and flushing callers.
pub(crate) struct SenderState {
    requested: AtomicU64,
    flushed: watch::Sender<u64>,
    closed: AtomicBool,
    network_bytes_sent: AtomicU64,
}

impl Default for SenderState {
    fn default() -> Self {
        Self {
            requested: AtomicU64::new(0),
            flushed: watch::channel(0).0,
            closed: AtomicBool::new(false),
            network_bytes_sent: AtomicU64::new(0),
        }
    }
}

impl SenderState {
    /// Waits until everything released before the call has been written.
    ///
    /// Returns `false` if the sender stopped first.
    pub(crate) async fn flush(&self, path: &SendPath, target: ProcId) -> bool {
        let mut flushed = self.flushed.subscribe();
        let epoch = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        path.flush_soon(target);
        // The sender publishes `u64::MAX` when it exits.
        let _ = flushed.wait_for(|done| *done >= epoch).await;
        !self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn network_bytes_sent(&self) -> u64 {
        self.network_bytes_sent.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.flushed.send_replace(u64::MAX);
    }
}

pub(crate) struct BufferedStreamSender {
    target: ProcId,
    path: Arc<SendPath>,
    state: Arc<SenderState>,
    poll_timeout: Duration,
}

impl BufferedStreamSender {
    pub(crate) fn new(
        target: ProcId,
        path: Arc<SendPath>,
        state: Arc<SenderState>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            target,
            path,
            state,
            poll_timeout,
        }
    }

    /// Serves the connection until `shutdown` fires or a write fails.
    ///
    /// Whatever is pending when `shutdown` fires is written before the write
    /// half is shut down.
    #[instrument(skip_all, fields(target = self.target), level = "debug")]
    pub(crate) async fn run<W>(self, mut writer: W, shutdown: CancellationToken) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut ring = CircularIovecBuffer::new();
        let result = async {
            loop {
                let stopping = select! {
                    biased;
                    _ = shutdown.cancelled() => true,
                    _ = self.path.wakeup(self.target).notified() => false,
                    _ = sleep(self.poll_timeout) => false,
                };
                self.drain(&mut ring, &mut writer, stopping).await?;
                if stopping {
                    trace!("sender stopping");
                    return writer.shutdown().await;
                }
            }
        }
        .await;
        self.state.close();
        result
    }

    async fn drain<W>(
        &self,
        ring: &mut CircularIovecBuffer,
        writer: &mut W,
        stopping: bool,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let epoch = self.state.requested.load(Ordering::SeqCst);
        let urgent = stopping || epoch > *self.state.flushed.borrow();
        for chunk in self.path.collect(self.target, urgent) {
            ring.write(chunk);
        }

        let wrote = !ring.is_empty();
        while !ring.is_empty() {
            let n = {
                let mut slices = Vec::new();
                ring.fill_transmit_descriptor(&mut slices);
                writer.write_vectored(&slices).await?
            };
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            ring.sent(n);
            self.state
                .network_bytes_sent
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        if wrote {
            writer.flush().await?;
        }

        self.state.flushed.send_if_modified(|flushed| {
            if epoch > *flushed {
                *flushed = epoch;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{
        buffer::thread_local::SendLimits,
        control::counters::CallCounters,
        packet::{PacketChunk, PacketMask},
    };

    fn send_path() -> Arc<SendPath> {
        Arc::new(SendPath::new(
            0,
            2,
            Arc::new(CallCounters::new(2)),
            SendLimits {
                full_buffer_size_limit: 1 << 20,
                num_full_buffer_limit: 64,
                initial_capacity: 4096,
            },
        ))
    }

    fn release(path: &Arc<SendPath>, body: &[u8], mask: PacketMask) {
        let local = path.local_buffer();
        let mut archive = local.acquire(1, mask, 1);
        archive.extend_from_slice(body);
        path.release(archive, true);
    }

    #[tokio::test]
    async fn it_writes_everything_released_before_flush() {
        let path = send_path();
        let state = Arc::new(SenderState::default());
        let (writer, mut reader) = tokio::io::duplex(1 << 16);
        let shutdown = CancellationToken::new();
        let sender = BufferedStreamSender::new(1, path.clone(), state.clone(), Duration::from_secs(60));
        let task = tokio::spawn(sender.run(writer, shutdown.clone()));

        for i in 0..100u8 {
            release(&path, &[i; 3], PacketMask::NONE);
        }
        assert!(state.flush(&path, 1).await);
        assert_eq!(state.network_bytes_sent(), 100 * (8 + 3));

        shutdown.cancel();
        task.await.unwrap().unwrap();
        let mut stream = Vec::new();
        reader.read_to_end(&mut stream).await.unwrap();
        let chunk = PacketChunk {
            source: 0,
            offset: 0,
            bytes: Bytes::from(stream),
        };
        let bodies = chunk.packets().map(|p| p.body[0]).collect::<Vec<_>>();
        assert_eq!(bodies, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn it_sends_flagged_calls_without_waiting_for_the_poll() {
        let path = send_path();
        let state = Arc::new(SenderState::default());
        let (writer, mut reader) = tokio::io::duplex(1 << 16);
        let shutdown = CancellationToken::new();
        let sender = BufferedStreamSender::new(1, path.clone(), state, Duration::from_secs(60));
        let task = tokio::spawn(sender.run(writer, shutdown.clone()));

        release(&path, b"ping", PacketMask::FLUSH);
        let mut frame = [0u8; 12];
        tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut frame))
            .await
            .expect("flagged call was sent promptly")
            .unwrap();
        assert_eq!(&frame[8..], b"ping");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn it_reports_closed_after_write_failure() {
        let path = send_path();
        let state = Arc::new(SenderState::default());
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);
        let sender = BufferedStreamSender::new(1, path.clone(), state.clone(), Duration::from_millis(1));
        let task = tokio::spawn(sender.run(writer, CancellationToken::new()));

        release(&path, b"lost", PacketMask::FLUSH);
        assert!(task.await.unwrap().is_err());
        assert!(!state.flush(&path, 1).await);
    }
}
