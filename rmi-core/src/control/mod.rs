//! Distributed control: one node's membership in a session.
//!
//! A [`DistributedControl`] owns the node's links, send path, handler queues,
//! fiber workers and outstanding-request table. It is cheap to clone; every
//! clone refers to the same session.
//!
//! # Features:
//! - **Calls**: [`remote_call`](DistributedControl::remote_call),
//!   [`remote_request`](DistributedControl::remote_request) and
//!   [`future_remote_request`](DistributedControl::future_remote_request) of
//!   free [`Function`]s, and the same on the methods of a [`DistObject`].
//!   [`remote_call_many`](DistributedControl::remote_call_many) sends one
//!   call to a set of nodes, encoding its arguments once.
//! - **Collectives**: barrier, full barrier, broadcast, gather, all-gather and
//!   all-reduce, session wide or per distributed object.
//! - **Ordering**: calls issued under the same sequentialization key run in
//!   send order on the receiver. The key belongs to the innermost
//!   [`with_sequentialization_key`](DistributedControl::with_sequentialization_key)
//!   scope, else to the calling fiber, else to the calling OS thread. Plain
//!   tokio tasks share OS threads, so they only carry a key inside a scope.
//! - **Statistics**: calls and bytes sent and received, logged again at
//!   shutdown.
//!
//! ```
//! use rmi::{async_trait, config::Config, DistributedControl};
//! use rmi::handler::{CallContext, Function, RemoteFunction};
//!
//! #[derive(RemoteFunction, Default)]
//! struct AddOne;
//!
//! #[async_trait]
//! impl Function for AddOne {
//!     type Args = u64;
//!     type Output = u64;
//!
//!     async fn call(&self, _ctx: &CallContext, x: u64) -> anyhow::Result<u64> {
//!         Ok(x + 1)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let nodes = DistributedControl::in_memory(&Config::default(), 2).await?;
//! assert_eq!(nodes[0].remote_request::<AddOne>(1, &41).await?, 42);
//! futures::future::try_join_all(nodes.iter().map(|dc| dc.shutdown())).await?;
//! # Ok(())
//! # }
//! ```
use std::{
    cell::Cell,
    future::Future,
    io,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{select, sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, warn, Instrument};

use crate::{
    buffer::thread_local::{SendLimits, SendPath},
    common::lock,
    config::Config,
    dispatch::{multiplexer::Multiplexer, DispatchTable, HandlerId},
    fiber::{self, panic_message, FiberControl},
    handler::{CallContext, Function, Result, RpcError},
    packet::{Packet, PacketMask, ProcId},
    serializer::{Serializable, Serializer},
    stream::{
        receive::receive_loop,
        send::{BufferedStreamSender, SenderState},
    },
    transport::{in_memory::InMemoryNetwork, DynamicTransport, Links, Transport},
};

pub(crate) mod collective;
pub mod counters;
pub mod object;
pub mod reply;

pub use collective::BRANCH_FACTOR;
use counters::CallCounters;
pub use object::{DistObject, ObjectId};
use object::{ObjectCore, ObjectRegistry};
use reply::{encode_reply, ReplyTable, RequestFuture};

thread_local! {
    static THREAD_KEY: Cell<u8> = const { Cell::new(0) };
}

tokio::task_local! {
    static TASK_KEY: Cell<u8>;
}

/// Whether the caller runs under a tokio runtime, where one OS thread is
/// shared by many tasks.
fn in_runtime() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

fn current_key() -> u8 {
    if let Ok(key) = TASK_KEY.try_with(Cell::get) {
        return key;
    }
    match fiber::current() {
        Some(fiber) => fiber.sequentialization_key.load(Ordering::Relaxed),
        None if in_runtime() => 0,
        None => THREAD_KEY.with(Cell::get),
    }
}

/// The key for an outgoing call, and whether it must bypass the calling
/// thread's buffer. A keyed task scope may move between threads at any
/// `.await`, so its calls are queued one by one to keep their order.
fn issuing_key() -> (u8, bool) {
    match TASK_KEY.try_with(Cell::get) {
        Ok(key) => (key, key != 0),
        Err(_) => (current_key(), false),
    }
}

fn replace_key(key: u8) -> u8 {
    if let Ok(previous) = TASK_KEY.try_with(|current| current.replace(key)) {
        return previous;
    }
    match fiber::current() {
        Some(fiber) => fiber.sequentialization_key.swap(key, Ordering::Relaxed),
        None if in_runtime() => {
            warn!(
                key,
                "sequentialization key set in a task outside with_sequentialization_key; ignored"
            );
            0
        }
        None => THREAD_KEY.with(|current| current.replace(key)),
    }
}

/// Session state shared by every handle, task and handler of one node.
pub(crate) struct Session {
    pub(crate) procid: ProcId,
    pub(crate) numprocs: usize,
    pub(crate) config: Config,
    pub(crate) serializer: Serializer,
    pub(crate) fibers: FiberControl,
    pub(crate) send: Arc<SendPath>,
    senders: Vec<Arc<SenderState>>,
    pub(crate) multiplexer: Multiplexer,
    pub(crate) replies: ReplyTable,
    pub(crate) objects: ObjectRegistry,
    pub(crate) counters: Arc<CallCounters>,
    pub(crate) network_bytes_received: AtomicU64,
    failed: Vec<AtomicBool>,
    peers_changed: Notify,
    pub(crate) shutdown: CancellationToken,
    expect_close: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Carries the session-wide collectives. Always object 0.
    services: Arc<ObjectCore>,
}

impl Session {
    /// The serializer for a packet's arguments and reply.
    pub(crate) fn serializer_for(&self, mask: PacketMask) -> Serializer {
        if mask.contains(PacketMask::POD) {
            Serializer::Postcard
        } else {
            self.serializer
        }
    }

    pub(crate) fn ensure_peer(&self, target: ProcId) -> Result<()> {
        let Some(failed) = self.failed.get(target as usize) else {
            return Err(RpcError::UnknownPeer {
                target,
                numprocs: self.numprocs,
            });
        };
        if failed.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionLost { peer: target });
        }
        Ok(())
    }

    fn first_failed_peer(&self) -> Option<ProcId> {
        self.failed
            .iter()
            .position(|failed| failed.load(Ordering::SeqCst))
            .map(|peer| peer as ProcId)
    }

    /// Builds one packet to `target` in the calling thread's buffer, or in a
    /// detached one queued on release.
    fn write<F>(
        &self,
        target: ProcId,
        mask: PacketMask,
        (key, detached): (u8, bool),
        object: Option<&ObjectCore>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        self.ensure_peer(target)?;
        let buffer = if detached {
            self.send.detached_buffer()
        } else {
            self.send.local_buffer()
        };
        let mut archive = buffer.acquire(target, mask, key);
        body(&mut *archive)?;
        let counted = !mask.is_control() && !mask.contains(PacketMask::REPLY);
        if counted {
            if let Some(counters) = object.and_then(ObjectCore::counters) {
                counters.inc_sent(target);
            }
        }
        self.send.release(archive, counted);
        Ok(())
    }

    /// Sends a call of handler `id`. `handle` turns it into a request.
    pub(crate) fn issue<A: Serialize + ?Sized>(
        &self,
        target: ProcId,
        mut mask: PacketMask,
        object: Option<&ObjectCore>,
        id: HandlerId,
        handle: Option<u64>,
        args: &A,
    ) -> Result<()> {
        if object.is_some() {
            mask |= PacketMask::METHOD;
        }
        if handle.is_some() {
            mask |= PacketMask::REQUEST | PacketMask::FLUSH;
        }
        let key = if mask.is_control() { (0, false) } else { issuing_key() };
        let serializer = self.serializer_for(mask);
        self.write(target, mask, key, object, |buf| {
            buf.put_u64_le(id.0);
            if let Some(object) = object {
                buf.put_u32_le(object.id());
            }
            if let Some(handle) = handle {
                buf.put_u64_le(handle);
            }
            serializer
                .serialize_into(buf, args)
                .map_err(RpcError::Serialization)
        })
    }

    /// Sends one call of handler `id` to every node in `targets`. The body is
    /// encoded once and copied into each target's buffer.
    pub(crate) fn issue_many<A: Serialize + ?Sized>(
        &self,
        targets: impl IntoIterator<Item = ProcId>,
        mut mask: PacketMask,
        object: Option<&ObjectCore>,
        id: HandlerId,
        args: &A,
    ) -> Result<()> {
        let targets = targets.into_iter().collect::<Vec<_>>();
        for &target in &targets {
            self.ensure_peer(target)?;
        }
        if object.is_some() {
            mask |= PacketMask::METHOD;
        }
        let mut body = BytesMut::new();
        body.put_u64_le(id.0);
        if let Some(object) = object {
            body.put_u32_le(object.id());
        }
        self.serializer_for(mask)
            .serialize_into(&mut body, args)
            .map_err(RpcError::Serialization)?;
        let body = body.freeze();

        let key = if mask.is_control() { (0, false) } else { issuing_key() };
        for target in targets {
            self.write(target, mask, key, object, |buf| {
                buf.extend_from_slice(&body);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Sends a request of handler `id` and returns its pending reply.
    pub(crate) fn request<T: DeserializeOwned, A: Serialize + ?Sized>(
        &self,
        target: ProcId,
        mask: PacketMask,
        object: Option<&ObjectCore>,
        id: HandlerId,
        args: &A,
    ) -> Result<RequestFuture<T>> {
        self.ensure_peer(target)?;
        let (handle, slot) = self.replies.register(target);
        // A failure reported between the check above and the registration
        // would never reach this handle.
        if let Err(err) = self
            .ensure_peer(target)
            .and_then(|()| self.issue(target, mask, object, id, Some(handle), args))
        {
            self.replies.cancel(handle);
            return Err(err);
        }
        Ok(RequestFuture::new(slot, self.serializer_for(mask)))
    }

    /// Runs one received packet to completion.
    ///
    /// # Panics
    ///
    /// A body too short for its mask or a handler id unknown to this binary
    /// means the peers run different builds, which is fatal.
    pub(crate) async fn execute(self: &Arc<Self>, packet: Packet) {
        let header = packet.header;
        let source = header.src;
        if header.mask.contains(PacketMask::REPLY) {
            self.replies.deliver(source, packet.body);
            return;
        }

        let mut body = packet.body;
        let needed = 8
            + if header.mask.contains(PacketMask::METHOD) { 4 } else { 0 }
            + if header.mask.contains(PacketMask::REQUEST) { 8 } else { 0 };
        if body.len() < needed {
            error!(source, mask = ?header.mask, len = body.len(), "call body too short");
            panic!("call of {} bytes from node {source} is malformed", body.len());
        }
        let id = HandlerId(body.get_u64_le());
        let object_id = header
            .mask
            .contains(PacketMask::METHOD)
            .then(|| body.get_u32_le());
        let handle = header
            .mask
            .contains(PacketMask::REQUEST)
            .then(|| body.get_u64_le());

        let Some(entry) = DispatchTable::global().lookup(id) else {
            error!(source, ?id, "call to an unregistered handler");
            panic!("node {source} called handler {id:?}, which is not registered here");
        };

        let object = match object_id {
            None => None,
            Some(object_id) => match self.objects.wait_for(object_id).await {
                Some(core) => Some(core),
                None => {
                    warn!(source, object = object_id, handler = entry.name, "call to a destroyed object");
                    if !header.mask.is_control() {
                        self.counters.inc_received(source);
                    }
                    if let Some(handle) = handle {
                        let result = Err(anyhow!("object {object_id} no longer exists"));
                        self.send_reply(source, handle, &result);
                    }
                    return;
                }
            },
        };

        let ctx = CallContext {
            dc: DistributedControl {
                inner: self.clone(),
            },
            header,
            object: object.clone(),
        };
        let result = match AssertUnwindSafe((entry.dispatch)(ctx, body))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("handler {} panicked: {}", entry.name, panic_message(&*panic))),
        };
        if let (Err(err), None) = (&result, handle) {
            warn!(source, handler = entry.name, "remote call failed: {err:#}");
        }

        if !header.mask.is_control() {
            self.counters.inc_received(source);
            if let Some(counters) = object.as_deref().and_then(ObjectCore::counters) {
                counters.inc_received(source);
            }
        }
        if let Some(handle) = handle {
            self.send_reply(source, handle, &result);
        }
    }

    fn send_reply(&self, target: ProcId, handle: u64, result: &anyhow::Result<Bytes>) {
        let mask = PacketMask::CONTROL | PacketMask::REPLY | PacketMask::FLUSH | PacketMask::POD;
        let sent = self.write(target, mask, (0, false), None, |buf| {
            encode_reply(buf, handle, result);
            Ok(())
        });
        if let Err(err) = sent {
            debug!(target, handle, %err, "reply not sent");
        }
    }

    /// Records that the link to `peer` is gone and fails every request
    /// waiting on it.
    pub(crate) fn connection_closed(&self, peer: ProcId, error: Option<io::Error>) {
        if self.failed[peer as usize].swap(true, Ordering::SeqCst) {
            return;
        }
        let expected = self.expect_close.load(Ordering::SeqCst) || self.shutdown.is_cancelled();
        match (error, expected) {
            (Some(err), false) => warn!(peer, %err, "connection failed"),
            (None, false) => warn!(peer, "connection closed unexpectedly"),
            (_, true) => debug!(peer, "connection closed"),
        }
        self.replies.fail_peer(peer);
        self.peers_changed.notify_waiters();
    }

    /// Waits until `ready` holds, re-checking it whenever `notify` fires.
    ///
    /// Fails as soon as any peer is lost or the session shuts down, since a
    /// collective could never complete without it. Once the session is
    /// closing, peers that already left are expected and ignored.
    pub(crate) async fn wait_until<F>(&self, notify: &Notify, mut ready: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        loop {
            let notified = notify.notified();
            let peers_changed = self.peers_changed.notified();
            tokio::pin!(notified, peers_changed);
            notified.as_mut().enable();
            peers_changed.as_mut().enable();

            if ready() {
                return Ok(());
            }
            if !self.expect_close.load(Ordering::SeqCst) {
                if let Some(peer) = self.first_failed_peer() {
                    return Err(RpcError::ConnectionLost { peer });
                }
            }
            if self.shutdown.is_cancelled() {
                return Err(RpcError::Shutdown);
            }
            select! {
                _ = notified => {}
                _ = peers_changed => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }
}

/// A handle to this node's session.
#[derive(Clone)]
pub struct DistributedControl {
    pub(crate) inner: Arc<Session>,
}

impl DistributedControl {
    /// Joins the session described by `config` over its configured
    /// transport.
    pub async fn init(config: &Config) -> anyhow::Result<Self> {
        Self::with_transport(config, DynamicTransport::from_config(config)?).await
    }

    /// Creates a session of `numprocs` nodes inside this process, connected
    /// by in-memory pipes. Returns the nodes in procid order.
    pub async fn in_memory(config: &Config, numprocs: usize) -> anyhow::Result<Vec<Self>> {
        ensure!(numprocs > 0, "a session needs at least one node");
        let network = InMemoryNetwork::new(numprocs, config.receive_buffer_size);
        let nodes = network.into_iter().map(|transport| {
            let config = config.for_procid(transport.procid());
            async move { Self::with_transport(&config, transport).await }
        });
        futures::future::try_join_all(nodes).await
    }

    /// Joins a session over `transport`. Returns once every node has joined.
    pub async fn with_transport<T: Transport>(config: &Config, transport: T) -> anyhow::Result<Self> {
        let Links { procid, links } = transport.connect().await?;
        let numprocs = links.len();
        ensure!(
            (procid as usize) < numprocs,
            "procid {procid} is outside a session of {numprocs} nodes"
        );

        let fibers = FiberControl::new(config.fiber_workers())?;
        let counters = Arc::new(CallCounters::new(numprocs));
        let send = Arc::new(SendPath::new(
            procid,
            numprocs,
            counters.clone(),
            SendLimits {
                full_buffer_size_limit: config.full_buffer_size_limit,
                num_full_buffer_limit: config.num_full_buffer_limit,
                initial_capacity: config.receive_buffer_size,
            },
        ));
        let objects = ObjectRegistry::default();
        let services = objects.register(Arc::new(()), None);
        let session = Arc::new(Session {
            procid,
            numprocs,
            config: config.clone(),
            serializer: Serializer::from(config),
            fibers,
            send,
            senders: (0..numprocs).map(|_| Default::default()).collect(),
            multiplexer: Multiplexer::new(numprocs, config.handler_threads()),
            replies: ReplyTable::default(),
            objects,
            counters,
            network_bytes_received: AtomicU64::new(0),
            failed: (0..numprocs).map(|_| AtomicBool::new(false)).collect(),
            peers_changed: Notify::new(),
            shutdown: CancellationToken::new(),
            expect_close: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            services,
        });

        if let Err(err) = session.multiplexer.start_handlers(&session) {
            session.fibers.shutdown();
            bail!("could not start handler fibers: {err}");
        }

        let poll_timeout = Duration::from_micros(config.send_poll_timeout_us);
        let mut tasks = Vec::with_capacity(2 * numprocs);
        for (peer, link) in links.into_iter().enumerate() {
            let peer = peer as ProcId;
            let sender = BufferedStreamSender::new(
                peer,
                session.send.clone(),
                session.senders[peer as usize].clone(),
                poll_timeout,
            );
            let sending = {
                let session = session.clone();
                async move {
                    if let Err(err) = sender.run(link.writer, session.shutdown.clone()).await {
                        session.connection_closed(peer, Some(err));
                    }
                }
            };
            tasks.push(tokio::spawn(
                sending.instrument(debug_span!("sender", procid, peer)),
            ));
            tasks.push(tokio::spawn(receive_loop(session.clone(), peer, link.reader)));
        }
        *lock(&session.tasks) = tasks;

        let dc = Self { inner: session };
        dc.barrier().await?;
        info!(procid, numprocs, handlers = DispatchTable::global().len(), "joined session");
        Ok(dc)
    }

    pub fn procid(&self) -> ProcId {
        self.inner.procid
    }

    pub fn numprocs(&self) -> usize {
        self.inner.numprocs
    }

    /// The session's fiber workers.
    pub fn fibers(&self) -> &FiberControl {
        &self.inner.fibers
    }

    pub fn serializer(&self) -> Serializer {
        self.inner.serializer
    }

    /// Runs `F` on `target` without waiting for it.
    pub fn remote_call<F: Function>(&self, target: ProcId, args: &F::Args) -> Result<()> {
        self.inner
            .issue(target, PacketMask::NONE, None, F::id(), None, args)
    }

    /// Runs `F` on every node in `targets` without waiting for it. The
    /// arguments are encoded once; each target counts as one call sent.
    ///
    /// Nothing is sent if any target is unknown or lost.
    pub fn remote_call_many<F: Function>(
        &self,
        targets: impl IntoIterator<Item = ProcId>,
        args: &F::Args,
    ) -> Result<()> {
        self.inner
            .issue_many(targets, PacketMask::NONE, None, F::id(), args)
    }

    /// Like [`Self::remote_call`], but dispatched immediately on arrival and
    /// not counted.
    pub fn control_call<F: Function>(&self, target: ProcId, args: &F::Args) -> Result<()> {
        self.inner.issue(
            target,
            PacketMask::CONTROL | PacketMask::FLUSH,
            None,
            F::id(),
            None,
            args,
        )
    }

    /// Runs `F` on `target` and returns the pending result.
    pub fn future_remote_request<F: Function>(
        &self,
        target: ProcId,
        args: &F::Args,
    ) -> Result<RequestFuture<F::Output>> {
        self.inner
            .request(target, PacketMask::NONE, None, F::id(), args)
    }

    /// Runs `F` on `target` and waits for its result.
    pub async fn remote_request<F: Function>(&self, target: ProcId, args: &F::Args) -> Result<F::Output> {
        self.future_remote_request::<F>(target, args)?.await
    }

    /// Waits until every node has entered the barrier.
    pub async fn barrier(&self) -> Result<()> {
        collective::barrier(self, &self.inner.services).await
    }

    /// A barrier that also waits for every call issued before it, on any
    /// node, to have completed.
    pub async fn full_barrier(&self) -> Result<()> {
        collective::full_barrier(self, &self.inner.services, &self.inner.counters).await
    }

    pub async fn broadcast<V: Serializable>(&self, value: &mut V, is_originator: bool) -> Result<()> {
        collective::broadcast(self, &self.inner.services, value, is_originator).await
    }

    pub async fn gather<V: Serializable>(&self, local: &V, root: ProcId) -> Result<Option<Vec<V>>> {
        collective::gather(self, &self.inner.services, local, root).await
    }

    pub async fn all_gather<V: Serializable>(&self, local: &V) -> Result<Vec<V>> {
        collective::all_gather(self, &self.inner.services, local).await
    }

    pub async fn all_reduce<V, F>(&self, value: &mut V, combine: F) -> Result<()>
    where
        V: Serializable,
        F: Fn(&mut V, V) + Send + Sync,
    {
        collective::all_reduce(self, &self.inner.services, value, combine).await
    }

    /// Counted calls issued by this node.
    pub fn calls_sent(&self) -> u64 {
        self.inner.counters.calls_sent()
    }

    /// Counted calls from any node that have completed here.
    pub fn calls_received(&self) -> u64 {
        self.inner.counters.calls_received()
    }

    /// Payload bytes committed to the send buffers. Counted when a message is
    /// released, before it reaches the network.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.send.bytes_sent()
    }

    /// Payload bytes of data calls received.
    pub fn bytes_received(&self) -> u64 {
        self.inner.multiplexer.bytes_received()
    }

    /// Bytes written to the links, headers included.
    pub fn network_bytes_sent(&self) -> u64 {
        self.inner
            .senders
            .iter()
            .map(|sender| sender.network_bytes_sent())
            .sum()
    }

    /// Bytes read from the links, headers included.
    pub fn network_bytes_received(&self) -> u64 {
        self.inner.network_bytes_received.load(Ordering::Relaxed)
    }

    /// The session's call counters.
    pub fn counters(&self) -> &Arc<CallCounters> {
        &self.inner.counters
    }

    /// Waits until everything released before the call has been written to
    /// the links.
    pub async fn flush(&self) -> Result<()> {
        let session = &self.inner;
        let flushes = (0..session.numprocs as ProcId).map(|target| async move {
            match session.senders[target as usize].flush(&session.send, target).await {
                true => Ok(()),
                false => Err(RpcError::ConnectionLost { peer: target }),
            }
        });
        futures::future::try_join_all(flushes).await?;
        Ok(())
    }

    /// Asks every sender to write out its buffers without waiting for it.
    pub fn flush_soon(&self) {
        for target in 0..self.numprocs() as ProcId {
            self.inner.send.flush_soon(target);
        }
    }

    /// The key calls issued from the calling scope, fiber or thread are
    /// tagged with.
    pub fn get_sequentialization_key() -> u8 {
        current_key()
    }

    /// Tags subsequent calls from the calling scope, fiber or thread with
    /// `key`. Returns the previous key.
    ///
    /// In a tokio task outside of any
    /// [`with_sequentialization_key`](Self::with_sequentialization_key)
    /// scope there is nothing to hold the key: it is ignored and 0 is
    /// returned.
    pub fn set_sequentialization_key(key: u8) -> u8 {
        replace_key(key)
    }

    /// Moves the calling scope, fiber or thread to the next key, wrapping
    /// past zero. Returns the previous key.
    pub fn new_sequentialization_key() -> u8 {
        let next = current_key().wrapping_add(1).max(1);
        replace_key(next)
    }

    /// Runs `fut` with its own sequentialization key, starting at `key`.
    ///
    /// The key follows `fut` across `.await`s and worker threads and is
    /// invisible to every other task. Calls issued with the same key from
    /// one scope run in send order on the receiver.
    ///
    /// ```
    /// use rmi::DistributedControl;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let key = DistributedControl::with_sequentialization_key(3, async {
    ///     tokio::task::yield_now().await;
    ///     DistributedControl::new_sequentialization_key();
    ///     DistributedControl::get_sequentialization_key()
    /// })
    /// .await;
    /// assert_eq!(key, 4);
    /// assert_eq!(DistributedControl::get_sequentialization_key(), 0);
    /// # }
    /// ```
    pub async fn with_sequentialization_key<F: Future>(key: u8, fut: F) -> F::Output {
        TASK_KEY.scope(Cell::new(key), fut).await
    }

    /// Leaves the session in an orderly way.
    ///
    /// Every node must call this. It returns once all calls issued anywhere
    /// have completed and the links are closed.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        ensure!(
            !fiber::in_fiber(),
            "a session cannot be shut down from one of its own fibers"
        );
        let session = &self.inner;
        self.full_barrier().await?;
        session.expect_close.store(true, Ordering::SeqCst);
        self.barrier().await?;
        if let Err(err) = self.flush().await {
            debug!(%err, "flush at shutdown incomplete");
        }

        session.shutdown.cancel();
        let tasks = std::mem::take(&mut *lock(&session.tasks));
        for task in tasks {
            if let Err(err) = task.await {
                debug!(%err, "session task ended abnormally");
            }
        }
        let abandoned = session.replies.outstanding();
        if abandoned > 0 {
            debug!(abandoned, "failing requests still outstanding at shutdown");
        }
        session.replies.fail_all(|_| RpcError::Shutdown);

        info!(
            procid = session.procid,
            calls_sent = self.calls_sent(),
            calls_received = self.calls_received(),
            bytes_sent = self.bytes_sent(),
            bytes_received = self.bytes_received(),
            network_bytes_sent = self.network_bytes_sent(),
            network_bytes_received = self.network_bytes_received(),
            "left session"
        );

        let fibers = session.fibers.clone();
        tokio::task::spawn_blocking(move || fibers.shutdown()).await?;
        Ok(())
    }

    /// Drops out of the session at once, as if the node had crashed.
    ///
    /// Links are closed without flushing, so peers see the connection fail.
    /// Pending local requests fail with [`RpcError::Shutdown`].
    pub fn abort(&self) {
        let session = &self.inner;
        warn!(procid = session.procid, "aborting session");
        session.expect_close.store(true, Ordering::SeqCst);
        session.shutdown.cancel();
        for task in lock(&session.tasks).drain(..) {
            task.abort();
        }
        session.replies.fail_all(|_| RpcError::Shutdown);
        session.peers_changed.notify_waiters();
    }

    /// Whether the link to `peer` has failed or closed.
    pub fn is_peer_lost(&self, peer: ProcId) -> bool {
        self.inner
            .failed
            .get(peer as usize)
            .map_or(false, |failed| failed.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn it_wraps_sequentialization_keys_past_zero() {
        std::thread::spawn(|| {
            assert_eq!(DistributedControl::get_sequentialization_key(), 0);
            assert_eq!(DistributedControl::new_sequentialization_key(), 0);
            assert_eq!(DistributedControl::get_sequentialization_key(), 1);
            assert_eq!(DistributedControl::set_sequentialization_key(255), 1);
            assert_eq!(DistributedControl::new_sequentialization_key(), 255);
            assert_eq!(DistributedControl::get_sequentialization_key(), 1);
        })
        .join()
        .unwrap();
    }

    #[tokio::test]
    async fn it_keeps_a_tasks_key_from_other_tasks() {
        assert_eq!(DistributedControl::set_sequentialization_key(5), 0);
        assert_eq!(DistributedControl::get_sequentialization_key(), 0);

        let (set_tx, set_rx) = tokio::sync::oneshot::channel();
        let (read_tx, read_rx) = tokio::sync::oneshot::channel();
        let keyed = tokio::spawn(DistributedControl::with_sequentialization_key(0, async move {
            DistributedControl::set_sequentialization_key(7);
            set_tx.send(()).unwrap();
            read_rx.await.unwrap();
            DistributedControl::get_sequentialization_key()
        }));
        let other = tokio::spawn(async move {
            set_rx.await.unwrap();
            let key = DistributedControl::get_sequentialization_key();
            read_tx.send(()).unwrap();
            key
        });

        assert_eq!(other.await.unwrap(), 0);
        assert_eq!(keyed.await.unwrap(), 7);
        assert_eq!(DistributedControl::get_sequentialization_key(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn it_carries_a_scoped_key_across_awaits() {
        let keys = DistributedControl::with_sequentialization_key(200, async {
            let mut keys = Vec::new();
            for _ in 0..100 {
                tokio::task::yield_now().await;
                keys.push(DistributedControl::get_sequentialization_key());
            }
            keys
        })
        .await;
        assert!(keys.iter().all(|&key| key == 200));
    }

    #[test]
    fn it_scopes_keys_to_the_calling_fiber() {
        let fibers = FiberControl::new(1).unwrap();
        let group = fiber::group::FiberGroup::new(&fibers);
        DistributedControl::set_sequentialization_key(9);
        for key in 1..=4u8 {
            group
                .launch(async move {
                    anyhow::ensure!(DistributedControl::get_sequentialization_key() == 0);
                    DistributedControl::set_sequentialization_key(key);
                    fiber::yield_now().await;
                    anyhow::ensure!(DistributedControl::get_sequentialization_key() == key);
                    Ok(())
                })
                .unwrap();
        }
        group.join_blocking().unwrap();
        assert_eq!(DistributedControl::get_sequentialization_key(), 9);
        fibers.shutdown();
    }
}
