//! Collective operations over a distributed object.
//!
//! All nodes must enter the same collectives on the same object in the same
//! order. Nothing checks this at runtime.
//!
//! # Implementation details
//!
//! Barriers and the data-carrying tree collectives run over a tree with
//! branching factor [`BRANCH_FACTOR`] rooted at node 0: node `p` has parent
//! `(p - 1) / BRANCH_FACTOR` and children `p * BRANCH_FACTOR + 1 ..`. A node
//! reports to its parent once all of its children have reported, and the root
//! sends the release back down the tree. Arrival counters are indexed by a
//! sense bit that flips on every entry, so the same state serves consecutive
//! epochs without a reset: a child cannot arrive for epoch `k + 1` before its
//! parent has released epoch `k`.
//!
//! All tree traffic uses control calls, which are dispatched on arrival and
//! never counted. [`full_barrier`] builds on this: the nodes exchange their
//! per-destination sent counters with [`all_gather`], each waits until it has
//! completed every call addressed to it, and the round repeats until no node
//! sent anything new while waiting.
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use tokio::sync::Notify;
use tracing::error;

use super::{counters::CallCounters, object::ObjectCore, DistributedControl};
use crate::{
    common::lock,
    handler::{CallContext, Function, RemoteFunction, RemoteHandler, Result, RpcError},
    packet::{PacketMask, ProcId},
    serializer::{Serializable, Serializer},
};

pub const BRANCH_FACTOR: usize = 128;

const TREE_MASK: PacketMask = PacketMask::from_bits(
    PacketMask::CONTROL.bits() | PacketMask::FLUSH.bits() | PacketMask::POD.bits(),
);

fn parent(procid: ProcId) -> Option<ProcId> {
    (procid > 0).then(|| ((procid as usize - 1) / BRANCH_FACTOR) as ProcId)
}

fn children(procid: ProcId, numprocs: usize) -> Range<usize> {
    let first = (procid as usize * BRANCH_FACTOR + 1).min(numprocs);
    let last = (first + BRANCH_FACTOR).min(numprocs);
    first..last
}

struct BarrierState {
    sense: bool,
    arrived: [usize; 2],
    released: Option<bool>,
}

struct TreeState {
    sense: bool,
    arrived: [Vec<Bytes>; 2],
    result: Option<(bool, Bytes)>,
}

/// Per-object collective state.
pub(crate) struct CollectiveState {
    barrier: Mutex<BarrierState>,
    barrier_changed: Notify,
    tree: Mutex<TreeState>,
    tree_changed: Notify,
    broadcast: Mutex<Option<Bytes>>,
    gather: SkipMap<(u64, ProcId), Bytes>,
    gather_round: AtomicU64,
}

impl Default for CollectiveState {
    fn default() -> Self {
        Self {
            barrier: Mutex::new(BarrierState {
                sense: false,
                arrived: [0; 2],
                released: None,
            }),
            barrier_changed: Notify::new(),
            tree: Mutex::new(TreeState {
                sense: false,
                arrived: [Vec::new(), Vec::new()],
                result: None,
            }),
            tree_changed: Notify::new(),
            broadcast: Mutex::new(None),
            gather: SkipMap::new(),
            gather_round: AtomicU64::new(0),
        }
    }
}

#[derive(RemoteFunction, Default)]
#[rmi(internal)]
struct BarrierArrive;

#[async_trait]
impl Function for BarrierArrive {
    type Args = bool;
    type Output = ();

    async fn call(&self, ctx: &CallContext, sense: bool) -> anyhow::Result<()> {
        let state = &ctx.object_core()?.collective;
        lock(&state.barrier).arrived[sense as usize] += 1;
        state.barrier_changed.notify_waiters();
        Ok(())
    }
}

#[derive(RemoteFunction, Default)]
#[rmi(internal)]
struct BarrierRelease;

#[async_trait]
impl Function for BarrierRelease {
    type Args = bool;
    type Output = ();

    async fn call(&self, ctx: &CallContext, sense: bool) -> anyhow::Result<()> {
        release_barrier(ctx.dc(), ctx.object_core()?, sense)?;
        Ok(())
    }
}

fn release_barrier(dc: &DistributedControl, core: &ObjectCore, sense: bool) -> Result<()> {
    let state = &core.collective;
    lock(&state.barrier).released = Some(sense);
    state.barrier_changed.notify_waiters();
    for child in children(dc.procid(), dc.numprocs()) {
        dc.inner.issue(
            child as ProcId,
            TREE_MASK,
            Some(core),
            BarrierRelease::id(),
            None,
            &sense,
        )?;
    }
    Ok(())
}

/// Waits until every node has entered the barrier.
pub(crate) async fn barrier(dc: &DistributedControl, core: &ObjectCore) -> Result<()> {
    let session = &dc.inner;
    let state = &core.collective;
    let sense = {
        let mut barrier = lock(&state.barrier);
        barrier.sense = !barrier.sense;
        barrier.sense
    };

    let expected = children(dc.procid(), dc.numprocs()).len();
    session
        .wait_until(&state.barrier_changed, || {
            let mut barrier = lock(&state.barrier);
            let arrived = &mut barrier.arrived[sense as usize];
            let complete = *arrived >= expected;
            if complete {
                *arrived -= expected;
            }
            complete
        })
        .await?;

    match parent(dc.procid()) {
        None => release_barrier(dc, core, sense)?,
        Some(parent) => session.issue(
            parent,
            TREE_MASK,
            Some(core),
            BarrierArrive::id(),
            None,
            &sense,
        )?,
    }

    session
        .wait_until(&state.barrier_changed, || {
            lock(&state.barrier).released == Some(sense)
        })
        .await
}

#[derive(RemoteFunction, Default)]
#[rmi(internal)]
struct TreeArrive;

#[async_trait]
impl Function for TreeArrive {
    type Args = (bool, Bytes);
    type Output = ();

    async fn call(&self, ctx: &CallContext, (sense, data): (bool, Bytes)) -> anyhow::Result<()> {
        let state = &ctx.object_core()?.collective;
        lock(&state.tree).arrived[sense as usize].push(data);
        state.tree_changed.notify_waiters();
        Ok(())
    }
}

#[derive(RemoteFunction, Default)]
#[rmi(internal)]
struct TreeRelease;

#[async_trait]
impl Function for TreeRelease {
    type Args = (bool, Bytes);
    type Output = ();

    async fn call(&self, ctx: &CallContext, (sense, data): (bool, Bytes)) -> anyhow::Result<()> {
        release_tree(ctx.dc(), ctx.object_core()?, sense, data)?;
        Ok(())
    }
}

fn release_tree(dc: &DistributedControl, core: &ObjectCore, sense: bool, data: Bytes) -> Result<()> {
    let state = &core.collective;
    let args = (sense, data.clone());
    lock(&state.tree).result = Some((sense, data));
    state.tree_changed.notify_waiters();
    for child in children(dc.procid(), dc.numprocs()) {
        dc.inner.issue(
            child as ProcId,
            TREE_MASK,
            Some(core),
            TreeRelease::id(),
            None,
            &args,
        )?;
    }
    Ok(())
}

/// Folds every node's contribution up the tree with `merge` and returns the
/// root's result on every node. `merge` receives this node's contribution
/// first, then those of its children.
async fn tree_collective<F>(
    dc: &DistributedControl,
    core: &ObjectCore,
    local: Bytes,
    merge: F,
) -> Result<Bytes>
where
    F: FnOnce(Vec<Bytes>) -> anyhow::Result<Bytes>,
{
    let session = &dc.inner;
    let state = &core.collective;
    let sense = {
        let mut tree = lock(&state.tree);
        tree.sense = !tree.sense;
        tree.sense
    };

    let expected = children(dc.procid(), dc.numprocs()).len();
    let mut parts = vec![local];
    session
        .wait_until(&state.tree_changed, || {
            let mut tree = lock(&state.tree);
            let arrived = &mut tree.arrived[sense as usize];
            if arrived.len() < expected {
                return false;
            }
            parts.extend(arrived.drain(..expected));
            true
        })
        .await?;
    let merged = merge(parts).map_err(RpcError::Serialization)?;

    match parent(dc.procid()) {
        None => release_tree(dc, core, sense, merged)?,
        Some(parent) => session.issue(
            parent,
            TREE_MASK,
            Some(core),
            TreeArrive::id(),
            None,
            &(sense, merged),
        )?,
    }

    let mut result = None;
    session
        .wait_until(&state.tree_changed, || match &lock(&state.tree).result {
            Some((released, data)) if *released == sense => {
                result = Some(data.clone());
                true
            }
            _ => false,
        })
        .await?;
    result.ok_or(RpcError::Shutdown)
}

fn encode<V: Serializable>(serializer: Serializer, value: &V) -> Result<Bytes> {
    serializer.to_bytes(value).map_err(RpcError::Serialization)
}

fn decode<V: Serializable>(serializer: Serializer, bytes: &[u8]) -> Result<V> {
    serializer.from_bytes(bytes).map_err(RpcError::Serialization)
}

/// Every node's `local`, indexed by node.
pub(crate) async fn all_gather<V: Serializable>(
    dc: &DistributedControl,
    core: &ObjectCore,
    local: &V,
) -> Result<Vec<V>> {
    let serializer = dc.inner.serializer;
    let contribution = vec![(dc.procid(), encode(serializer, local)?)];
    let local = encode(Serializer::Postcard, &contribution)?;
    let gathered = tree_collective(dc, core, local, |parts| {
        let mut all = Vec::new();
        for part in parts {
            all.extend(Serializer::Postcard.from_bytes::<Vec<(ProcId, Bytes)>>(&part)?);
        }
        Serializer::Postcard.to_bytes(&all)
    })
    .await?;

    let mut all: Vec<(ProcId, Bytes)> = decode(Serializer::Postcard, &gathered)?;
    all.sort_by_key(|(procid, _)| *procid);
    all.iter()
        .map(|(_, bytes)| decode(serializer, bytes))
        .collect()
}

/// Combines every node's `value` with `combine` and stores the result in
/// `value` on every node.
pub(crate) async fn all_reduce<V, F>(
    dc: &DistributedControl,
    core: &ObjectCore,
    value: &mut V,
    combine: F,
) -> Result<()>
where
    V: Serializable,
    F: Fn(&mut V, V) + Send + Sync,
{
    let serializer = dc.inner.serializer;
    let local = encode(serializer, &*value)?;
    let reduced = tree_collective(dc, core, local, |parts| {
        let mut parts = parts.into_iter();
        let first = parts.next().ok_or_else(|| anyhow!("no contribution to reduce"))?;
        let mut acc: V = serializer.from_bytes(&first)?;
        for part in parts {
            combine(&mut acc, serializer.from_bytes(&part)?);
        }
        serializer.to_bytes(&acc)
    })
    .await?;
    *value = decode(serializer, &reduced)?;
    Ok(())
}

#[derive(RemoteFunction, Default)]
#[rmi(internal)]
struct BroadcastValue;

#[async_trait]
impl Function for BroadcastValue {
    type Args = Bytes;
    type Output = ();

    async fn call(&self, ctx: &CallContext, value: Bytes) -> anyhow::Result<()> {
        *lock(&ctx.object_core()?.collective.broadcast) = Some(value);
        Ok(())
    }
}

/// Copies the originator's `value` to every node.
///
/// # Panics
///
/// A node that is not the originator but finds no broadcast value has been
/// paired with a different collective, which is fatal.
pub(crate) async fn broadcast<V: Serializable>(
    dc: &DistributedControl,
    core: &ObjectCore,
    value: &mut V,
    is_originator: bool,
) -> Result<()> {
    let session = &dc.inner;
    let serializer = session.serializer;
    if is_originator {
        let bytes = encode(serializer, &*value)?;
        let mut pending = Vec::with_capacity(dc.numprocs());
        for target in (0..dc.numprocs() as ProcId).filter(|&target| target != dc.procid()) {
            pending.push(session.request::<(), _>(
                target,
                PacketMask::POD,
                Some(core),
                BroadcastValue::id(),
                &bytes,
            )?);
        }
        futures::future::try_join_all(pending).await?;
    }
    barrier(dc, core).await?;

    if !is_originator {
        let Some(bytes) = lock(&core.collective.broadcast).take() else {
            error!(procid = dc.procid(), object = core.id(), "broadcast entered without an originator");
            panic!("node {} entered a broadcast no node originated", dc.procid());
        };
        *value = decode(serializer, &bytes)?;
    }
    barrier(dc, core).await
}

#[derive(RemoteFunction, Default)]
#[rmi(internal)]
struct GatherValue;

#[async_trait]
impl Function for GatherValue {
    type Args = (u64, Bytes);
    type Output = ();

    async fn call(&self, ctx: &CallContext, (round, value): (u64, Bytes)) -> anyhow::Result<()> {
        ctx.object_core()?
            .collective
            .gather
            .insert((round, ctx.source()), value);
        Ok(())
    }
}

/// Collects every node's `local` on `root`, indexed by node. Other nodes get
/// `None`.
///
/// # Panics
///
/// A missing contribution on the root means the nodes entered different
/// collectives, which is fatal.
pub(crate) async fn gather<V: Serializable>(
    dc: &DistributedControl,
    core: &ObjectCore,
    local: &V,
    root: ProcId,
) -> Result<Option<Vec<V>>> {
    let session = &dc.inner;
    session.ensure_peer(root)?;
    let serializer = session.serializer;
    let round = core.collective.gather_round.fetch_add(1, Ordering::SeqCst);
    let bytes = encode(serializer, local)?;
    if dc.procid() == root {
        core.collective.gather.insert((round, root), bytes);
    } else {
        session
            .request::<(), _>(root, PacketMask::POD, Some(core), GatherValue::id(), &(round, bytes))?
            .await?;
    }
    barrier(dc, core).await?;

    if dc.procid() != root {
        return Ok(None);
    }
    let mut values = Vec::with_capacity(dc.numprocs());
    for source in 0..dc.numprocs() as ProcId {
        let Some(entry) = core.collective.gather.remove(&(round, source)) else {
            error!(round, source, object = core.id(), "gather contribution missing");
            panic!("node {source} contributed nothing to gather round {round}");
        };
        values.push(decode(serializer, entry.value())?);
    }
    Ok(Some(values))
}

/// A barrier that also waits for every call counted in `counters` before it,
/// on any node, to have completed.
pub(crate) async fn full_barrier(
    dc: &DistributedControl,
    core: &ObjectCore,
    counters: &Arc<CallCounters>,
) -> Result<()> {
    let me = dc.procid() as usize;
    loop {
        let sent = counters.sent_snapshot();
        let all_sent = all_gather(dc, core, &sent).await?;
        let expected = all_sent.iter().map(|sent| sent[me]).collect::<Vec<_>>();
        {
            let _watch = counters.watch();
            dc.inner
                .wait_until(counters.received_notify(), || counters.received_at_least(&expected))
                .await?;
        }
        let mut changed = counters.sent_snapshot() != sent;
        all_reduce(dc, core, &mut changed, |any, changed| *any |= changed).await?;
        if !changed {
            break;
        }
    }
    barrier(dc, core).await
}
