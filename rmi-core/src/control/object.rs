//! Distributed objects.
//!
//! A [`DistObject`] is one instance of a type per node, registered under the
//! same [`ObjectId`] everywhere because every node constructs its objects in
//! the same order. Method calls addressed to the id run against the target
//! node's instance. Each object keeps its own call counters, so
//! [`DistObject::full_barrier`] only waits for calls made through it.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use rmi::{async_trait, DistObject, DistributedControl};
//! use rmi::handler::{CallContext, Method, RemoteMethod};
//!
//! #[derive(Default)]
//! struct Counter(AtomicU64);
//!
//! #[derive(RemoteMethod, Default)]
//! struct Add;
//!
//! #[async_trait]
//! impl Method for Add {
//!     type Object = Counter;
//!     type Args = u64;
//!     type Output = u64;
//!
//!     async fn call(&self, counter: &Counter, _ctx: &CallContext, by: u64) -> anyhow::Result<u64> {
//!         Ok(counter.0.fetch_add(by, Ordering::SeqCst) + by)
//!     }
//! }
//!
//! # async fn run(dc: DistributedControl) -> anyhow::Result<()> {
//! let counter = DistObject::new(&dc, Counter::default());
//! let next = (dc.procid() as usize + 1) % dc.numprocs();
//! counter.remote_call::<Add>(next as u16, &1)?;
//! counter.full_barrier().await?;
//! assert_eq!(counter.owner().0.load(Ordering::SeqCst), 1);
//! # Ok(())
//! # }
//! ```
use std::{
    any::Any,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use tokio::sync::Notify;

use super::{
    collective::{self, CollectiveState},
    counters::CallCounters,
    reply::RequestFuture,
    DistributedControl,
};
use crate::{
    handler::{Method, Result},
    packet::{PacketMask, ProcId},
    serializer::Serializable,
};

pub type ObjectId = u32;

/// The type-erased, node-local half of a distributed object.
pub struct ObjectCore {
    id: ObjectId,
    owner: Arc<dyn Any + Send + Sync>,
    counters: Option<Arc<CallCounters>>,
    pub(crate) collective: CollectiveState,
}

impl ObjectCore {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn owner<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.owner.clone().downcast::<T>().ok()
    }

    /// The object's own counters, if it keeps them apart from the session's.
    pub(crate) fn counters(&self) -> Option<&CallCounters> {
        self.counters.as_deref()
    }
}

/// Node-local index of distributed objects.
#[derive(Default)]
pub(crate) struct ObjectRegistry {
    next: AtomicU32,
    objects: DashMap<ObjectId, Arc<ObjectCore>>,
    registered: Notify,
}

impl ObjectRegistry {
    pub(crate) fn register(
        &self,
        owner: Arc<dyn Any + Send + Sync>,
        counters: Option<Arc<CallCounters>>,
    ) -> Arc<ObjectCore> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        let core = Arc::new(ObjectCore {
            id,
            owner,
            counters,
            collective: CollectiveState::default(),
        });
        self.objects.insert(id, core.clone());
        self.registered.notify_waiters();
        core
    }

    pub(crate) fn remove(&self, id: ObjectId) {
        self.objects.remove(&id);
    }

    /// Resolves `id`, waiting for the local instance to be constructed if
    /// the call overtook it. Returns `None` for an object already destroyed.
    pub(crate) async fn wait_for(&self, id: ObjectId) -> Option<Arc<ObjectCore>> {
        loop {
            let registered = self.registered.notified();
            tokio::pin!(registered);
            registered.as_mut().enable();
            if let Some(core) = self.objects.get(&id) {
                return Some(core.clone());
            }
            if id < self.next.load(Ordering::SeqCst) {
                return None;
            }
            registered.await;
        }
    }
}

/// A handle to one instance of `T` per node.
pub struct DistObject<T: Send + Sync + 'static> {
    dc: DistributedControl,
    core: Arc<ObjectCore>,
    owner: Arc<T>,
}

impl<T: Send + Sync + 'static> DistObject<T> {
    /// Registers `owner` as this node's instance of a new distributed object.
    ///
    /// Every node must construct its distributed objects in the same order.
    pub fn new(dc: &DistributedControl, owner: T) -> Self {
        let counters = Arc::new(CallCounters::new(dc.numprocs()));
        Self::with_counters(dc, Arc::new(owner), Some(counters))
    }

    /// `None` counts the object's calls with the session's counters only.
    pub(crate) fn with_counters(
        dc: &DistributedControl,
        owner: Arc<T>,
        counters: Option<Arc<CallCounters>>,
    ) -> Self {
        let core = dc.inner.objects.register(owner.clone(), counters);
        Self {
            dc: dc.clone(),
            core,
            owner,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.core.id
    }

    /// This node's instance.
    pub fn owner(&self) -> &Arc<T> {
        &self.owner
    }

    pub fn dc(&self) -> &DistributedControl {
        &self.dc
    }

    pub fn procid(&self) -> ProcId {
        self.dc.procid()
    }

    pub fn numprocs(&self) -> usize {
        self.dc.numprocs()
    }

    /// The counters calls through this object are tallied in.
    pub fn counters(&self) -> Arc<CallCounters> {
        self.core
            .counters
            .clone()
            .unwrap_or_else(|| self.dc.inner.counters.clone())
    }

    pub fn calls_sent(&self) -> u64 {
        self.counters().calls_sent()
    }

    pub fn calls_received(&self) -> u64 {
        self.counters().calls_received()
    }

    /// Runs `M` on `target`'s instance without waiting for it.
    pub fn remote_call<M: Method<Object = T>>(&self, target: ProcId, args: &M::Args) -> Result<()> {
        self.dc
            .inner
            .issue(target, PacketMask::NONE, Some(&self.core), M::id(), None, args)
    }

    /// Runs `M` on the instance of every node in `targets` without waiting
    /// for it. The arguments are encoded once.
    pub fn remote_call_many<M: Method<Object = T>>(
        &self,
        targets: impl IntoIterator<Item = ProcId>,
        args: &M::Args,
    ) -> Result<()> {
        self.dc
            .inner
            .issue_many(targets, PacketMask::NONE, Some(&self.core), M::id(), args)
    }

    /// Like [`Self::remote_call`], but dispatched immediately on arrival and
    /// not counted.
    pub fn control_call<M: Method<Object = T>>(&self, target: ProcId, args: &M::Args) -> Result<()> {
        self.dc.inner.issue(
            target,
            PacketMask::CONTROL | PacketMask::FLUSH,
            Some(&self.core),
            M::id(),
            None,
            args,
        )
    }

    /// Runs `M` on `target`'s instance and returns the pending result.
    pub fn future_remote_request<M: Method<Object = T>>(
        &self,
        target: ProcId,
        args: &M::Args,
    ) -> Result<RequestFuture<M::Output>> {
        self.dc
            .inner
            .request(target, PacketMask::NONE, Some(&self.core), M::id(), args)
    }

    /// Runs `M` on `target`'s instance and waits for its result.
    pub async fn remote_request<M: Method<Object = T>>(
        &self,
        target: ProcId,
        args: &M::Args,
    ) -> Result<M::Output> {
        self.future_remote_request::<M>(target, args)?.await
    }

    pub async fn barrier(&self) -> Result<()> {
        collective::barrier(&self.dc, &self.core).await
    }

    /// A barrier that also waits for every call made through this object
    /// before it, on any node, to have completed.
    pub async fn full_barrier(&self) -> Result<()> {
        collective::full_barrier(&self.dc, &self.core, &self.counters()).await
    }

    pub async fn broadcast<V: Serializable>(&self, value: &mut V, is_originator: bool) -> Result<()> {
        collective::broadcast(&self.dc, &self.core, value, is_originator).await
    }

    pub async fn gather<V: Serializable>(&self, local: &V, root: ProcId) -> Result<Option<Vec<V>>> {
        collective::gather(&self.dc, &self.core, local, root).await
    }

    pub async fn all_gather<V: Serializable>(&self, local: &V) -> Result<Vec<V>> {
        collective::all_gather(&self.dc, &self.core, local).await
    }

    pub async fn all_reduce<V, F>(&self, value: &mut V, combine: F) -> Result<()>
    where
        V: Serializable,
        F: Fn(&mut V, V) + Send + Sync,
    {
        collective::all_reduce(&self.dc, &self.core, value, combine).await
    }

    pub(crate) fn core(&self) -> &Arc<ObjectCore> {
        &self.core
    }
}

impl<T: Send + Sync + 'static> Drop for DistObject<T> {
    fn drop(&mut self) {
        self.dc.inner.objects.remove(self.core.id);
    }
}
