//! A cooperative fiber scheduler.
//!
//! Fibers are futures multiplexed over a fixed pool of OS worker threads. Each
//! worker drives its own single-threaded runtime, so a fiber always runs on
//! the worker it was launched on and only gives the worker up at an `.await`.
//! Thousands of fibers blocked on remote replies cost one suspended future
//! each, not one OS thread each.
//!
//! # Features:
//! - [`FiberControl::launch`]: Starts a fiber on a worker chosen from its
//!   [`Affinity`] by comparing the load of two random candidates.
//! - [`deschedule_self`] and [`FiberControl::schedule_tid`]: Suspend the
//!   current fiber until another context explicitly reschedules it, releasing
//!   a caller-supplied lock guard in between.
//! - [`group::FiberGroup`]: Joins a set of fibers and re-raises the first
//!   failure captured from any of them.
//! - [`barrier::FiberBarrier`]: A barrier for fibers.
//!
//! # Lifecycle
//!
//! A fiber moves through `Runnable → Running → (Descheduled → Runnable)* →
//! Terminated`. Its descriptor is dropped when its body returns.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use rmi::fiber::{deschedule_self, get_tid, Affinity, FiberControl};
//!
//! # fn main() -> anyhow::Result<()> {
//! let fibers = FiberControl::new(2)?;
//! let parked = Arc::new(Mutex::new(None));
//! let (done_tx, done_rx) = std::sync::mpsc::channel();
//!
//! fibers.launch(
//!     {
//!         let parked = parked.clone();
//!         async move {
//!             let resume = {
//!                 let mut slot = parked.lock().unwrap();
//!                 *slot = get_tid();
//!                 // Releases the lock and parks until rescheduled.
//!                 deschedule_self(slot).unwrap()
//!             };
//!             resume.await;
//!             done_tx.send(()).unwrap();
//!         }
//!     },
//!     &Affinity::all(),
//! )?;
//!
//! let tid = loop {
//!     if let Some(tid) = *parked.lock().unwrap() {
//!         break tid;
//!     }
//!     std::thread::yield_now();
//! };
//! while !fibers.schedule_tid(tid) {
//!     std::thread::yield_now();
//! }
//! done_rx.recv()?;
//! fibers.shutdown();
//! # Ok(())
//! # }
//! ```
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use anyhow::Context as _;
use dashmap::DashMap;
use futures::FutureExt;
use thiserror::Error;
use tokio::{runtime, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::common::{lock, power_of_two_choices};

pub mod barrier;
pub mod group;

pub type FiberId = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    #[error("not running inside a fiber")]
    NotInFiber,
    #[error("affinity allows none of the {workers} workers")]
    EmptyAffinity { workers: usize },
    #[error("fiber scheduler is shut down")]
    Shutdown,
    #[error("blocking join attempted inside a fiber")]
    BlockingJoinInFiber,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    Runnable,
    Running,
    Descheduled,
    Terminated,
}

/// The set of workers a fiber may be placed on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Affinity {
    /// `None` allows every worker.
    mask: Option<Vec<u64>>,
}

impl Default for Affinity {
    fn default() -> Self {
        Self::all()
    }
}

impl Affinity {
    pub fn all() -> Self {
        Self { mask: None }
    }

    pub fn single(worker: usize) -> Self {
        Self::from_workers([worker])
    }

    pub fn from_workers(workers: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Vec::new();
        for worker in workers {
            let word = worker / 64;
            if mask.len() <= word {
                mask.resize(word + 1, 0);
            }
            mask[word] |= 1 << (worker % 64);
        }
        Self { mask: Some(mask) }
    }

    pub fn contains(&self, worker: usize) -> bool {
        match &self.mask {
            None => true,
            Some(mask) => mask
                .get(worker / 64)
                .map_or(false, |word| word & (1 << (worker % 64)) != 0),
        }
    }

    fn candidates(&self, workers: usize) -> impl Iterator<Item = usize> + '_ {
        (0..workers).filter(|&worker| self.contains(worker))
    }
}

/// Scheduler bookkeeping for one fiber.
pub struct FiberDescriptor {
    id: FiberId,
    worker: usize,
    state: Mutex<FiberState>,
    wakeup: Notify,
    pub(crate) sequentialization_key: AtomicU8,
}

impl FiberDescriptor {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn state(&self) -> FiberState {
        *lock(&self.state)
    }
}

tokio::task_local! {
    static CURRENT: Arc<FiberDescriptor>;
}

/// The descriptor of the fiber running on this task, if any.
pub(crate) fn current() -> Option<Arc<FiberDescriptor>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Whether the caller runs inside a fiber.
pub fn in_fiber() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}

/// The id of the calling fiber.
pub fn get_tid() -> Option<FiberId> {
    CURRENT.try_with(|fiber| fiber.id).ok()
}

/// Lets the other fibers of this worker run before continuing.
pub async fn yield_now() {
    tokio::task::yield_now().await
}

/// Marks the calling fiber descheduled, then releases `guard`.
///
/// The returned future completes once some other context calls
/// [`FiberControl::schedule_tid`] with this fiber's id. Because the state
/// changes before the guard is released, a waker that takes the same lock and
/// then reschedules the fiber can never be lost.
pub fn deschedule_self<G>(guard: G) -> Result<impl Future<Output = ()> + Send + 'static, FiberError> {
    let fiber = current().ok_or(FiberError::NotInFiber)?;
    *lock(&fiber.state) = FiberState::Descheduled;
    drop(guard);
    Ok(async move {
        fiber.wakeup.notified().await;
        *lock(&fiber.state) = FiberState::Running;
    })
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    fibers: DashMap<FiberId, Arc<FiberDescriptor>>,
    load: Vec<AtomicUsize>,
}

struct Inner {
    registry: Arc<Registry>,
    workers: Vec<runtime::Handle>,
    stop: CancellationToken,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// A pool of worker threads running fibers.
#[derive(Clone)]
pub struct FiberControl {
    inner: Arc<Inner>,
}

impl FiberControl {
    /// Starts `workers` worker threads.
    pub fn new(workers: usize) -> anyhow::Result<Self> {
        let workers = workers.max(1);
        let stop = CancellationToken::new();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let mut threads = Vec::with_capacity(workers);
        for worker in 0..workers {
            let stop = stop.clone();
            let handle_tx = handle_tx.clone();
            let thread = thread::Builder::new()
                .name(format!("rmi-fiber-{worker}"))
                .spawn(move || {
                    let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            error!(worker, %err, "failed to start fiber worker");
                            return;
                        }
                    };
                    if handle_tx.send((worker, runtime.handle().clone())).is_err() {
                        return;
                    }
                    runtime.block_on(stop.cancelled());
                    debug!(worker, "fiber worker stopped");
                })
                .context("failed to spawn fiber worker thread")?;
            threads.push(thread);
        }
        drop(handle_tx);

        let mut handles = vec![None; workers];
        for (worker, handle) in handle_rx {
            handles[worker] = Some(handle);
        }
        let Some(workers) = handles.into_iter().collect::<Option<Vec<_>>>() else {
            stop.cancel();
            anyhow::bail!("a fiber worker failed to start");
        };

        Ok(Self {
            inner: Arc::new(Inner {
                registry: Arc::new(Registry {
                    load: workers.iter().map(|_| AtomicUsize::new(0)).collect(),
                    ..Default::default()
                }),
                workers,
                stop,
                threads: Mutex::new(threads),
            }),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// Number of fibers launched and not yet terminated.
    pub fn num_fibers(&self) -> usize {
        self.inner.registry.fibers.len()
    }

    /// Launches `fiber` on a worker allowed by `affinity`.
    ///
    /// A panic in the fiber body terminates the fiber and is logged.
    pub fn launch<F>(&self, fiber: F, affinity: &Affinity) -> Result<FiberId, FiberError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.stop.is_cancelled() {
            return Err(FiberError::Shutdown);
        }
        let registry = &self.inner.registry;
        let worker = power_of_two_choices(affinity.candidates(self.num_workers()), |worker| {
            registry.load[worker].load(Ordering::Relaxed)
        })
        .ok_or(FiberError::EmptyAffinity {
            workers: self.num_workers(),
        })?;

        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let descriptor = Arc::new(FiberDescriptor {
            id,
            worker,
            state: Mutex::new(FiberState::Runnable),
            wakeup: Notify::new(),
            sequentialization_key: AtomicU8::new(0),
        });
        registry.fibers.insert(id, descriptor.clone());
        registry.load[worker].fetch_add(1, Ordering::Relaxed);

        let body = {
            let registry = registry.clone();
            let descriptor = descriptor.clone();
            async move {
                *lock(&descriptor.state) = FiberState::Running;
                let result = AssertUnwindSafe(fiber).catch_unwind().await;
                if let Err(panic) = result {
                    error!(fiber = id, panic = %panic_message(&*panic), "fiber panicked");
                }
                *lock(&descriptor.state) = FiberState::Terminated;
                registry.fibers.remove(&id);
                registry.load[worker].fetch_sub(1, Ordering::Relaxed);
            }
        };
        // The handle stays valid until the worker's runtime is dropped at
        // shutdown, after which spawned tasks are dropped unpolled.
        drop(self.inner.workers[worker].spawn(CURRENT.scope(descriptor, body)));
        Ok(id)
    }

    /// Makes a descheduled fiber runnable again.
    ///
    /// Returns `false` if `id` is unknown or the fiber is not descheduled.
    pub fn schedule_tid(&self, id: FiberId) -> bool {
        let Some(fiber) = self.inner.registry.fibers.get(&id).map(|f| f.clone()) else {
            return false;
        };
        let mut state = lock(&fiber.state);
        if *state != FiberState::Descheduled {
            return false;
        }
        *state = FiberState::Runnable;
        fiber.wakeup.notify_one();
        true
    }

    /// Stops every worker and waits for the threads to exit. Fibers that have
    /// not finished are dropped.
    ///
    /// Must not be called from a fiber of this scheduler.
    pub fn shutdown(&self) {
        self.inner.stop.cancel();
        let threads = std::mem::take(&mut *lock(&self.inner.threads));
        for thread in threads {
            if thread.join().is_err() {
                error!("fiber worker thread panicked");
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
