//! Joinable groups of fibers.
//!
//! A fiber body in a [`FiberGroup`] returns `anyhow::Result<()>`. Failures,
//! including panics, are captured as values when the fiber terminates and are
//! re-raised once by the joining context, which may be running on a different
//! OS thread than the failed fiber. Only the first failure is kept.
//!
//! ```
//! use rmi::fiber::{group::FiberGroup, FiberControl};
//!
//! # fn main() -> anyhow::Result<()> {
//! let fibers = FiberControl::new(2)?;
//! let group = FiberGroup::new(&fibers);
//! for i in 0..4 {
//!     group.launch(async move {
//!         anyhow::ensure!(i != 2, "fiber {i} failed");
//!         Ok(())
//!     })?;
//! }
//! let err = group.join_blocking().unwrap_err();
//! assert_eq!(err.to_string(), "fiber 2 failed");
//!
//! // The failure has been consumed.
//! group.join_blocking()?;
//! fibers.shutdown();
//! # Ok(())
//! # }
//! ```
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Condvar, Mutex},
};

use anyhow::anyhow;
use futures::FutureExt;
use tokio::sync::Notify;

use super::{in_fiber, panic_message, Affinity, FiberControl, FiberError, FiberId};
use crate::common::lock;

#[derive(Default)]
struct GroupState {
    running: usize,
    error: Option<anyhow::Error>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<GroupState>,
    done: Condvar,
    done_async: Notify,
}

impl Shared {
    fn finish(&self, result: anyhow::Result<()>) {
        let mut state = lock(&self.state);
        if let Err(err) = result {
            state.error.get_or_insert(err);
        }
        state.running -= 1;
        if state.running == 0 {
            self.done.notify_all();
            self.done_async.notify_waiters();
        }
    }

    fn take_result(state: &mut GroupState) -> anyhow::Result<()> {
        match state.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct FiberGroup {
    fibers: FiberControl,
    affinity: Affinity,
    shared: Arc<Shared>,
}

impl FiberGroup {
    pub fn new(fibers: &FiberControl) -> Self {
        Self {
            fibers: fibers.clone(),
            affinity: Affinity::all(),
            shared: Default::default(),
        }
    }

    /// Affinity of fibers launched from now on.
    pub fn set_affinity(&mut self, affinity: Affinity) {
        self.affinity = affinity;
    }

    pub fn affinity(&self) -> &Affinity {
        &self.affinity
    }

    /// Fibers launched by this group and not yet terminated.
    pub fn running_fibers(&self) -> usize {
        lock(&self.shared.state).running
    }

    pub fn launch<F>(&self, fiber: F) -> Result<FiberId, FiberError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        lock(&self.shared.state).running += 1;
        let shared = self.shared.clone();
        let body = async move {
            let result = match AssertUnwindSafe(fiber).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(anyhow!("fiber panicked: {}", panic_message(&*panic))),
            };
            shared.finish(result);
        };
        self.fibers.launch(body, &self.affinity).map_err(|err| {
            let mut state = lock(&self.shared.state);
            state.running -= 1;
            if state.running == 0 {
                self.shared.done.notify_all();
                self.shared.done_async.notify_waiters();
            }
            err
        })
    }

    /// Waits until every fiber of the group has terminated and returns the
    /// first failure captured since the last join.
    pub async fn join(&self) -> anyhow::Result<()> {
        loop {
            let done = self.shared.done_async.notified();
            tokio::pin!(done);
            done.as_mut().enable();
            {
                let mut state = lock(&self.shared.state);
                if state.running == 0 {
                    return Shared::take_result(&mut state);
                }
            }
            done.await;
        }
    }

    /// Blocking form of [`Self::join`] for contexts outside any fiber.
    pub fn join_blocking(&self) -> anyhow::Result<()> {
        if in_fiber() {
            return Err(FiberError::BlockingJoinInFiber.into());
        }
        let mut state = lock(&self.shared.state);
        while state.running > 0 {
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        Shared::take_result(&mut state)
    }
}
