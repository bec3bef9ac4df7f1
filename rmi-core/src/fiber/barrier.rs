//! A barrier for fibers.
//!
//! Waiting fibers deschedule themselves instead of blocking their worker. The
//! last fiber to arrive reschedules every other waiter with
//! [`FiberControl::schedule_tid`] and starts the next generation.
use std::sync::Mutex;

use super::{deschedule_self, get_tid, FiberControl, FiberError, FiberId};
use crate::common::lock;

struct BarrierState {
    arrived: usize,
    generation: u64,
    waiting: Vec<FiberId>,
}

pub struct FiberBarrier {
    fibers: FiberControl,
    parties: usize,
    state: Mutex<BarrierState>,
}

impl FiberBarrier {
    pub fn new(fibers: &FiberControl, parties: usize) -> Self {
        Self {
            fibers: fibers.clone(),
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                waiting: Vec::new(),
            }),
        }
    }

    /// Waits until `parties` fibers have called `wait` for the current
    /// generation. Returns `true` for exactly one fiber per generation, the
    /// last to arrive.
    pub async fn wait(&self) -> Result<bool, FiberError> {
        let me = get_tid().ok_or(FiberError::NotInFiber)?;
        let (generation, mut resume) = {
            let mut state = lock(&self.state);
            state.arrived += 1;
            if state.arrived == self.parties {
                state.arrived = 0;
                state.generation += 1;
                let waiting = std::mem::take(&mut state.waiting);
                drop(state);
                for fiber in waiting {
                    // A waiter is always descheduled before it can be listed.
                    self.fibers.schedule_tid(fiber);
                }
                return Ok(true);
            }

            let generation = state.generation;
            state.waiting.push(me);
            (generation, deschedule_self(state)?)
        };
        loop {
            resume.await;
            let state = lock(&self.state);
            if state.generation != generation {
                return Ok(false);
            }
            resume = deschedule_self(state)?;
        }
    }
}
