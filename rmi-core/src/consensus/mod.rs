//! Distributed termination detection.
//!
//! Work can move between nodes while a computation runs: a call from node A
//! may give node B new work after B's queues have drained. A node therefore
//! cannot stop when it runs out of local work. It can only stop once every
//! node is idle and no call is in flight anywhere.
//!
//! [`AsyncConsensus`] decides this without a coordinator. Each of the `ncpus`
//! local workers that runs out of work opens a
//! [`CriticalSection`](AsyncConsensus::begin_done_critical_section), checks
//! its queues one last time and then either cancels the section (it found
//! work) or ends it, which suspends the worker until termination or until new
//! work arrives and [`AsyncConsensus::cancel`] wakes it.
//!
//! # Implementation details
//!
//! A token circulates around the ring `0 → 1 → … → n-1 → 0`, and only moves
//! while its holder has all of its workers asleep. The token accumulates the
//! session-wide totals of counted calls sent and completed. Each holder adds
//! the change in its own counters since it last held the token, and stamps
//! itself as the last node to change the totals if there was any. When the
//! token comes back to the last node that changed it with no change in a
//! full round, every node has been asleep through that round. If the totals
//! also balance then no call is in flight, and termination is declared to
//! every node.
//!
//! The token and the termination notice travel as uncounted control calls.
//!
//! ```
//! use rmi::{config::Config, consensus::AsyncConsensus, DistributedControl};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let nodes = DistributedControl::in_memory(&Config::default(), 3).await?;
//! let consensus = nodes
//!     .iter()
//!     .map(|dc| AsyncConsensus::new(dc, 1))
//!     .collect::<Vec<_>>();
//!
//! // Every node is out of work straight away.
//! let done = futures::future::try_join_all(
//!     consensus
//!         .iter()
//!         .map(|consensus| consensus.begin_done_critical_section(0).end()),
//! )
//! .await?;
//! assert!(done.into_iter().all(|done| done));
//!
//! drop(consensus);
//! futures::future::try_join_all(nodes.iter().map(|dc| dc.shutdown())).await?;
//! # Ok(())
//! # }
//! ```
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::{
    common::lock,
    control::{counters::CallCounters, object::ObjectCore, DistObject, DistributedControl},
    handler::{CallContext, Method, RemoteHandler, RemoteMethod, Result},
    packet::{PacketMask, ProcId},
};

/// The circulating summary of counted calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub total_calls_sent: u64,
    pub total_calls_received: u64,
    /// The last node whose counters changed the totals.
    pub last_change: ProcId,
}

struct State {
    numactive: usize,
    /// Workers inside a critical section.
    critical: Vec<bool>,
    /// Workers suspended in [`CriticalSection::end`].
    sleeping: Vec<bool>,
    /// Bumped by every cancel that reaches a worker's critical section.
    cancelled: Vec<u64>,
    hastoken: bool,
    token: Token,
    last_calls_sent: u64,
    last_calls_received: u64,
    done: bool,
}

impl State {
    fn new(procid: ProcId, numprocs: usize, ncpus: usize) -> Self {
        Self {
            numactive: ncpus,
            critical: vec![false; ncpus],
            sleeping: vec![false; ncpus],
            cancelled: vec![0; ncpus],
            hastoken: procid == 0,
            token: Token {
                last_change: (numprocs - 1) as ProcId,
                ..Default::default()
            },
            last_calls_sent: 0,
            last_calls_received: 0,
            done: false,
        }
    }
}

/// The node-local half of an [`AsyncConsensus`].
pub struct ConsensusState {
    ncpus: usize,
    counters: Arc<CallCounters>,
    state: Mutex<State>,
    wakeups: Vec<Notify>,
}

impl ConsensusState {
    fn wake(&self, state: &mut State, cpu: usize) {
        if state.critical[cpu] {
            state.cancelled[cpu] += 1;
        }
        if state.sleeping[cpu] {
            state.sleeping[cpu] = false;
            state.numactive += 1;
            self.wakeups[cpu].notify_one();
        }
    }

    fn wake_all(&self, state: &mut State) {
        let was_idle = state.numactive == 0;
        for cpu in 0..self.ncpus {
            self.wake(state, cpu);
        }
        if was_idle && state.numactive > 0 && !state.done {
            debug!("waking");
        }
    }

    /// Completes the ring or forwards the token. The caller holds the token.
    fn pass_the_token(&self, state: &mut State, dc: &DistributedControl, core: &ObjectCore) -> Result<()> {
        let procid = dc.procid();
        let sent = self.counters.calls_sent();
        let received = self.counters.calls_received();
        let changed = sent != state.last_calls_sent || received != state.last_calls_received;
        if changed {
            state.token.total_calls_sent += sent - state.last_calls_sent;
            state.token.total_calls_received += received - state.last_calls_received;
            state.token.last_change = procid;
            state.last_calls_sent = sent;
            state.last_calls_received = received;
        } else if state.token.last_change == procid
            && state.token.total_calls_sent == state.token.total_calls_received
        {
            info!(
                procid,
                calls = state.token.total_calls_sent,
                "termination detected"
            );
            for peer in (0..dc.numprocs() as ProcId).filter(|&peer| peer != procid) {
                dc.inner.issue(peer, CONTROL, Some(core), ForceDone::id(), None, &())?;
            }
            state.done = true;
            self.wake_all(state);
            return Ok(());
        }

        let next = ((procid as usize + 1) % dc.numprocs()) as ProcId;
        debug!(
            from = procid,
            to = next,
            sent = state.token.total_calls_sent,
            received = state.token.total_calls_received,
            "passing token"
        );
        state.hastoken = false;
        dc.inner
            .issue(next, CONTROL, Some(core), ReceiveToken::id(), None, &state.token)
    }
}

const CONTROL: PacketMask = PacketMask::from_bits(PacketMask::CONTROL.bits() | PacketMask::FLUSH.bits() | PacketMask::POD.bits());

#[derive(RemoteMethod, Default)]
#[rmi(internal)]
struct ReceiveToken;

#[async_trait]
impl Method for ReceiveToken {
    type Object = ConsensusState;
    type Args = Token;
    type Output = ();

    async fn call(&self, consensus: &ConsensusState, ctx: &CallContext, token: Token) -> anyhow::Result<()> {
        let mut state = lock(&consensus.state);
        state.hastoken = true;
        state.token = token;
        debug!(from = ctx.source(), "token received");
        if state.numactive == 0 {
            consensus.pass_the_token(&mut state, ctx.dc(), ctx.object_core()?)?;
        }
        Ok(())
    }
}

#[derive(RemoteMethod, Default)]
#[rmi(internal)]
struct ForceDone;

#[async_trait]
impl Method for ForceDone {
    type Object = ConsensusState;
    type Args = ();
    type Output = ();

    async fn call(&self, consensus: &ConsensusState, _ctx: &CallContext, _args: ()) -> anyhow::Result<()> {
        let mut state = lock(&consensus.state);
        state.done = true;
        consensus.wake_all(&mut state);
        Ok(())
    }
}

/// Termination detection over a distributed object.
///
/// Every node must construct its consensus objects in the same order, like
/// any other distributed object.
pub struct AsyncConsensus {
    object: DistObject<ConsensusState>,
}

impl AsyncConsensus {
    /// Detects termination of `ncpus` local workers per node, judging
    /// in-flight work by every counted call of the session.
    ///
    /// Every node must construct its consensus before any node starts
    /// workers on it. A token reaching a node that has not built the object
    /// yet holds up every later packet from the sending node until it has.
    pub fn new(dc: &DistributedControl, ncpus: usize) -> Self {
        Self::with_counters(dc, ncpus, dc.counters().clone())
    }

    /// Like [`Self::new`], but only calls made through `attached` count as
    /// work.
    pub fn attached<T: Send + Sync + 'static>(
        dc: &DistributedControl,
        ncpus: usize,
        attached: &DistObject<T>,
    ) -> Self {
        Self::with_counters(dc, ncpus, attached.counters())
    }

    fn with_counters(dc: &DistributedControl, ncpus: usize, counters: Arc<CallCounters>) -> Self {
        let ncpus = ncpus.max(1);
        let state = ConsensusState {
            ncpus,
            counters,
            state: Mutex::new(State::new(dc.procid(), dc.numprocs(), ncpus)),
            wakeups: (0..ncpus).map(|_| Notify::new()).collect(),
        };
        Self {
            object: DistObject::with_counters(dc, Arc::new(state), None),
        }
    }

    fn consensus(&self) -> &ConsensusState {
        self.object.owner()
    }

    pub fn ncpus(&self) -> usize {
        self.consensus().ncpus
    }

    /// Whether termination has been declared.
    pub fn is_done(&self) -> bool {
        lock(&self.consensus().state).done
    }

    /// Opens worker `cpu`'s critical section. The worker must then check for
    /// work once more and resolve the section with
    /// [`CriticalSection::end`] if it found none, or
    /// [`CriticalSection::cancel`] if it did.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not below [`Self::ncpus`].
    pub fn begin_done_critical_section(&self, cpu: usize) -> CriticalSection<'_> {
        let mut state = lock(&self.consensus().state);
        state.critical[cpu] = true;
        CriticalSection {
            consensus: self,
            cpu,
            cancelled: state.cancelled[cpu],
        }
    }

    /// Signals new work: wakes every sleeping worker and makes every open
    /// critical section end without suspending.
    pub fn cancel(&self) {
        let consensus = self.consensus();
        let mut state = lock(&consensus.state);
        consensus.wake_all(&mut state);
    }

    /// Like [`Self::cancel`], for worker `cpu` only.
    pub fn cancel_one(&self, cpu: usize) {
        let consensus = self.consensus();
        let mut state = lock(&consensus.state);
        let was_idle = state.numactive == 0;
        consensus.wake(&mut state, cpu);
        if was_idle && state.numactive > 0 && !state.done {
            debug!(cpu, "waking");
        }
    }

    /// Declares termination on this node and wakes every worker.
    pub fn force_done(&self) {
        let consensus = self.consensus();
        let mut state = lock(&consensus.state);
        state.done = true;
        consensus.wake_all(&mut state);
    }

    /// Prepares for another round of detection. Every node must reset, with
    /// no worker inside a critical section, before any node starts again.
    pub fn reset(&self) {
        let consensus = self.consensus();
        let mut state = lock(&consensus.state);
        *state = State::new(self.object.procid(), self.object.numprocs(), consensus.ncpus);
    }
}

/// An open critical section of one worker.
///
/// Dropping it unresolved behaves like [`CriticalSection::cancel`].
#[must_use = "a critical section must be ended or cancelled"]
pub struct CriticalSection<'a> {
    consensus: &'a AsyncConsensus,
    cpu: usize,
    cancelled: u64,
}

impl CriticalSection<'_> {
    /// Suspends the worker until termination is declared or work arrives.
    ///
    /// Returns `true` on termination. `false` means the worker has been
    /// woken by a cancel and should look for work again.
    pub async fn end(self) -> Result<bool> {
        let object = &self.consensus.object;
        let consensus = object.owner();
        let cpu = self.cpu;
        {
            let mut state = lock(&consensus.state);
            if state.done {
                return Ok(true);
            }
            if state.cancelled[cpu] != self.cancelled {
                return Ok(false);
            }
            state.numactive -= 1;
            if state.numactive == 0 {
                info!(procid = object.procid(), "termination possible");
                if state.hastoken {
                    consensus.pass_the_token(&mut state, object.dc(), object.core())?;
                }
            }
            state.sleeping[cpu] = !state.done;
        }

        object
            .dc()
            .inner
            .wait_until(&consensus.wakeups[cpu], || {
                let state = lock(&consensus.state);
                !state.sleeping[cpu] || state.done
            })
            .await?;
        Ok(lock(&consensus.state).done)
    }

    /// Resolves the section after finding more work.
    pub fn cancel(self) {}
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        lock(&self.consensus.consensus().state).critical[self.cpu] = false;
    }
}
