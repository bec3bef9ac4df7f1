use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{ensure, Result};
use clap::Args;
use rmi::{
    async_trait,
    fiber::group::FiberGroup,
    handler::{CallContext, Function, Method, RemoteFunction, RemoteMethod},
    DistObject, DistributedControl,
};
use tracing::{info, instrument};

const HELP_HEADING: &str = "Workload options";

#[derive(Args, Clone, Debug)]
pub struct Workload {
    /// Fibers issuing requests on each node.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 8)]
    pub fibers: usize,

    /// Requests each fiber issues.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 1250)]
    pub requests: u64,
}

#[derive(RemoteFunction, Default)]
struct AddOne;

#[async_trait]
impl Function for AddOne {
    type Args = u64;
    type Output = u64;

    async fn call(&self, _ctx: &CallContext, x: u64) -> anyhow::Result<u64> {
        Ok(x + 1)
    }
}

#[derive(Default)]
struct Tally(AtomicU64);

#[derive(RemoteMethod, Default)]
struct Deposit;

#[async_trait]
impl Method for Deposit {
    type Object = Tally;
    type Args = u64;
    type Output = ();

    async fn call(&self, tally: &Tally, _ctx: &CallContext, amount: u64) -> anyhow::Result<()> {
        tally.0.fetch_add(amount, Ordering::Relaxed);
        Ok(())
    }
}

impl Workload {
    /// Runs every phase on one node. All nodes must run it together.
    #[instrument(skip_all, fields(procid = dc.procid()))]
    pub async fn run(&self, dc: &DistributedControl) -> Result<()> {
        self.requests_phase(dc).await?;
        self.deposit_phase(dc).await?;
        Ok(())
    }

    /// Each node's fibers ask the next node to increment numbers.
    async fn requests_phase(&self, dc: &DistributedControl) -> Result<()> {
        let next = ((dc.procid() as usize + 1) % dc.numprocs()) as u16;
        let group = FiberGroup::new(dc.fibers());
        let answered = Arc::new(AtomicU64::new(0));
        for fiber in 0..self.fibers as u64 {
            let dc = dc.clone();
            let answered = answered.clone();
            let requests = self.requests;
            group.launch(async move {
                for i in 0..requests {
                    let x = fiber * requests + i;
                    let y = dc.remote_request::<AddOne>(next, &x).await?;
                    ensure!(y == x + 1, "node {next} answered {y} for {x}");
                    answered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })?;
        }
        group.join().await?;

        let mut total = answered.load(Ordering::Relaxed);
        dc.all_reduce(&mut total, |acc, other| *acc += other).await?;
        info!(answered = total, "requests complete");
        Ok(())
    }

    /// Every node deposits into every node's tally, then checks the sums.
    async fn deposit_phase(&self, dc: &DistributedControl) -> Result<()> {
        let tally = DistObject::new(dc, Tally::default());
        tally.remote_call_many::<Deposit>(0..dc.numprocs() as u16, &(dc.procid() as u64 + 1))?;
        tally.full_barrier().await?;

        let n = dc.numprocs() as u64;
        let local = tally.owner().0.load(Ordering::Relaxed);
        ensure!(local == n * (n + 1) / 2, "tally holds {local}");

        let mut total = local;
        tally.all_reduce(&mut total, |acc, other| *acc += other).await?;
        info!(
            local,
            total,
            calls = tally.calls_received(),
            "deposits complete"
        );
        Ok(())
    }
}
