use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
};

use anyhow::Result;
use futures::future::try_join_all;
use rmi::{
    async_trait,
    config::Config,
    consensus::AsyncConsensus,
    handler::{CallContext, Method, RemoteMethod},
    DistObject, DistributedControl,
};

const WORKERS: usize = 2;
const SEEDS: u32 = 10;
const HOPS: u32 = 20;

fn config() -> Config {
    Config {
        handler_threads: Some(2),
        fiber_workers: Some(2),
        ..Default::default()
    }
}

/// A node's share of a computation in which every item of work hops between
/// nodes until its hop count runs out.
#[derive(Default)]
struct Hops {
    queue: Mutex<VecDeque<u32>>,
    processed: AtomicU64,
    consensus: OnceLock<Weak<AsyncConsensus>>,
}

impl Hops {
    fn push(&self, hops: u32) {
        self.queue.lock().unwrap().push_back(hops);
        if let Some(consensus) = self.consensus.get().and_then(Weak::upgrade) {
            consensus.cancel();
        }
    }

    fn pop(&self) -> Option<u32> {
        self.queue.lock().unwrap().pop_front()
    }
}

#[derive(RemoteMethod, Default)]
struct Hop;

#[async_trait]
impl Method for Hop {
    type Object = Hops;
    type Args = u32;
    type Output = ();

    async fn call(&self, hops: &Hops, _ctx: &CallContext, remaining: u32) -> Result<()> {
        hops.push(remaining);
        Ok(())
    }
}

async fn worker(
    work: Arc<DistObject<Hops>>,
    consensus: Arc<AsyncConsensus>,
    cpu: usize,
) -> Result<()> {
    let process = |remaining: u32| -> Result<()> {
        work.owner().processed.fetch_add(1, Ordering::SeqCst);
        if remaining > 0 {
            let target = (work.procid() as usize + 1 + remaining as usize) % work.numprocs();
            work.remote_call::<Hop>(target as u16, &(remaining - 1))?;
        }
        Ok(())
    };
    loop {
        if let Some(remaining) = work.owner().pop() {
            process(remaining)?;
            continue;
        }
        let section = consensus.begin_done_critical_section(cpu);
        if let Some(remaining) = work.owner().pop() {
            section.cancel();
            process(remaining)?;
            continue;
        }
        if section.end().await? {
            return Ok(());
        }
    }
}

async fn run_node(dc: DistributedControl) -> Result<(u64, usize)> {
    let work = Arc::new(DistObject::new(&dc, Hops::default()));
    let consensus = Arc::new(AsyncConsensus::attached(&dc, WORKERS, &work));
    let _ = work.owner().consensus.set(Arc::downgrade(&consensus));
    for _ in 0..SEEDS {
        work.owner().push(HOPS);
    }
    dc.barrier().await?;

    let workers = (0..WORKERS).map(|cpu| tokio::spawn(worker(work.clone(), consensus.clone(), cpu)));
    for handle in try_join_all(workers).await? {
        handle?;
    }
    anyhow::ensure!(consensus.is_done());

    let leftover = work.owner().queue.lock().unwrap().len();
    let mut processed = work.owner().processed.load(Ordering::SeqCst);
    work.all_reduce(&mut processed, |acc, other| *acc += other).await?;
    Ok((processed, leftover))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_detects_termination_only_after_all_work_is_done() {
    let nodes = DistributedControl::in_memory(&config(), 3).await.unwrap();
    let results = try_join_all(nodes.iter().cloned().map(run_node)).await.unwrap();
    for (processed, leftover) in results {
        assert_eq!(processed, 3 * SEEDS as u64 * (HOPS as u64 + 1));
        assert_eq!(leftover, 0);
    }
    try_join_all(nodes.iter().map(|dc| dc.shutdown())).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_terminates_a_single_node() {
    let nodes = DistributedControl::in_memory(&config(), 1).await.unwrap();
    let results = run_node(nodes[0].clone()).await.unwrap();
    assert_eq!(results, (SEEDS as u64 * (HOPS as u64 + 1), 0));
    nodes[0].shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_wakes_a_worker_that_found_work() {
    let nodes = DistributedControl::in_memory(&config(), 1).await.unwrap();
    let consensus = AsyncConsensus::new(&nodes[0], 2);

    let section = consensus.begin_done_critical_section(0);
    consensus.cancel_one(0);
    assert!(!section.end().await.unwrap());

    let section = consensus.begin_done_critical_section(0);
    section.cancel();
    consensus.force_done();
    assert!(consensus.is_done());
    assert!(consensus.begin_done_critical_section(1).end().await.unwrap());

    consensus.reset();
    assert!(!consensus.is_done());
    drop(consensus);
    nodes[0].shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_runs_again_after_a_reset() {
    let nodes = DistributedControl::in_memory(&config(), 2).await.unwrap();
    let consensus = nodes
        .iter()
        .map(|dc| AsyncConsensus::new(dc, 1))
        .collect::<Vec<_>>();
    for _ in 0..3 {
        let done = try_join_all(
            consensus
                .iter()
                .map(|consensus| consensus.begin_done_critical_section(0).end()),
        )
        .await
        .unwrap();
        assert_eq!(done, [true, true]);

        try_join_all(nodes.iter().map(|dc| dc.barrier())).await.unwrap();
        consensus.iter().for_each(AsyncConsensus::reset);
        try_join_all(nodes.iter().map(|dc| dc.barrier())).await.unwrap();
    }
    drop(consensus);
    try_join_all(nodes.iter().map(|dc| dc.shutdown())).await.unwrap();
}
