use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use futures::future::try_join_all;
use num_traits::Num;
use rmi::{
    async_trait,
    config::{Config, Serializer},
    handler::{CallContext, Function, Method, RemoteFunction, RemoteMethod},
    DistObject, DistributedControl,
};

fn config() -> Config {
    Config {
        handler_threads: Some(2),
        fiber_workers: Some(2),
        ..Default::default()
    }
}

async fn session(numprocs: usize) -> Vec<DistributedControl> {
    DistributedControl::in_memory(&config(), numprocs).await.unwrap()
}

async fn shutdown(nodes: &[DistributedControl]) {
    try_join_all(nodes.iter().map(|dc| dc.shutdown())).await.unwrap();
}

fn sum<T: Num + Copy>(acc: &mut T, other: T) {
    *acc = *acc + other;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_completes_consecutive_barriers() {
    let nodes = session(4).await;
    let arrived = AtomicU64::new(0);
    try_join_all(nodes.iter().map(|dc| {
        let arrived = &arrived;
        async move {
            for round in 1..=50u64 {
                arrived.fetch_add(1, Ordering::SeqCst);
                dc.barrier().await?;
                anyhow::ensure!(arrived.load(Ordering::SeqCst) >= 4 * round);
            }
            anyhow::Ok(())
        }
    }))
    .await
    .unwrap();
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_broadcasts_from_any_node() {
    let nodes = session(3).await;
    let values = try_join_all(nodes.iter().map(|dc| async move {
        let mut value = if dc.procid() == 2 {
            vec!["from".to_string(), "two".to_string()]
        } else {
            Vec::new()
        };
        dc.broadcast(&mut value, dc.procid() == 2).await?;
        anyhow::Ok(value)
    }))
    .await
    .unwrap();
    for value in values {
        assert_eq!(value, ["from", "two"]);
    }
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_gathers_at_the_root() {
    let nodes = session(3).await;
    for root in 0..3u16 {
        let gathered = try_join_all(nodes.iter().map(|dc| async move {
            dc.gather(&(dc.procid() as u32 * 10), root).await
        }))
        .await
        .unwrap();
        for (procid, gathered) in gathered.into_iter().enumerate() {
            if procid == root as usize {
                assert_eq!(gathered, Some(vec![0, 10, 20]));
            } else {
                assert_eq!(gathered, None);
            }
        }
    }
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_gathers_everywhere() {
    let nodes = session(4).await;
    let gathered = try_join_all(
        nodes
            .iter()
            .map(|dc| async move { dc.all_gather(&format!("node-{}", dc.procid())).await }),
    )
    .await
    .unwrap();
    for gathered in gathered {
        assert_eq!(gathered, ["node-0", "node-1", "node-2", "node-3"]);
    }
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_reduces_everywhere() {
    let nodes = session(3).await;
    let reduced = try_join_all(nodes.iter().map(|dc| async move {
        let mut count = dc.procid() as u64 + 1;
        dc.all_reduce(&mut count, sum).await?;
        let mut weight = 0.5f64 * (dc.procid() as f64 + 1.0);
        dc.all_reduce(&mut weight, sum).await?;
        let mut widest = dc.procid() as i32 - 1;
        dc.all_reduce(&mut widest, |acc: &mut i32, other| *acc = (*acc).max(other))
            .await?;
        anyhow::Ok((count, weight, widest))
    }))
    .await
    .unwrap();
    for reduced in reduced {
        assert_eq!(reduced, (6, 3.0, 1));
    }
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_runs_collectives_with_either_serializer() {
    let config = Config {
        serializer: Serializer::Cbor,
        ..config()
    };
    let nodes = DistributedControl::in_memory(&config, 2).await.unwrap();
    let gathered = try_join_all(nodes.iter().map(|dc| async move {
        dc.all_gather(&(dc.procid(), format!("{}", dc.procid()))).await
    }))
    .await
    .unwrap();
    assert_eq!(gathered[1], [(0u16, "0".to_string()), (1u16, "1".to_string())]);
    shutdown(&nodes).await;
}

static RELAYED: AtomicU64 = AtomicU64::new(0);

/// Forwards itself around the ring until its hop count runs out.
#[derive(RemoteFunction, Default)]
struct Relay;

#[async_trait]
impl Function for Relay {
    type Args = u32;
    type Output = ();

    async fn call(&self, ctx: &CallContext, hops: u32) -> Result<()> {
        RELAYED.fetch_add(1, Ordering::SeqCst);
        if hops > 0 {
            let dc = ctx.dc();
            let next = ((dc.procid() as usize + 1) % dc.numprocs()) as u16;
            dc.remote_call::<Relay>(next, &(hops - 1))?;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_waits_for_calls_spawned_by_calls() {
    let nodes = session(3).await;
    for dc in &nodes {
        for _ in 0..10 {
            dc.remote_call::<Relay>(dc.procid(), &20).unwrap();
        }
    }
    try_join_all(nodes.iter().map(|dc| dc.full_barrier())).await.unwrap();
    assert_eq!(RELAYED.load(Ordering::SeqCst), 3 * 10 * 21);

    let sent = nodes.iter().map(|dc| dc.calls_sent()).sum::<u64>();
    let received = nodes.iter().map(|dc| dc.calls_received()).sum::<u64>();
    assert_eq!(sent, 3 * 10 * 21);
    assert_eq!(sent, received);
    shutdown(&nodes).await;
}

#[derive(Default)]
struct Inbox(AtomicU64);

#[derive(RemoteMethod, Default)]
struct Deliver;

#[async_trait]
impl Method for Deliver {
    type Object = Inbox;
    type Args = u64;
    type Output = ();

    async fn call(&self, inbox: &Inbox, _ctx: &CallContext, amount: u64) -> Result<()> {
        inbox.0.fetch_add(amount, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_scopes_collectives_to_an_object() {
    let nodes = session(3).await;
    let inboxes = nodes
        .iter()
        .map(|dc| DistObject::new(dc, Inbox::default()))
        .collect::<Vec<_>>();

    let totals = try_join_all(inboxes.iter().map(|inbox| async move {
        for target in 0..inbox.numprocs() as u16 {
            inbox.remote_call::<Deliver>(target, &(inbox.procid() as u64 + 1))?;
        }
        inbox.full_barrier().await?;
        let mut total = inbox.owner().0.load(Ordering::SeqCst);
        anyhow::ensure!(total == 6, "inbox holds {total}");
        inbox.all_reduce(&mut total, sum).await?;
        let everyone = inbox.all_gather(&inbox.calls_received()).await?;
        anyhow::Ok((total, everyone))
    }))
    .await
    .unwrap();
    for (total, everyone) in totals {
        assert_eq!(total, 18);
        assert_eq!(everyone, [3, 3, 3]);
    }

    drop(inboxes);
    shutdown(&nodes).await;
}
