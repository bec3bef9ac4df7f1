use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use anyhow::{anyhow, Result};
use futures::future::try_join_all;
use rmi::{
    async_trait,
    config::Config,
    fiber::group::FiberGroup,
    handler::{CallContext, Function, Method, RemoteFunction, RemoteMethod, RpcError},
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

#[derive(RemoteFunction, Default)]
struct AddOne;

#[async_trait]
impl Function for AddOne {
    type Args = u64;
    type Output = u64;

    async fn call(&self, _ctx: &CallContext, x: u64) -> Result<u64> {
        Ok(x + 1)
    }
}

#[derive(RemoteFunction, Default)]
struct WhoAmI;

#[async_trait]
impl Function for WhoAmI {
    type Args = ();
    type Output = (u16, u16, u8);

    async fn call(&self, ctx: &CallContext, _args: ()) -> Result<(u16, u16, u8)> {
        Ok((ctx.procid(), ctx.source(), ctx.sequentialization_key()))
    }
}

#[derive(RemoteFunction, Default)]
struct Fails;

#[async_trait]
impl Function for Fails {
    type Args = String;
    type Output = ();

    async fn call(&self, _ctx: &CallContext, reason: String) -> Result<()> {
        Err(anyhow!("refused: {reason}"))
    }
}

#[derive(RemoteFunction, Default)]
struct Stall;

#[async_trait]
impl Function for Stall {
    type Args = ();
    type Output = ();

    async fn call(&self, _ctx: &CallContext, _args: ()) -> Result<()> {
        std::future::pending().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_answers_requests_from_many_fibers() {
    let nodes = session(2).await;
    let group = FiberGroup::new(nodes[0].fibers());
    for fiber in 0..8u64 {
        let dc = nodes[0].clone();
        group
            .launch(async move {
                for i in 0..1250 {
                    let x = fiber * 10_000 + i;
                    anyhow::ensure!(dc.remote_request::<AddOne>(1, &x).await? == x + 1);
                }
                Ok(())
            })
            .unwrap();
    }
    group.join().await.unwrap();

    try_join_all(nodes.iter().map(|dc| dc.full_barrier())).await.unwrap();
    assert_eq!(nodes[0].calls_sent(), 10_000);
    assert_eq!(nodes[1].calls_received(), 10_000);
    assert_eq!(nodes[1].counters().received_from(0), 10_000);
    assert!(nodes[0].bytes_sent() > 0);
    assert!(nodes[1].network_bytes_received() > 0);
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_describes_the_call_to_the_handler() {
    let nodes = session(3).await;
    assert_eq!(nodes[2].remote_request::<WhoAmI>(1, &()).await.unwrap(), (1, 2, 0));
    assert_eq!(nodes[0].remote_request::<WhoAmI>(0, &()).await.unwrap(), (0, 0, 0));

    let pending = nodes[1].future_remote_request::<AddOne>(0, &7).unwrap();
    assert_eq!(pending.await.unwrap(), 8);
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_reports_remote_failures() {
    let nodes = session(2).await;
    let err = nodes[0]
        .remote_request::<Fails>(1, &"no reason".to_string())
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { peer, message } => {
            assert_eq!(peer, 1);
            assert!(message.contains("refused: no reason"), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }

    // The session survives a failed handler.
    assert_eq!(nodes[0].remote_request::<AddOne>(1, &1).await.unwrap(), 2);
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_rejects_unknown_peers() {
    let nodes = session(2).await;
    assert!(matches!(
        nodes[0].remote_call::<AddOne>(5, &1),
        Err(RpcError::UnknownPeer { target: 5, numprocs: 2 })
    ));
    assert!(nodes[0].future_remote_request::<AddOne>(2, &1).is_err());
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_refuses_blocking_waits_inside_fibers() {
    let nodes = session(2).await;
    let group = FiberGroup::new(nodes[0].fibers());
    let dc = nodes[0].clone();
    group
        .launch(async move {
            let pending = dc.future_remote_request::<AddOne>(1, &1)?;
            match pending.wait() {
                Err(RpcError::BlockingWaitInFiber) => Ok(()),
                other => Err(anyhow!("expected a refusal, got {other:?}")),
            }
        })
        .unwrap();
    group.join().await.unwrap();

    let pending = nodes[0].future_remote_request::<AddOne>(1, &41).unwrap();
    let answer = tokio::task::spawn_blocking(move || pending.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, 42);
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_fails_requests_to_lost_peers() {
    let nodes = session(2).await;
    let pending = nodes[0].future_remote_request::<Stall>(1, &()).unwrap();
    nodes[0].flush().await.unwrap();

    nodes[1].abort();
    match pending.await {
        Err(RpcError::ConnectionLost { peer: 1 }) => {}
        other => panic!("expected a lost connection, got {other:?}"),
    }
    assert!(nodes[0].is_peer_lost(1));
    assert!(matches!(
        nodes[0].remote_request::<AddOne>(1, &1).await,
        Err(RpcError::ConnectionLost { peer: 1 })
    ));
    assert!(nodes[0].barrier().await.is_err());
    nodes[0].abort();
}

#[derive(Default)]
struct Log(Mutex<Vec<u64>>);

#[derive(RemoteMethod, Default)]
struct Append;

#[async_trait]
impl Method for Append {
    type Object = Log;
    type Args = u64;
    type Output = ();

    async fn call(&self, log: &Log, _ctx: &CallContext, value: u64) -> Result<()> {
        log.0.lock().unwrap().push(value);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_runs_keyed_calls_in_send_order() {
    let nodes = session(2).await;
    let logs = nodes
        .iter()
        .map(|dc| DistObject::new(dc, Log::default()))
        .collect::<Vec<_>>();

    DistributedControl::with_sequentialization_key(7, async {
        for value in 0..2000 {
            logs[0].remote_call::<Append>(1, &value).unwrap();
            if value % 100 == 0 {
                tokio::task::yield_now().await;
            }
        }
    })
    .await;

    try_join_all(logs.iter().map(|log| log.full_barrier())).await.unwrap();
    let received = logs[1].owner().0.lock().unwrap().clone();
    assert_eq!(received, (0..2000).collect::<Vec<_>>());

    drop(logs);
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_tags_calls_with_the_callers_key() {
    let nodes = session(2).await;
    let tagged = DistributedControl::with_sequentialization_key(3, async {
        nodes[0].remote_request::<WhoAmI>(1, &()).await
    });
    let untagged = nodes[0].remote_request::<WhoAmI>(1, &());
    let (tagged, untagged) = futures::join!(tagged, untagged);
    assert_eq!(tagged.unwrap(), (1, 0, 3));
    assert_eq!(untagged.unwrap(), (1, 0, 0));
    shutdown(&nodes).await;
}

#[derive(Default)]
struct Counter(AtomicU64);

#[derive(RemoteMethod, Default)]
struct Add;

#[async_trait]
impl Method for Add {
    type Object = Counter;
    type Args = u64;
    type Output = u64;

    async fn call(&self, counter: &Counter, _ctx: &CallContext, by: u64) -> Result<u64> {
        Ok(counter.0.fetch_add(by, Ordering::SeqCst) + by)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_runs_methods_on_the_targets_instance() {
    let nodes = session(3).await;
    let counters = nodes
        .iter()
        .map(|dc| DistObject::new(dc, Counter::default()))
        .collect::<Vec<_>>();
    assert!(counters.iter().all(|counter| counter.id() == counters[0].id()));

    for counter in &counters {
        for target in 0..3 {
            counter.remote_call::<Add>(target, &(target as u64 + 1)).unwrap();
        }
    }
    try_join_all(counters.iter().map(|counter| counter.full_barrier()))
        .await
        .unwrap();
    for (procid, counter) in counters.iter().enumerate() {
        assert_eq!(counter.owner().0.load(Ordering::SeqCst), 3 * (procid as u64 + 1));
        assert_eq!(counter.calls_sent(), 3);
        assert_eq!(counter.calls_received(), 3);
    }

    assert_eq!(counters[0].remote_request::<Add>(2, &10).await.unwrap(), 19);
    assert_eq!(counters[2].owner().0.load(Ordering::SeqCst), 19);

    drop(counters);
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_fails_calls_to_destroyed_objects() {
    let nodes = session(2).await;
    let mut counters = nodes
        .iter()
        .map(|dc| DistObject::new(dc, Counter::default()))
        .collect::<Vec<_>>();
    drop(counters.pop());

    let err = counters[0].remote_request::<Add>(1, &1).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote { peer: 1, .. }), "{err}");
    drop(counters);
    shutdown(&nodes).await;
}

static TICKS: AtomicU64 = AtomicU64::new(0);

#[derive(RemoteFunction, Default)]
struct Tick;

#[async_trait]
impl Function for Tick {
    type Args = u64;
    type Output = ();

    async fn call(&self, ctx: &CallContext, by: u64) -> Result<()> {
        TICKS.fetch_add(by << (8 * ctx.procid()), Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_calls_a_set_of_nodes_at_once() {
    let nodes = session(4).await;
    let counters = nodes
        .iter()
        .map(|dc| DistObject::new(dc, Counter::default()))
        .collect::<Vec<_>>();

    counters[0].remote_call_many::<Add>([1, 3], &5).unwrap();
    counters[2].remote_call_many::<Add>(0..3, &1).unwrap();
    counters[3].remote_call_many::<Add>(std::iter::empty(), &100).unwrap();
    assert!(matches!(
        counters[1].remote_call_many::<Add>([0, 9], &100),
        Err(RpcError::UnknownPeer { target: 9, numprocs: 4 })
    ));
    nodes[1].remote_call_many::<Tick>([0, 2, 3], &1).unwrap();

    try_join_all(counters.iter().map(|counter| counter.full_barrier()))
        .await
        .unwrap();
    let values = counters
        .iter()
        .map(|counter| counter.owner().0.load(Ordering::SeqCst))
        .collect::<Vec<_>>();
    assert_eq!(values, [1, 6, 1, 5]);
    let sent = counters.iter().map(|counter| counter.calls_sent()).collect::<Vec<_>>();
    assert_eq!(sent, [2, 0, 3, 0]);
    let received = counters.iter().map(|counter| counter.calls_received()).sum::<u64>();
    assert_eq!(received, 5);

    try_join_all(nodes.iter().map(|dc| dc.full_barrier())).await.unwrap();
    assert_eq!(TICKS.load(Ordering::SeqCst), 1 | 1 << 16 | 1 << 24);
    assert_eq!(nodes[1].calls_sent(), 3);

    drop(counters);
    shutdown(&nodes).await;
}
