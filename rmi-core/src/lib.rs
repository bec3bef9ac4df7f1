#![cfg_attr(docsrs, feature(doc_cfg))]

//! A distributed-object RPC substrate.
//!
//! rmi connects a fixed set of processes ("nodes") into a session in which
//! any node can call functions on any other node, call methods on the other
//! nodes' instances of a distributed object, and synchronize with collective
//! operations. It is meant as the bottom layer of distributed algorithms
//! (graph engines, distributed hash tables, query executors) that exchange
//! many small messages and need to know when the whole computation has gone
//! quiet.
//!
//! Features:
//! - **Buffered calls**: Calls are serialized straight into per-thread,
//!   per-destination buffers and written out by one sender per peer with
//!   vectored writes, so thousands of small calls cost a handful of system
//!   calls and no lock on the calling path.
//! - **Ordered or parallel dispatch**: Calls tagged with the same
//!   sequentialization key run in send order; untagged calls run
//!   concurrently on the receiver's handler fibers.
//! - **Fibers**: Waiting for a reply suspends a lightweight fiber instead of
//!   an OS thread, so a small pool of workers can keep a very large number of
//!   requests in flight.
//! - **Collectives**: Barriers, full barriers that also wait for in-flight
//!   calls, broadcast, gather, all-gather and all-reduce.
//! - **Termination detection**: [`consensus::AsyncConsensus`] decides without
//!   a coordinator when every node is idle and no work is in flight.
//!
//! # How to use rmi
//!
//! ## Defining handlers
//!
//! A remotely callable function is a unit struct implementing
//! [`Function`](crate::handler::Function) and deriving
//! [`RemoteFunction`](crate::handler::RemoteFunction). The derive registers
//! it under its module path and type name, which is all two nodes need to
//! agree on.
//!
//! ```
//! use rmi::{async_trait, handler::{CallContext, Function, RemoteFunction}};
//!
//! #[derive(RemoteFunction, Default)]
//! struct AddOne;
//!
//! #[async_trait]
//! impl Function for AddOne {
//!     type Args = u64;
//!     type Output = u64;
//!
//!     async fn call(&self, _ctx: &CallContext, x: u64) -> anyhow::Result<u64> {
//!         Ok(x + 1)
//!     }
//! }
//! ```
//!
//! Methods of distributed objects implement
//! [`Method`](crate::handler::Method) instead, naming the object type they
//! run against. See [`DistObject`].
//!
//! ## Joining a session
//!
//! Every node runs the same binary with the same machine list and its own
//! procid. The [`Config`](crate::config::Config) is a [`clap`] argument
//! group, so binaries usually flatten it into their command line:
//!
//! ```no_run
//! use clap::Parser;
//! use rmi::{config::Config, DistributedControl};
//!
//! #[derive(Parser, Debug)]
//! pub struct Cli {
//!     #[command(flatten)]
//!     pub options: Config,
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = Cli::parse();
//!     let dc = DistributedControl::init(&args.options).await?;
//!     println!("node {} of {}", dc.procid(), dc.numprocs());
//!     dc.shutdown().await
//! }
//! ```
//!
//! For tests, [`DistributedControl::in_memory`] builds a whole session inside
//! one process.
//!
//! ## Calling
//!
//! ```
//! # use rmi::{async_trait, handler::{CallContext, Function, RemoteFunction}};
//! # #[derive(RemoteFunction, Default)]
//! # struct AddOne;
//! # #[async_trait]
//! # impl Function for AddOne {
//! #     type Args = u64;
//! #     type Output = u64;
//! #     async fn call(&self, _ctx: &CallContext, x: u64) -> anyhow::Result<u64> {
//! #         Ok(x + 1)
//! #     }
//! # }
//! use rmi::{config::Config, DistributedControl};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let nodes = DistributedControl::in_memory(&Config::default(), 2).await?;
//! let dc = &nodes[0];
//!
//! // Fire and forget.
//! dc.remote_call::<AddOne>(1, &1)?;
//!
//! // Wait for the result.
//! assert_eq!(dc.remote_request::<AddOne>(1, &41).await?, 42);
//!
//! // Or collect it later.
//! let pending = dc.future_remote_request::<AddOne>(1, &99)?;
//! assert_eq!(pending.await?, 100);
//!
//! futures::future::try_join_all(nodes.iter().map(|dc| dc.shutdown())).await?;
//! # Ok(())
//! # }
//! ```
//!
//! A request whose target goes away fails with
//! [`RpcError::ConnectionLost`](crate::handler::RpcError::ConnectionLost)
//! instead of hanging; one whose handler fails carries the handler's error
//! back as [`RpcError::Remote`](crate::handler::RpcError::Remote).
//!
//! ## Collectives
//!
//! Every node must enter the same collectives in the same order:
//!
//! ```
//! use rmi::{config::Config, DistributedControl};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let nodes = DistributedControl::in_memory(&Config::default(), 3).await?;
//! let sums = futures::future::try_join_all(nodes.iter().map(|dc| async move {
//!     let mut value = dc.procid() as u64 + 1;
//!     dc.all_reduce(&mut value, |acc, other| *acc += other).await?;
//!     anyhow::Ok(value)
//! }))
//! .await?;
//! assert_eq!(sums, vec![6, 6, 6]);
//! futures::future::try_join_all(nodes.iter().map(|dc| dc.shutdown())).await?;
//! # Ok(())
//! # }
//! ```
pub mod buffer;
mod common;
pub mod config;
pub mod consensus;
pub mod control;
pub mod dispatch;
pub mod fiber;
pub mod handler;
pub mod packet;
pub mod serializer;
pub mod stream;
pub mod transport;

pub use async_trait::async_trait;
pub use control::{reply::RequestFuture, DistObject, DistributedControl};
pub use futures;
pub use tracing;

#[doc(hidden)]
pub mod __private {
    pub use linkme;

    /// Every handler linked into the binary, collected by the derive macros.
    #[linkme::distributed_slice]
    pub static HANDLERS: [crate::dispatch::HandlerEntry] = [..];
}
