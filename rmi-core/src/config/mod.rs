//! Shared session configuration.
//!
//! This module introduces types to facilitate the configuration of a
//! distributed-control session.
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned with
//!   [`clap`] attributes to allow easy setup via command-line arguments or
//!   environment variables.
//! - [`Serializer`]: Specifies the serialization format to use.
//! - [`Transport`]: Enumerates the available transports.
//!
//! # Usage:
//! Every node of a session must be started with the same machine list and
//! serializer; only `procid` differs between nodes. The [`Config`] struct can
//! be passed to
//! [`DistributedControl::init`](crate::control::DistributedControl::init)
//! to join a session over the configured transport.

use clap::{Args, ValueEnum};

use crate::packet::ProcId;

const HELP_HEADING: &str = "RMI options";

/// Microseconds a sender waits between unprompted drains of its buffers.
pub const DEFAULT_SEND_POLL_TIMEOUT_US: u64 = 5000;
/// A thread's per-destination buffer is handed to the sender once it holds
/// this many bytes.
pub const DEFAULT_FULL_BUFFER_SIZE_LIMIT: usize = 16 * 1024 * 1024;
/// Above this many queued buffers for one destination the sender is woken.
pub const DEFAULT_NUM_FULL_BUFFER_LIMIT: usize = 64;
/// Initial size of receive buffers and thread-local send buffers.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 128 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Represents the main configuration structure for a session.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Ordered list of node addresses (`host:port`). The position of an
    /// address is the procid of the node listening on it.
    #[arg(long, help_heading = HELP_HEADING, env = "RMI_MACHINES", value_delimiter = ',')]
    pub machines: Vec<String>,

    /// The procid of this node.
    #[arg(long, short, help_heading = HELP_HEADING, env = "RMI_PROCID", default_value_t = 0)]
    pub procid: ProcId,

    /// Determines the serialization format to be used.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Specifies the transport to use.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Transport::Tcp)]
    pub transport: Transport,

    /// Number of nodes to run in this process (in memory transport only).
    #[arg(long, help_heading = HELP_HEADING)]
    pub num_procs: Option<usize>,

    /// Number of handler queues servicing incoming calls. Defaults to the
    /// number of cpus minus two, and at least two.
    #[arg(long, help_heading = HELP_HEADING)]
    pub handler_threads: Option<usize>,

    /// Number of OS worker threads running fibers. Defaults to the number of
    /// handler queues.
    #[arg(long, help_heading = HELP_HEADING)]
    pub fiber_workers: Option<usize>,

    /// Microseconds a sender waits before draining unflushed buffers.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_SEND_POLL_TIMEOUT_US)]
    pub send_poll_timeout_us: u64,

    /// Bytes a thread buffers for one destination before handing it off.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_FULL_BUFFER_SIZE_LIMIT)]
    pub full_buffer_size_limit: usize,

    /// Queued buffers for one destination that trigger an early send.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_NUM_FULL_BUFFER_LIMIT)]
    pub num_full_buffer_limit: usize,

    /// Initial receive buffer size per connection.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_RECEIVE_BUFFER_SIZE)]
    pub receive_buffer_size: usize,

    /// Milliseconds to keep retrying connections to peers (tcp transport
    /// only).
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machines: Default::default(),
            procid: 0,
            serializer: Default::default(),
            transport: Default::default(),
            num_procs: Default::default(),
            handler_threads: Default::default(),
            fiber_workers: Default::default(),
            send_poll_timeout_us: DEFAULT_SEND_POLL_TIMEOUT_US,
            full_buffer_size_limit: DEFAULT_FULL_BUFFER_SIZE_LIMIT,
            num_full_buffer_limit: DEFAULT_NUM_FULL_BUFFER_LIMIT,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Resolved number of handler queues.
    pub fn handler_threads(&self) -> usize {
        self.handler_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get().saturating_sub(2))
                    .unwrap_or(2)
            })
            .max(2)
    }

    /// Resolved number of fiber worker threads.
    pub fn fiber_workers(&self) -> usize {
        self.fiber_workers.unwrap_or_else(|| self.handler_threads()).max(1)
    }

    /// A copy of this configuration for another node of the same session.
    pub fn for_procid(&self, procid: ProcId) -> Self {
        Self {
            procid,
            ..self.clone()
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

/// Enumerates the available transports.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Transport {
    #[default]
    Tcp,
    InMemory,
}
