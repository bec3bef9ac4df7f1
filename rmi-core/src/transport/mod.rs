//! Byte-stream connections between the nodes of a session.
//!
//! A [`Transport`] resolves the session's node list into one full-duplex
//! [`Link`] per node, this node's own included. What the link is made of is
//! up to the transport; the rest of the crate only reads and writes bytes.
//!
//! # Features:
//! - [`tcp::TcpTransport`]: A full mesh of TCP connections with a procid
//!   handshake.
//! - [`in_memory::InMemoryNetwork`]: Duplex pipes between nodes living in one
//!   process, for tests and single-process sessions.
//! - [`DynamicTransport`]: Selects one of the above from a [`Config`].
use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    config::{self, Config},
    packet::ProcId,
};

pub mod in_memory;
pub mod tcp;

pub type Reader = Box<dyn AsyncRead + Send + Unpin>;
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Both directions of the connection to one peer.
pub struct Link {
    pub reader: Reader,
    pub writer: Writer,
}

impl Link {
    /// A link whose writes come back on its own reader.
    pub fn loopback(capacity: usize) -> Self {
        let (writer, reader) = tokio::io::duplex(capacity);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// The established links of one node, indexed by peer.
pub struct Links {
    pub procid: ProcId,
    pub links: Vec<Link>,
}

impl Links {
    pub fn numprocs(&self) -> usize {
        self.links.len()
    }
}

/// Establishes the links of one node.
#[async_trait]
pub trait Transport: Send {
    /// Connects to every node of the session. Returns once all links are up.
    async fn connect(self) -> Result<Links>;
}

/// A [`Transport`] chosen at runtime.
pub enum DynamicTransport {
    Tcp(tcp::TcpTransport),
    InMemory(in_memory::InMemoryTransport),
}

impl DynamicTransport {
    /// Builds the transport `config` names.
    ///
    /// The in-memory transport joins every node of a session from one
    /// process; from a single [`Config`] it can only form a session of one.
    /// Use [`DistributedControl::in_memory`](crate::DistributedControl::in_memory)
    /// for larger in-process sessions.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.transport {
            config::Transport::Tcp => Ok(Self::Tcp(tcp::TcpTransport::from_config(config)?)),
            config::Transport::InMemory => match config.num_procs {
                None | Some(1) => {
                    let mut network = in_memory::InMemoryNetwork::new(1, config.receive_buffer_size);
                    match network.pop() {
                        Some(node) => Ok(Self::InMemory(node)),
                        None => bail!("in-memory network of one node is empty"),
                    }
                }
                Some(n) => bail!(
                    "an in-memory session of {n} nodes must be created with DistributedControl::in_memory"
                ),
            },
        }
    }
}

#[async_trait]
impl Transport for DynamicTransport {
    async fn connect(self) -> Result<Links> {
        match self {
            Self::Tcp(transport) => transport.connect().await,
            Self::InMemory(transport) => transport.connect().await,
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn it_echoes_over_loopback() {
        let mut link = Link::loopback(64);
        link.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        link.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn it_builds_a_single_in_memory_node() {
        let config = Config {
            transport: config::Transport::InMemory,
            ..Default::default()
        };
        let links = DynamicTransport::from_config(&config)
            .unwrap()
            .connect()
            .await
            .unwrap();
        assert_eq!((links.procid, links.numprocs()), (0, 1));

        let config = Config {
            num_procs: Some(3),
            ..config
        };
        assert!(DynamicTransport::from_config(&config).is_err());
    }
}
