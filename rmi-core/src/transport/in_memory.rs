//! An in-process network of duplex pipes.
//!
//! Every pair of nodes shares one [`tokio::io::duplex`] pipe, split into read
//! and write halves on each side. Dropping a node's links closes its pipes,
//! which its peers observe as an orderly end of stream, just like a closed
//! socket.
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{duplex, split};

use super::{Link, Links, Transport};
use crate::packet::ProcId;

/// Builds the links of an in-process session.
pub struct InMemoryNetwork;

impl InMemoryNetwork {
    /// Wires up `numprocs` nodes. Pipes buffer up to `capacity` bytes per
    /// direction before writers wait for readers.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(numprocs: usize, capacity: usize) -> Vec<InMemoryTransport> {
        let mut links: Vec<Vec<Option<Link>>> = (0..numprocs)
            .map(|_| (0..numprocs).map(|_| None).collect())
            .collect();
        for a in 0..numprocs {
            links[a][a] = Some(Link::loopback(capacity));
            for b in a + 1..numprocs {
                let (near, far) = duplex(capacity);
                let (near_reader, near_writer) = split(near);
                let (far_reader, far_writer) = split(far);
                links[a][b] = Some(Link {
                    reader: Box::new(near_reader),
                    writer: Box::new(near_writer),
                });
                links[b][a] = Some(Link {
                    reader: Box::new(far_reader),
                    writer: Box::new(far_writer),
                });
            }
        }
        links
            .into_iter()
            .enumerate()
            .map(|(procid, links)| InMemoryTransport {
                procid: procid as ProcId,
                links: links.into_iter().flatten().collect(),
            })
            .collect()
    }
}

/// One node's side of an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    procid: ProcId,
    links: Vec<Link>,
}

impl InMemoryTransport {
    pub fn procid(&self) -> ProcId {
        self.procid
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(self) -> Result<Links> {
        Ok(Links {
            procid: self.procid,
            links: self.links,
        })
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn it_connects_every_pair() {
        let mut nodes = Vec::new();
        for transport in InMemoryNetwork::new(3, 1024) {
            nodes.push(transport.connect().await.unwrap());
        }
        for from in 0..3 {
            for to in 0..3 {
                let message = [from as u8, to as u8];
                nodes[from].links[to].writer.write_all(&message).await.unwrap();
                let mut received = [0u8; 2];
                nodes[to].links[from]
                    .reader
                    .read_exact(&mut received)
                    .await
                    .unwrap();
                assert_eq!(received, message);
            }
        }
    }

    #[tokio::test]
    async fn it_reports_end_of_stream_when_a_node_goes_away() {
        let mut nodes = InMemoryNetwork::new(2, 1024).into_iter();
        let mut first = nodes.next().unwrap().connect().await.unwrap();
        drop(nodes.next().unwrap());
        let mut buf = [0u8; 1];
        assert_eq!(first.links[1].reader.read(&mut buf).await.unwrap(), 0);
    }
}
