//! A full mesh of TCP connections.
//!
//! Node `p` listens on `machines[p]`, connects to every node with a lower
//! procid and accepts a connection from every node with a higher one, so each
//! pair shares exactly one socket. The connecting side opens with a
//! handshake of its procid and session size (`u16` each, little endian),
//! which the accepting side validates before using the socket.
//!
//! Peers that are not listening yet are retried with exponential backoff
//! until the connect timeout elapses. Self-calls use an in-process loopback
//! pipe.
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, info, instrument};

use super::{Link, Links, Transport};
use crate::{config::Config, packet::ProcId};

pub struct TcpTransport {
    machines: Vec<String>,
    procid: ProcId,
    connect_timeout: Duration,
    loopback_capacity: usize,
}

impl TcpTransport {
    pub fn from_config(config: &Config) -> Result<Self> {
        ensure!(!config.machines.is_empty(), "the tcp transport needs a machine list");
        ensure!(
            (config.procid as usize) < config.machines.len(),
            "procid {} is not in a machine list of {}",
            config.procid,
            config.machines.len()
        );
        ensure!(
            config.machines.len() <= ProcId::MAX as usize + 1,
            "{} machines exceed the procid range",
            config.machines.len()
        );
        Ok(Self {
            machines: config.machines.clone(),
            procid: config.procid,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            loopback_capacity: config.receive_buffer_size,
        })
    }

    fn numprocs(&self) -> usize {
        self.machines.len()
    }

    async fn connect_to(&self, peer: ProcId) -> Result<TcpStream> {
        let address = &self.machines[peer as usize];
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(self.connect_timeout))
            .build();
        let mut stream = backoff::future::retry_notify(
            policy,
            || async { TcpStream::connect(address).await.map_err(backoff::Error::transient) },
            |err, next| debug!(peer, %address, %err, ?next, "peer not reachable yet"),
        )
        .await
        .with_context(|| format!("could not connect to node {peer} at {address}"))?;

        stream.set_nodelay(true)?;
        stream.write_u16_le(self.procid).await?;
        stream.write_u16_le(self.numprocs() as u16).await?;
        stream.flush().await?;
        Ok(stream)
    }

    async fn accept_from(&self, listener: &TcpListener) -> Result<(ProcId, TcpStream)> {
        let (mut stream, address) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let peer = stream.read_u16_le().await?;
        let numprocs = stream.read_u16_le().await? as usize;
        ensure!(
            numprocs == self.numprocs(),
            "node {peer} at {address} expects {numprocs} nodes, this session has {}",
            self.numprocs()
        );
        ensure!(
            peer > self.procid && (peer as usize) < self.numprocs(),
            "unexpected handshake from node {peer} at {address}"
        );
        Ok((peer, stream))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    #[instrument(skip_all, fields(procid = self.procid, numprocs = self.numprocs()))]
    async fn connect(self) -> Result<Links> {
        let listen_on = &self.machines[self.procid as usize];
        let listener = TcpListener::bind(listen_on)
            .await
            .with_context(|| format!("could not listen on {listen_on}"))?;

        let mut streams: Vec<Option<TcpStream>> = (0..self.numprocs()).map(|_| None).collect();
        let higher = self.numprocs() - self.procid as usize - 1;
        let accepting = async {
            let mut accepted = Vec::with_capacity(higher);
            for _ in 0..higher {
                accepted.push(self.accept_from(&listener).await?);
            }
            anyhow::Ok(accepted)
        };
        let connecting = async {
            let mut connected = Vec::with_capacity(self.procid as usize);
            for peer in 0..self.procid {
                connected.push((peer, self.connect_to(peer).await?));
            }
            anyhow::Ok(connected)
        };
        let (accepted, connected) = timeout(self.connect_timeout * 2, async {
            tokio::try_join!(accepting, connecting)
        })
        .await
        .context("timed out waiting for peers")??;

        for (peer, stream) in accepted.into_iter().chain(connected) {
            if streams[peer as usize].replace(stream).is_some() {
                bail!("node {peer} connected twice");
            }
        }

        let mut links = Vec::with_capacity(self.numprocs());
        for (peer, stream) in streams.into_iter().enumerate() {
            let link = match stream {
                Some(stream) => {
                    let (reader, writer) = stream.into_split();
                    Link {
                        reader: Box::new(reader),
                        writer: Box::new(writer),
                    }
                }
                None if peer == self.procid as usize => Link::loopback(self.loopback_capacity),
                None => bail!("no connection to node {peer}"),
            };
            links.push(link);
        }
        info!("connected to all peers");
        Ok(Links {
            procid: self.procid,
            links,
        })
    }
}
