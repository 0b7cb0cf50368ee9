//! Best-effort UDP discovery of idle agents.
//!
//! The dispatcher broadcasts a probe; every AVAILABLE agent answers with its
//! core count (and the TCP port it accepts jobs on) and reserves itself for
//! the next inbound connection. A directed `QUIT` asks an agent to cancel its
//! running job. Lost or duplicated datagrams are harmless: the agent state
//! machine and the dispatcher's agent pool are idempotent with respect to them.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::dispatcher::pool::AgentPool;
use crate::error::{DiscoveryError, HerdError, Result};

/// Token carried by discovery probes. An empty datagram is a probe too.
pub const PROBE_TOKEN: &str = "HERD_DISCOVERY";

/// Directed cancellation request.
pub const QUIT_TOKEN: &str = "QUIT";

const MAX_DATAGRAM: usize = 512;

/// Capacity advertised by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub cores: usize,
    /// TCP port for job transfer, if the agent advertised one.
    pub job_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram {
    Probe,
    Reply(DiscoveryReply),
    Quit,
}

impl Datagram {
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, DiscoveryError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DiscoveryError::NotText)?;
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        if text.is_empty() || text == PROBE_TOKEN {
            return Ok(Datagram::Probe);
        }
        if text == QUIT_TOKEN {
            return Ok(Datagram::Quit);
        }
        Self::parse_reply(text)
            .map(Datagram::Reply)
            .ok_or_else(|| DiscoveryError::Malformed(text.to_string()))
    }

    /// `cores=N [port=P]`, or the legacy `<Cores>N</Cores>` form.
    fn parse_reply(text: &str) -> Option<DiscoveryReply> {
        if let Some(inner) = text
            .strip_prefix("<Cores>")
            .and_then(|rest| rest.strip_suffix("</Cores>"))
        {
            let cores = inner.trim().parse().ok()?;
            return Some(DiscoveryReply {
                cores,
                job_port: None,
            });
        }

        let mut cores = None;
        let mut job_port = None;
        for field in text.split_whitespace() {
            let (key, value) = field.split_once('=')?;
            match key {
                "cores" => cores = Some(value.parse().ok()?),
                "port" => job_port = Some(value.parse().ok()?),
                _ => return None,
            }
        }
        Some(DiscoveryReply {
            cores: cores?,
            job_port,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Datagram::Probe => PROBE_TOKEN.as_bytes().to_vec(),
            Datagram::Quit => QUIT_TOKEN.as_bytes().to_vec(),
            Datagram::Reply(reply) => match reply.job_port {
                Some(port) => format!("cores={} port={}", reply.cores, port).into_bytes(),
                None => format!("cores={}", reply.cores).into_bytes(),
            },
        }
    }
}

/// Dispatcher side of discovery: sends probes and `QUIT`s, receives replies.
pub struct Broadcaster {
    socket: UdpSocket,
    target: SocketAddr,
}

impl Broadcaster {
    /// Bind an ephemeral UDP socket able to reach `target`.
    pub async fn bind(target: SocketAddr) -> Result<Self> {
        let local = SocketAddr::from(([0, 0, 0, 0], 0));
        let socket = UdpSocket::bind(local).await.map_err(|source| HerdError::Bind {
            what: "discovery socket",
            addr: local,
            source,
        })?;
        socket.set_broadcast(true)?;
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub async fn probe(&self) -> Result<()> {
        self.socket
            .send_to(&Datagram::Probe.encode(), self.target)
            .await?;
        tracing::trace!(target_addr = %self.target, "Discovery probe sent");
        Ok(())
    }

    /// Ask the agent listening on `agent` to cancel its running job.
    pub async fn send_quit(&self, agent: SocketAddr) -> Result<()> {
        self.socket.send_to(&Datagram::Quit.encode(), agent).await?;
        tracing::info!(agent = %agent, "QUIT sent");
        Ok(())
    }

    /// Wait for the next well-formed reply. Malformed and unexpected
    /// datagrams are logged and skipped.
    pub async fn recv_reply(&self) -> Result<(SocketAddr, DiscoveryReply)> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match Datagram::parse(&buf[..len]) {
                Ok(Datagram::Reply(reply)) => return Ok((from, reply)),
                Ok(other) => {
                    tracing::debug!(from = %from, datagram = ?other, "Ignoring non-reply datagram");
                }
                Err(e) => {
                    tracing::warn!(from = %from, error = %e, "Ignoring malformed discovery reply");
                }
            }
        }
    }

    /// Send one probe and register every reply arriving within `window`.
    /// Returns the number of replies received (duplicates included).
    pub async fn discovery_round(&self, pool: &mut AgentPool, window: Duration) -> Result<usize> {
        self.probe().await?;
        let deadline = tokio::time::Instant::now() + window;
        let mut replies = 0;
        loop {
            match tokio::time::timeout_at(deadline, self.recv_reply()).await {
                Ok(Ok((from, reply))) => {
                    replies += 1;
                    pool.on_discovery_reply(from, reply);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
        tracing::debug!(replies, agents = pool.len(), "Discovery round finished");
        Ok(replies)
    }
}
