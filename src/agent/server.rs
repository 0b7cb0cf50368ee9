use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::executor::JobExecutor;
use crate::agent::session::{JobSession, SessionEnd};
use crate::agent::state::{AgentSignal, AgentState, AgentStateMachine, Outcome, Transition};
use crate::config::AgentConfig;
use crate::discovery::{Datagram, DiscoveryReply};
use crate::error::{HerdError, Result};
use crate::protocol::{JobEnd, MessageStream, Record};

const MAX_DATAGRAM: usize = 512;

/// A finished session and the handle that keeps its connection open until
/// the control loop has applied the end.
type SessionDone = (SessionEnd, oneshot::Sender<()>);

/// An agent process: answers discovery probes and runs one job at a time.
///
/// All signals (datagrams, accepted connections, finished sessions,
/// reservation expiry, shutdown) are handled by the single loop in
/// [`run`](Self::run), so state transitions never race. Job sessions run on
/// their own tasks and report back through a channel.
pub struct HerdAgent {
    config: Arc<AgentConfig>,
    discovery: UdpSocket,
    listener: TcpListener,
    machine: AgentStateMachine,
    transitions: broadcast::Sender<Transition>,
    session: JobSession,
    current_job: Option<CancellationToken>,
    reserved_until: Option<Instant>,
}

impl HerdAgent {
    /// Bind the discovery socket and the job listener. Failing to bind
    /// either is fatal for the agent.
    pub async fn bind(config: AgentConfig) -> Result<Self> {
        Self::bind_with_executor(config, JobExecutor::new()).await
    }

    pub async fn bind_with_executor(config: AgentConfig, executor: JobExecutor) -> Result<Self> {
        let discovery = UdpSocket::bind(config.discovery_addr)
            .await
            .map_err(|source| HerdError::Bind {
                what: "discovery port",
                addr: config.discovery_addr,
                source,
            })?;
        let listener = TcpListener::bind(config.job_addr)
            .await
            .map_err(|source| HerdError::Bind {
                what: "job port",
                addr: config.job_addr,
                source,
            })?;

        let config = Arc::new(config);
        let (transitions, _) = broadcast::channel(64);
        let agent = Self {
            session: JobSession::new(config.clone(), executor),
            config,
            discovery,
            listener,
            machine: AgentStateMachine::new(),
            transitions,
            current_job: None,
            reserved_until: None,
        };

        tracing::info!(
            discovery = %agent.discovery_addr()?,
            job = %agent.job_addr()?,
            cores = agent.config.cores,
            "Agent listening"
        );
        Ok(agent)
    }

    pub fn discovery_addr(&self) -> Result<SocketAddr> {
        Ok(self.discovery.local_addr()?)
    }

    pub fn job_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> AgentState {
        self.machine.state()
    }

    /// Observe every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Serve until `shutdown` fires. A running job is cancelled and its
    /// session allowed to report before returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let (done_tx, mut done_rx) = mpsc::channel::<SessionDone>(4);
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Agent shutting down");
                    break;
                }
                received = self.discovery.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                    Err(e) => tracing::warn!(error = %e, "Discovery receive failed"),
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_connection(stream, peer, &done_tx),
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                Some((end, applied)) = done_rx.recv() => {
                    self.on_session_end(end);
                    let _ = applied.send(());
                }
                _ = wait_until(self.reserved_until) => {
                    self.reserved_until = None;
                    if let Outcome::Moved(_) = self.apply(AgentSignal::ReservationExpired) {
                        tracing::info!("Reservation expired without a connection");
                    }
                }
            }
        }

        if let Some(token) = self.current_job.take() {
            token.cancel();
            if let Some((end, applied)) = done_rx.recv().await {
                self.on_session_end(end);
                let _ = applied.send(());
            }
        }
        Ok(())
    }

    async fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let datagram = match Datagram::parse(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "Ignoring malformed datagram");
                return;
            }
        };

        match datagram {
            Datagram::Probe => {
                if let Outcome::Moved(_) = self.apply(AgentSignal::Probe) {
                    let port = self.listener.local_addr().ok().map(|a| a.port());
                    let reply = Datagram::Reply(DiscoveryReply {
                        cores: self.config.cores,
                        job_port: port,
                    });
                    if let Err(e) = self.discovery.send_to(&reply.encode(), from).await {
                        tracing::warn!(dispatcher = %from, error = %e, "Failed to answer probe");
                    }
                    self.reserved_until = Some(Instant::now() + self.config.reservation_timeout);
                    tracing::info!(dispatcher = %from, "Reserved by discovery probe");
                }
            }
            Datagram::Quit => {
                if let Outcome::Moved(_) = self.apply(AgentSignal::Quit) {
                    tracing::info!(from = %from, "QUIT received, cancelling job");
                    if let Some(token) = &self.current_job {
                        token.cancel();
                    }
                }
            }
            Datagram::Reply(_) => {
                tracing::debug!(from = %from, "Ignoring discovery reply addressed to an agent");
            }
        }
    }

    fn on_connection(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        done_tx: &mpsc::Sender<SessionDone>,
    ) {
        match self.apply(AgentSignal::ConnectionAccepted) {
            Outcome::Moved(_) => {
                self.reserved_until = None;
                let token = CancellationToken::new();
                self.current_job = Some(token.clone());
                let session = self.session.clone();
                let done_tx = done_tx.clone();
                tracing::info!(peer = %peer, "Job connection accepted");
                tokio::spawn(async move {
                    let mut stream = stream;
                    let end = session.run(&mut stream, peer, token).await;
                    // Close only after the loop is AVAILABLE again.
                    let (applied_tx, applied_rx) = oneshot::channel();
                    if done_tx.send((end, applied_tx)).await.is_ok() {
                        let _ = applied_rx.await;
                    }
                    drop(stream);
                });
            }
            Outcome::Rejected(reason) => {
                tracing::warn!(peer = %peer, state = %self.machine.state(), "Rejecting connection");
                let idle = self.config.io_timeout;
                tokio::spawn(async move {
                    let mut stream = MessageStream::new(stream);
                    // Consume the query so closing does not reset the connection.
                    let _ = stream.read_next_timeout(idle).await;
                    let end = Record::End(JobEnd::rejected(reason.to_string()));
                    if let Err(e) = stream.send_record(&end).await {
                        tracing::debug!(peer = %peer, error = %e, "Failed to send rejection");
                    }
                });
            }
            Outcome::Ignored => {}
        }
    }

    fn on_session_end(&mut self, end: SessionEnd) {
        self.current_job = None;
        match &end {
            SessionEnd::Finished { job, status } => {
                tracing::info!(job = %job, status = %status, "Job session finished");
            }
            SessionEnd::Released => tracing::info!("Reservation released"),
            SessionEnd::Aborted(reason) => {
                tracing::warn!(reason = %reason, "Job session aborted");
            }
        }
        self.apply(AgentSignal::SessionFinished);
    }

    fn apply(&mut self, signal: AgentSignal) -> Outcome {
        let outcome = self.machine.apply(signal);
        if let Outcome::Moved(transition) = &outcome {
            let _ = self.transitions.send(*transition);
        }
        outcome
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
