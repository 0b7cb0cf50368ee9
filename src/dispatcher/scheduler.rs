use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::batch::{ExperimentBatch, UnitId, UnitStatus};
use crate::config::DispatcherConfig;
use crate::discovery::{Broadcaster, DiscoveryReply};
use crate::dispatcher::pool::{AgentPool, AgentSnapshot};
use crate::dispatcher::queue::UnitQueue;
use crate::dispatcher::report::BatchReport;
use crate::dispatcher::transfer::{self, JobReport, JobTransfer, TransferEvent};
use crate::error::{HerdError, Result};
use crate::protocol::EndStatus;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Distributes experimental units over discovered agents.
///
/// The dispatcher owns the agent pool and the unit queue; both are mutated
/// only from the loop in [`run`](Self::run). Each job transfer runs on its
/// own task and reports back through an mpsc channel. Observers get
/// snapshots through [`subscribe`](Self::subscribe) and
/// [`agents`](Self::agents).
pub struct Dispatcher {
    config: DispatcherConfig,
    pool: AgentPool,
    queue: UnitQueue,
    broadcaster: Broadcaster,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: mpsc::Receiver<TransferEvent>,
    in_flight: usize,
    draining: bool,
    report_tx: watch::Sender<BatchReport>,
    agents_tx: watch::Sender<Vec<AgentSnapshot>>,
}

impl Dispatcher {
    pub async fn new(config: DispatcherConfig) -> Result<Self> {
        let broadcaster = Broadcaster::bind(config.discovery_target).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (report_tx, _) = watch::channel(BatchReport::default());
        let (agents_tx, _) = watch::channel(Vec::new());
        Ok(Self {
            pool: AgentPool::new(config.default_job_port, config.retry.max_agent_failures),
            queue: UnitQueue::new(config.retry),
            config,
            broadcaster,
            events_tx,
            events_rx,
            in_flight: 0,
            draining: false,
            report_tx,
            agents_tx,
        })
    }

    /// Queue every Pending unit of `batch`.
    pub fn add_batch(&mut self, batch: ExperimentBatch) -> usize {
        let index = self.queue.push_batch(batch);
        self.publish();
        index
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchReport> {
        self.report_tx.subscribe()
    }

    pub fn agents(&self) -> watch::Receiver<Vec<AgentSnapshot>> {
        self.agents_tx.subscribe()
    }

    pub fn report(&self) -> BatchReport {
        self.queue.report()
    }

    /// Register an agent without waiting for a discovery reply.
    pub fn add_agent(&mut self, discovery_addr: SocketAddr, reply: DiscoveryReply) {
        self.pool.on_discovery_reply(discovery_addr, reply);
    }

    /// Run until every unit reached a terminal status, or until `shutdown`
    /// fires and in-flight transfers have drained. Units never handed out
    /// stay Pending.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<BatchReport> {
        let mut probe = tokio::time::interval(self.config.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            target_addr = %self.broadcaster.target(),
            units = self.queue.pending_len(),
            "Dispatcher started"
        );

        loop {
            if !self.draining {
                self.dispatch_pending();
            }
            self.publish();

            if self.in_flight == 0 && (self.draining || self.queue.outstanding() == 0) {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled(), if !self.draining => {
                    tracing::info!(in_flight = self.in_flight, "Shutdown requested, draining transfers");
                    self.draining = true;
                    self.quit_busy_agents().await;
                }
                _ = probe.tick(), if !self.draining && self.queue.pending_len() > 0 => {
                    if let Err(e) = self.broadcaster.probe().await {
                        tracing::warn!(error = %e, "Failed to send discovery probe");
                    }
                }
                reply = self.broadcaster.recv_reply() => match reply {
                    Ok((from, reply)) => {
                        self.pool.on_discovery_reply(from, reply);
                    }
                    Err(e) => tracing::warn!(error = %e, "Discovery receive failed"),
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
            }
        }

        self.release_reserved().await;

        let report = self.queue.report();
        self.publish();
        tracing::info!(
            finished = report.finished,
            unfinished = report.unfinished,
            "Dispatcher finished"
        );
        Ok(report)
    }

    /// Give one pending unit to each idle agent.
    fn dispatch_pending(&mut self) {
        for agent in self.pool.idle_agents() {
            let Some(job_addr) = self.pool.get(&agent).map(|h| h.job_addr) else {
                continue;
            };
            let Some(unit) = self.queue.pop_next() else {
                break;
            };
            let Some(spec) = self.queue.job_spec(unit) else {
                tracing::error!(unit = %unit, "Queued unit has no batch entry");
                continue;
            };

            if !self.pool.assign(&agent, unit) {
                self.queue.requeue(unit);
                continue;
            }
            self.queue.assign(unit, agent);
            self.in_flight += 1;
            tracing::info!(agent = %agent, unit = %unit, name = %spec.name, "Unit assigned");

            let transfer = JobTransfer {
                agent,
                job_addr,
                unit,
                spec,
                connect_timeout: self.config.connect_timeout,
                io_timeout: self.config.io_timeout,
            };
            tokio::spawn(transfer.run(self.events_tx.clone()));
        }
    }

    async fn on_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Accepted { agent, unit } => {
                self.queue.mark_running(unit);
                self.pool.mark_running(&agent);
                if self.draining {
                    self.send_quit(agent).await;
                }
            }
            TransferEvent::Finished {
                agent,
                unit,
                outcome,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.apply_outcome(agent, unit, outcome);
            }
        }
    }

    fn apply_outcome(&mut self, agent: SocketAddr, unit: UnitId, outcome: Result<JobReport>) {
        let retry_job_errors = self.config.retry.retry_job_errors;
        match outcome {
            Ok(report) => match report.end.status {
                EndStatus::Completed => {
                    self.pool.record_success(&agent);
                    self.pool.release(&agent);
                    self.queue.complete(unit);
                    tracing::info!(agent = %agent, unit = %unit, "Unit done");
                }
                EndStatus::Cancelled => {
                    self.pool.release(&agent);
                    self.queue.cancel(unit);
                    tracing::info!(agent = %agent, unit = %unit, "Unit cancelled");
                }
                EndStatus::Error => {
                    self.pool.record_success(&agent);
                    self.pool.release(&agent);
                    let reason = report
                        .end
                        .message
                        .unwrap_or_else(|| "job reported an error".to_string());
                    let status = self.queue.fail(unit, reason, retry_job_errors);
                    tracing::warn!(agent = %agent, unit = %unit, status = ?status, "Unit failed on agent");
                }
                EndStatus::Rejected => {
                    self.pool.park(&agent);
                    self.queue.requeue(unit);
                    tracing::info!(agent = %agent, unit = %unit, "Agent busy, unit requeued");
                }
            },
            Err(e) => {
                let agent_fault = matches!(e, HerdError::Connection(_) | HerdError::Protocol(_));
                if agent_fault {
                    self.pool.park(&agent);
                    self.pool.record_failure(&agent);
                } else {
                    self.pool.release(&agent);
                }
                let status = self
                    .queue
                    .fail(unit, e.to_string(), agent_fault || retry_job_errors);
                tracing::warn!(agent = %agent, unit = %unit, status = ?status, error = %e, "Unit attempt failed");
            }
        }
    }

    async fn quit_busy_agents(&mut self) {
        for (agent, unit) in self.pool.busy_agents() {
            let running = self.queue.unit(unit).map(|u| u.status()) == Some(UnitStatus::Running);
            if running {
                self.send_quit(agent).await;
            }
        }
    }

    async fn send_quit(&mut self, agent: SocketAddr) {
        if let Err(e) = self.broadcaster.send_quit(agent).await {
            tracing::warn!(agent = %agent, error = %e, "Failed to send QUIT");
        }
        self.pool.mark_canceling(&agent);
    }

    async fn release_reserved(&mut self) {
        for job_addr in self.pool.reserved_agents() {
            if let Err(e) = transfer::send_free(job_addr, self.config.connect_timeout).await {
                tracing::debug!(agent = %job_addr, error = %e, "Failed to release reservation");
            }
        }
    }

    fn publish(&self) {
        self.report_tx.send_replace(self.queue.report());
        self.agents_tx.send_replace(self.pool.snapshot());
    }
}
