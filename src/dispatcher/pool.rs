use std::collections::BTreeMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::AgentState;
use crate::batch::UnitId;
use crate::discovery::DiscoveryReply;

/// The dispatcher's view of one agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    /// Source address of the agent's discovery replies; `QUIT` goes here.
    pub discovery_addr: SocketAddr,
    /// Where job-transfer connections are opened.
    pub job_addr: SocketAddr,
    pub cores: usize,
    pub state: AgentState,
    pub assigned: Option<UnitId>,
    pub last_contact: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub unreachable: bool,
    /// Out of rotation until the agent answers another probe.
    pub awaiting_reply: bool,
}

impl AgentHandle {
    fn new(discovery_addr: SocketAddr, job_addr: SocketAddr, cores: usize) -> Self {
        Self {
            discovery_addr,
            job_addr,
            cores,
            state: AgentState::Discovered,
            assigned: None,
            last_contact: Utc::now(),
            consecutive_failures: 0,
            unreachable: false,
            awaiting_reply: false,
        }
    }

    /// Can take a unit right now.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, AgentState::Available | AgentState::Discovered)
            && self.assigned.is_none()
            && !self.unreachable
            && !self.awaiting_reply
    }
}

/// Serializable copy of an [`AgentHandle`] for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    pub address: SocketAddr,
    pub job_address: SocketAddr,
    pub cores: usize,
    pub state: AgentState,
    pub assigned: Option<UnitId>,
    pub last_contact: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub unreachable: bool,
    pub awaiting_reply: bool,
}

impl From<&AgentHandle> for AgentSnapshot {
    fn from(handle: &AgentHandle) -> Self {
        Self {
            address: handle.discovery_addr,
            job_address: handle.job_addr,
            cores: handle.cores,
            state: handle.state,
            assigned: handle.assigned,
            last_contact: handle.last_contact,
            consecutive_failures: handle.consecutive_failures,
            unreachable: handle.unreachable,
            awaiting_reply: handle.awaiting_reply,
        }
    }
}

/// Known agents, keyed by discovery address.
///
/// Registering the same reply twice is a no-op apart from refreshing the
/// contact time, so duplicated or reordered datagrams never create extra
/// handles. At most one unit is assigned to a handle at any time.
#[derive(Debug)]
pub struct AgentPool {
    agents: BTreeMap<SocketAddr, AgentHandle>,
    default_job_port: u16,
    max_failures: u32,
}

impl AgentPool {
    pub fn new(default_job_port: u16, max_failures: u32) -> Self {
        Self {
            agents: BTreeMap::new(),
            default_job_port,
            max_failures: max_failures.max(1),
        }
    }

    /// Register or refresh the agent that sent `reply`. Returns true for a
    /// previously unknown agent.
    pub fn on_discovery_reply(&mut self, from: SocketAddr, reply: DiscoveryReply) -> bool {
        let job_addr = SocketAddr::new(
            from.ip(),
            reply.job_port.unwrap_or(self.default_job_port),
        );

        if let Some(handle) = self.agents.get_mut(&from) {
            handle.last_contact = Utc::now();
            handle.cores = reply.cores;
            handle.job_addr = job_addr;
            handle.awaiting_reply = false;
            if handle.unreachable {
                tracing::info!(agent = %from, "Agent reachable again");
                handle.unreachable = false;
                handle.consecutive_failures = 0;
            }
            // Only an idle agent answers probes.
            if handle.assigned.is_none() {
                handle.state = AgentState::Discovered;
            }
            return false;
        }

        tracing::info!(agent = %from, job_addr = %job_addr, cores = reply.cores, "Agent discovered");
        self.agents
            .insert(from, AgentHandle::new(from, job_addr, reply.cores));
        true
    }

    pub fn get(&self, agent: &SocketAddr) -> Option<&AgentHandle> {
        self.agents.get(agent)
    }

    /// Agents able to take a unit, in address order.
    pub fn idle_agents(&self) -> Vec<SocketAddr> {
        self.agents
            .values()
            .filter(|h| h.is_idle())
            .map(|h| h.discovery_addr)
            .collect()
    }

    /// Reserve an idle agent for `unit`. Refused if the agent is unknown or
    /// not idle.
    pub fn assign(&mut self, agent: &SocketAddr, unit: UnitId) -> bool {
        match self.agents.get_mut(agent) {
            Some(handle) if handle.is_idle() => {
                handle.assigned = Some(unit);
                true
            }
            _ => false,
        }
    }

    /// The agent acknowledged its job.
    pub fn mark_running(&mut self, agent: &SocketAddr) {
        if let Some(handle) = self.agents.get_mut(agent) {
            handle.state = AgentState::Busy;
            handle.last_contact = Utc::now();
        }
    }

    pub fn mark_canceling(&mut self, agent: &SocketAddr) {
        if let Some(handle) = self.agents.get_mut(agent) {
            if handle.state == AgentState::Busy {
                handle.state = AgentState::Canceling;
            }
        }
    }

    /// The transfer is over; the agent is idle again.
    pub fn release(&mut self, agent: &SocketAddr) -> Option<UnitId> {
        let handle = self.agents.get_mut(agent)?;
        handle.state = AgentState::Available;
        handle.assigned.take()
    }

    /// Take the unit back from an agent that turned the job down or could
    /// not be talked to. It stays out of rotation until it answers a probe
    /// again, so the unit goes to another agent.
    pub fn park(&mut self, agent: &SocketAddr) -> Option<UnitId> {
        let handle = self.agents.get_mut(agent)?;
        handle.state = AgentState::Available;
        handle.awaiting_reply = true;
        handle.assigned.take()
    }

    pub fn record_success(&mut self, agent: &SocketAddr) {
        if let Some(handle) = self.agents.get_mut(agent) {
            handle.consecutive_failures = 0;
            handle.last_contact = Utc::now();
        }
    }

    /// Count a connection or protocol failure. Returns true when the agent
    /// has just been marked unreachable.
    pub fn record_failure(&mut self, agent: &SocketAddr) -> bool {
        let Some(handle) = self.agents.get_mut(agent) else {
            return false;
        };
        handle.consecutive_failures += 1;
        if !handle.unreachable && handle.consecutive_failures >= self.max_failures {
            handle.unreachable = true;
            tracing::warn!(
                agent = %agent,
                failures = handle.consecutive_failures,
                "Agent marked unreachable"
            );
            return true;
        }
        false
    }

    /// Agents currently holding a unit.
    pub fn busy_agents(&self) -> Vec<(SocketAddr, UnitId)> {
        self.agents
            .values()
            .filter_map(|h| h.assigned.map(|unit| (h.discovery_addr, unit)))
            .collect()
    }

    /// Agents that answered a probe but were never given a job.
    pub fn reserved_agents(&self) -> Vec<SocketAddr> {
        self.agents
            .values()
            .filter(|h| h.state == AgentState::Discovered && h.assigned.is_none() && !h.unreachable)
            .map(|h| h.job_addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.agents.values().map(AgentSnapshot::from).collect()
    }
}
