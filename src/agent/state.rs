use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Lifecycle of an agent, shared by the agent itself and the dispatcher's
/// view of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    /// Idle, answers probes.
    Available,
    /// Answered a probe; reserved for the next connection.
    Discovered,
    /// Accepted a connection and is running (or about to run) a job.
    Busy,
    /// Cancellation requested while busy; waiting for the child to die.
    Canceling,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Available => write!(f, "AVAILABLE"),
            AgentState::Discovered => write!(f, "DISCOVERED"),
            AgentState::Busy => write!(f, "BUSY"),
            AgentState::Canceling => write!(f, "CANCELING"),
        }
    }
}

/// External signals the agent control loop turns into transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    Probe,
    Quit,
    ConnectionAccepted,
    /// The job session ended, whatever the reason.
    SessionFinished,
    /// Nobody connected within the reservation timeout.
    ReservationExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
    pub signal: AgentSignal,
}

/// What the control loop must do after feeding a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// State changed; act on the transition.
    Moved(Transition),
    /// Signal has no effect in the current state.
    Ignored,
    /// Signal is a protocol violation in the current state.
    Rejected(ProtocolError),
}

/// The agent's state machine. Pure: owns no sockets or tasks, so every
/// transition can be tested without a network.
#[derive(Debug, Clone)]
pub struct AgentStateMachine {
    state: AgentState,
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStateMachine {
    pub fn new() -> Self {
        Self {
            state: AgentState::Available,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn apply(&mut self, signal: AgentSignal) -> Outcome {
        use AgentSignal::*;
        use AgentState::*;

        let next = match (self.state, signal) {
            (Available, Probe) => Discovered,
            (Discovered | Busy | Canceling, Probe) => return Outcome::Ignored,

            // A known dispatcher may connect without probing first.
            (Available | Discovered, ConnectionAccepted) => Busy,
            (Busy | Canceling, ConnectionAccepted) => {
                return Outcome::Rejected(ProtocolError::AgentBusy)
            }

            (Busy, Quit) => Canceling,
            (Available | Discovered | Canceling, Quit) => return Outcome::Ignored,

            (Busy | Canceling, SessionFinished) => Available,
            (Available | Discovered, SessionFinished) => return Outcome::Ignored,

            (Discovered, ReservationExpired) => Available,
            (_, ReservationExpired) => return Outcome::Ignored,
        };

        let transition = Transition {
            from: self.state,
            to: next,
            signal,
        };
        self.state = next;
        tracing::debug!(from = %transition.from, to = %transition.to, signal = ?signal, "Agent transition");
        Outcome::Moved(transition)
    }
}
