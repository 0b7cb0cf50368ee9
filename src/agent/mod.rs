//! Agent side: runs experimental units on behalf of a dispatcher.
//!
//! - **State machine**: AVAILABLE → DISCOVERED → BUSY → CANCELING → AVAILABLE
//! - **Session**: one job-transfer connection, from query to last output file
//! - **Execution**: spawns the unit's executable in a scratch directory
//! - **Heartbeat**: `<Alive>` records while a job runs
//!
//! # Components
//!
//! - [`HerdAgent`]: control loop owning the discovery socket and job listener
//! - [`AgentStateMachine`]: pure transition table fed by the control loop
//! - [`JobSession`]: protocol driver for a single connection
//! - [`JobExecutor`]: child process lifecycle and cancellation
//!
//! # Security Note
//!
//! Jobs run with the agent's privileges and without sandboxing. Only record
//! paths are confined to the scratch directory.

pub mod executor;
pub mod heartbeat;
pub mod server;
pub mod session;
pub mod state;

pub use executor::JobExecutor;
pub use server::HerdAgent;
pub use session::{JobSession, SessionEnd};
pub use state::{AgentSignal, AgentState, AgentStateMachine, Transition};
