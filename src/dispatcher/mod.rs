//! Dispatcher side: hands experimental units to discovered agents.
//!
//! - [`pool`]: known agents and their assignment
//! - [`queue`]: pending units and retry accounting
//! - [`transfer`]: one job-transfer connection
//! - [`scheduler`]: the [`Dispatcher`] control loop
//! - [`report`]: per-unit and aggregate status for consumers

pub mod pool;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod transfer;

pub use pool::{AgentHandle, AgentPool, AgentSnapshot};
pub use queue::UnitQueue;
pub use report::{BatchReport, UnitReport};
pub use scheduler::Dispatcher;
pub use transfer::{JobReport, JobSpec, JobTransfer, TransferEvent};
