use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::batch::{ExperimentBatch, ExperimentalUnit, StatusCounts, UnitId, UnitStatus};
use crate::config::RetryPolicy;
use crate::dispatcher::report::BatchReport;
use crate::dispatcher::transfer::JobSpec;

/// Pending units of every submitted batch, plus retry accounting.
///
/// Units are handed out in [`UnitId`] order: batch, then experiment, then
/// position inside the experiment. A unit is in the pending set exactly when
/// its status is Pending.
#[derive(Debug)]
pub struct UnitQueue {
    batches: Vec<ExperimentBatch>,
    pending: BTreeSet<UnitId>,
    retry: RetryPolicy,
}

impl UnitQueue {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            batches: Vec::new(),
            pending: BTreeSet::new(),
            retry,
        }
    }

    /// Queue every Pending unit of `batch`. Returns the batch index.
    pub fn push_batch(&mut self, batch: ExperimentBatch) -> usize {
        let index = self.batches.len();
        for ((e, u), unit) in batch.units() {
            if unit.status() == UnitStatus::Pending {
                self.pending.insert(UnitId::new(index, e, u));
            }
        }
        self.batches.push(batch);
        index
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Next unit in scheduling order, removed from the pending set.
    pub fn pop_next(&mut self) -> Option<UnitId> {
        self.pending.pop_first()
    }

    pub fn unit(&self, id: UnitId) -> Option<&ExperimentalUnit> {
        self.batches.get(id.batch)?.unit(id.experiment, id.unit)
    }

    fn unit_mut(&mut self, id: UnitId) -> Option<&mut ExperimentalUnit> {
        self.batches
            .get_mut(id.batch)?
            .unit_mut(id.experiment, id.unit)
    }

    /// What must be shipped to an agent to run `id`.
    pub fn job_spec(&self, id: UnitId) -> Option<JobSpec> {
        let batch = self.batches.get(id.batch)?;
        let experiment = batch.experiments.get(id.experiment)?;
        let unit = experiment.units.get(id.unit)?;
        Some(JobSpec {
            name: unit.name.clone(),
            exe: experiment.executable.clone(),
            args: experiment.arguments.clone(),
            config_name: unit.config_file_name(),
            config: unit.config.clone(),
            inputs: experiment
                .inputs
                .iter()
                .map(|input| (input.clone(), batch.base_dir.join(input)))
                .collect(),
            outputs: unit.output_names(),
            output_dir: unit
                .path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| batch.base_dir.clone()),
        })
    }

    /// A popped unit was handed to `agent`. Counts one attempt.
    pub fn assign(&mut self, id: UnitId, agent: SocketAddr) {
        self.pending.remove(&id);
        if let Some(unit) = self.unit_mut(id) {
            if unit.set_status(UnitStatus::Assigned) {
                unit.attempts += 1;
                unit.agent = Some(agent);
            }
        }
    }

    pub fn mark_running(&mut self, id: UnitId) {
        if let Some(unit) = self.unit_mut(id) {
            if unit.status() == UnitStatus::Assigned {
                unit.set_status(UnitStatus::Running);
            }
        }
    }

    pub fn complete(&mut self, id: UnitId) {
        if let Some(unit) = self.unit_mut(id) {
            unit.last_error = None;
            unit.set_status(UnitStatus::Done);
        }
    }

    pub fn cancel(&mut self, id: UnitId) {
        if let Some(unit) = self.unit_mut(id) {
            unit.set_status(UnitStatus::Cancelled);
        }
    }

    /// Record a failed attempt. The unit goes back to Pending while
    /// `retryable` holds and attempts remain, otherwise it is Failed.
    /// Returns the resulting status.
    pub fn fail(&mut self, id: UnitId, reason: String, retryable: bool) -> Option<UnitStatus> {
        let max_attempts = self.retry.max_attempts;
        let unit = self.unit_mut(id)?;
        if unit.status().is_terminal() {
            return Some(unit.status());
        }
        unit.last_error = Some(reason);
        let status = if retryable && unit.attempts < max_attempts {
            UnitStatus::Pending
        } else {
            UnitStatus::Failed
        };
        unit.set_status(status);
        if status == UnitStatus::Pending {
            self.pending.insert(id);
        }
        Some(status)
    }

    /// Put a unit back without counting the attempt, e.g. when the agent
    /// turned it down before starting.
    pub fn requeue(&mut self, id: UnitId) {
        let Some(unit) = self.unit_mut(id) else {
            return;
        };
        if unit.status().is_terminal() {
            return;
        }
        unit.attempts = unit.attempts.saturating_sub(1);
        unit.agent = None;
        unit.set_status(UnitStatus::Pending);
        self.pending.insert(id);
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for batch in &self.batches {
            for (_, unit) in batch.units() {
                counts.add(unit.status());
            }
        }
        counts
    }

    /// Units still Pending, Assigned or Running.
    pub fn outstanding(&self) -> usize {
        self.status_counts().outstanding()
    }

    pub fn batches(&self) -> &[ExperimentBatch] {
        &self.batches
    }

    pub fn report(&self) -> BatchReport {
        BatchReport::from_batches(&self.batches)
    }
}
