use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batch::{ExperimentBatch, StatusCounts, UnitId, UnitStatus};

/// Final or in-progress state of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub id: UnitId,
    pub experiment: String,
    pub name: String,
    pub path: PathBuf,
    pub status: UnitStatus,
    pub attempts: u32,
    pub agent: Option<SocketAddr>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What the dispatcher hands to the batch consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub units: Vec<UnitReport>,
    pub counts: StatusCounts,
    pub finished: usize,
    pub unfinished: usize,
}

impl BatchReport {
    pub fn from_batches(batches: &[ExperimentBatch]) -> Self {
        let mut units = Vec::new();
        let mut counts = StatusCounts::default();
        for (b, batch) in batches.iter().enumerate() {
            for ((e, u), unit) in batch.units() {
                counts.add(unit.status());
                units.push(UnitReport {
                    id: UnitId::new(b, e, u),
                    experiment: batch.experiments[e].name.clone(),
                    name: unit.name.clone(),
                    path: unit.path.clone(),
                    status: unit.status(),
                    attempts: unit.attempts,
                    agent: unit.agent,
                    last_error: unit.last_error.clone(),
                    finished_at: unit.finished_at,
                });
            }
        }
        Self {
            units,
            finished: counts.finished(),
            unfinished: counts.unfinished(),
            counts,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.total()
    }

    /// Every unit reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.counts.outstanding() == 0
    }
}
