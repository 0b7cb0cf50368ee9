//! Experiment batches: what the dispatcher runs.
//!
//! - [`descriptor`]: XML batch descriptor parsing
//! - [`logs`]: log artifact locations, finished checks and deletion
//! - [`unit`]: [`ExperimentalUnit`] and its status
//!
//! A batch is loaded once; afterwards only unit statuses change, and only
//! from the dispatcher's scheduler loop.

pub mod descriptor;
pub mod logs;
pub mod unit;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BatchError;
pub use unit::{ExperimentalUnit, ForkValue, UnitId, UnitStatus};

/// Which units a load or count considers, judged by their log artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnitSelection {
    #[default]
    All,
    OnlyFinished,
    OnlyUnfinished,
}

impl UnitSelection {
    fn accepts(&self, unit_path: &Path) -> bool {
        match self {
            UnitSelection::All => true,
            UnitSelection::OnlyFinished => logs::is_finished(unit_path),
            UnitSelection::OnlyUnfinished => !logs::is_finished(unit_path),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub selection: UnitSelection,
}

/// Ordered units sharing an executable and its inputs.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub name: String,
    pub executable: String,
    pub arguments: Vec<String>,
    /// Extra input files, relative to the batch directory.
    pub inputs: Vec<String>,
    pub units: Vec<ExperimentalUnit>,
}

/// Per-status unit counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: UnitStatus) {
        match status {
            UnitStatus::Pending => self.pending += 1,
            UnitStatus::Assigned => self.assigned += 1,
            UnitStatus::Running => self.running += 1,
            UnitStatus::Done => self.done += 1,
            UnitStatus::Failed => self.failed += 1,
            UnitStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.running + self.done + self.failed + self.cancelled
    }

    /// Units that completed successfully.
    pub fn finished(&self) -> usize {
        self.done
    }

    /// Everything else, terminal failures included.
    pub fn unfinished(&self) -> usize {
        self.total() - self.finished()
    }

    /// Units still queued or on an agent.
    pub fn outstanding(&self) -> usize {
        self.pending + self.assigned + self.running
    }
}

/// The unit of work submitted to the dispatcher.
#[derive(Debug, Clone)]
pub struct ExperimentBatch {
    /// Descriptor file, if loaded from disk.
    pub file: Option<PathBuf>,
    /// Directory unit paths are relative to.
    pub base_dir: PathBuf,
    pub experiments: Vec<Experiment>,
}

impl ExperimentBatch {
    /// Load a descriptor and the configuration of every selected unit.
    pub fn load(path: &Path, options: LoadOptions) -> Result<Self, BatchError> {
        let xml = read(path)?;
        let base_dir = base_dir_of(path);
        let mut batch = Self::from_descriptor(&xml, &base_dir, options).map_err(|e| match e {
            BatchError::Parse { reason, .. } => BatchError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        batch.file = Some(path.to_path_buf());
        tracing::info!(
            batch = %path.display(),
            experiments = batch.experiments.len(),
            units = batch.count_units(),
            "Batch loaded"
        );
        Ok(batch)
    }

    /// Build a batch from descriptor text; unit paths resolve against `base_dir`.
    pub fn from_descriptor(
        xml: &str,
        base_dir: &Path,
        options: LoadOptions,
    ) -> Result<Self, BatchError> {
        let entries = descriptor::parse(xml).map_err(|reason| BatchError::Parse {
            path: base_dir.to_path_buf(),
            reason,
        })?;

        let mut experiments = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut units = Vec::with_capacity(entry.units.len());
            for (index, unit) in entry.units.into_iter().enumerate() {
                let path = base_dir.join(&unit.path);
                if !options.selection.accepts(&path) {
                    continue;
                }
                let config = read(&path)?;
                let name = unit
                    .name
                    .unwrap_or_else(|| format!("{}-{}", entry.name, index));
                units.push(ExperimentalUnit::new(
                    name,
                    entry.executable.clone(),
                    unit.path,
                    path,
                    config,
                    unit.forks,
                ));
            }
            experiments.push(Experiment {
                name: entry.name,
                executable: entry.executable,
                arguments: entry.arguments,
                inputs: entry.inputs,
                units,
            });
        }

        Ok(Self {
            file: None,
            base_dir: base_dir.to_path_buf(),
            experiments,
        })
    }

    pub fn count_units(&self) -> usize {
        self.experiments.iter().map(|e| e.units.len()).sum()
    }

    /// All units in scheduling order, with their position inside this batch.
    pub fn units(&self) -> impl Iterator<Item = ((usize, usize), &ExperimentalUnit)> {
        self.experiments.iter().enumerate().flat_map(|(e, exp)| {
            exp.units
                .iter()
                .enumerate()
                .map(move |(u, unit)| ((e, u), unit))
        })
    }

    pub fn unit(&self, experiment: usize, unit: usize) -> Option<&ExperimentalUnit> {
        self.experiments.get(experiment)?.units.get(unit)
    }

    pub fn unit_mut(&mut self, experiment: usize, unit: usize) -> Option<&mut ExperimentalUnit> {
        self.experiments.get_mut(experiment)?.units.get_mut(unit)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for (_, unit) in self.units() {
            counts.add(unit.status());
        }
        counts
    }

    /// Count the units of a descriptor on disk without loading their configs.
    pub fn count_experimental_units(
        path: &Path,
        selection: UnitSelection,
    ) -> Result<usize, BatchError> {
        Ok(Self::unit_paths(path)?
            .iter()
            .filter(|unit| selection.accepts(unit))
            .count())
    }

    /// Delete any log artifact left by a previous run of the descriptor's
    /// units. Returns how many units had logs.
    pub fn delete_log_files(path: &Path) -> Result<usize, BatchError> {
        let mut deleted = 0;
        for unit in Self::unit_paths(path)? {
            match logs::delete_logs(&unit) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(source) => {
                    return Err(BatchError::Io {
                        path: unit.clone(),
                        source,
                    })
                }
            }
        }
        tracing::info!(batch = %path.display(), deleted, "Stale logs deleted");
        Ok(deleted)
    }

    fn unit_paths(path: &Path) -> Result<Vec<PathBuf>, BatchError> {
        let xml = read(path)?;
        let base_dir = base_dir_of(path);
        let entries = descriptor::parse(&xml).map_err(|reason| BatchError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(entries
            .iter()
            .flat_map(|e| e.units.iter().map(|u| base_dir.join(&u.path)))
            .collect())
    }
}

fn base_dir_of(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn read(path: &Path) -> Result<String, BatchError> {
    std::fs::read_to_string(path).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_counts_partition_the_batch() {
        let mut counts = StatusCounts::default();
        for status in [
            UnitStatus::Pending,
            UnitStatus::Running,
            UnitStatus::Done,
            UnitStatus::Done,
            UnitStatus::Failed,
            UnitStatus::Cancelled,
        ] {
            counts.add(status);
        }
        assert_eq!(counts.total(), 6);
        assert_eq!(counts.finished(), 2);
        assert_eq!(counts.unfinished(), 4);
        assert_eq!(counts.outstanding(), 2);
        assert_eq!(counts.finished() + counts.unfinished(), counts.total());
    }

    #[test]
    fn missing_descriptor_is_an_io_error() {
        let err = ExperimentBatch::load(Path::new("/nonexistent/batch.xml"), LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, BatchError::Io { .. }));
    }
}
