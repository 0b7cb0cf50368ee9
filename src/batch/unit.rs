use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::logs;

/// Position of a unit: batch, experiment within the batch, unit within the
/// experiment. Ordering is the scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub batch: usize,
    pub experiment: usize,
    pub unit: usize,
}

impl UnitId {
    pub fn new(batch: usize, experiment: usize, unit: usize) -> Self {
        Self {
            batch,
            experiment,
            unit,
        }
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}.{}", self.batch, self.experiment, self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    Pending,
    Assigned,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl UnitStatus {
    /// Done, Failed and Cancelled are reached at most once and never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Done | UnitStatus::Failed | UnitStatus::Cancelled
        )
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Pending => write!(f, "pending"),
            UnitStatus::Assigned => write!(f, "assigned"),
            UnitStatus::Running => write!(f, "running"),
            UnitStatus::Done => write!(f, "done"),
            UnitStatus::Failed => write!(f, "failed"),
            UnitStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkValue {
    pub name: String,
    pub value: String,
}

/// One schedulable execution of an experiment.
#[derive(Debug, Clone)]
pub struct ExperimentalUnit {
    pub name: String,
    /// Executable shared with the owning experiment.
    pub executable: String,
    /// Path of the unit's configuration file as written in the descriptor.
    pub relative_path: String,
    /// Absolute location of the configuration file; logs live next to it.
    pub path: PathBuf,
    /// Serialized configuration shipped to the agent.
    pub config: String,
    pub forks: Vec<ForkValue>,
    status: UnitStatus,
    pub attempts: u32,
    pub agent: Option<SocketAddr>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExperimentalUnit {
    pub fn new(
        name: String,
        executable: String,
        relative_path: String,
        path: PathBuf,
        config: String,
        forks: Vec<ForkValue>,
    ) -> Self {
        Self {
            name,
            executable,
            relative_path,
            path,
            config,
            forks,
            status: UnitStatus::Pending,
            attempts: 0,
            agent: None,
            last_error: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// Move to `status`. A terminal status is final: once reached, later
    /// updates are refused and `false` is returned.
    pub fn set_status(&mut self, status: UnitStatus) -> bool {
        if self.status.is_terminal() {
            tracing::warn!(
                unit = %self.name,
                current = %self.status,
                requested = %status,
                "Refusing to leave terminal status"
            );
            return false;
        }
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    /// Binary log produced by the run.
    pub fn log_path(&self) -> PathBuf {
        logs::log_file_path(&self.path, false)
    }

    /// XML log descriptor produced by the run.
    pub fn log_descriptor_path(&self) -> PathBuf {
        logs::log_file_path(&self.path, true)
    }

    /// File name of the configuration inside the agent's job directory.
    pub fn config_file_name(&self) -> String {
        file_name(&self.path)
    }

    /// Outputs the agent must send back, relative to the job directory.
    pub fn output_names(&self) -> Vec<String> {
        vec![
            file_name(&self.log_descriptor_path()),
            file_name(&self.log_path()),
        ]
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
