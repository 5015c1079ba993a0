//! Records describing supervised agent processes.

use crate::{ProcessStatus, RunId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What a process was launched to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    #[default]
    Task,
    Review,
    SelfGuided,
    EpicMerge,
    RealityIndex,
}

/// Runtime view of one agent subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Process table id, unique for the daemon's lifetime.
    pub id: u64,
    pub task_id: TaskId,
    pub run_id: RunId,
    pub agent: String,
    pub process_type: ProcessType,
    /// Program and arguments, joined for display.
    pub command: String,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Process {
    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }

    /// Seconds since spawn, or total lifetime once completed.
    pub fn elapsed_seconds(&self) -> i64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds().max(0)
    }
}

/// Captured output of a task's most recent process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl ProcessOutput {
    /// Stdout and stderr joined, for failure classification.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}
