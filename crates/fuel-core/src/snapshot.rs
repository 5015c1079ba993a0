//! Point-in-time view of the consume daemon.

use crate::{HealthStatus, Process, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tasks partitioned by status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    #[serde(default)]
    pub open: Vec<Task>,
    #[serde(default)]
    pub in_progress: Vec<Task>,
    #[serde(default)]
    pub review: Vec<Task>,
    #[serde(default)]
    pub blocked: Vec<Task>,
    #[serde(default)]
    pub done: Vec<Task>,
    #[serde(default)]
    pub cancelled: Vec<Task>,
    #[serde(default)]
    pub someday: Vec<Task>,
}

impl BoardState {
    /// Partition tasks into buckets, keeping input order within each bucket.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut board = Self::default();
        for task in tasks {
            board.bucket_mut(task.status).push(task);
        }
        board
    }

    pub fn bucket(&self, status: TaskStatus) -> &[Task] {
        match status {
            TaskStatus::Open => &self.open,
            TaskStatus::InProgress => &self.in_progress,
            TaskStatus::Review => &self.review,
            TaskStatus::Blocked => &self.blocked,
            TaskStatus::Done => &self.done,
            TaskStatus::Cancelled => &self.cancelled,
            TaskStatus::Someday => &self.someday,
        }
    }

    fn bucket_mut(&mut self, status: TaskStatus) -> &mut Vec<Task> {
        match status {
            TaskStatus::Open => &mut self.open,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Review => &mut self.review,
            TaskStatus::Blocked => &mut self.blocked,
            TaskStatus::Done => &mut self.done,
            TaskStatus::Cancelled => &mut self.cancelled,
            TaskStatus::Someday => &mut self.someday,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.bucket(*s).len()).sum()
    }
}

/// Health line for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub agent: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub total_runs: u64,
    pub success_rate: Option<f64>,
    pub backoff_seconds: u64,
    pub is_dead: bool,
}

/// Daemon lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    pub paused: bool,
    #[serde(default)]
    pub shutting_down: bool,
    pub started_at: DateTime<Utc>,
    pub instance_id: String,
}

/// The parts of configuration clients display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub interval_seconds: u64,
    /// Per-agent `max_concurrent`.
    pub agent_limits: BTreeMap<String, usize>,
}

/// Immutable, internally consistent view of the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeSnapshot {
    pub board_state: BoardState,
    pub active_processes: Vec<Process>,
    pub health_summary: Vec<HealthSummary>,
    pub runner_state: RunnerState,
    pub config: SnapshotConfig,
}

impl ConsumeSnapshot {
    /// Active processes belonging to one agent.
    pub fn running_for(&self, agent: &str) -> usize {
        self.active_processes.iter().filter(|p| p.agent == agent).count()
    }
}
