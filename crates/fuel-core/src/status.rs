//! Status enums for tasks, processes, and agent health.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a task in the backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to be picked up once its dependencies are closed.
    #[default]
    Open,
    /// An agent process is working on it.
    InProgress,
    /// Work finished, waiting on (or undergoing) review.
    Review,
    /// Waiting on another task, usually a human.
    Blocked,
    /// Completed.
    Done,
    /// Abandoned.
    Cancelled,
    /// Parked; never scheduled.
    Someday,
}

impl TaskStatus {
    /// Every status, in board order.
    pub const ALL: [TaskStatus; 7] = [
        Self::Open,
        Self::InProgress,
        Self::Review,
        Self::Blocked,
        Self::Done,
        Self::Cancelled,
        Self::Someday,
    ];

    /// Returns true if the task no longer gates its dependents.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Someday => "someday",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a supervised OS process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessStatus {
    /// Still executing.
    #[default]
    Running,
    /// Exited with status 0.
    Completed,
    /// Exited non-zero or was terminated by a signal.
    Failed,
    /// Terminated by the daemon.
    Killed,
}

impl ProcessStatus {
    /// Returns true once the process will not change state again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Health label derived from an agent's consecutive failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No consecutive failures.
    #[default]
    Healthy,
    /// One consecutive failure.
    Warning,
    /// Two to four consecutive failures.
    Degraded,
    /// Five or more consecutive failures.
    Unhealthy,
}

impl HealthStatus {
    /// Map a consecutive-failure count to a label.
    pub fn from_consecutive_failures(failures: u32) -> Self {
        match failures {
            0 => Self::Healthy,
            1 => Self::Warning,
            2..=4 => Self::Degraded,
            _ => Self::Unhealthy,
        }
    }

    /// Wire name of the label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
