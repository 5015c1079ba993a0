//! Task and Run types.

use crate::{CoreError, EpicId, RunId, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How much effort a task is expected to take. Drives agent routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    #[default]
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

/// Selects the completion policy applied when a task's process exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Ordinary unit of work, optionally reviewed.
    #[default]
    Work,
    /// Iterates until the agent closes the task itself.
    SelfGuided,
    /// Merges an epic's mirror workspace back.
    EpicMerge,
    /// Refreshes the project's reality index; failures never cascade.
    RealityIndex,
}

/// A task in the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Short human readable title.
    pub title: String,

    /// Longer description handed to the agent.
    #[serde(default)]
    pub description: Option<String>,

    /// Current task status.
    #[serde(default)]
    pub status: TaskStatus,

    /// Expected effort, used for agent routing.
    #[serde(default)]
    pub complexity: Complexity,

    /// Completion policy.
    #[serde(default)]
    pub kind: TaskKind,

    /// Explicit agent override; bypasses complexity routing.
    #[serde(default)]
    pub agent: Option<String>,

    /// Tasks that must be closed before this one is ready.
    #[serde(default)]
    pub blocked_by: Vec<TaskId>,

    /// Owning epic, if any.
    #[serde(default)]
    pub epic_id: Option<EpicId>,

    /// Free-form labels.
    #[serde(default)]
    pub labels: Vec<String>,

    /// Completed self-guided iterations.
    #[serde(default)]
    pub selfguided_iteration: u32,

    /// Consecutive self-guided iterations that failed.
    #[serde(default)]
    pub selfguided_stuck_count: u32,

    /// Note left by the last done/reopen transition.
    #[serde(default)]
    pub reason: Option<String>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task last changed.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new open task.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            title: title.into(),
            description: None,
            status: TaskStatus::Open,
            complexity: Complexity::default(),
            kind: TaskKind::default(),
            agent: None,
            blocked_by: Vec::new(),
            epic_id: None,
            labels: Vec::new(),
            selfguided_iteration: 0,
            selfguided_stuck_count: 0,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<TaskId>) -> Self {
        self.blocked_by.push(dependency.into());
        self
    }

    pub fn with_epic(mut self, epic: impl Into<EpicId>) -> Self {
        self.epic_id = Some(epic.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Apply a partial update and bump `updated_at`.
    pub fn apply(&mut self, update: TaskUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(iteration) = update.selfguided_iteration {
            self.selfguided_iteration = iteration;
        }
        if let Some(stuck) = update.selfguided_stuck_count {
            self.selfguided_stuck_count = stuck;
        }
        for dependency in update.add_blocked_by {
            if !self.blocked_by.contains(&dependency) {
                self.blocked_by.push(dependency);
            }
        }
        for label in update.add_labels {
            if !self.has_label(&label) {
                self.labels.push(label);
            }
        }
        if update.reason.is_some() {
            self.reason = update.reason;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update applied through the task store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub selfguided_iteration: Option<u32>,
    pub selfguided_stuck_count: Option<u32>,
    pub add_blocked_by: Vec<TaskId>,
    pub add_labels: Vec<String>,
    pub reason: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// One spawn attempt for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub run_id: RunId,

    /// Task this run worked on.
    pub task_id: TaskId,

    /// Agent that executed the run.
    pub agent: String,

    /// Model the agent was configured with.
    pub model: Option<String>,

    /// When the process was spawned.
    pub started_at: DateTime<Utc>,

    /// When the process was reaped. `None` until finalized.
    pub ended_at: Option<DateTime<Utc>>,

    /// Process exit code, absent for signal deaths.
    pub exit_code: Option<i32>,

    /// Wall-clock duration in seconds.
    pub duration_seconds: Option<i64>,

    /// Agent session id, when the agent reported one.
    pub session_id: Option<String>,

    /// Reported cost in USD.
    pub cost_usd: Option<f64>,

    /// Captured (tail-bounded) output.
    pub output: Option<String>,
}

/// Final facts recorded on a run when its process exits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub output: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
}

impl Run {
    /// Record a run starting now.
    pub fn start(task_id: TaskId, agent: impl Into<String>, model: Option<String>) -> Self {
        Self {
            run_id: RunId::generate(),
            task_id,
            agent: agent.into(),
            model,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            duration_seconds: None,
            session_id: None,
            cost_usd: None,
            output: None,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Close the run. A run can only be finalized once.
    pub fn finalize(&mut self, outcome: RunOutcome) -> Result<(), CoreError> {
        if self.is_finalized() {
            return Err(CoreError::RunAlreadyFinalized(self.run_id.to_string()));
        }
        let ended_at = Utc::now();
        self.duration_seconds = Some((ended_at - self.started_at).num_seconds().max(0));
        self.ended_at = Some(ended_at);
        self.exit_code = outcome.exit_code;
        self.session_id = outcome.session_id;
        self.cost_usd = outcome.cost_usd;
        self.output = Some(outcome.output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Fix the build")
            .with_complexity(Complexity::Simple)
            .with_label("ci");

        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.kind, TaskKind::Work);
        assert!(task.has_label("ci"));
        assert!(task.blocked_by.is_empty());
    }

    #[test]
    fn test_apply_update_dedups_dependencies() {
        let mut task = Task::new("t").with_dependency("f-000001");
        let update = TaskUpdate {
            status: Some(TaskStatus::Blocked),
            add_blocked_by: vec![TaskId::new("f-000001"), TaskId::new("f-000002")],
            ..TaskUpdate::default()
        };
        task.apply(update);

        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.blocked_by.len(), 2);
    }

    #[test]
    fn test_run_finalize_once() {
        let mut run = Run::start(TaskId::new("f-abcdef"), "claude", None);
        assert!(!run.is_finalized());

        run.finalize(RunOutcome {
            exit_code: Some(0),
            output: "ok".into(),
            ..RunOutcome::default()
        })
        .unwrap();
        assert!(run.is_finalized());
        assert_eq!(run.exit_code, Some(0));
        assert!(run.duration_seconds.unwrap() >= 0);

        let err = run.finalize(RunOutcome::default()).unwrap_err();
        assert!(matches!(err, CoreError::RunAlreadyFinalized(_)));
        assert_eq!(run.output.as_deref(), Some("ok"));
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let json = r#"{
            "id": "f-111111",
            "title": "minimal",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.complexity, Complexity::Moderate);
        assert_eq!(task.selfguided_stuck_count, 0);
    }
}
