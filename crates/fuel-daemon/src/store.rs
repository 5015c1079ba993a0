//! Task and run persistence.
//!
//! The daemon is the only writer; every mutation goes through these traits.
//! [`MemoryTaskStore`] keeps tasks in memory and can mirror them to a JSON
//! file so the backlog survives restarts.

use async_trait::async_trait;
use chrono::Utc;
use fuel_core::{BoardState, Run, RunId, RunOutcome, Task, TaskId, TaskStatus, TaskUpdate};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run already finalized: {0}")]
    RunAlreadyFinalized(RunId),

    #[error("Task {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Failed to persist tasks to {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse task file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Backlog operations used by the scheduling core.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Open tasks whose dependencies are all closed, oldest first.
    async fn list_ready(&self) -> Result<Vec<Task>, StoreError>;

    async fn find(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Mark a task in progress.
    async fn start(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Close a task and unblock dependents whose dependencies are now closed.
    async fn done(&self, id: &TaskId, note: Option<String>) -> Result<Task, StoreError>;

    /// Put a task back in the ready queue.
    async fn reopen(&self, id: &TaskId, reason: Option<String>) -> Result<Task, StoreError>;

    async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, StoreError>;

    async fn create(&self, task: Task) -> Result<Task, StoreError>;

    /// Every task partitioned by status, from a single read.
    async fn board(&self) -> Result<BoardState, StoreError>;
}

/// Run record operations.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: Run) -> Result<(), StoreError>;

    /// Record the outcome of a run. Fails if the run was already finalized.
    async fn finalize_run(&self, run_id: &RunId, outcome: RunOutcome) -> Result<Run, StoreError>;

    /// Runs for a task, oldest first.
    async fn runs_for(&self, task_id: &TaskId) -> Result<Vec<Run>, StoreError>;
}

/// In-memory [`TaskStore`] with optional JSON persistence.
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    path: Option<PathBuf>,
}

impl MemoryTaskStore {
    /// Empty, non-persistent store.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Load from `path` if it exists and write back after each mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tasks = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| StoreError::Persist {
                path: path.clone(),
                source,
            })?;
            let list: Vec<Task> =
                serde_json::from_str(&text).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?;
            list.into_iter().map(|t| (t.id.clone(), t)).collect()
        } else {
            HashMap::new()
        };
        info!(path = %path.display(), tasks = tasks.len(), "Opened task store");
        Ok(Self {
            tasks: RwLock::new(tasks),
            path: Some(path),
        })
    }

    /// Number of tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    async fn persist(&self, tasks: &HashMap<TaskId, Task>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list = sorted(tasks.values().cloned());
        let json = serde_json::to_string_pretty(&list).map_err(|e| StoreError::Persist {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        write_atomic(path, json.as_bytes())
            .await
            .map_err(|source| StoreError::Persist {
                path: path.clone(),
                source,
            })
    }

    async fn mutate<F>(&self, id: &TaskId, f: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), StoreError> + Send,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        f(task)?;
        let updated = task.clone();
        self.persist(&tasks).await?;
        Ok(updated)
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(tasks: impl Iterator<Item = Task>) -> Vec<Task> {
    let mut list: Vec<Task> = tasks.collect();
    list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    list
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

fn dependencies_closed(task: &Task, tasks: &HashMap<TaskId, Task>) -> bool {
    task.blocked_by.iter().all(|dep| {
        tasks
            .get(dep)
            .map(|d| d.status.is_closed())
            // A dependency that no longer exists does not block.
            .unwrap_or(true)
    })
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_ready(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let ready = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open && dependencies_closed(t, &tasks))
            .cloned();
        Ok(sorted(ready))
    }

    async fn find(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn start(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.mutate(id, |task| {
            if task.status.is_closed() {
                return Err(StoreError::InvalidTransition {
                    id: task.id.clone(),
                    from: task.status,
                    to: TaskStatus::InProgress,
                });
            }
            task.apply(TaskUpdate::status(TaskStatus::InProgress));
            Ok(())
        })
        .await
    }

    async fn done(&self, id: &TaskId, note: Option<String>) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        task.apply(TaskUpdate {
            status: Some(TaskStatus::Done),
            reason: note,
            ..TaskUpdate::default()
        });
        let closed = task.clone();

        let unblocked: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Blocked && t.blocked_by.contains(id))
            .filter(|t| dependencies_closed(t, &tasks))
            .map(|t| t.id.clone())
            .collect();
        for dependent in &unblocked {
            if let Some(t) = tasks.get_mut(dependent) {
                t.apply(TaskUpdate::status(TaskStatus::Open));
                debug!(task_id = %dependent, unblocked_by = %id, "Task unblocked");
            }
        }

        self.persist(&tasks).await?;
        Ok(closed)
    }

    async fn reopen(&self, id: &TaskId, reason: Option<String>) -> Result<Task, StoreError> {
        self.mutate(id, |task| {
            task.apply(TaskUpdate {
                status: Some(TaskStatus::Open),
                reason,
                ..TaskUpdate::default()
            });
            Ok(())
        })
        .await
    }

    async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, StoreError> {
        self.mutate(id, |task| {
            task.apply(update);
            Ok(())
        })
        .await
    }

    async fn create(&self, mut task: Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        while tasks.contains_key(&task.id) {
            task.id = TaskId::generate();
        }
        task.updated_at = Utc::now();
        tasks.insert(task.id.clone(), task.clone());
        self.persist(&tasks).await?;
        debug!(task_id = %task.id, title = %task.title, "Task created");
        Ok(task)
    }

    async fn board(&self) -> Result<BoardState, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(BoardState::from_tasks(sorted(tasks.values().cloned())))
    }
}

/// In-memory [`RunStore`].
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<Vec<Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        self.runs.write().await.push(run);
        Ok(())
    }

    async fn finalize_run(&self, run_id: &RunId, outcome: RunOutcome) -> Result<Run, StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .iter_mut()
            .find(|r| &r.run_id == run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.clone()))?;
        if run.finalize(outcome).is_err() {
            warn!(run_id = %run_id, "Attempted to finalize a run twice");
            return Err(StoreError::RunAlreadyFinalized(run_id.clone()));
        }
        Ok(run.clone())
    }

    async fn runs_for(&self, task_id: &TaskId) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .filter(|r| &r.task_id == task_id)
            .cloned()
            .collect())
    }
}
