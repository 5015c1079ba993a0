//! Shared daemon state.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use fuel_core::{RunId, TaskId};

use crate::agent_task::AgentTask;
use crate::config::{ConfigService, YamlConfig};
use crate::epic::{EpicService, MemoryEpicService};
use crate::error::DaemonError;
use crate::events::EventBus;
use crate::health::AgentHealthTracker;
use crate::lifecycle::LifecycleManager;
use crate::process::ProcessManager;
use crate::prompt::{PromptBuilder, TemplatePromptBuilder};
use crate::store::{MemoryRunStore, MemoryTaskStore, RunStore, TaskStore};

/// External services the daemon drives.
#[derive(Clone)]
pub struct Collaborators {
    pub tasks: Arc<dyn TaskStore>,
    pub runs: Arc<dyn RunStore>,
    pub config: Arc<dyn ConfigService>,
    pub prompts: Arc<dyn PromptBuilder>,
    pub epics: Arc<dyn EpicService>,
}

impl Collaborators {
    /// File-backed services rooted at a `.fuel` directory: `config.yaml`,
    /// `tasks.json` and `mirrors/`.
    pub fn open(fuel_dir: &Path) -> Result<Self, DaemonError> {
        Ok(Self {
            tasks: Arc::new(MemoryTaskStore::open(fuel_dir.join("tasks.json"))?),
            runs: Arc::new(MemoryRunStore::new()),
            config: Arc::new(YamlConfig::load(fuel_dir.join("config.yaml"))?),
            prompts: Arc::new(TemplatePromptBuilder::new()),
            epics: Arc::new(MemoryEpicService::new(fuel_dir.join("mirrors"))),
        })
    }
}

/// A task whose process is running (or exited but not yet reaped).
pub struct InFlight {
    pub task: Arc<dyn AgentTask>,
    pub run_id: RunId,
    pub agent: String,
    pub started_at: DateTime<Utc>,
}

/// Shared application state.
pub struct AppState {
    /// Project directory agents run in.
    pub cwd: PathBuf,

    pub tasks: Arc<dyn TaskStore>,
    pub runs: Arc<dyn RunStore>,
    pub config: Arc<dyn ConfigService>,
    pub prompts: Arc<dyn PromptBuilder>,
    pub epics: Arc<dyn EpicService>,

    pub health: AgentHealthTracker,
    pub processes: Arc<ProcessManager>,
    pub lifecycle: LifecycleManager,
    pub events: EventBus,

    /// In-flight work indexed by TaskId.
    pub in_flight: RwLock<HashMap<TaskId, InFlight>>,

    /// Tasks whose work succeeded and that wait for a review process.
    pub pending_reviews: Mutex<VecDeque<TaskId>>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc. Process logs go to
    /// `<cwd>/.fuel/processes`.
    pub fn new(
        cwd: impl Into<PathBuf>,
        collaborators: Collaborators,
        events: EventBus,
    ) -> Arc<Self> {
        let cwd = cwd.into();
        let processes = Arc::new(ProcessManager::new(
            cwd.join(".fuel").join("processes"),
            collaborators.config.clone(),
        ));
        let lifecycle = LifecycleManager::new(
            events.instance_id(),
            collaborators.config.interval_seconds(),
            processes.clone(),
        );
        Arc::new(Self {
            cwd,
            tasks: collaborators.tasks,
            runs: collaborators.runs,
            config: collaborators.config,
            prompts: collaborators.prompts,
            epics: collaborators.epics,
            health: AgentHealthTracker::new(),
            processes,
            lifecycle,
            events,
            in_flight: RwLock::new(HashMap::new()),
            pending_reviews: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue a review unless one is already queued for the task.
    pub async fn enqueue_review(&self, task_id: TaskId) {
        let mut queue = self.pending_reviews.lock().await;
        if !queue.contains(&task_id) {
            queue.push_back(task_id);
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    pub async fn is_in_flight(&self, task_id: &TaskId) -> bool {
        self.in_flight.read().await.contains_key(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_empty_fuel_dir() {
        let dir = tempfile::tempdir().unwrap();
        let collaborators = Collaborators::open(dir.path()).unwrap();
        assert_eq!(collaborators.config.interval_seconds(), 5);
    }

    #[test]
    fn test_open_reports_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "interval_seconds: 0\n").unwrap();
        let err = Collaborators::open(dir.path()).err().unwrap();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn test_open_reports_corrupt_task_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tasks.json"), "{ nope").unwrap();
        let err = Collaborators::open(dir.path()).err().unwrap();
        assert!(matches!(err, DaemonError::Store(_)));
    }
}
