//! Per-kind completion policies.
//!
//! Every in-flight unit of work is an [`AgentTask`]. The variant is chosen
//! from the task's [`TaskKind`] when it is spawned (reviews are chosen by the
//! spawner) and decides what happens to the task once its process exits.

use crate::config::ConfigService;
use crate::epic::EpicError;
use crate::output::parse_review_verdict;
use crate::prompt::PromptBuilder;
use crate::state::AppState;
use crate::store::StoreError;
use async_trait::async_trait;
use fuel_core::{
    CompletionType, FailureType, ProcessOutput, ProcessType, RunId, Task, TaskId, TaskKind,
    TaskStatus, TaskUpdate,
};
use fuel_ipc::Payload;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Failed self-guided iterations in a row before a human is asked to step in.
pub const SELF_GUIDED_STUCK_THRESHOLD: u32 = 3;

/// Label on tasks created when self-guided work gets stuck.
pub const NEEDS_HUMAN_LABEL: &str = "needs-human";

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Epic(#[from] EpicError),

    #[error("Merge task {0} has no epic")]
    MissingEpic(TaskId),
}

/// What a finished process produced.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub agent: String,
    pub exit_code: Option<i32>,
    pub completion: CompletionType,
    pub failure: Option<FailureType>,
    pub output: ProcessOutput,
}

impl TaskResult {
    fn failure_reason(&self) -> String {
        let kind = self.failure.map(|f| f.as_str()).unwrap_or("unknown");
        match self.exit_code {
            Some(code) => format!("{} failed ({kind}, exit {code})", self.agent),
            None => format!("{} failed ({kind})", self.agent),
        }
    }
}

#[async_trait]
pub trait AgentTask: Send + Sync {
    fn task_id(&self) -> &TaskId;

    fn agent_name(&self, config: &dyn ConfigService) -> String;

    fn build_prompt(&self, prompts: &dyn PromptBuilder, cwd: &Path) -> String;

    fn process_type(&self) -> ProcessType;

    async fn on_success(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError>;

    async fn on_failure(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError>;
}

/// Build the completion policy for a task's kind.
pub fn agent_task_for(task: Task) -> Arc<dyn AgentTask> {
    match task.kind {
        TaskKind::Work => Arc::new(WorkTask::new(task)),
        TaskKind::SelfGuided => Arc::new(SelfGuidedTask::new(task)),
        TaskKind::EpicMerge => Arc::new(EpicMergeTask::new(task)),
        TaskKind::RealityIndex => Arc::new(RealityIndexTask::new(task)),
    }
}

/// Explicit override first, then complexity routing.
fn routed_agent(task: &Task, config: &dyn ConfigService) -> String {
    task.agent
        .clone()
        .unwrap_or_else(|| config.agent_for_complexity(task.complexity))
}

async fn current(state: &AppState, id: &TaskId) -> Result<Task, CompletionError> {
    state
        .tasks
        .find(id)
        .await?
        .ok_or_else(|| StoreError::TaskNotFound(id.clone()).into())
}

/// Ordinary work: review or close on success, retry on failure.
pub struct WorkTask {
    task: Task,
}

impl WorkTask {
    pub fn new(task: Task) -> Self {
        Self { task }
    }
}

#[async_trait]
impl AgentTask for WorkTask {
    fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    fn agent_name(&self, config: &dyn ConfigService) -> String {
        routed_agent(&self.task, config)
    }

    fn build_prompt(&self, prompts: &dyn PromptBuilder, cwd: &Path) -> String {
        prompts.build(&self.task, ProcessType::Task, cwd)
    }

    fn process_type(&self) -> ProcessType {
        ProcessType::Task
    }

    async fn on_success(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError> {
        let task = current(state, &self.task.id).await?;
        if task.status == TaskStatus::Done {
            info!(task_id = %task.id, "Task already closed by agent");
            return Ok(());
        }

        if state.config.review_enabled() {
            state
                .tasks
                .update(&task.id, TaskUpdate::status(TaskStatus::Review))
                .await?;
            state.enqueue_review(task.id.clone()).await;
            info!(task_id = %task.id, "Task queued for review");
        } else {
            state
                .tasks
                .done(&task.id, Some(format!("completed by {}", result.agent)))
                .await?;
            info!(task_id = %task.id, "Task auto-completed");
        }
        Ok(())
    }

    async fn on_failure(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError> {
        state
            .tasks
            .reopen(&self.task.id, Some(result.failure_reason()))
            .await?;
        info!(task_id = %self.task.id, "Task reopened for retry");
        Ok(())
    }
}

/// Reviews the work done for a task. Runs under the original task's id.
pub struct ReviewTask {
    task: Task,
}

impl ReviewTask {
    pub fn new(task: Task) -> Self {
        Self { task }
    }
}

#[async_trait]
impl AgentTask for ReviewTask {
    fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    fn agent_name(&self, config: &dyn ConfigService) -> String {
        config.review_agent()
    }

    fn build_prompt(&self, prompts: &dyn PromptBuilder, cwd: &Path) -> String {
        prompts.build(&self.task, ProcessType::Review, cwd)
    }

    fn process_type(&self) -> ProcessType {
        ProcessType::Review
    }

    async fn on_success(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError> {
        let task = current(state, &self.task.id).await?;
        let was_already_done = task.status == TaskStatus::Done;
        let verdict = parse_review_verdict(&result.output.stdout);

        if verdict.passed {
            if !was_already_done {
                state
                    .tasks
                    .done(&task.id, Some("review passed".to_string()))
                    .await?;
            }
            info!(task_id = %task.id, "Review passed");
        } else {
            let reason = if verdict.issues.is_empty() {
                "review failed".to_string()
            } else {
                format!("review failed: {}", verdict.issues.join("; "))
            };
            state.tasks.reopen(&task.id, Some(reason)).await?;
            info!(
                task_id = %task.id,
                issues = verdict.issues.len(),
                "Review failed, task reopened"
            );
        }

        state.events.publish(Payload::ReviewCompleted {
            task_id: task.id,
            passed: verdict.passed,
            issues: verdict.issues,
            was_already_done,
        });
        Ok(())
    }

    async fn on_failure(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError> {
        state
            .tasks
            .reopen(
                &self.task.id,
                Some(format!("review could not run: {}", result.failure_reason())),
            )
            .await?;
        Ok(())
    }
}

/// Iterates until the agent closes the task itself.
pub struct SelfGuidedTask {
    task: Task,
}

impl SelfGuidedTask {
    pub fn new(task: Task) -> Self {
        Self { task }
    }
}

#[async_trait]
impl AgentTask for SelfGuidedTask {
    fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    fn agent_name(&self, config: &dyn ConfigService) -> String {
        routed_agent(&self.task, config)
    }

    fn build_prompt(&self, prompts: &dyn PromptBuilder, cwd: &Path) -> String {
        prompts.build(&self.task, ProcessType::SelfGuided, cwd)
    }

    fn process_type(&self) -> ProcessType {
        ProcessType::SelfGuided
    }

    async fn on_success(
        &self,
        state: &AppState,
        _result: &TaskResult,
    ) -> Result<(), CompletionError> {
        let task = current(state, &self.task.id).await?;
        if task.status == TaskStatus::Done {
            info!(
                task_id = %task.id,
                iterations = task.selfguided_iteration + 1,
                "Self-guided task finished"
            );
            return Ok(());
        }

        let update = TaskUpdate {
            status: Some(TaskStatus::Open),
            selfguided_iteration: Some(task.selfguided_iteration + 1),
            selfguided_stuck_count: Some(0),
            ..TaskUpdate::default()
        };
        state.tasks.update(&task.id, update).await?;
        info!(
            task_id = %task.id,
            iteration = task.selfguided_iteration + 1,
            "Self-guided iteration complete"
        );
        Ok(())
    }

    async fn on_failure(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError> {
        let task = current(state, &self.task.id).await?;
        let stuck = task.selfguided_stuck_count + 1;

        if stuck < SELF_GUIDED_STUCK_THRESHOLD {
            let update = TaskUpdate {
                status: Some(TaskStatus::Open),
                selfguided_stuck_count: Some(stuck),
                reason: Some(result.failure_reason()),
                ..TaskUpdate::default()
            };
            state.tasks.update(&task.id, update).await?;
            info!(task_id = %task.id, stuck, "Self-guided iteration failed, retrying");
            return Ok(());
        }

        let human = Task::new(format!("Needs human: {}", task.title))
            .with_description(format!(
                "Self-guided task {} failed {stuck} iterations in a row. Last failure: {}.",
                task.id,
                result.failure_reason()
            ))
            .with_label(NEEDS_HUMAN_LABEL)
            .with_complexity(task.complexity);
        let human = state.tasks.create(human).await?;

        let update = TaskUpdate {
            status: Some(TaskStatus::Blocked),
            selfguided_stuck_count: Some(stuck),
            add_blocked_by: vec![human.id.clone()],
            reason: Some(format!("stuck, waiting on {}", human.id)),
            ..TaskUpdate::default()
        };
        state.tasks.update(&task.id, update).await?;
        warn!(
            task_id = %task.id,
            needs_human = %human.id,
            stuck,
            "Self-guided task stuck, escalated"
        );
        Ok(())
    }
}

/// Merges an epic's mirror workspace.
pub struct EpicMergeTask {
    task: Task,
}

impl EpicMergeTask {
    pub fn new(task: Task) -> Self {
        Self { task }
    }
}

#[async_trait]
impl AgentTask for EpicMergeTask {
    fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    fn agent_name(&self, config: &dyn ConfigService) -> String {
        routed_agent(&self.task, config)
    }

    fn build_prompt(&self, prompts: &dyn PromptBuilder, cwd: &Path) -> String {
        prompts.build(&self.task, ProcessType::EpicMerge, cwd)
    }

    fn process_type(&self) -> ProcessType {
        ProcessType::EpicMerge
    }

    async fn on_success(
        &self,
        state: &AppState,
        _result: &TaskResult,
    ) -> Result<(), CompletionError> {
        let epic = self
            .task
            .epic_id
            .as_ref()
            .ok_or_else(|| CompletionError::MissingEpic(self.task.id.clone()))?;
        state.epics.cleanup_mirror(epic).await?;
        state
            .tasks
            .done(&self.task.id, Some("merged".to_string()))
            .await?;
        info!(task_id = %self.task.id, epic_id = %epic, "Epic merged");
        Ok(())
    }

    async fn on_failure(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError> {
        let epic = self
            .task
            .epic_id
            .as_ref()
            .ok_or_else(|| CompletionError::MissingEpic(self.task.id.clone()))?;
        state.epics.pause_epic(epic).await?;
        state.epics.mark_merge_failed(epic).await?;
        state
            .tasks
            .update(
                &self.task.id,
                TaskUpdate::status(TaskStatus::Cancelled)
                    .with_reason(format!("merge failed: {}", result.failure_reason())),
            )
            .await?;
        warn!(task_id = %self.task.id, epic_id = %epic, "Epic merge failed, epic paused");
        Ok(())
    }
}

/// Refreshes the reality index. Never cascades failures.
pub struct RealityIndexTask {
    task: Task,
}

impl RealityIndexTask {
    pub fn new(task: Task) -> Self {
        Self { task }
    }
}

#[async_trait]
impl AgentTask for RealityIndexTask {
    fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    fn agent_name(&self, config: &dyn ConfigService) -> String {
        routed_agent(&self.task, config)
    }

    fn build_prompt(&self, prompts: &dyn PromptBuilder, cwd: &Path) -> String {
        prompts.build(&self.task, ProcessType::RealityIndex, cwd)
    }

    fn process_type(&self) -> ProcessType {
        ProcessType::RealityIndex
    }

    async fn on_success(
        &self,
        state: &AppState,
        _result: &TaskResult,
    ) -> Result<(), CompletionError> {
        if let Err(e) = state.tasks.done(&self.task.id, None).await {
            warn!(task_id = %self.task.id, error = %e, "Could not close reality index task");
        }
        Ok(())
    }

    async fn on_failure(
        &self,
        state: &AppState,
        result: &TaskResult,
    ) -> Result<(), CompletionError> {
        let update = TaskUpdate::status(TaskStatus::Cancelled).with_reason(result.failure_reason());
        if let Err(e) = state.tasks.update(&self.task.id, update).await {
            warn!(task_id = %self.task.id, error = %e, "Could not discard reality index task");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FuelConfig, YamlConfig};
    use crate::epic::{EpicService, MemoryEpicService};
    use crate::events::EventBus;
    use crate::prompt::TemplatePromptBuilder;
    use crate::state::Collaborators;
    use crate::store::{MemoryRunStore, MemoryTaskStore};
    use fuel_core::EpicId;

    fn state_with(config: FuelConfig, dir: &Path) -> Arc<AppState> {
        let collaborators = Collaborators {
            tasks: Arc::new(MemoryTaskStore::new()),
            runs: Arc::new(MemoryRunStore::new()),
            config: Arc::new(YamlConfig::from_config(config)),
            prompts: Arc::new(TemplatePromptBuilder::new()),
            epics: Arc::new(MemoryEpicService::new(dir.join("mirrors"))),
        };
        AppState::new(dir, collaborators, EventBus::new("test"))
    }

    fn result(task_id: &TaskId, completion: CompletionType, stdout: &str) -> TaskResult {
        TaskResult {
            task_id: task_id.clone(),
            run_id: RunId::generate(),
            agent: "claude".into(),
            exit_code: Some(if completion == CompletionType::Success { 0 } else { 1 }),
            completion,
            failure: (completion != CompletionType::Success).then_some(FailureType::Crash),
            output: ProcessOutput {
                stdout: stdout.to_string(),
                ..ProcessOutput::default()
            },
        }
    }

    async fn status(state: &AppState, id: &TaskId) -> TaskStatus {
        state.tasks.find(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_work_success_without_review_closes() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let task = state.tasks.create(Task::new("w")).await.unwrap();
        state.tasks.start(&task.id).await.unwrap();

        let work = agent_task_for(task.clone());
        work.on_success(&state, &result(&task.id, CompletionType::Success, ""))
            .await
            .unwrap();
        assert_eq!(status(&state, &task.id).await, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_work_success_with_review_queues_review() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FuelConfig::default();
        config.review.enabled = true;
        let state = state_with(config, dir.path());
        let task = state.tasks.create(Task::new("w")).await.unwrap();

        agent_task_for(task.clone())
            .on_success(&state, &result(&task.id, CompletionType::Success, ""))
            .await
            .unwrap();
        assert_eq!(status(&state, &task.id).await, TaskStatus::Review);
        assert_eq!(state.pending_reviews.lock().await.front(), Some(&task.id));
    }

    #[tokio::test]
    async fn test_work_failure_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let task = state.tasks.create(Task::new("w")).await.unwrap();
        state.tasks.start(&task.id).await.unwrap();

        agent_task_for(task.clone())
            .on_failure(&state, &result(&task.id, CompletionType::Failed, ""))
            .await
            .unwrap();
        let reopened = state.tasks.find(&task.id).await.unwrap().unwrap();
        assert_eq!(reopened.status, TaskStatus::Open);
        assert!(reopened.reason.unwrap().contains("crash"));
    }

    #[tokio::test]
    async fn test_review_fail_reopens_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let task = state
            .tasks
            .create(Task::new("w").with_status(TaskStatus::Review))
            .await
            .unwrap();
        let mut events = state.events.subscribe();

        let review = ReviewTask::new(task.clone());
        review
            .on_success(
                &state,
                &result(
                    &task.id,
                    CompletionType::Success,
                    "{\"review\": \"fail\", \"issues\": [\"no tests\"]}\n",
                ),
            )
            .await
            .unwrap();

        let reopened = state.tasks.find(&task.id).await.unwrap().unwrap();
        assert_eq!(reopened.status, TaskStatus::Open);
        assert_eq!(reopened.reason.as_deref(), Some("review failed: no tests"));

        let event = events.recv().await.unwrap();
        match event.payload {
            Payload::ReviewCompleted {
                passed,
                issues,
                was_already_done,
                ..
            } => {
                assert!(!passed);
                assert_eq!(issues, vec!["no tests"]);
                assert!(!was_already_done);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_review_pass_on_done_task() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let task = state
            .tasks
            .create(Task::new("w").with_status(TaskStatus::Done))
            .await
            .unwrap();
        let mut events = state.events.subscribe();

        ReviewTask::new(task.clone())
            .on_success(&state, &result(&task.id, CompletionType::Success, "REVIEW_PASSED"))
            .await
            .unwrap();
        assert_eq!(status(&state, &task.id).await, TaskStatus::Done);
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            Payload::ReviewCompleted { passed: true, was_already_done: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_self_guided_success_advances_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let mut task = Task::new("explore").with_kind(TaskKind::SelfGuided);
        task.selfguided_stuck_count = 2;
        let task = state.tasks.create(task).await.unwrap();
        state.tasks.start(&task.id).await.unwrap();

        agent_task_for(task.clone())
            .on_success(&state, &result(&task.id, CompletionType::Success, ""))
            .await
            .unwrap();
        let after = state.tasks.find(&task.id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Open);
        assert_eq!(after.selfguided_iteration, 1);
        assert_eq!(after.selfguided_stuck_count, 0);
    }

    #[tokio::test]
    async fn test_self_guided_escalates_on_third_failure() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let task = state
            .tasks
            .create(Task::new("explore").with_kind(TaskKind::SelfGuided))
            .await
            .unwrap();
        let policy = agent_task_for(task.clone());
        let failed = result(&task.id, CompletionType::Failed, "");

        policy.on_failure(&state, &failed).await.unwrap();
        policy.on_failure(&state, &failed).await.unwrap();
        assert_eq!(status(&state, &task.id).await, TaskStatus::Open);

        policy.on_failure(&state, &failed).await.unwrap();
        let stuck = state.tasks.find(&task.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, TaskStatus::Blocked);
        assert_eq!(stuck.selfguided_stuck_count, 3);
        assert_eq!(stuck.blocked_by.len(), 1);

        let human = state.tasks.find(&stuck.blocked_by[0]).await.unwrap().unwrap();
        assert!(human.has_label(NEEDS_HUMAN_LABEL));
        assert_eq!(human.status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn test_epic_merge_failure_pauses_epic() {
        let dir = tempfile::tempdir().unwrap();
        let epics = Arc::new(MemoryEpicService::new(dir.path().join("mirrors")));
        let collaborators = Collaborators {
            tasks: Arc::new(MemoryTaskStore::new()),
            runs: Arc::new(MemoryRunStore::new()),
            config: Arc::new(YamlConfig::from_config(FuelConfig::default())),
            prompts: Arc::new(TemplatePromptBuilder::new()),
            epics: epics.clone(),
        };
        let state = AppState::new(dir.path(), collaborators, EventBus::new("test"));
        let epic = EpicId::new("e-000001");
        let task = state
            .tasks
            .create(Task::new("merge").with_kind(TaskKind::EpicMerge).with_epic(epic.clone()))
            .await
            .unwrap();

        agent_task_for(task.clone())
            .on_failure(&state, &result(&task.id, CompletionType::Failed, ""))
            .await
            .unwrap();
        assert!(epics.is_epic_paused(&epic).await);
        assert!(epics.is_merge_failed(&epic).await);
        assert_eq!(status(&state, &task.id).await, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_epic_merge_success_cleans_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let mirror = dir.path().join("mirrors").join("e-000002");
        std::fs::create_dir_all(&mirror).unwrap();
        let task = state
            .tasks
            .create(Task::new("merge").with_kind(TaskKind::EpicMerge).with_epic("e-000002"))
            .await
            .unwrap();

        agent_task_for(task.clone())
            .on_success(&state, &result(&task.id, CompletionType::Success, ""))
            .await
            .unwrap();
        assert!(!mirror.exists());
        assert_eq!(status(&state, &task.id).await, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_merge_without_epic_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let task = state
            .tasks
            .create(Task::new("merge").with_kind(TaskKind::EpicMerge))
            .await
            .unwrap();
        let err = agent_task_for(task.clone())
            .on_success(&state, &result(&task.id, CompletionType::Success, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::MissingEpic(_)));
    }

    #[tokio::test]
    async fn test_reality_index_never_errors() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FuelConfig::default(), dir.path());
        let ghost = Task::new("index").with_kind(TaskKind::RealityIndex);
        let policy = agent_task_for(ghost.clone());

        // The task does not exist in the store; both callbacks still succeed.
        policy
            .on_success(&state, &result(&ghost.id, CompletionType::Success, ""))
            .await
            .unwrap();
        policy
            .on_failure(&state, &result(&ghost.id, CompletionType::Failed, ""))
            .await
            .unwrap();
    }

    #[test]
    fn test_agent_routing() {
        let config = YamlConfig::from_config(FuelConfig::default());
        let routed = WorkTask::new(Task::new("t"));
        assert_eq!(routed.agent_name(&config), "claude");
        let pinned = WorkTask::new(Task::new("t").with_agent("codex"));
        assert_eq!(pinned.agent_name(&config), "codex");
        let review = ReviewTask::new(Task::new("t").with_agent("codex"));
        assert_eq!(review.agent_name(&config), "claude");
    }
}
