//! Reaping finished processes and applying their outcome.

use crate::agent_task::{AgentTask, CompletionError, TaskResult};
use crate::output::{parse_agent_summary, tail, MAX_RUN_OUTPUT_BYTES};
use crate::process::ProcessExit;
use crate::state::AppState;
use fuel_core::{
    CompletionType, FailureType, ProcessStatus, ProcessType, RunId, RunOutcome, TaskId,
};
use fuel_ipc::Payload;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One reaped process.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub agent: String,
    pub completion_type: CompletionType,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Default)]
pub struct CompletionHandler;

impl CompletionHandler {
    pub fn new() -> Self {
        Self
    }

    /// Reap every exited process and run its completion policy.
    pub async fn reap(&self, state: &Arc<AppState>) -> Vec<CompletionReport> {
        let exits = state.processes.poll_completed().await;
        let mut reports = Vec::with_capacity(exits.len());
        for exit in exits {
            if let Some(report) = self.complete(state, exit).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn complete(&self, state: &Arc<AppState>, exit: ProcessExit) -> Option<CompletionReport> {
        let process = exit.process;
        let task_id = process.task_id.clone();

        let Some(in_flight) = state.in_flight.write().await.remove(&task_id) else {
            warn!(task_id = %task_id, "Reaped a process with no in-flight record");
            return None;
        };

        let output = state.processes.get_output(&task_id).await;
        let combined = output.combined();

        let (completion, failure) = if process.status == ProcessStatus::Killed {
            (CompletionType::Killed, None)
        } else if process.exit_code == Some(0) {
            (CompletionType::Success, None)
        } else {
            let failure = FailureType::classify(process.exit_code, exit.signal, &combined);
            (CompletionType::from(failure), Some(failure))
        };

        let agent = in_flight.agent.clone();
        self.record_health(state, &agent, completion, failure);

        let summary = parse_agent_summary(&output.stdout);
        let outcome = RunOutcome {
            exit_code: process.exit_code,
            output: tail(&combined, MAX_RUN_OUTPUT_BYTES).to_string(),
            session_id: summary.session_id,
            cost_usd: summary.cost_usd,
        };
        if let Err(e) = state.runs.finalize_run(&in_flight.run_id, outcome).await {
            warn!(
                task_id = %task_id,
                run_id = %in_flight.run_id,
                error = %e,
                "Could not finalize run"
            );
        }

        let result = TaskResult {
            task_id: task_id.clone(),
            run_id: in_flight.run_id.clone(),
            agent: agent.clone(),
            exit_code: process.exit_code,
            completion,
            failure,
            output,
        };

        if completion == CompletionType::Killed {
            self.handle_killed(state, &in_flight.task, process.process_type).await;
        } else {
            run_policy(state, in_flight.task.clone(), result).await;
        }

        info!(
            task_id = %task_id,
            run_id = %in_flight.run_id,
            agent = %agent,
            completion = ?completion,
            exit_code = ?process.exit_code,
            "Task completed"
        );
        state.events.publish(Payload::TaskCompleted {
            task_id: task_id.clone(),
            run_id: in_flight.run_id.clone(),
            exit_code: process.exit_code,
            completion_type: completion,
        });

        Some(CompletionReport {
            task_id,
            run_id: in_flight.run_id,
            agent,
            completion_type: completion,
            exit_code: process.exit_code,
        })
    }

    fn record_health(
        &self,
        state: &AppState,
        agent: &str,
        completion: CompletionType,
        failure: Option<FailureType>,
    ) {
        // A kill says nothing about the agent.
        if completion == CompletionType::Killed {
            return;
        }
        let before = state.health.status_label(agent);
        match failure {
            Some(failure) => state.health.record_failure(agent, failure),
            None => state.health.record_success(agent),
        }
        let after = state.health.status_label(agent);
        if before != after {
            debug!(agent = %agent, from = %before, to = %after, "Agent health changed");
            state.events.publish(Payload::HealthChange {
                agent: agent.to_string(),
                status: after,
            });
        }
    }

    /// Killed work goes back to where it was before it started.
    async fn handle_killed(
        &self,
        state: &AppState,
        task: &Arc<dyn AgentTask>,
        process_type: ProcessType,
    ) {
        let task_id = task.task_id();
        if process_type == ProcessType::Review {
            state.enqueue_review(task_id.clone()).await;
            return;
        }
        if let Err(e) = state
            .tasks
            .reopen(task_id, Some("process killed".to_string()))
            .await
        {
            warn!(task_id = %task_id, error = %e, "Could not reopen killed task");
        }
    }
}

/// Run a completion policy on its own task so a panic cannot take down the loop.
async fn run_policy(state: &Arc<AppState>, task: Arc<dyn AgentTask>, result: TaskResult) {
    let task_id = result.task_id.clone();
    let state = state.clone();
    let handle = tokio::spawn(async move {
        if result.completion == CompletionType::Success {
            task.on_success(&state, &result).await
        } else {
            task.on_failure(&state, &result).await
        }
    });

    let outcome: Result<(), CompletionError> = match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Completion handler panicked");
            return;
        }
    };
    if let Err(e) = outcome {
        error!(task_id = %task_id, error = %e, "Completion handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, FuelConfig, YamlConfig};
    use crate::epic::MemoryEpicService;
    use crate::events::EventBus;
    use crate::prompt::TemplatePromptBuilder;
    use crate::spawner::TaskSpawner;
    use crate::state::Collaborators;
    use crate::store::{MemoryRunStore, MemoryTaskStore};
    use fuel_core::{HealthStatus, Task, TaskStatus};
    use std::path::Path;
    use std::time::Duration;

    fn state(dir: &Path, script: &str) -> Arc<AppState> {
        let mut config = FuelConfig::default();
        config.primary = "sh".into();
        config.agents.insert(
            "sh".into(),
            AgentConfig::new("sh").with_args(["-c", script, "{prompt}"]),
        );
        let collaborators = Collaborators {
            tasks: Arc::new(MemoryTaskStore::new()),
            runs: Arc::new(MemoryRunStore::new()),
            config: Arc::new(YamlConfig::from_config(config)),
            prompts: Arc::new(TemplatePromptBuilder::new()),
            epics: Arc::new(MemoryEpicService::new(dir.join("mirrors"))),
        };
        AppState::new(dir, collaborators, EventBus::new("test"))
    }

    async fn reap_one(state: &Arc<AppState>) -> CompletionReport {
        let handler = CompletionHandler::new();
        for _ in 0..100 {
            let mut reports = handler.reap(state).await;
            if let Some(report) = reports.pop() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no process completed");
    }

    #[tokio::test]
    async fn test_success_closes_task_and_finalizes_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(
            dir.path(),
            r#"echo '{"type":"result","session_id":"s-1","total_cost_usd":0.25}'"#,
        );
        let task = state.tasks.create(Task::new("a")).await.unwrap();
        TaskSpawner::new().spawn_ready(&state).await.unwrap();

        let report = reap_one(&state).await;
        assert_eq!(report.completion_type, CompletionType::Success);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(state.in_flight_count().await, 0);

        let task = state.tasks.find(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        let runs = state.runs.runs_for(&task.id).await.unwrap();
        assert_eq!(runs[0].exit_code, Some(0));
        assert_eq!(runs[0].session_id.as_deref(), Some("s-1"));
        assert_eq!(runs[0].cost_usd, Some(0.25));
        assert_eq!(state.health.get_health_status("sh").total_successes, 1);
    }

    #[tokio::test]
    async fn test_network_failure_reopens_and_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), "echo 'connection refused' >&2; exit 1");
        let task = state.tasks.create(Task::new("a")).await.unwrap();
        TaskSpawner::new().spawn_ready(&state).await.unwrap();

        let report = reap_one(&state).await;
        assert_eq!(report.completion_type, CompletionType::NetworkError);
        let task = state.tasks.find(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(!state.health.is_available("sh"));
        assert_eq!(state.health.status_label("sh"), HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_health_change_published() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), "exit 2");
        state.tasks.create(Task::new("a")).await.unwrap();
        let mut events = state.events.subscribe();
        TaskSpawner::new().spawn_ready(&state).await.unwrap();
        reap_one(&state).await;

        let mut saw_health = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event.payload {
                Payload::HealthChange { agent, status } => {
                    assert_eq!(agent, "sh");
                    assert_eq!(status, HealthStatus::Warning);
                    saw_health = true;
                }
                Payload::TaskCompleted { completion_type, .. } => {
                    assert_eq!(completion_type, CompletionType::Failed);
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_health && saw_completed);
    }

    #[tokio::test]
    async fn test_killed_task_is_reopened_without_health_penalty() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), "sleep 5");
        let task = state.tasks.create(Task::new("a")).await.unwrap();
        TaskSpawner::new().spawn_ready(&state).await.unwrap();
        assert!(state.processes.kill(&task.id).await);

        let report = reap_one(&state).await;
        assert_eq!(report.completion_type, CompletionType::Killed);
        let task = state.tasks.find(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(state.health.get_health_status("sh").total_runs, 0);
    }

    #[tokio::test]
    async fn test_killed_review_is_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), "sleep 5");
        let task = state
            .tasks
            .create(Task::new("a").with_status(TaskStatus::Review))
            .await
            .unwrap();
        state.enqueue_review(task.id.clone()).await;
        TaskSpawner::new().spawn_ready(&state).await.unwrap();
        assert!(state.pending_reviews.lock().await.is_empty());
        state.processes.kill(&task.id).await;

        reap_one(&state).await;
        assert_eq!(state.pending_reviews.lock().await.front(), Some(&task.id));
        let task = state.tasks.find(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Review);
    }
}
