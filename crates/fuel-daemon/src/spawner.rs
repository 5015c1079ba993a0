//! Turning ready work into running agent processes.
//!
//! Each tick the spawner first offers queued reviews, then walks the ready
//! list, skipping work that belongs to a paused epic. A task is only started
//! once every gate passes: its agent is alive, out of backoff, configured and
//! below its concurrency limit.

use crate::agent_task::{agent_task_for, AgentTask, ReviewTask};
use crate::process::{ProcessError, SpawnRequest};
use crate::state::{AppState, InFlight};
use crate::store::StoreError;
use chrono::Utc;
use fuel_core::{FailureType, Process, ProcessType, Run, TaskStatus};
use fuel_ipc::Payload;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the task id into agent processes.
pub const TASK_ID_ENV: &str = "FUEL_TASK_ID";

/// Environment variable carrying the run id into agent processes.
pub const RUN_ID_ENV: &str = "FUEL_RUN_ID";

/// Why a task was not started this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The agent exceeded its retry budget.
    AgentDead,
    /// The agent is cooling down after a failure.
    Backoff { seconds: u64 },
    AtCapacity,
    AlreadyRunning,
    UnknownAgent,
    SpawnFailed(String),
}

#[derive(Debug, Clone)]
pub enum SpawnOutcome {
    Spawned(Process),
    Rejected(Rejection),
}

/// What one spawn pass did.
#[derive(Debug, Default)]
pub struct SpawnReport {
    pub spawned: Vec<Process>,
    pub rejected: usize,
}

#[derive(Debug, Default)]
pub struct TaskSpawner;

impl TaskSpawner {
    pub fn new() -> Self {
        Self
    }

    /// Start every queued review and ready task that can run right now.
    pub async fn spawn_ready(&self, state: &Arc<AppState>) -> Result<SpawnReport, StoreError> {
        let mut report = SpawnReport::default();

        let queued: Vec<_> = state.pending_reviews.lock().await.drain(..).collect();
        let mut requeue = Vec::new();
        for task_id in queued {
            let Some(task) = state.tasks.find(&task_id).await? else {
                debug!(task_id = %task_id, "Queued review dropped, task gone");
                continue;
            };
            if task.status != TaskStatus::Review {
                debug!(task_id = %task_id, status = %task.status, "Queued review dropped");
                continue;
            }
            if state.is_in_flight(&task_id).await {
                requeue.push(task_id);
                continue;
            }
            let review: Arc<dyn AgentTask> = Arc::new(ReviewTask::new(task));
            match self.try_spawn(state, review).await? {
                SpawnOutcome::Spawned(process) => report.spawned.push(process),
                SpawnOutcome::Rejected(_) => {
                    report.rejected += 1;
                    requeue.push(task_id);
                }
            }
        }
        if !requeue.is_empty() {
            let mut pending = state.pending_reviews.lock().await;
            for task_id in requeue.into_iter().rev() {
                if !pending.contains(&task_id) {
                    pending.push_front(task_id);
                }
            }
        }

        for task in state.tasks.list_ready().await? {
            if state.is_in_flight(&task.id).await {
                continue;
            }
            if let Some(epic) = &task.epic_id {
                if state.epics.is_epic_paused(epic).await {
                    debug!(task_id = %task.id, epic_id = %epic, "Epic paused, not spawning");
                    continue;
                }
            }
            match self.try_spawn(state, agent_task_for(task)).await? {
                SpawnOutcome::Spawned(process) => report.spawned.push(process),
                SpawnOutcome::Rejected(_) => report.rejected += 1,
            }
        }

        if !report.spawned.is_empty() {
            info!(
                spawned = report.spawned.len(),
                rejected = report.rejected,
                "Spawn pass complete"
            );
        }
        Ok(report)
    }

    /// Run the gates for one unit of work and start it if they all pass.
    pub async fn try_spawn(
        &self,
        state: &Arc<AppState>,
        work: Arc<dyn AgentTask>,
    ) -> Result<SpawnOutcome, StoreError> {
        let task_id = work.task_id().clone();
        let agent = work.agent_name(state.config.as_ref());

        if state.health.is_dead(&agent, state.config.agent_max_retries(&agent)) {
            debug!(task_id = %task_id, agent = %agent, "Agent dead, not spawning");
            return Ok(SpawnOutcome::Rejected(Rejection::AgentDead));
        }
        if !state.health.is_available(&agent) {
            let seconds = state.health.get_backoff_seconds(&agent);
            debug!(task_id = %task_id, agent = %agent, seconds, "Agent in backoff");
            return Ok(SpawnOutcome::Rejected(Rejection::Backoff { seconds }));
        }
        if state.processes.running_count_for(&agent).await >= state.config.agent_limit(&agent) {
            return Ok(SpawnOutcome::Rejected(Rejection::AtCapacity));
        }
        let Some(agent_config) = state.config.agent_command(&agent) else {
            warn!(task_id = %task_id, agent = %agent, "No command configured for agent");
            return Ok(SpawnOutcome::Rejected(Rejection::UnknownAgent));
        };

        let process_type = work.process_type();
        let prompt = work.build_prompt(state.prompts.as_ref(), &state.cwd);
        let run = Run::start(task_id.clone(), agent.clone(), agent_config.model.clone());

        let mut request = SpawnRequest::new(
            task_id.clone(),
            run.run_id.clone(),
            agent.clone(),
            agent_config.command.clone(),
        )
        .with_args(agent_config.render_args(&prompt))
        .with_cwd(&state.cwd)
        .with_process_type(process_type)
        .with_env(TASK_ID_ENV, task_id.as_str())
        .with_env(RUN_ID_ENV, run.run_id.as_str());
        for (key, value) in &agent_config.env {
            request = request.with_env(key, value);
        }

        let process = match state.processes.spawn(request).await {
            Ok(process) => process,
            Err(ProcessError::AtCapacity { .. }) => {
                return Ok(SpawnOutcome::Rejected(Rejection::AtCapacity));
            }
            Err(ProcessError::AlreadyRunning(_)) => {
                return Ok(SpawnOutcome::Rejected(Rejection::AlreadyRunning));
            }
            Err(e) => {
                // An agent that cannot launch counts against its health.
                state.health.record_failure(&agent, FailureType::Crash);
                error!(task_id = %task_id, agent = %agent, error = %e, "Spawn failed");
                return Ok(SpawnOutcome::Rejected(Rejection::SpawnFailed(e.to_string())));
            }
        };

        // Reviews leave the task in `review` while they run.
        if process_type != ProcessType::Review {
            if let Err(e) = state.tasks.start(&task_id).await {
                state.processes.kill(&task_id).await;
                return Err(e);
            }
        }

        let run_id = run.run_id.clone();
        state.runs.create_run(run).await?;
        state.in_flight.write().await.insert(
            task_id.clone(),
            InFlight {
                task: work,
                run_id: run_id.clone(),
                agent: agent.clone(),
                started_at: Utc::now(),
            },
        );

        state.events.publish(Payload::TaskSpawned {
            task_id,
            run_id,
            agent,
        });
        Ok(SpawnOutcome::Spawned(process))
    }
}
