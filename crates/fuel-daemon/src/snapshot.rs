//! Point-in-time view of the daemon for clients.

use crate::state::AppState;
use crate::store::StoreError;
use fuel_core::{ConsumeSnapshot, SnapshotConfig};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct SnapshotManager;

impl SnapshotManager {
    pub fn new() -> Self {
        Self
    }

    /// Assemble a snapshot from the backlog, process table, health and lifecycle.
    pub async fn build(&self, state: &AppState) -> Result<ConsumeSnapshot, StoreError> {
        let board_state = state.tasks.board().await?;
        let active_processes = state.processes.running_processes().await;

        // Configured agents plus any that have history but were since removed.
        let mut agents: BTreeSet<String> = state.config.agent_names().into_iter().collect();
        agents.extend(state.health.get_all_health_status().into_iter().map(|h| h.agent));

        let health_summary = agents
            .iter()
            .map(|agent| {
                state
                    .health
                    .summary(agent, state.config.agent_max_retries(agent))
            })
            .collect();

        let agent_limits: BTreeMap<String, usize> = state
            .config
            .agent_names()
            .into_iter()
            .map(|agent| {
                let limit = state.config.agent_limit(&agent);
                (agent, limit)
            })
            .collect();

        Ok(ConsumeSnapshot {
            board_state,
            active_processes,
            health_summary,
            runner_state: state.lifecycle.runner_state(),
            config: SnapshotConfig {
                interval_seconds: state.lifecycle.interval_seconds(),
                agent_limits,
            },
        })
    }
}
