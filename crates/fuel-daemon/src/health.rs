//! Per-agent health tracking.

use crate::backoff::backoff_for;
use chrono::{DateTime, Duration, Utc};
use fuel_core::{AgentHealth, FailureType, HealthStatus, HealthSummary};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Health table for every agent the daemon has run.
///
/// All reads and writes go through one mutex so each operation sees and
/// leaves a consistent record.
#[derive(Default)]
pub struct AgentHealthTracker {
    agents: Mutex<HashMap<String, AgentHealth>>,
}

impl AgentHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, AgentHealth>> {
        self.agents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_success(&self, agent: &str) {
        self.record_success_at(agent, Utc::now());
    }

    pub fn record_success_at(&self, agent: &str, now: DateTime<Utc>) {
        let mut table = self.table();
        let health = table
            .entry(agent.to_string())
            .or_insert_with(|| AgentHealth::new(agent));
        let recovered = health.consecutive_failures > 0;
        health.total_runs += 1;
        health.total_successes += 1;
        health.consecutive_failures = 0;
        health.backoff_until = None;
        health.last_success_at = Some(now);
        if recovered {
            info!(agent = %agent, "Agent recovered");
        }
    }

    pub fn record_failure(&self, agent: &str, failure: FailureType) {
        self.record_failure_at(agent, failure, Utc::now());
    }

    pub fn record_failure_at(&self, agent: &str, failure: FailureType, now: DateTime<Utc>) {
        let mut table = self.table();
        let health = table
            .entry(agent.to_string())
            .or_insert_with(|| AgentHealth::new(agent));
        health.total_runs += 1;
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure_at = Some(now);

        if failure.is_retryable() {
            let wait = backoff_for(health.consecutive_failures, failure);
            let wait = Duration::seconds(wait.as_secs() as i64);
            health.backoff_until = Some(now + wait);
            warn!(
                agent = %agent,
                failure = failure.as_str(),
                consecutive_failures = health.consecutive_failures,
                backoff_secs = wait.num_seconds(),
                "Agent failure recorded, backing off"
            );
        } else {
            warn!(
                agent = %agent,
                failure = failure.as_str(),
                consecutive_failures = health.consecutive_failures,
                "Agent failure recorded"
            );
        }
    }

    /// False while the agent is inside its backoff window. Unknown agents are available.
    pub fn is_available(&self, agent: &str) -> bool {
        self.is_available_at(agent, Utc::now())
    }

    pub fn is_available_at(&self, agent: &str, now: DateTime<Utc>) -> bool {
        self.table()
            .get(agent)
            .map(|h| h.is_available_at(now))
            .unwrap_or(true)
    }

    /// Whole seconds of backoff left, zero when none.
    pub fn get_backoff_seconds(&self, agent: &str) -> u64 {
        self.table()
            .get(agent)
            .map(|h| h.backoff_seconds_at(Utc::now()))
            .unwrap_or(0)
    }

    /// Unknown agents are never dead.
    pub fn is_dead(&self, agent: &str, max_retries: u32) -> bool {
        self.table()
            .get(agent)
            .map(|h| h.is_dead(max_retries))
            .unwrap_or(false)
    }

    /// Current record, or a fresh one for agents with no history.
    pub fn get_health_status(&self, agent: &str) -> AgentHealth {
        self.table()
            .get(agent)
            .cloned()
            .unwrap_or_else(|| AgentHealth::new(agent))
    }

    /// Every record with history, sorted by agent name.
    pub fn get_all_health_status(&self) -> Vec<AgentHealth> {
        let mut all: Vec<AgentHealth> = self.table().values().cloned().collect();
        all.sort_by(|a, b| a.agent.cmp(&b.agent));
        all
    }

    /// Forget an agent's history.
    pub fn clear_health(&self, agent: &str) {
        if self.table().remove(agent).is_some() {
            info!(agent = %agent, "Agent health cleared");
        }
    }

    pub fn status_label(&self, agent: &str) -> HealthStatus {
        self.get_health_status(agent).status()
    }

    /// Summary line used in snapshots.
    pub fn summary(&self, agent: &str, max_retries: u32) -> HealthSummary {
        let health = self.get_health_status(agent);
        HealthSummary {
            agent: health.agent.clone(),
            status: health.status(),
            consecutive_failures: health.consecutive_failures,
            total_runs: health.total_runs,
            success_rate: health.success_rate(),
            backoff_seconds: health.backoff_seconds_at(Utc::now()),
            is_dead: health.is_dead(max_retries),
        }
    }
}
