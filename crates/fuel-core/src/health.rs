//! Per-agent health record.

use crate::HealthStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rolling health record for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent name as configured.
    pub agent: String,

    pub total_runs: u64,
    pub total_successes: u64,

    /// Reset to zero by every success.
    pub consecutive_failures: u32,

    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,

    /// The agent is not scheduled before this instant.
    pub backoff_until: Option<DateTime<Utc>>,
}

impl AgentHealth {
    /// A fresh record with no history.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            total_runs: 0,
            total_successes: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            backoff_until: None,
        }
    }

    /// Fraction of runs that succeeded, `None` before the first run.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_runs == 0 {
            None
        } else {
            Some(self.total_successes as f64 / self.total_runs as f64)
        }
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_consecutive_failures(self.consecutive_failures)
    }

    /// Dead agents are never scheduled until a success is recorded.
    pub fn is_dead(&self, max_retries: u32) -> bool {
        self.consecutive_failures >= max_retries
    }

    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        match self.backoff_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Whole seconds of backoff remaining at `now`, floored at zero.
    pub fn backoff_seconds_at(&self, now: DateTime<Utc>) -> u64 {
        self.backoff_until
            .map(|until| (until - now).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_success_rate_empty() {
        let health = AgentHealth::new("claude");
        assert_eq!(health.success_rate(), None);
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert!(health.is_available_at(Utc::now()));
    }

    #[test]
    fn test_success_rate() {
        let mut health = AgentHealth::new("claude");
        health.total_runs = 4;
        health.total_successes = 3;
        assert_eq!(health.success_rate(), Some(0.75));
    }

    #[test]
    fn test_backoff_window() {
        let now = Utc::now();
        let mut health = AgentHealth::new("claude");
        health.backoff_until = Some(now + Duration::seconds(30));

        assert!(!health.is_available_at(now));
        assert_eq!(health.backoff_seconds_at(now), 30);
        assert!(health.is_available_at(now + Duration::seconds(31)));
        assert_eq!(health.backoff_seconds_at(now + Duration::seconds(31)), 0);
    }

    #[test]
    fn test_is_dead() {
        let mut health = AgentHealth::new("claude");
        health.consecutive_failures = 4;
        assert!(!health.is_dead(5));
        health.consecutive_failures = 5;
        assert!(health.is_dead(5));
    }
}
