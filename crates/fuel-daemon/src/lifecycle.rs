//! Pause, resume, and shutdown state for one daemon instance.

use crate::process::ProcessManager;
use chrono::{DateTime, Utc};
use fuel_core::RunnerState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct LifecycleManager {
    instance_id: String,
    started_at: DateTime<Utc>,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    interval_seconds: AtomicU64,
    shutdown: CancellationToken,
    processes: Arc<ProcessManager>,
}

impl LifecycleManager {
    /// A new instance starts paused.
    pub fn new(
        instance_id: impl Into<String>,
        interval_seconds: u64,
        processes: Arc<ProcessManager>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            started_at: Utc::now(),
            paused: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            interval_seconds: AtomicU64::new(interval_seconds.max(1)),
            shutdown: CancellationToken::new(),
            processes,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns true if the state changed.
    pub fn pause(&self) -> bool {
        let changed = !self.paused.swap(true, Ordering::SeqCst);
        if changed {
            info!(instance_id = %self.instance_id, "Runner paused");
        }
        changed
    }

    /// Returns true if the state changed.
    pub fn resume(&self) -> bool {
        let changed = self.paused.swap(false, Ordering::SeqCst);
        if changed {
            info!(instance_id = %self.instance_id, "Runner resumed");
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn interval_seconds(&self) -> u64 {
        self.interval_seconds.load(Ordering::SeqCst)
    }

    /// Zero is clamped to one second.
    pub fn set_interval_seconds(&self, seconds: u64) {
        self.interval_seconds.store(seconds.max(1), Ordering::SeqCst);
    }

    /// Cancelled as soon as a stop is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Begin shutdown. A forced stop kills every process before returning.
    /// Returns the number of processes killed.
    pub async fn stop(&self, graceful: bool) -> usize {
        let already = self.shutting_down.swap(true, Ordering::SeqCst);
        let killed = if graceful {
            0
        } else {
            self.processes.kill_all().await
        };
        if !already {
            warn!(instance_id = %self.instance_id, graceful, killed, "Shutdown requested");
        }
        self.shutdown.cancel();
        killed
    }

    pub fn runner_state(&self) -> RunnerState {
        RunnerState {
            paused: self.is_paused(),
            shutting_down: self.is_shutting_down(),
            started_at: self.started_at,
            instance_id: self.instance_id.clone(),
        }
    }
}
