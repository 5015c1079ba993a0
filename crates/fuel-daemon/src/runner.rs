//! The consume loop: ticks, commands, and shutdown.
//!
//! [`ConsumeRunner`] owns the schedule. Every tick it spawns ready work
//! (unless paused), streams new process output, reaps finished processes,
//! publishes a snapshot and announces agents leaving backoff. Commands from
//! clients are applied between ticks as they arrive.

use crate::completion::CompletionHandler;
use crate::server::{ClientRegistry, InboundCommand};
use crate::snapshot::SnapshotManager;
use crate::spawner::TaskSpawner;
use crate::state::AppState;
use fuel_core::TaskStatus;
use fuel_ipc::{IpcMessage, Payload, StatusLevel, StopMode};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Tick period while waiting for processes to exit during shutdown.
const STOP_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    Created,
    Paused,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct ConsumeRunner {
    state: Arc<AppState>,
    commands: mpsc::Receiver<InboundCommand>,
    clients: ClientRegistry,
    spawner: TaskSpawner,
    completions: CompletionHandler,
    snapshots: SnapshotManager,
    phase: RunnerPhase,
    /// Agents that were in backoff at the previous tick.
    backed_off: BTreeSet<String>,
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl ConsumeRunner {
    pub fn new(
        state: Arc<AppState>,
        commands: mpsc::Receiver<InboundCommand>,
        clients: ClientRegistry,
    ) -> Self {
        Self {
            state,
            commands,
            clients,
            spawner: TaskSpawner::new(),
            completions: CompletionHandler::new(),
            snapshots: SnapshotManager::new(),
            phase: RunnerPhase::Created,
            backed_off: BTreeSet::new(),
        }
    }

    pub fn phase(&self) -> RunnerPhase {
        self.phase
    }

    fn sync_phase(&mut self) {
        let lifecycle = &self.state.lifecycle;
        self.phase = if lifecycle.is_shutting_down() {
            RunnerPhase::ShuttingDown
        } else if lifecycle.is_paused() {
            RunnerPhase::Paused
        } else {
            RunnerPhase::Running
        };
    }

    /// Put work orphaned by a previous daemon back in the queue.
    pub async fn recover(&self) {
        let board = match self.state.tasks.board().await {
            Ok(board) => board,
            Err(e) => {
                error!(error = %e, "Could not read backlog for recovery");
                return;
            }
        };

        for task in &board.in_progress {
            if self.state.is_in_flight(&task.id).await {
                continue;
            }
            match self
                .state
                .tasks
                .reopen(&task.id, Some("daemon restarted".to_string()))
                .await
            {
                Ok(_) => info!(task_id = %task.id, "Recovered orphaned task"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Could not recover task"),
            }
        }

        if self.state.config.review_enabled() {
            for task in board.bucket(TaskStatus::Review) {
                self.state.enqueue_review(task.id.clone()).await;
            }
        }
    }

    /// Drive the loop until a stop request has been carried out.
    pub async fn run(mut self) {
        self.recover().await;
        self.sync_phase();
        let shutdown = self.state.lifecycle.shutdown_token();
        let mut ticker = new_ticker(Duration::from_secs(self.state.lifecycle.interval_seconds()));
        let mut stopping = false;

        info!(
            instance_id = %self.state.lifecycle.instance_id(),
            interval_secs = self.state.lifecycle.interval_seconds(),
            paused = self.state.lifecycle.is_paused(),
            "Consume runner started"
        );
        self.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                    if stopping && self.drained().await {
                        break;
                    }
                }
                Some(command) = self.commands.recv() => {
                    if let Some(period) = self.handle_command(command).await {
                        if !stopping {
                            ticker = new_ticker(period);
                        }
                    }
                }
                _ = shutdown.cancelled(), if !stopping => {
                    stopping = true;
                    self.sync_phase();
                    ticker = new_ticker(STOP_POLL);
                }
            }
        }

        self.phase = RunnerPhase::Stopped;
        self.state
            .events
            .publish(Payload::status_line(StatusLevel::Info, "daemon stopped"));
        info!(instance_id = %self.state.lifecycle.instance_id(), "Consume runner stopped");
    }

    async fn drained(&self) -> bool {
        self.state.processes.tracked_count().await == 0 && self.state.in_flight_count().await == 0
    }

    /// One pass of the schedule.
    pub async fn tick(&mut self) {
        let lifecycle = &self.state.lifecycle;
        if !lifecycle.is_paused() && !lifecycle.is_shutting_down() {
            if let Err(e) = self.spawner.spawn_ready(&self.state).await {
                error!(error = %e, "Spawn pass failed");
            }
        }

        for chunk in self.state.processes.drain_output().await {
            self.state.events.publish(Payload::OutputChunk {
                task_id: chunk.task_id,
                run_id: chunk.run_id,
                stream: chunk.stream,
                chunk: chunk.chunk,
            });
        }

        self.completions.reap(&self.state).await;

        match self.snapshots.build(&self.state).await {
            Ok(snapshot) => {
                self.state.events.publish(Payload::Snapshot(Box::new(snapshot)));
            }
            Err(e) => error!(error = %e, "Could not build snapshot"),
        }

        self.recompute_backoff();
    }

    fn recompute_backoff(&mut self) {
        let mut agents: BTreeSet<String> = self.state.config.agent_names().into_iter().collect();
        agents.extend(self.backed_off.iter().cloned());

        let now_backed_off: BTreeSet<String> = agents
            .into_iter()
            .filter(|agent| !self.state.health.is_available(agent))
            .collect();
        for agent in self.backed_off.difference(&now_backed_off) {
            info!(agent = %agent, "Agent backoff expired");
            self.state.events.publish(Payload::status_line(
                StatusLevel::Info,
                format!("{agent} is available again"),
            ));
        }
        self.backed_off = now_backed_off;
    }

    fn reply(&self, command: &InboundCommand, payload: Payload) {
        let message = self
            .state
            .events
            .reply(payload, command.message.request_id.clone());
        if !self.clients.reply(command.client_id, message) {
            debug!(client_id = command.client_id, "Reply dropped, client gone");
        }
    }

    fn ack(&self, command: &InboundCommand, text: impl Into<String>) {
        self.reply(command, Payload::status_line(StatusLevel::Info, text));
    }

    fn broadcast(&self, level: StatusLevel, text: impl Into<String>) {
        self.state.events.publish(Payload::status_line(level, text));
    }

    /// Apply one client command. Returns a new tick period when it changed.
    pub async fn handle_command(&mut self, command: InboundCommand) -> Option<Duration> {
        let client_id = command.client_id;
        info!(client_id, command = %command.message.message_type(), "Handling command");

        let mut new_period = None;
        match &command.message.payload {
            Payload::Attach { last_event_id } => {
                let after = self.state.events.last_event_id();
                match self.snapshots.build(&self.state).await {
                    Ok(snapshot) => {
                        let mut initial: Vec<IpcMessage> = vec![self.state.events.reply(
                            Payload::Snapshot(Box::new(snapshot)),
                            command.message.request_id.clone(),
                        )];
                        if let Some(last) = last_event_id {
                            initial.extend(
                                self.state
                                    .events
                                    .replay_after(*last)
                                    .into_iter()
                                    .filter(|m| m.event_id.is_some_and(|id| id <= after)),
                            );
                        }
                        self.clients.attach(client_id, initial, after);
                    }
                    Err(e) => self.reply(&command, Payload::error(format!("snapshot failed: {e}"))),
                }
            }
            Payload::Detach => {
                self.clients.detach(client_id);
                self.ack(&command, "detached");
            }
            Payload::Pause => {
                if self.state.lifecycle.pause() {
                    self.broadcast(StatusLevel::Info, "paused");
                }
                self.ack(&command, "paused");
            }
            Payload::Resume => {
                if self.state.lifecycle.is_shutting_down() {
                    self.reply(&command, Payload::error("daemon is shutting down"));
                } else {
                    if self.state.lifecycle.resume() {
                        self.broadcast(StatusLevel::Info, "resumed");
                    }
                    self.ack(&command, "running");
                }
            }
            Payload::Stop { mode } => {
                let graceful = *mode == StopMode::Graceful;
                self.ack(&command, "stopping");
                let killed = self.state.lifecycle.stop(graceful).await;
                let running = self.state.processes.running_count().await;
                let text = if graceful {
                    format!("shutting down, waiting for {running} running process(es)")
                } else {
                    format!("shutting down, killed {killed} process(es)")
                };
                self.broadcast(StatusLevel::Warn, text);
            }
            Payload::ReloadConfig => match self.state.config.reload() {
                Ok(()) => {
                    let seconds = self.state.config.interval_seconds();
                    if seconds != self.state.lifecycle.interval_seconds() {
                        self.state.lifecycle.set_interval_seconds(seconds);
                        new_period =
                            Some(Duration::from_secs(self.state.lifecycle.interval_seconds()));
                    }
                    self.ack(&command, "configuration reloaded");
                }
                Err(e) => {
                    warn!(error = %e, "Configuration reload failed");
                    self.reply(&command, Payload::error(format!("reload failed: {e}")));
                }
            },
            Payload::SetInterval { interval_seconds } => {
                if *interval_seconds == 0 {
                    self.reply(&command, Payload::error("interval_seconds must be at least 1"));
                } else {
                    self.state.lifecycle.set_interval_seconds(*interval_seconds);
                    new_period = Some(Duration::from_secs(*interval_seconds));
                    self.ack(&command, format!("interval set to {interval_seconds}s"));
                }
            }
            Payload::RequestSnapshot => match self.snapshots.build(&self.state).await {
                Ok(snapshot) => {
                    self.reply(&command, Payload::Snapshot(Box::new(snapshot.clone())));
                    self.state.events.publish(Payload::Snapshot(Box::new(snapshot)));
                }
                Err(e) => self.reply(&command, Payload::error(format!("snapshot failed: {e}"))),
            },
            other => {
                self.reply(
                    &command,
                    Payload::error(format!("`{}` is not a command", other.message_type())),
                );
            }
        }

        self.sync_phase();
        new_period
    }
}
