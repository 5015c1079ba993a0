//! Fuel consume daemon.
//!
//! Schedules coding-agent processes against a task backlog: spawns ready
//! work under per-agent concurrency limits, tracks agent health with
//! exponential backoff, applies per-kind completion policies and serves
//! state and control to clients over a Unix socket.

pub mod agent_task;
pub mod backoff;
pub mod completion;
pub mod config;
pub mod epic;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod output;
pub mod process;
pub mod prompt;
pub mod runner;
pub mod server;
pub mod snapshot;
pub mod spawner;
pub mod state;
pub mod store;

pub use agent_task::{agent_task_for, AgentTask, CompletionError, TaskResult};
pub use completion::{CompletionHandler, CompletionReport};
pub use config::{AgentConfig, ConfigError, ConfigService, FuelConfig, YamlConfig};
pub use epic::{EpicError, EpicService, MemoryEpicService};
pub use error::DaemonError;
pub use events::EventBus;
pub use health::AgentHealthTracker;
pub use lifecycle::LifecycleManager;
pub use process::{ProcessError, ProcessManager, SpawnRequest};
pub use prompt::{PromptBuilder, TemplatePromptBuilder};
pub use runner::{ConsumeRunner, RunnerPhase};
pub use server::{ClientRegistry, InboundCommand, IpcServer};
pub use snapshot::SnapshotManager;
pub use spawner::{Rejection, SpawnOutcome, SpawnReport, TaskSpawner};
pub use state::{AppState, Collaborators};
pub use store::{MemoryRunStore, MemoryTaskStore, RunStore, StoreError, TaskStore};

/// Capacity of the channel carrying client commands to the runner.
pub const COMMAND_CHANNEL_CAPACITY: usize = 100;
