//! Fuel Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Subprocesses
//! - Sockets or the wire protocol
//! - Runtime specifics
//!
//! Everything the consume daemon schedules, supervises, and reports is
//! described here: tasks and their runs, agent health records, failure
//! classification, process records, and daemon snapshots.

pub mod error;
pub mod failure;
pub mod health;
pub mod ids;
pub mod process;
pub mod snapshot;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use failure::{CompletionType, FailureType};
pub use health::AgentHealth;
pub use ids::{EpicId, RunId, TaskId};
pub use process::{Process, ProcessOutput, ProcessType};
pub use snapshot::{BoardState, ConsumeSnapshot, HealthSummary, RunnerState, SnapshotConfig};
pub use status::{HealthStatus, ProcessStatus, TaskStatus};
pub use task::{Complexity, Run, RunOutcome, Task, TaskKind, TaskUpdate};
