//! Message envelope, commands, and events.

use chrono::{DateTime, Utc};
use fuel_core::{CompletionType, ConsumeSnapshot, HealthStatus, RunId, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the daemon should stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Stop spawning, wait for running processes to exit.
    #[default]
    Graceful,
    /// Kill every running process first.
    Force,
}

/// Severity of a `status_line` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// Which pipe an `output_chunk` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// The body of a message. Commands flow client to daemon, events the other way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    // Commands
    Attach {
        #[serde(default)]
        last_event_id: Option<u64>,
    },
    Detach,
    Pause,
    Resume,
    Stop {
        #[serde(default)]
        mode: StopMode,
    },
    ReloadConfig,
    SetInterval {
        interval_seconds: u64,
    },
    RequestSnapshot,

    // Events
    Hello {
        version: String,
    },
    Snapshot(Box<ConsumeSnapshot>),
    StatusLine {
        #[serde(default)]
        level: StatusLevel,
        text: String,
    },
    TaskSpawned {
        task_id: TaskId,
        run_id: RunId,
        agent: String,
    },
    TaskCompleted {
        task_id: TaskId,
        run_id: RunId,
        exit_code: Option<i32>,
        completion_type: CompletionType,
    },
    HealthChange {
        agent: String,
        status: HealthStatus,
    },
    OutputChunk {
        task_id: TaskId,
        run_id: RunId,
        stream: OutputStream,
        chunk: String,
    },
    ReviewCompleted {
        task_id: TaskId,
        passed: bool,
        #[serde(default)]
        issues: Vec<String>,
        was_already_done: bool,
    },
    Error {
        message: String,
    },
}

/// Every value the `type` field may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Attach,
    Detach,
    Pause,
    Resume,
    Stop,
    ReloadConfig,
    SetInterval,
    RequestSnapshot,
    Hello,
    Snapshot,
    StatusLine,
    TaskSpawned,
    TaskCompleted,
    HealthChange,
    OutputChunk,
    ReviewCompleted,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 17] = [
        Self::Attach,
        Self::Detach,
        Self::Pause,
        Self::Resume,
        Self::Stop,
        Self::ReloadConfig,
        Self::SetInterval,
        Self::RequestSnapshot,
        Self::Hello,
        Self::Snapshot,
        Self::StatusLine,
        Self::TaskSpawned,
        Self::TaskCompleted,
        Self::HealthChange,
        Self::OutputChunk,
        Self::ReviewCompleted,
        Self::Error,
    ];

    /// Parse a `type` field. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::ReloadConfig => "reload_config",
            Self::SetInterval => "set_interval",
            Self::RequestSnapshot => "request_snapshot",
            Self::Hello => "hello",
            Self::Snapshot => "snapshot",
            Self::StatusLine => "status_line",
            Self::TaskSpawned => "task_spawned",
            Self::TaskCompleted => "task_completed",
            Self::HealthChange => "health_change",
            Self::OutputChunk => "output_chunk",
            Self::ReviewCompleted => "review_completed",
            Self::Error => "error",
        }
    }

    /// Returns true for the client-to-daemon family.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::Attach
                | Self::Detach
                | Self::Pause
                | Self::Resume
                | Self::Stop
                | Self::ReloadConfig
                | Self::SetInterval
                | Self::RequestSnapshot
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Attach { .. } => MessageType::Attach,
            Self::Detach => MessageType::Detach,
            Self::Pause => MessageType::Pause,
            Self::Resume => MessageType::Resume,
            Self::Stop { .. } => MessageType::Stop,
            Self::ReloadConfig => MessageType::ReloadConfig,
            Self::SetInterval { .. } => MessageType::SetInterval,
            Self::RequestSnapshot => MessageType::RequestSnapshot,
            Self::Hello { .. } => MessageType::Hello,
            Self::Snapshot(_) => MessageType::Snapshot,
            Self::StatusLine { .. } => MessageType::StatusLine,
            Self::TaskSpawned { .. } => MessageType::TaskSpawned,
            Self::TaskCompleted { .. } => MessageType::TaskCompleted,
            Self::HealthChange { .. } => MessageType::HealthChange,
            Self::OutputChunk { .. } => MessageType::OutputChunk,
            Self::ReviewCompleted { .. } => MessageType::ReviewCompleted,
            Self::Error { .. } => MessageType::Error,
        }
    }

    pub fn is_command(&self) -> bool {
        self.message_type().is_command()
    }

    pub fn status_line(level: StatusLevel, text: impl Into<String>) -> Self {
        Self::StatusLine {
            level,
            text: text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// A complete message: payload plus envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    #[serde(flatten)]
    pub payload: Payload,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Daemon instance the message belongs to. Empty on client commands.
    #[serde(default)]
    pub instance_id: String,

    /// Correlates a reply with the command that caused it.
    #[serde(default)]
    pub request_id: Option<String>,

    /// Position in the daemon's event log, set on broadcast events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u64>,
}

impl IpcMessage {
    pub fn new(payload: Payload, instance_id: impl Into<String>) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            instance_id: instance_id.into(),
            request_id: None,
            event_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_event_id(mut self, event_id: u64) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}
