//! Agent subprocess supervision.
//!
//! [`ProcessManager`] is the only owner of OS process handles. Each task has
//! at most one process; its stdout and stderr go to
//! `<log_dir>/<task_id>/stdout.log` and `stderr.log`.

use crate::config::ConfigService;
use crate::output::MAX_RUN_OUTPUT_BYTES;
use chrono::Utc;
use fuel_core::{Process, ProcessOutput, ProcessStatus, ProcessType, RunId, TaskId};
use fuel_ipc::OutputStream;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Largest output chunk read per stream per drain.
const MAX_CHUNK_BYTES: u64 = 16 * 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Agent '{agent}' is at its concurrency limit ({limit})")]
    AtCapacity { agent: String, limit: usize },

    #[error("Task {0} already has a process")]
    AlreadyRunning(TaskId),

    #[error("Failed to prepare log files in {path}: {source}")]
    Logs {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

/// Everything needed to launch one agent process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub agent: String,
    pub process_type: ProcessType,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

impl SpawnRequest {
    pub fn new(
        task_id: TaskId,
        run_id: RunId,
        agent: impl Into<String>,
        program: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            run_id,
            agent: agent.into(),
            process_type: ProcessType::Task,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: PathBuf::from("."),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_process_type(mut self, process_type: ProcessType) -> Self {
        self.process_type = process_type;
        self
    }

    fn display_command(&self) -> String {
        // Prompts can be long; keep the display short.
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                if a.chars().count() > 60 {
                    format!("{}…", a.chars().take(60).collect::<String>())
                } else {
                    a.clone()
                }
            })
            .collect();
        if args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, args.join(" "))
        }
    }
}

/// A process that has exited and been released from the table.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub process: Process,
    /// Terminating signal, if the process did not exit on its own.
    pub signal: Option<i32>,
}

/// Output produced since the previous drain.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub stream: OutputStream,
    pub chunk: String,
}

struct Entry {
    process: Process,
    child: Child,
    stdout_offset: u64,
    stderr_offset: u64,
}

/// Spawns and supervises agent processes.
pub struct ProcessManager {
    log_dir: PathBuf,
    config: Arc<dyn ConfigService>,
    table: Mutex<HashMap<TaskId, Entry>>,
    next_id: AtomicU64,
}

impl ProcessManager {
    pub fn new(log_dir: impl Into<PathBuf>, config: Arc<dyn ConfigService>) -> Self {
        Self {
            log_dir: log_dir.into(),
            config,
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn log_paths(&self, task_id: &TaskId) -> (PathBuf, PathBuf) {
        let dir = self.log_dir.join(task_id.as_str());
        (dir.join("stdout.log"), dir.join("stderr.log"))
    }

    /// Start a process. Returns as soon as the OS process exists.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<Process, ProcessError> {
        let mut table = self.table.lock().await;

        if table.contains_key(&request.task_id) {
            return Err(ProcessError::AlreadyRunning(request.task_id));
        }

        let limit = self.config.agent_limit(&request.agent);
        let running = count_running(&table, &request.agent);
        if running >= limit {
            debug!(agent = %request.agent, running, limit, "Spawn rejected at capacity");
            return Err(ProcessError::AtCapacity {
                agent: request.agent,
                limit,
            });
        }

        let (stdout_path, stderr_path) = self.log_paths(&request.task_id);
        let (stdout, stderr) = open_log_files(&stdout_path, &stderr_path).await?;

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|source| {
            error!(program = %request.program, error = %source, "Failed to spawn agent process");
            ProcessError::Spawn {
                program: request.program.clone(),
                source,
            }
        })?;

        let process = Process {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            task_id: request.task_id.clone(),
            run_id: request.run_id.clone(),
            agent: request.agent.clone(),
            process_type: request.process_type,
            command: request.display_command(),
            cwd: request.cwd.clone(),
            pid: child.id(),
            status: ProcessStatus::Running,
            exit_code: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        info!(
            task_id = %process.task_id,
            run_id = %process.run_id,
            agent = %process.agent,
            pid = ?process.pid,
            "Agent process spawned"
        );

        table.insert(
            request.task_id,
            Entry {
                process: process.clone(),
                child,
                stdout_offset: 0,
                stderr_offset: 0,
            },
        );
        Ok(process)
    }

    pub async fn is_running(&self, task_id: &TaskId) -> bool {
        self.table
            .lock()
            .await
            .get(task_id)
            .map(|e| e.process.is_running())
            .unwrap_or(false)
    }

    /// Terminate a task's process. Unknown or finished tasks are a no-op.
    ///
    /// The process stays in the table, marked `Killed`, until
    /// [`poll_completed`](Self::poll_completed) reaps it.
    pub async fn kill(&self, task_id: &TaskId) -> bool {
        let mut table = self.table.lock().await;
        match table.get_mut(task_id) {
            Some(entry) if entry.process.is_running() => {
                kill_entry(entry);
                true
            }
            _ => false,
        }
    }

    /// Kill every running process. Returns how many were signalled.
    pub async fn kill_all(&self) -> usize {
        let mut table = self.table.lock().await;
        let mut killed = 0;
        for entry in table.values_mut().filter(|e| e.process.is_running()) {
            kill_entry(entry);
            killed += 1;
        }
        if killed > 0 {
            warn!(count = killed, "Killed all agent processes");
        }
        killed
    }

    pub async fn running_count(&self) -> usize {
        self.table
            .lock()
            .await
            .values()
            .filter(|e| e.process.is_running())
            .count()
    }

    pub async fn running_count_for(&self, agent: &str) -> usize {
        count_running(&*self.table.lock().await, agent)
    }

    /// Processes not yet reaped, including killed ones still exiting.
    pub async fn tracked_count(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Running processes ordered by spawn.
    pub async fn running_processes(&self) -> Vec<Process> {
        let table = self.table.lock().await;
        let mut processes: Vec<Process> = table
            .values()
            .filter(|e| e.process.is_running())
            .map(|e| e.process.clone())
            .collect();
        processes.sort_by_key(|p| p.id);
        processes
    }

    /// Reap exited processes without blocking and release them from the table.
    pub async fn poll_completed(&self) -> Vec<ProcessExit> {
        let mut table = self.table.lock().await;
        let mut finished = Vec::new();

        for (task_id, entry) in table.iter_mut() {
            match entry.child.try_wait() {
                Ok(Some(status)) => {
                    let process = &mut entry.process;
                    process.exit_code = status.code();
                    process.completed_at = Some(Utc::now());
                    if process.status != ProcessStatus::Killed {
                        process.status = if status.success() {
                            ProcessStatus::Completed
                        } else {
                            ProcessStatus::Failed
                        };
                    }
                    debug!(
                        task_id = %task_id,
                        exit_code = ?process.exit_code,
                        signal = ?status.signal(),
                        status = ?process.status,
                        "Agent process exited"
                    );
                    finished.push((task_id.clone(), status.signal()));
                }
                Ok(None) => {}
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Failed to poll agent process");
                    entry.process.status = ProcessStatus::Failed;
                    entry.process.completed_at = Some(Utc::now());
                    finished.push((task_id.clone(), None));
                }
            }
        }

        finished
            .into_iter()
            .filter_map(|(task_id, signal)| {
                table.remove(&task_id).map(|entry| ProcessExit {
                    process: entry.process,
                    signal,
                })
            })
            .collect()
    }

    /// Captured output of the task's most recent process, at most the last
    /// [`MAX_RUN_OUTPUT_BYTES`] of each stream.
    pub async fn get_output(&self, task_id: &TaskId) -> ProcessOutput {
        let (stdout_path, stderr_path) = self.log_paths(task_id);
        let stdout = read_tail(&stdout_path, MAX_RUN_OUTPUT_BYTES as u64).await;
        let stderr = read_tail(&stderr_path, MAX_RUN_OUTPUT_BYTES as u64).await;
        ProcessOutput {
            stdout,
            stderr,
            stdout_path,
            stderr_path,
        }
    }

    /// Output written by tracked processes since the previous call.
    pub async fn drain_output(&self) -> Vec<OutputChunk> {
        let pending: Vec<(TaskId, RunId, u64, u64)> = {
            let table = self.table.lock().await;
            table
                .iter()
                .map(|(id, e)| {
                    (
                        id.clone(),
                        e.process.run_id.clone(),
                        e.stdout_offset,
                        e.stderr_offset,
                    )
                })
                .collect()
        };

        let mut chunks = Vec::new();
        let mut advanced = Vec::new();
        for (task_id, run_id, stdout_offset, stderr_offset) in pending {
            let (stdout_path, stderr_path) = self.log_paths(&task_id);
            let mut offsets = (stdout_offset, stderr_offset);
            for (stream, path, offset) in [
                (OutputStream::Stdout, &stdout_path, &mut offsets.0),
                (OutputStream::Stderr, &stderr_path, &mut offsets.1),
            ] {
                match read_from(path, *offset).await {
                    Ok(bytes) if !bytes.is_empty() => {
                        let usable = complete_utf8_prefix(&bytes);
                        if usable == 0 {
                            continue;
                        }
                        *offset += usable as u64;
                        chunks.push(OutputChunk {
                            task_id: task_id.clone(),
                            run_id: run_id.clone(),
                            stream,
                            chunk: String::from_utf8_lossy(&bytes[..usable]).into_owned(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(
                            task_id = %task_id,
                            path = %path.display(),
                            error = %e,
                            "Output not readable"
                        );
                    }
                }
            }
            advanced.push((task_id, offsets));
        }

        let mut table = self.table.lock().await;
        for (task_id, (stdout_offset, stderr_offset)) in advanced {
            if let Some(entry) = table.get_mut(&task_id) {
                entry.stdout_offset = stdout_offset;
                entry.stderr_offset = stderr_offset;
            }
        }
        chunks
    }
}

fn count_running(table: &HashMap<TaskId, Entry>, agent: &str) -> usize {
    table
        .values()
        .filter(|e| e.process.agent == agent && e.process.is_running())
        .count()
}

fn kill_entry(entry: &mut Entry) {
    if let Err(e) = entry.child.start_kill() {
        // Already exited; the next poll reaps it.
        debug!(task_id = %entry.process.task_id, error = %e, "Kill signal not delivered");
    }
    entry.process.status = ProcessStatus::Killed;
    info!(task_id = %entry.process.task_id, pid = ?entry.process.pid, "Agent process killed");
}

async fn open_log_files(
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<(std::fs::File, std::fs::File), ProcessError> {
    let dir = stdout_path.parent().unwrap_or(Path::new("."));
    let logs_err = |source| ProcessError::Logs {
        path: dir.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(logs_err)?;
    let stdout = tokio::fs::File::create(stdout_path).await.map_err(logs_err)?;
    let stderr = tokio::fs::File::create(stderr_path).await.map_err(logs_err)?;
    Ok((stdout.into_std().await, stderr.into_std().await))
}

async fn read_tail(path: &Path, max_bytes: u64) -> String {
    match read_last(path, max_bytes).await {
        Ok(bytes) => {
            // Drop a character split by the seek.
            let start = bytes
                .iter()
                .take(3)
                .take_while(|b| (**b & 0xC0) == 0x80)
                .count();
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Could not read process log");
            }
            String::new()
        }
    }
}

async fn read_last(path: &Path, max_bytes: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max_bytes))).await?;
    let mut bytes = Vec::new();
    file.take(max_bytes).read_to_end(&mut bytes).await?;
    Ok(bytes)
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    let mut bytes = Vec::new();
    file.take(MAX_CHUNK_BYTES).read_to_end(&mut bytes).await?;
    Ok(bytes)
}

/// Length of `bytes` without a trailing, incomplete UTF-8 sequence.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Invalid in the middle: pass everything through lossily.
        Err(_) => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, FuelConfig, YamlConfig};
    use std::time::Duration;

    fn manager(dir: &Path, limit: usize) -> ProcessManager {
        let mut config = FuelConfig::default();
        config.agents.insert(
            "sh".into(),
            AgentConfig::new("sh").with_max_concurrent(limit),
        );
        ProcessManager::new(dir, Arc::new(YamlConfig::from_config(config)))
    }

    fn sh(task: &str, script: &str, cwd: &Path) -> SpawnRequest {
        SpawnRequest::new(TaskId::new(task), RunId::generate(), "sh", "sh")
            .with_args(["-c", script])
            .with_cwd(cwd)
    }

    async fn wait_for_exit(pm: &ProcessManager) -> Vec<ProcessExit> {
        for _ in 0..100 {
            let done = pm.poll_completed().await;
            if !done.is_empty() {
                return done;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process did not exit in time");
    }

    #[tokio::test]
    async fn test_spawn_and_capture_output() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), 1);

        let process = pm
            .spawn(sh("f-out001", "echo hello; echo oops >&2; exit 3", dir.path()))
            .await
            .unwrap();
        assert_eq!(process.status, ProcessStatus::Running);
        assert!(process.pid.is_some());

        let exits = wait_for_exit(&pm).await;
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].process.status, ProcessStatus::Failed);
        assert_eq!(exits[0].process.exit_code, Some(3));
        assert_eq!(pm.running_count().await, 0);

        let output = pm.get_output(&TaskId::new("f-out001")).await;
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(output.stdout_path.ends_with("f-out001/stdout.log"));
    }

    #[tokio::test]
    async fn test_output_keeps_only_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), 1);
        let (stdout_path, _) = pm.log_paths(&TaskId::new("f-big001"));
        std::fs::create_dir_all(stdout_path.parent().unwrap()).unwrap();
        let mut log = "é".repeat(MAX_RUN_OUTPUT_BYTES);
        log.push_str("last line!\n");
        std::fs::write(&stdout_path, &log).unwrap();

        let output = pm.get_output(&TaskId::new("f-big001")).await;
        assert!(output.stdout.len() <= MAX_RUN_OUTPUT_BYTES);
        assert!(output.stdout.ends_with("last line!\n"));
        assert!(!output.stdout.contains('\u{FFFD}'));
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), 2);

        pm.spawn(sh("f-000001", "sleep 5", dir.path())).await.unwrap();
        pm.spawn(sh("f-000002", "sleep 5", dir.path())).await.unwrap();
        let err = pm.spawn(sh("f-000003", "sleep 5", dir.path())).await.unwrap_err();
        assert!(matches!(err, ProcessError::AtCapacity { limit: 2, .. }));
        assert_eq!(pm.running_count_for("sh").await, 2);

        pm.kill_all().await;
    }

    #[tokio::test]
    async fn test_one_process_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), 3);

        pm.spawn(sh("f-000001", "sleep 5", dir.path())).await.unwrap();
        let err = pm.spawn(sh("f-000001", "sleep 5", dir.path())).await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyRunning(_)));
        pm.kill_all().await;
    }

    #[tokio::test]
    async fn test_kill_unknown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), 1);
        pm.spawn(sh("f-000001", "sleep 5", dir.path())).await.unwrap();

        assert!(!pm.kill(&TaskId::new("f-ghost0")).await);
        assert_eq!(pm.running_count().await, 1);
        pm.kill_all().await;
    }

    #[tokio::test]
    async fn test_kill_marks_killed_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), 1);
        let task = TaskId::new("f-000001");
        pm.spawn(sh(task.as_str(), "sleep 5", dir.path())).await.unwrap();

        assert!(pm.kill(&task).await);
        assert!(!pm.kill(&task).await);
        assert!(!pm.is_running(&task).await);
        assert_eq!(pm.running_count().await, 0);

        let exits = wait_for_exit(&pm).await;
        assert_eq!(exits[0].process.status, ProcessStatus::Killed);
        assert_eq!(exits[0].signal, Some(9));
        assert!(!pm.kill(&task).await);
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), 1);
        let request = SpawnRequest::new(
            TaskId::new("f-000001"),
            RunId::generate(),
            "sh",
            "/definitely/not/a/program",
        )
        .with_cwd(dir.path());
        let err = pm.spawn(request).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(pm.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_drain_output_is_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let pm = manager(dir.path(), 1);
        pm.spawn(sh("f-000001", "echo first; sleep 0.4; echo second; sleep 5", dir.path()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let first = pm.drain_output().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].stream, OutputStream::Stdout);
        assert_eq!(first[0].chunk, "first\n");

        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = pm.drain_output().await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].chunk, "second\n");

        assert!(pm.drain_output().await.is_empty());
        pm.kill_all().await;
    }

    #[test]
    fn test_complete_utf8_prefix() {
        let text = "héllo".as_bytes();
        assert_eq!(complete_utf8_prefix(text), text.len());
        // Cut inside the two-byte 'é'.
        assert_eq!(complete_utf8_prefix(&text[..2]), 1);
    }
}
