//! Fuel CLI - control a running consume daemon.

use std::path::PathBuf;

use chrono::Local;
use clap::{Parser, Subcommand};

use fuel_core::{ConsumeSnapshot, TaskStatus};
use fuel_ipc::{default_socket_path, IpcClient, IpcMessage, Payload, StopMode};

/// Fuel CLI - consume daemon control
#[derive(Parser)]
#[command(name = "fuel")]
#[command(about = "Control the Fuel consume daemon", long_about = None)]
struct Cli {
    /// Project directory whose daemon to talk to
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Socket path (default: <dir>/.fuel/agent.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Print raw JSON messages
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show board, processes and agent health
    Status,

    /// Stop spawning new work
    Pause,

    /// Start spawning ready work
    Resume,

    /// Shut the daemon down
    Stop {
        /// Kill running processes instead of waiting for them
        #[arg(long)]
        force: bool,
    },

    /// Change the tick interval
    Interval {
        /// Seconds between ticks
        seconds: u64,
    },

    /// Re-read .fuel/config.yaml
    Reload,

    /// Attach and print events until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let socket = cli.socket.unwrap_or_else(|| default_socket_path(&cli.dir));

    let mut client = IpcClient::connect(&socket)
        .await
        .map_err(|e| format!("Cannot reach daemon at '{}': {}", socket.display(), e))?;

    match cli.command {
        Commands::Status => {
            let reply = client.request(Payload::RequestSnapshot).await?;
            if cli.json {
                print_json(&reply)?;
            } else if let Payload::Snapshot(snapshot) = &reply.payload {
                print_snapshot(snapshot);
            }
        }
        Commands::Pause => command(&mut client, Payload::Pause, cli.json).await?,
        Commands::Resume => command(&mut client, Payload::Resume, cli.json).await?,
        Commands::Stop { force } => {
            let mode = if force { StopMode::Force } else { StopMode::Graceful };
            command(&mut client, Payload::Stop { mode }, cli.json).await?;
        }
        Commands::Interval { seconds } => {
            command(
                &mut client,
                Payload::SetInterval {
                    interval_seconds: seconds,
                },
                cli.json,
            )
            .await?;
        }
        Commands::Reload => command(&mut client, Payload::ReloadConfig, cli.json).await?,
        Commands::Watch => watch(&mut client, cli.json).await?,
    }

    Ok(())
}

async fn command(
    client: &mut IpcClient,
    payload: Payload,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let reply = client.request(payload).await?;
    if json {
        print_json(&reply)?;
    } else if let Payload::StatusLine { text, .. } = &reply.payload {
        println!("{}", text);
    }
    Ok(())
}

async fn watch(client: &mut IpcClient, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    client.send(Payload::Attach { last_event_id: None }).await?;

    loop {
        let message = tokio::select! {
            message = client.next_message() => message?,
            _ = tokio::signal::ctrl_c() => {
                client.send(Payload::Detach).await?;
                return Ok(());
            }
        };
        let Some(message) = message else {
            println!("Daemon closed the connection");
            return Ok(());
        };

        if json {
            print_json(&message)?;
            continue;
        }
        match &message.payload {
            // Periodic snapshots are noise in a tail; show only the first.
            Payload::Snapshot(snapshot) if message.event_id.is_none() => print_snapshot(snapshot),
            Payload::Snapshot(_) => {}
            payload => {
                if let Some(line) = describe(payload) {
                    let at = message.timestamp.with_timezone(&Local);
                    println!("{}  {}", at.format("%H:%M:%S"), line);
                }
            }
        }
    }
}

fn describe(payload: &Payload) -> Option<String> {
    let line = match payload {
        Payload::StatusLine { level, text } => format!("[{:?}] {}", level, text),
        Payload::TaskSpawned {
            task_id,
            run_id,
            agent,
        } => format!("spawned   {} run={} agent={}", task_id, run_id, agent),
        Payload::TaskCompleted {
            task_id,
            exit_code,
            completion_type,
            ..
        } => format!(
            "completed {} {:?} exit={}",
            task_id,
            completion_type,
            exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
        ),
        Payload::HealthChange { agent, status } => format!("health    {} -> {}", agent, status),
        Payload::ReviewCompleted {
            task_id,
            passed,
            issues,
            ..
        } => {
            let verdict = if *passed { "passed" } else { "failed" };
            format!("review    {} {} {}", task_id, verdict, issues.join("; "))
        }
        Payload::OutputChunk {
            task_id, chunk, ..
        } => {
            let text = chunk.trim_end();
            if text.is_empty() {
                return None;
            }
            format!("{}> {}", task_id, text)
        }
        Payload::Error { message } => format!("error: {}", message),
        _ => return None,
    };
    Some(line)
}

fn print_json(message: &IpcMessage) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string(message)?);
    Ok(())
}

fn print_snapshot(snapshot: &ConsumeSnapshot) {
    let runner = &snapshot.runner_state;
    let state = if runner.shutting_down {
        "shutting down"
    } else if runner.paused {
        "paused"
    } else {
        "running"
    };
    println!(
        "Daemon {} ({}), started {}, interval {}s",
        runner.instance_id,
        state,
        runner.started_at.format("%Y-%m-%d %H:%M:%S"),
        snapshot.config.interval_seconds
    );

    println!();
    println!("Board:");
    for status in TaskStatus::ALL {
        let count = snapshot.board_state.bucket(status).len();
        if count > 0 {
            println!("  {:<12} {}", status.as_str(), count);
        }
    }

    println!();
    println!("Processes ({}):", snapshot.active_processes.len());
    if !snapshot.active_processes.is_empty() {
        println!(
            "  {:<10}  {:<12}  {:<12}  {:>8}  {}",
            "TASK", "AGENT", "TYPE", "PID", "ELAPSED"
        );
        for p in &snapshot.active_processes {
            println!(
                "  {:<10}  {:<12}  {:<12}  {:>8}  {}s",
                p.task_id,
                p.agent,
                format!("{:?}", p.process_type),
                p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into()),
                p.elapsed_seconds()
            );
        }
    }

    println!();
    println!("Agents:");
    println!(
        "  {:<12}  {:<10}  {:>6}  {:>8}  {:>8}  {}",
        "AGENT", "HEALTH", "FAILS", "RUNNING", "LIMIT", "BACKOFF"
    );
    for h in &snapshot.health_summary {
        let limit = snapshot
            .config
            .agent_limits
            .get(&h.agent)
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".into());
        let backoff = if h.is_dead {
            "dead".to_string()
        } else if h.backoff_seconds > 0 {
            format!("{}s", h.backoff_seconds)
        } else {
            "-".to_string()
        };
        println!(
            "  {:<12}  {:<10}  {:>6}  {:>8}  {:>8}  {}",
            h.agent,
            h.status.to_string(),
            h.consecutive_failures,
            snapshot.running_for(&h.agent),
            limit,
            backoff
        );
    }
}
