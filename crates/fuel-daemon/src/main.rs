//! Fuel consume daemon binary.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fuel_daemon::{
    AppState, Collaborators, ConsumeRunner, DaemonError, EventBus, IpcServer,
    COMMAND_CHANNEL_CAPACITY,
};
use fuel_ipc::{default_socket_path, generate_instance_id, FUEL_DIR};

/// Runs agent processes against the project's task backlog.
#[derive(Parser, Debug)]
#[command(name = "fuel-daemon", about = "Fuel consume daemon")]
struct Args {
    /// Project directory agents run in
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Socket path (default: <dir>/.fuel/agent.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Seconds between ticks, overrides the config file
    #[arg(long)]
    interval: Option<u64>,

    /// Start spawning immediately instead of waiting for `resume`
    #[arg(long)]
    start_running: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fuel=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_file.as_ref())?;
    // Fatal startup errors exit non-zero.
    run(args).await?;
    Ok(())
}

async fn run(args: Args) -> Result<(), DaemonError> {
    let dir = std::fs::canonicalize(&args.dir)?;
    let fuel_dir = dir.join(FUEL_DIR);
    std::fs::create_dir_all(&fuel_dir)?;
    let collaborators = Collaborators::open(&fuel_dir)?;

    let events = EventBus::new(generate_instance_id());
    let state = AppState::new(&dir, collaborators, events.clone());
    if let Some(seconds) = args.interval {
        state.lifecycle.set_interval_seconds(seconds);
    }

    let socket = args.socket.unwrap_or_else(|| default_socket_path(&dir));
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let server = IpcServer::bind(&socket, events, command_tx).await?;
    let clients = server.clients();

    info!(
        instance_id = %state.lifecycle.instance_id(),
        dir = %dir.display(),
        socket = %socket.display(),
        "Starting Fuel daemon"
    );

    let server_shutdown = CancellationToken::new();
    let server_handle = tokio::spawn(server.serve(server_shutdown.clone()));

    // Ctrl-C behaves like a graceful stop.
    let signal_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            signal_state.lifecycle.stop(true).await;
        }
    });

    if args.start_running {
        state.lifecycle.resume();
    }

    ConsumeRunner::new(state, command_rx, clients).run().await;

    server_shutdown.cancel();
    if let Err(e) = server_handle.await {
        warn!(error = %e, "IPC server task failed");
    }
    info!("Fuel daemon stopped");
    Ok(())
}
