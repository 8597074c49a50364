use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use craned::config::SupervisorConfig;
use craned::supervisor::task::{new_task_runner, TaskEvent};
use craned::supervisor::server;

#[derive(Parser, Debug)]
#[command(name = "csupervisor")]
#[command(about = "Per-job supervisor of the Crane compute-node agent")]
struct Args {
    /// Job this supervisor owns
    #[arg(long)]
    job_id: u32,

    /// Identity of the spawning agent
    #[arg(long)]
    craned_id: String,

    /// Crane base directory (holds the control sockets)
    #[arg(long)]
    base_dir: PathBuf,

    /// Directory the job script is written to
    #[arg(long)]
    script_dir: PathBuf,

    /// The agent's unix socket, for status change reports
    #[arg(long)]
    craned_sock: PathBuf,

    /// cgroup.procs files the task pid is attached to (repeatable)
    #[arg(long = "cgroup-procs")]
    cgroup_procs: Vec<PathBuf>,

    /// Log file of this supervisor
    #[arg(long)]
    log_file: PathBuf,

    /// Logging level: trace|debug|info|warn|error
    #[arg(long, default_value = "info")]
    debug_level: String,

    /// Job memory cap, surfaced as CRANE_MEM_PER_NODE
    #[arg(long, default_value = "0")]
    memory_limit_bytes: u64,

    /// Environment contributed by assigned devices, NAME=VALUE (repeatable)
    #[arg(long = "device-env")]
    device_env: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(parent) = args.log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.log_file)?;
    let (writer, _log_guard) = tracing_appender::non_blocking(log_file);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.debug_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();

    // SIGPIPE would kill the supervisor when a task closes its stdio early.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let device_env: HashMap<String, String> = args
        .device_env
        .iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let config = SupervisorConfig {
        job_id: args.job_id,
        craned_id: args.craned_id,
        crane_base_dir: args.base_dir,
        craned_script_dir: args.script_dir,
        craned_unix_sock_path: args.craned_sock,
        cgroup_procs_paths: args.cgroup_procs,
        debug_level: args.debug_level,
        log_file: args.log_file,
        device_env,
        memory_limit_bytes: args.memory_limit_bytes,
    };

    let sock_path = config.supervisor_sock_path();
    let job_id = config.job_id;
    tracing::info!(job_id, "Supervisor starting");

    let (runner, run_loop) = new_task_runner(config);
    let exit = run_loop.exit_token();

    // Reap notifications are delivered to the runner as events.
    let sigchld_tx = runner.event_sender();
    tokio::spawn(async move {
        let mut sigchld = match signal(SignalKind::child()) {
            Ok(sigchld) => sigchld,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGCHLD handler");
                return;
            }
        };
        while sigchld.recv().await.is_some() {
            if sigchld_tx.send(TaskEvent::SigChld).await.is_err() {
                break;
            }
        }
    });

    let server_sock = sock_path.clone();
    let server_runner = runner.clone();
    let server_exit = exit.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(&server_sock, job_id, server_runner, server_exit).await {
            tracing::error!(error = %e, "Supervisor server failed");
        }
    });

    run_loop.run().await;
    let _ = server_handle.await;
    let _ = std::fs::remove_file(&sock_path);
    tracing::info!(job_id, "Supervisor exiting");
    Ok(())
}
