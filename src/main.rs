use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use nix::fcntl::{Flock, FlockArg};
use tracing_subscriber::EnvFilter;

use craned::cgroup::{bpf, CgroupDriver, DEFAULT_CGROUP_ROOT};
use craned::config::{CranedConfig, DEFAULT_CONFIG_PATH, DEFAULT_CRANED_PORT};
use craned::device::DeviceMap;
use craned::grpc::ctld_client::CtldClient;
use craned::grpc::CranedServer;
use craned::job::{JobManager, JobSpec};
use craned::shutdown::install_shutdown_handler;
use craned::supervisor_keeper::SupervisorKeeper;
use craned::util::{create_folders, create_folders_for_file};
use craned::JobId;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "craned")]
#[command(about = "Compute-node agent of the Crane batch scheduler")]
#[command(disable_version_flag = true)]
struct Args {
    /// Path to configuration file
    #[arg(short = 'C', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listening address, format: <IP>:<port>
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Controller address, format: <IP>:<port>
    #[arg(short = 's', long)]
    server_address: Option<String>,

    /// Path to the agent log file
    #[arg(short = 'L', long)]
    log_file: Option<PathBuf>,

    /// Logging level: trace|debug|info|warn|error
    #[arg(short = 'D', long)]
    debug_level: Option<String>,

    /// Display version information
    #[arg(short = 'v', long)]
    version: bool,
}

fn main() {
    let args = Args::parse();
    if args.version {
        println!("Version: {VERSION}");
        std::process::exit(0);
    }

    let mut config = match CranedConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("craned: {e}");
            std::process::exit(1);
        }
    };

    // Command line overrides the config file.
    if let Some(listen) = &args.listen {
        match listen.rsplit_once(':') {
            Some((addr, port)) => {
                config.listen_addr = addr.to_string();
                config.listen_port = port.parse().unwrap_or(DEFAULT_CRANED_PORT);
            }
            None => config.listen_addr = listen.clone(),
        }
    }
    if let Some(server_address) = &args.server_address {
        config.control_machine = server_address.clone();
    }
    if let Some(log_file) = &args.log_file {
        config.craned_log_file = log_file.clone();
    }
    if let Some(debug_level) = &args.debug_level {
        config.debug_level = debug_level.clone();
    }
    if config.control_machine.is_empty() {
        eprintln!("craned: controller address must be specified in command line or config file");
        std::process::exit(1);
    }

    if create_folders_for_file(&config.craned_log_file).is_err()
        || create_folders(&config.craned_script_dir).is_err()
        || create_folders(&config.crane_base_dir).is_err()
    {
        eprintln!("craned: cannot create required directories");
        std::process::exit(1);
    }

    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.craned_log_file)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!(
                "craned: cannot open log file {}: {e}",
                config.craned_log_file.display()
            );
            std::process::exit(1);
        }
    };
    let (writer, _log_guard) = tracing_appender::non_blocking(log_file);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.debug_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();

    // A second agent instance on the same base dir would fight over
    // cgroups and sockets.
    let _instance_lock = check_singleton(&config);

    bpf::set_logging(matches!(config.debug_level.as_str(), "trace" | "debug"));

    // SIGPIPE arrives whenever a spawned process closes its end early.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Cannot create async runtime");
            std::process::exit(1);
        }
    };
    runtime.block_on(run(config));
    std::process::exit(0);
}

fn check_singleton(config: &CranedConfig) -> Flock<std::fs::File> {
    if create_folders_for_file(&config.craned_mutex_file_path).is_err() {
        std::process::exit(1);
    }
    let lock_file = match std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&config.craned_mutex_file_path)
    {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(
                path = %config.craned_mutex_file_path.display(),
                error = %e,
                "Failed to open instance lock file. Exiting..."
            );
            std::process::exit(1);
        }
    };
    match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, nix::errno::Errno::EWOULDBLOCK)) => {
            tracing::error!("There is another craned instance running. Exiting...");
            std::process::exit(1);
        }
        Err((_, e)) => {
            tracing::error!(
                path = %config.craned_mutex_file_path.display(),
                error = %e,
                "Failed to lock instance lock file. Exiting..."
            );
            std::process::exit(1);
        }
    }
}

async fn run(config: CranedConfig) {
    let config = Arc::new(config);
    let shutdown = install_shutdown_handler();

    tracing::info!(
        craned_id = %config.craned_id,
        listen = %config.listen_addr,
        port = config.listen_port,
        "Starting craned"
    );

    let devices = match DeviceMap::from_config(&config.gres) {
        Ok(devices) => Arc::new(devices),
        Err(e) => {
            tracing::error!(error = %e, "Device initialization failed");
            std::process::exit(1);
        }
    };

    // Surviving supervisors define which jobs are still running here.
    let keeper = Arc::new(SupervisorKeeper::new());
    let survivors = keeper.recover(&config.crane_base_dir).await;
    if !survivors.is_empty() {
        tracing::info!(
            jobs = ?survivors.keys().collect::<Vec<_>>(),
            "Jobs still running from the previous incarnation"
        );
    }

    let ctld = CtldClient::new(
        config.craned_id.clone(),
        &format!("{}:{}", config.control_machine, config.ctld_port),
    );

    let driver = match CgroupDriver::new(DEFAULT_CGROUP_ROOT) {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            tracing::error!(error = %e, "Cgroup initialization failed");
            std::process::exit(1);
        }
    };

    let (configure_tx, configure_rx) = tokio::sync::oneshot::channel();
    let (job_manager, mut job_loop) = JobManager::new(
        config.clone(),
        driver.clone(),
        devices.clone(),
        keeper.clone(),
        ctld.clone(),
    );

    let (server, recovered) =
        match CranedServer::new(&config, job_manager, ctld.clone(), configure_tx) {
            Ok(built) => built,
            Err(e) => {
                tracing::error!(error = %e, "Cannot build gRPC server");
                std::process::exit(1);
            }
        };
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(server_shutdown).await {
            tracing::error!(error = %e, "gRPC server failed");
        }
    });

    tokio::spawn(ctld.clone().run());

    // The controller's Configure call carries the authoritative job view;
    // intersect it with the supervisor survivors.
    tracing::info!("Waiting for controller configuration");
    let configure = match configure_rx.await {
        Ok(configure) => configure,
        Err(_) => {
            tracing::error!("Configuration channel closed before Configure arrived");
            std::process::exit(1);
        }
    };

    let mut unknown_supervisors: HashSet<JobId> = survivors.keys().copied().collect();
    let mut running_jobs: HashSet<JobId> = HashSet::new();
    let mut nonexistent_jobs: Vec<JobId> = Vec::new();
    let mut job_status_map: HashMap<JobId, (JobSpec, craned::proto::TaskSpec, i32)> =
        HashMap::new();

    for (job_id, job_spec) in configure.job_map {
        if unknown_supervisors.remove(&job_id) {
            running_jobs.insert(job_id);
            let task_spec = configure
                .job_tasks_map
                .get(&job_id)
                .cloned()
                .unwrap_or_default();
            job_status_map.insert(
                job_id,
                (JobSpec::from(job_spec), task_spec, survivors[&job_id]),
            );
        } else {
            nonexistent_jobs.push(job_id);
        }
    }
    if !unknown_supervisors.is_empty() {
        tracing::error!(
            jobs = ?unknown_supervisors,
            "Supervisors running for jobs the controller does not know"
        );
    }

    // Stale job cgroups and device-map entries from the previous
    // incarnation are removed now that the kept set is known.
    {
        let driver = driver.clone();
        let running = running_jobs.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || driver.reconcile(&running)).await.unwrap_or_else(
                |e| Err(craned::error::CranedError::System(format!("join error: {e}"))),
            )
        {
            tracing::error!(error = %e, "Cgroup reconciliation failed");
        }
    }

    job_loop.recover(job_status_map).await;
    let job_handle = tokio::spawn(job_loop.run(shutdown.clone()));

    recovered.store(true, Ordering::Release);
    tracing::info!("Craned finished recover");

    ctld.craned_ready(nonexistent_jobs).await;

    // The job manager drains the live set after shutdown is requested.
    let _ = job_handle.await;
    let _ = server_handle.await;
    tracing::info!("craned exiting");
}
