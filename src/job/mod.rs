//! Per-job state machine of the agent.
//!
//! The `JobManager` is a single-writer actor: every external request is
//! enqueued as a [`JobEvent`] and consumed serially by the event loop, which
//! gives a total order of events per job. Blocking work (cgroup syscalls,
//! process spawning) runs on the blocking thread pool and never touches
//! manager state directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cgroup::{
    CgroupDriver, CgroupHandle, CgroupVersion, ControllerFlags, V1_PREFERRED_CONTROLLERS,
    V2_PREFERRED_CONTROLLERS,
};
use crate::config::{CranedConfig, SupervisorConfig};
use crate::device::DeviceMap;
use crate::error::{exit_code, CranedError, Result};
use crate::grpc::ctld_client::CtldClient;
use crate::proto::{self, TaskStatus};
use crate::supervisor_keeper::SupervisorKeeper;
use crate::JobId;

/// Device access bits enforced for every job cgroup.
pub const LIMIT_DEVICE_READ: bool = true;
pub const LIMIT_DEVICE_WRITE: bool = true;
pub const LIMIT_DEVICE_MKNOD: bool = true;

/// Resource allocation of one job on this node, decoded from the wire.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: JobId,
    pub uid: u32,
    pub gid: u32,
    pub cpu_core_limit: f64,
    pub memory_limit_bytes: u64,
    pub memory_sw_limit_bytes: u64,
    pub dedicated_slots: HashSet<String>,
    pub time_limit: Duration,
    pub start_time: DateTime<Utc>,
}

impl From<proto::JobSpec> for JobSpec {
    fn from(spec: proto::JobSpec) -> Self {
        JobSpec {
            job_id: spec.job_id,
            uid: spec.uid,
            gid: spec.gid,
            cpu_core_limit: spec.cpu_core_limit,
            memory_limit_bytes: spec.memory_limit_bytes,
            memory_sw_limit_bytes: spec.memory_sw_limit_bytes,
            dedicated_slots: spec.dedicated_slots.into_iter().collect(),
            time_limit: Duration::from_secs(spec.time_limit_seconds.max(0) as u64),
            start_time: Utc
                .timestamp_opt(spec.start_time, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// A terminal status pending delivery or acknowledgement upstream.
#[derive(Debug, Clone, Copy)]
pub struct TerminalStatus {
    pub status: TaskStatus,
    pub exit_code: u32,
}

struct JobInstance {
    spec: JobSpec,
    cgroup: Option<CgroupHandle>,
    task_spec: Option<proto::TaskSpec>,
    task_pid: Option<i32>,
    supervisor_spawned: bool,
    orphaned: bool,
    /// Why the agent killed the task, if it did; overrides the status the
    /// supervisor reports for the kill.
    terminated_by: Option<TaskStatus>,
    timer: Option<JoinHandle<()>>,
    terminal: Option<TerminalStatus>,
}

impl JobInstance {
    fn new(spec: JobSpec) -> Self {
        JobInstance {
            spec,
            cgroup: None,
            task_spec: None,
            task_pid: None,
            supervisor_spawned: false,
            orphaned: false,
            terminated_by: None,
            timer: None,
            terminal: None,
        }
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub enum JobEvent {
    AllocateJobs {
        specs: Vec<JobSpec>,
        resp: oneshot::Sender<Vec<(JobId, bool)>>,
    },
    ExecuteTask {
        task: proto::TaskSpec,
        resp: oneshot::Sender<Result<()>>,
    },
    TerminateTask {
        job_id: JobId,
        mark_orphaned: bool,
    },
    ChangeTimeLimit {
        job_id: JobId,
        seconds: i64,
        resp: oneshot::Sender<bool>,
    },
    CheckTaskStatus {
        job_id: JobId,
        resp: oneshot::Sender<Option<TaskStatus>>,
    },
    FreeJobAllocation {
        job_ids: Vec<JobId>,
        resp: oneshot::Sender<Vec<(JobId, bool)>>,
    },
    TaskStatusChange {
        job_id: JobId,
        new_status: TaskStatus,
        exit_code: u32,
        reason: Option<String>,
    },
    TimerFired {
        job_id: JobId,
    },
    QueryJobIdFromPid {
        pid: i32,
        resp: oneshot::Sender<Option<JobId>>,
    },
    QueryTaskEnvMap {
        job_id: JobId,
        resp: oneshot::Sender<Option<HashMap<String, String>>>,
    },
    MigrateProcToCgroup {
        pid: i32,
        job_id: JobId,
        resp: oneshot::Sender<bool>,
    },
}

/// Cheap, clonable handle used by the RPC layer.
#[derive(Clone)]
pub struct JobManager {
    event_tx: mpsc::Sender<JobEvent>,
}

impl JobManager {
    pub fn new(
        config: Arc<CranedConfig>,
        driver: Arc<CgroupDriver>,
        devices: Arc<DeviceMap>,
        keeper: Arc<SupervisorKeeper>,
        ctld: Arc<CtldClient>,
    ) -> (Self, JobManagerLoop) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let manager = JobManager {
            event_tx: event_tx.clone(),
        };
        let run_loop = JobManagerLoop {
            config,
            driver,
            devices,
            keeper,
            ctld,
            jobs: HashMap::new(),
            pid_index: HashMap::new(),
            event_tx,
            event_rx,
            ending: false,
        };
        (manager, run_loop)
    }

    pub fn event_sender(&self) -> mpsc::Sender<JobEvent> {
        self.event_tx.clone()
    }

    pub async fn allocate_jobs(&self, specs: Vec<JobSpec>) -> Vec<(JobId, bool)> {
        let (tx, rx) = oneshot::channel();
        if self
            .event_tx
            .send(JobEvent::AllocateJobs { specs, resp: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn execute_task(&self, task: proto::TaskSpec) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(JobEvent::ExecuteTask { task, resp: tx })
            .await
            .map_err(|_| CranedError::System("job manager is gone".to_string()))?;
        rx.await
            .map_err(|_| CranedError::System("job manager dropped the request".to_string()))?
    }

    pub async fn terminate_task(&self, job_id: JobId) {
        let _ = self
            .event_tx
            .send(JobEvent::TerminateTask {
                job_id,
                mark_orphaned: false,
            })
            .await;
    }

    pub async fn mark_orphaned_and_terminate(&self, job_id: JobId) {
        let _ = self
            .event_tx
            .send(JobEvent::TerminateTask {
                job_id,
                mark_orphaned: true,
            })
            .await;
    }

    pub async fn change_task_time_limit(&self, job_id: JobId, seconds: i64) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .event_tx
            .send(JobEvent::ChangeTimeLimit {
                job_id,
                seconds,
                resp: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn check_task_status(&self, job_id: JobId) -> Option<TaskStatus> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(JobEvent::CheckTaskStatus { job_id, resp: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn free_job_allocation(&self, job_ids: Vec<JobId>) -> Vec<(JobId, bool)> {
        let (tx, rx) = oneshot::channel();
        if self
            .event_tx
            .send(JobEvent::FreeJobAllocation { job_ids, resp: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn task_status_change(
        &self,
        job_id: JobId,
        new_status: TaskStatus,
        exit_code: u32,
        reason: Option<String>,
    ) {
        let _ = self
            .event_tx
            .send(JobEvent::TaskStatusChange {
                job_id,
                new_status,
                exit_code,
                reason,
            })
            .await;
    }

    pub async fn query_job_id_from_pid(&self, pid: i32) -> Option<JobId> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(JobEvent::QueryJobIdFromPid { pid, resp: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn query_task_env_map(&self, job_id: JobId) -> Option<HashMap<String, String>> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(JobEvent::QueryTaskEnvMap { job_id, resp: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn migrate_proc_to_cgroup(&self, pid: i32, job_id: JobId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .event_tx
            .send(JobEvent::MigrateProcToCgroup {
                pid,
                job_id,
                resp: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// The event-loop half of the manager; owns all job state.
pub struct JobManagerLoop {
    config: Arc<CranedConfig>,
    driver: Arc<CgroupDriver>,
    devices: Arc<DeviceMap>,
    keeper: Arc<SupervisorKeeper>,
    ctld: Arc<CtldClient>,

    jobs: HashMap<JobId, JobInstance>,
    pid_index: HashMap<i32, JobId>,

    event_tx: mpsc::Sender<JobEvent>,
    event_rx: mpsc::Receiver<JobEvent>,
    ending: bool,
}

impl JobManagerLoop {
    /// Rebuild state for jobs that survived an agent restart: the
    /// intersection of the supervisor survivors and the controller's
    /// authoritative view. Cgroups are adopted in recover mode; no limits
    /// are reapplied and no hook fires. Timers restart from the original
    /// start time.
    pub async fn recover(
        &mut self,
        job_status_map: HashMap<JobId, (JobSpec, proto::TaskSpec, i32)>,
    ) {
        for (job_id, (spec, task_spec, task_pid)) in job_status_map {
            let driver = self.driver.clone();
            let devices = self.devices.clone();
            let recover_spec = spec.clone();
            let cgroup = tokio::task::spawn_blocking(move || {
                let preferred = preferred_controllers(driver.version());
                let mut cgroup = driver.create_or_open(
                    recover_spec.job_id,
                    preferred,
                    ControllerFlags::empty(),
                    true,
                )?;
                cgroup.recover_device_entries(
                    &devices,
                    &recover_spec.dedicated_slots,
                    LIMIT_DEVICE_READ,
                    LIMIT_DEVICE_WRITE,
                    LIMIT_DEVICE_MKNOD,
                );
                Ok::<_, CranedError>(cgroup)
            })
            .await
            .unwrap_or_else(|e| Err(CranedError::System(format!("join error: {e}"))));

            let cgroup = match cgroup {
                Ok(cgroup) => cgroup,
                Err(e) => {
                    tracing::error!(job_id, error = %e, "Failed to adopt cgroup during recovery");
                    continue;
                }
            };

            let mut instance = JobInstance::new(spec);
            instance.cgroup = Some(cgroup);
            instance.task_spec = Some(task_spec);
            instance.task_pid = Some(task_pid);
            instance.supervisor_spawned = true;
            instance.timer = Some(Self::spawn_timer(
                self.event_tx.clone(),
                job_id,
                deadline_after(instance.spec.start_time, instance.spec.time_limit),
            ));
            self.pid_index.insert(task_pid, job_id);
            self.jobs.insert(job_id, instance);
            tracing::info!(job_id, pid = task_pid, "Recovered running job");
        }
    }

    /// Run until shutdown is requested and the live set drains.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
                _ = shutdown.cancelled(), if !self.ending => {
                    tracing::info!("Shutdown requested. Draining running jobs");
                    self.ending = true;
                }
                _ = tick.tick() => {}
            }

            if self.ending && self.jobs.is_empty() {
                tracing::info!("All jobs cleared. Job manager exiting");
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::AllocateJobs { specs, resp } => {
                let results = self.allocate_jobs(specs).await;
                let _ = resp.send(results);
            }
            JobEvent::ExecuteTask { task, resp } => {
                let result = self.execute_task(task).await;
                let _ = resp.send(result);
            }
            JobEvent::TerminateTask {
                job_id,
                mark_orphaned,
            } => {
                self.terminate_task(job_id, mark_orphaned, false).await;
            }
            JobEvent::ChangeTimeLimit {
                job_id,
                seconds,
                resp,
            } => {
                let ok = self.change_time_limit(job_id, seconds).await;
                let _ = resp.send(ok);
            }
            JobEvent::CheckTaskStatus { job_id, resp } => {
                let status = match self.jobs.get(&job_id) {
                    Some(instance) => match instance.terminal {
                        Some(terminal) => Some(terminal.status),
                        None => Some(TaskStatus::Running),
                    },
                    None => None,
                };
                let _ = resp.send(status);
            }
            JobEvent::FreeJobAllocation { job_ids, resp } => {
                let mut results = Vec::with_capacity(job_ids.len());
                for job_id in job_ids {
                    let ok = self.free_job_allocation(job_id).await;
                    results.push((job_id, ok));
                }
                let _ = resp.send(results);
            }
            JobEvent::TaskStatusChange {
                job_id,
                new_status,
                exit_code,
                reason,
            } => {
                self.task_status_change(job_id, new_status, exit_code, reason)
                    .await;
            }
            JobEvent::TimerFired { job_id } => {
                self.timer_fired(job_id).await;
            }
            JobEvent::QueryJobIdFromPid { pid, resp } => {
                let _ = resp.send(self.pid_index.get(&pid).copied());
            }
            JobEvent::QueryTaskEnvMap { job_id, resp } => {
                let env = self.jobs.get(&job_id).and_then(|instance| {
                    instance.task_spec.as_ref().map(|task| {
                        crate::supervisor::env::build_task_env(
                            task,
                            &self.devices.env_for_assigned(&instance.spec.dedicated_slots),
                            instance.spec.memory_limit_bytes,
                        )
                    })
                });
                let _ = resp.send(env);
            }
            JobEvent::MigrateProcToCgroup { pid, job_id, resp } => {
                let ok = match self.jobs.get(&job_id).and_then(|i| i.cgroup.as_ref()) {
                    Some(cgroup) => match cgroup.migrate_proc_in(pid) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(pid, job_id, error = %e, "Cannot migrate process into job cgroup");
                            false
                        }
                    },
                    None => false,
                };
                let _ = resp.send(ok);
            }
        }
    }

    async fn allocate_jobs(&mut self, specs: Vec<JobSpec>) -> Vec<(JobId, bool)> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let job_id = spec.job_id;
            if self.ending {
                tracing::warn!(job_id, "Agent is shutting down. Rejecting allocation");
                results.push((job_id, false));
                continue;
            }
            if self.jobs.contains_key(&job_id) {
                tracing::error!(job_id, "Duplicated allocation request. Ignoring it");
                results.push((job_id, false));
                continue;
            }

            tracing::info!(
                job_id,
                cpu = spec.cpu_core_limit,
                memory_bytes = spec.memory_limit_bytes,
                slots = spec.dedicated_slots.len(),
                "Allocating job resources"
            );

            let driver = self.driver.clone();
            let devices = self.devices.clone();
            let alloc_spec = spec.clone();
            let cgroup = tokio::task::spawn_blocking(move || {
                allocate_cgroup(&driver, &devices, &alloc_spec)
            })
            .await
            .unwrap_or_else(|e| Err(CranedError::System(format!("join error: {e}"))));

            match cgroup {
                Ok(cgroup) => {
                    if self.config.plugin.enabled {
                        tracing::trace!(
                            job_id,
                            cgroup = cgroup.name(),
                            "Dispatching create-cgroup hook"
                        );
                    }
                    let mut instance = JobInstance::new(spec);
                    instance.cgroup = Some(cgroup);
                    self.jobs.insert(job_id, instance);
                    results.push((job_id, true));
                }
                Err(e) => {
                    tracing::error!(job_id, error = %e, "Failed to create cgroup for job");
                    results.push((job_id, false));
                }
            }
        }
        results
    }

    async fn execute_task(&mut self, task: proto::TaskSpec) -> Result<()> {
        let job_id = task.job_id;
        if !self.jobs.contains_key(&job_id) {
            tracing::debug!(job_id, "Executing task without an allocated cgroup. Ignoring it");
            return Err(CranedError::Cgroup(format!(
                "no cgroup allocated for job {job_id}"
            )));
        }
        if self.jobs[&job_id].cgroup.is_none() {
            self.activate_status_change(
                job_id,
                TaskStatus::Failed,
                exit_code::CGROUP_ERROR,
                Some(format!("failed to find created cgroup for job {job_id}")),
            )
            .await;
            return Err(CranedError::Cgroup(format!(
                "no cgroup allocated for job {job_id}"
            )));
        }
        let Some(instance) = self.jobs.get_mut(&job_id) else {
            return Err(CranedError::JobNotFound(job_id));
        };

        tracing::info!(job_id, "Executing task");
        let event_tx = self.event_tx.clone();
        instance.task_spec = Some(task.clone());
        instance.spec.start_time = Utc::now();

        // Interactive allocations carry no script to run.
        if task.r#type == proto::JobType::Calloc as i32 {
            instance.timer = Some(Self::spawn_timer(
                event_tx,
                job_id,
                deadline_after(
                    Utc::now(),
                    Duration::from_secs(task.time_limit_seconds.max(0) as u64),
                ),
            ));
            return Ok(());
        }

        if !instance.supervisor_spawned {
            let sv_config = self.supervisor_config(job_id);
            match self.keeper.spawn_supervisor(&self.config, &sv_config).await {
                Ok(()) => {
                    if let Some(instance) = self.jobs.get_mut(&job_id) {
                        instance.supervisor_spawned = true;
                    }
                }
                Err(e) => {
                    tracing::error!(job_id, error = %e, "Failed to spawn supervisor");
                    self.activate_status_change(
                        job_id,
                        TaskStatus::Failed,
                        exit_code::SPAWN_PROCESS_FAIL,
                        Some(format!("cannot spawn supervisor for job {job_id}: {e}")),
                    )
                    .await;
                    return Err(e);
                }
            }
        }

        match self.keeper.execute_task(job_id, task).await {
            Ok(pid) => {
                tracing::debug!(job_id, pid, "Task process started");
                let event_tx = self.event_tx.clone();
                if let Some(instance) = self.jobs.get_mut(&job_id) {
                    instance.task_pid = Some(pid);
                    instance.timer = Some(Self::spawn_timer(
                        event_tx,
                        job_id,
                        deadline_after(instance.spec.start_time, instance.spec.time_limit),
                    ));
                }
                self.pid_index.insert(pid, job_id);
                Ok(())
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Supervisor failed to start the task");
                self.activate_status_change(
                    job_id,
                    TaskStatus::Failed,
                    exit_code::SPAWN_PROCESS_FAIL,
                    Some(format!("cannot spawn task process of job {job_id}: {e}")),
                )
                .await;
                Err(e)
            }
        }
    }

    fn supervisor_config(&self, job_id: JobId) -> SupervisorConfig {
        let instance = &self.jobs[&job_id];
        let cgroup_procs_paths = instance
            .cgroup
            .as_ref()
            .map(|cg| cg.procs_paths())
            .unwrap_or_default();
        SupervisorConfig {
            job_id,
            craned_id: self.config.craned_id.clone(),
            crane_base_dir: self.config.crane_base_dir.clone(),
            craned_script_dir: self.config.craned_script_dir.clone(),
            craned_unix_sock_path: self.config.craned_unix_sock_path.clone(),
            cgroup_procs_paths,
            debug_level: self.config.debug_level.clone(),
            log_file: self
                .config
                .crane_base_dir
                .join(format!("supervisor_{job_id}.log")),
            device_env: self
                .devices
                .env_for_assigned(&instance.spec.dedicated_slots),
            memory_limit_bytes: instance.spec.memory_limit_bytes,
        }
    }

    /// Terminate a job's task. Unknown job ids are accepted silently so the
    /// operation is idempotent.
    async fn terminate_task(&mut self, job_id: JobId, mark_orphaned: bool, by_timeout: bool) {
        let Some(instance) = self.jobs.get_mut(&job_id) else {
            tracing::debug!(job_id, "Terminate for an unknown job. Ignoring it");
            return;
        };

        if mark_orphaned {
            instance.orphaned = true;
        }
        if by_timeout {
            instance.terminated_by = Some(TaskStatus::ExceedTimeLimit);
        } else if instance.terminated_by.is_none() {
            instance.terminated_by = Some(TaskStatus::Cancelled);
        }

        if instance.terminal.is_some() {
            // Already ended; nothing further to kill.
            return;
        }

        if !instance.supervisor_spawned {
            // The pending execution is dropped; synthesize the terminal
            // status locally.
            let status = instance.terminated_by.unwrap_or(TaskStatus::Cancelled);
            let code = match status {
                TaskStatus::ExceedTimeLimit => exit_code::EXCEED_TIME_LIMIT,
                _ => exit_code::from_wait_signal(libc::SIGTERM),
            };
            self.activate_status_change(job_id, status, code, None).await;
            return;
        }

        if let Err(e) = self.keeper.terminate_task(job_id, mark_orphaned).await {
            tracing::error!(job_id, error = %e, "Supervisor unreachable during terminate");
            self.on_supervisor_lost(job_id).await;
        }
    }

    async fn change_time_limit(&mut self, job_id: JobId, seconds: i64) -> bool {
        let Some(instance) = self.jobs.get_mut(&job_id) else {
            tracing::error!(job_id, "Time limit change for a non-existent job");
            return false;
        };

        let new_limit = Duration::from_secs(seconds.max(0) as u64);
        instance.spec.time_limit = new_limit;
        instance.abort_timer();

        let start_time = instance.spec.start_time;
        let deadline = deadline_after(start_time, new_limit);
        let now = Utc::now();

        if now >= deadline_time(start_time, new_limit) {
            tracing::debug!(job_id, "New time limit already exceeded. Terminating task");
            self.terminate_task(job_id, false, true).await;
        } else {
            let event_tx = self.event_tx.clone();
            if let Some(instance) = self.jobs.get_mut(&job_id) {
                instance.timer = Some(Self::spawn_timer(event_tx, job_id, deadline));
            }
            if let Err(e) = self.keeper.change_task_time_limit(job_id, seconds).await {
                tracing::debug!(job_id, error = %e, "Supervisor did not take the time limit change");
            }
        }
        true
    }

    async fn timer_fired(&mut self, job_id: JobId) {
        if !self.jobs.contains_key(&job_id) {
            tracing::trace!(job_id, "Timer fired for a job that is already gone");
            return;
        }
        tracing::debug!(job_id, "Job exceeded its time limit. Terminating it");
        self.terminate_task(job_id, false, true).await;
    }

    async fn free_job_allocation(&mut self, job_id: JobId) -> bool {
        let Some(instance) = self.jobs.get_mut(&job_id) else {
            tracing::debug!(job_id, "Free for an unknown job allocation. Ignoring it");
            return true;
        };

        if let Some(cgroup) = instance.cgroup.as_ref() {
            // The user process tree must be gone. A non-empty cgroup is a
            // process leak; kill and let the controller retry.
            match cgroup.empty() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(job_id, "Cgroup still has processes. Killing them");
                    let _ = cgroup.kill_all_processes();
                    return false;
                }
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Cannot inspect cgroup before free");
                }
            }
        }

        let Some(mut instance) = self.jobs.remove(&job_id) else {
            return true;
        };
        instance.abort_timer();
        if let Some(pid) = instance.task_pid {
            self.pid_index.remove(&pid);
        }

        if let Some(cgroup) = instance.cgroup.take() {
            let destroyed =
                tokio::task::spawn_blocking(move || cgroup.destroy()).await;
            match destroyed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(job_id, error = %e, "Failed to destroy cgroup");
                    return false;
                }
                Err(e) => {
                    tracing::error!(job_id, error = %e, "Cgroup destroy task failed");
                    return false;
                }
            }
        }

        if instance.supervisor_spawned {
            let _ = self.keeper.terminate_supervisor(job_id).await;
        }
        self.keeper.remove(job_id, &self.config.crane_base_dir).await;
        tracing::info!(job_id, "Job allocation freed");
        true
    }

    /// A supervisor-sourced (or locally synthesized) terminal status.
    async fn task_status_change(
        &mut self,
        job_id: JobId,
        new_status: TaskStatus,
        exit_code: u32,
        reason: Option<String>,
    ) {
        let Some(instance) = self.jobs.get_mut(&job_id) else {
            // Double status changes can happen when a terminate races task
            // end. Ignore them.
            tracing::trace!(job_id, "Status change for an unknown job. Ignoring it");
            return;
        };

        // The agent-side kill reason wins over what the supervisor derived
        // from the wait status.
        let status = match (instance.terminated_by, new_status) {
            (Some(kill_status), TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled) => {
                kill_status
            }
            (_, status) => status,
        };

        instance.abort_timer();
        instance.terminal = Some(TerminalStatus { status, exit_code });
        let orphaned = instance.orphaned;

        let script = self.config.script_path(job_id);
        let _ = tokio::task::spawn_blocking(move || std::fs::remove_file(script)).await;

        tracing::info!(
            job_id,
            status = ?status,
            exit_code,
            orphaned,
            "Task reached a terminal status"
        );

        if !orphaned {
            self.ctld
                .task_status_change(job_id, status, exit_code, reason)
                .await;
        }
    }

    async fn activate_status_change(
        &mut self,
        job_id: JobId,
        new_status: TaskStatus,
        exit_code: u32,
        reason: Option<String>,
    ) {
        self.task_status_change(job_id, new_status, exit_code, reason)
            .await;
    }

    /// The supervisor control channel broke before the task ended: report
    /// `Failed`, SIGKILL the user processes, and drop the record.
    async fn on_supervisor_lost(&mut self, job_id: JobId) {
        if let Some(instance) = self.jobs.get_mut(&job_id) {
            if let Some(cgroup) = instance.cgroup.as_ref() {
                let _ = cgroup.kill_all_processes();
            }
        }
        self.keeper.remove(job_id, &self.config.crane_base_dir).await;
        self.activate_status_change(
            job_id,
            TaskStatus::Failed,
            exit_code::SUPERVISOR_LOST,
            Some(format!("supervisor for job {job_id} disconnected unexpectedly")),
        )
        .await;
    }

    fn spawn_timer(
        event_tx: mpsc::Sender<JobEvent>,
        job_id: JobId,
        deadline: tokio::time::Instant,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = event_tx.send(JobEvent::TimerFired { job_id }).await;
        })
    }
}

fn preferred_controllers(version: CgroupVersion) -> ControllerFlags {
    match version {
        CgroupVersion::V1 => V1_PREFERRED_CONTROLLERS,
        CgroupVersion::V2 => V2_PREFERRED_CONTROLLERS,
    }
}

fn allocate_cgroup(
    driver: &CgroupDriver,
    devices: &DeviceMap,
    spec: &JobSpec,
) -> Result<CgroupHandle> {
    let preferred = preferred_controllers(driver.version());
    let mut cgroup =
        driver.create_or_open(spec.job_id, preferred, ControllerFlags::empty(), false)?;

    cgroup.set_cpu_core_limit(spec.cpu_core_limit)?;
    cgroup.set_memory_limit_bytes(spec.memory_limit_bytes)?;

    // Soft and swap caps depend on the host configuration; failures here
    // are logged and ignored.
    if let Err(e) = cgroup.set_memory_soft_limit_bytes(spec.memory_sw_limit_bytes) {
        tracing::debug!(job_id = spec.job_id, error = %e, "Memory soft limit not applied");
    }
    if let Err(e) = cgroup.set_memory_sw_limit_bytes(spec.memory_sw_limit_bytes) {
        tracing::debug!(job_id = spec.job_id, error = %e, "Memory+swap limit not applied");
    }

    if !devices.is_empty() {
        cgroup.set_device_access(
            devices,
            &spec.dedicated_slots,
            LIMIT_DEVICE_READ,
            LIMIT_DEVICE_WRITE,
            LIMIT_DEVICE_MKNOD,
        )?;
    }

    Ok(cgroup)
}

fn deadline_time(start: DateTime<Utc>, limit: Duration) -> DateTime<Utc> {
    start + chrono::Duration::from_std(limit).unwrap_or(chrono::Duration::zero())
}

/// Translate an absolute wall-clock deadline into a tokio instant.
fn deadline_after(start: DateTime<Utc>, limit: Duration) -> tokio::time::Instant {
    let deadline = deadline_time(start, limit);
    let remaining = (deadline - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    tokio::time::Instant::now() + remaining
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_spec_from_proto() {
        let spec = JobSpec::from(proto::JobSpec {
            job_id: 7,
            uid: 1000,
            gid: 1000,
            cpu_core_limit: 0.5,
            memory_limit_bytes: 128 * 1024 * 1024,
            memory_sw_limit_bytes: 0,
            dedicated_slots: vec!["/dev/nvidia0".to_string()],
            time_limit_seconds: 3600,
            start_time: 1_700_000_000,
        });
        assert_eq!(spec.job_id, 7);
        assert_eq!(spec.time_limit, Duration::from_secs(3600));
        assert!(spec.dedicated_slots.contains("/dev/nvidia0"));
        assert_eq!(spec.start_time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn expired_deadline_collapses_to_now() {
        let start = Utc::now() - chrono::Duration::seconds(100);
        let deadline = deadline_after(start, Duration::from_secs(10));
        assert!(deadline <= tokio::time::Instant::now() + Duration::from_millis(1));
    }
}
