//! Parent-side task lifecycle inside the supervisor.
//!
//! The runner is a single-writer actor like the agent's job manager: the
//! unix-socket service, the SIGCHLD handler, the local time-limit timer and
//! the relay client all post [`TaskEvent`]s consumed serially here.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::error::{exit_code, CranedError, Result};
use crate::proto::craned_client::CranedClient;
use crate::proto::{self, CanStartMessage, ChildProcessReady, JobType, TaskStatus};
use crate::supervisor::cfored::CforedClient;
use crate::supervisor::env::build_task_env;
use crate::supervisor::exec::{self, ChildSetup, ChildStdio};
use crate::supervisor_keeper::connect_uds;
use crate::util::{parse_file_path_pattern, substitute_path_tokens};

/// Grace period between SIGTERM and SIGKILL when killing the task group.
const KILL_GRACE: Duration = Duration::from_secs(5);

pub enum TaskEvent {
    Execute {
        task: proto::TaskSpec,
        resp: oneshot::Sender<Result<i32>>,
    },
    CheckStatus {
        resp: oneshot::Sender<Option<i32>>,
    },
    ChangeTimeLimit {
        seconds: i64,
        resp: oneshot::Sender<bool>,
    },
    TerminateTask {
        mark_orphaned: bool,
    },
    TerminateSupervisor,
    SigChld,
    TimerFired,
    OutputDone,
}

/// Clonable handle used by the RPC service and signal plumbing.
#[derive(Clone)]
pub struct TaskRunner {
    event_tx: mpsc::Sender<TaskEvent>,
}

impl TaskRunner {
    pub fn event_sender(&self) -> mpsc::Sender<TaskEvent> {
        self.event_tx.clone()
    }

    pub async fn execute_task(&self, task: proto::TaskSpec) -> Result<i32> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(TaskEvent::Execute { task, resp: tx })
            .await
            .map_err(|_| CranedError::System("task runner is gone".to_string()))?;
        rx.await
            .map_err(|_| CranedError::System("task runner dropped the request".to_string()))?
    }

    pub async fn check_status(&self) -> Option<i32> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(TaskEvent::CheckStatus { resp: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn change_time_limit(&self, seconds: i64) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .event_tx
            .send(TaskEvent::ChangeTimeLimit { seconds, resp: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn terminate_task(&self, mark_orphaned: bool) {
        let _ = self
            .event_tx
            .send(TaskEvent::TerminateTask { mark_orphaned })
            .await;
    }

    pub async fn terminate_supervisor(&self) {
        let _ = self.event_tx.send(TaskEvent::TerminateSupervisor).await;
    }
}

struct RunningTask {
    pid: i32,
    spec: proto::TaskSpec,
    start_time: DateTime<Utc>,
    proc_stopped: bool,
    output_done: bool,
    wait_result: Option<(TaskStatus, u32)>,
}

pub struct TaskRunnerLoop {
    config: SupervisorConfig,
    event_tx: mpsc::Sender<TaskEvent>,
    event_rx: mpsc::Receiver<TaskEvent>,

    task: Option<RunningTask>,
    timer: Option<JoinHandle<()>>,
    kill_escalation: Option<JoinHandle<()>>,
    /// Why this supervisor killed the task; overrides the wait status.
    killed_by: Option<TaskStatus>,
    orphaned: bool,
    terminate_requested: bool,
    status_reported: bool,
    cfored_stop: CancellationToken,
    exit: CancellationToken,
}

pub fn new_task_runner(config: SupervisorConfig) -> (TaskRunner, TaskRunnerLoop) {
    let (event_tx, event_rx) = mpsc::channel(64);
    let runner = TaskRunner {
        event_tx: event_tx.clone(),
    };
    let run_loop = TaskRunnerLoop {
        config,
        event_tx,
        event_rx,
        task: None,
        timer: None,
        kill_escalation: None,
        killed_by: None,
        orphaned: false,
        terminate_requested: false,
        status_reported: false,
        cfored_stop: CancellationToken::new(),
        exit: CancellationToken::new(),
    };
    (runner, run_loop)
}

impl TaskRunnerLoop {
    /// Cancelled when the supervisor should exit: status delivered and the
    /// agent sent `Terminate`.
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub async fn run(mut self) {
        while let Some(event) = self.event_rx.recv().await {
            self.handle(event).await;
            if self.exit.is_cancelled() {
                break;
            }
        }
    }

    async fn handle(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Execute { task, resp } => {
                let result = self.execute(task).await;
                let _ = resp.send(result);
            }
            TaskEvent::CheckStatus { resp } => {
                let _ = resp.send(self.task.as_ref().map(|t| t.pid));
            }
            TaskEvent::ChangeTimeLimit { seconds, resp } => {
                let ok = self.change_time_limit(seconds).await;
                let _ = resp.send(ok);
            }
            TaskEvent::TerminateTask { mark_orphaned } => {
                if mark_orphaned {
                    self.orphaned = true;
                }
                self.kill_task(TaskStatus::Cancelled);
            }
            TaskEvent::TerminateSupervisor => {
                self.terminate_requested = true;
                if self.status_reported || self.task.is_none() {
                    self.exit.cancel();
                }
            }
            TaskEvent::SigChld => {
                self.reap().await;
            }
            TaskEvent::TimerFired => {
                tracing::debug!("Task exceeded its time limit. Terminating it");
                self.kill_task(TaskStatus::ExceedTimeLimit);
            }
            TaskEvent::OutputDone => {
                if let Some(task) = self.task.as_mut() {
                    task.output_done = true;
                }
                self.maybe_report().await;
            }
        }
    }

    async fn execute(&mut self, task: proto::TaskSpec) -> Result<i32> {
        if self.task.is_some() {
            return Err(CranedError::SpawnFail(
                "supervisor already runs a task".to_string(),
            ));
        }

        let job_id = self.config.job_id;
        let is_crun = task.r#type == JobType::Crun as i32;
        let launch_pty = is_crun && task.pty;

        let pwent = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(task.uid))
            .map_err(|e| CranedError::System(e.to_string()))?
            .ok_or_else(|| {
                CranedError::PermissionDenied(format!(
                    "no password entry for uid {} of job {job_id}",
                    task.uid
                ))
            })?;

        // The task environment is assembled before fork; the child only
        // execs with it.
        let env = build_task_env(&task, &self.config.device_env, self.config.memory_limit_bytes);

        let script_path = self.config.script_path();
        std::fs::write(&script_path, &task.script).map_err(|e| {
            CranedError::FileNotFound(format!(
                "cannot write shell script {}: {e}",
                script_path.display()
            ))
        })?;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| CranedError::System(format!("cannot chmod script: {e}")))?;

        let stdio = if task.r#type == JobType::Batch as i32 {
            let stdout_path = substitute_path_tokens(
                &parse_file_path_pattern(&task.output_file_pattern, &task.cwd, job_id),
                job_id,
                &pwent.name,
                &task.name,
            );
            // Empty means merged into stdout.
            let stderr_path = if task.error_file_pattern.is_empty() {
                String::new()
            } else {
                substitute_path_tokens(
                    &parse_file_path_pattern(&task.error_file_pattern, &task.cwd, job_id),
                    job_id,
                    &pwent.name,
                    &task.name,
                )
            };
            ChildStdio::Batch {
                stdout_path,
                stderr_path,
            }
        } else {
            ChildStdio::Pty // placeholder, replaced below for non-pty crun
        };

        let (ctrl_parent, ctrl_child) =
            socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
                .map_err(|e| CranedError::System(format!("cannot create socket pair: {e}")))?;

        tracing::debug!(job_id, pty = launch_pty, "Launching task process");

        let child_setup_base = |stdio: ChildStdio| ChildSetup {
            uid: task.uid,
            gid: task.gid,
            pwent_gid: pwent.gid.as_raw(),
            cwd: task.cwd.clone(),
            stdio,
            env: env.clone(),
            script_path: script_path.to_string_lossy().into_owned(),
            args: task.args.clone(),
            login_shell: task.get_user_env,
        };

        let winsize: Option<&nix::pty::Winsize> = None;
        let termios: Option<&nix::sys::termios::Termios> = None;
        let (child_pid, io_fd): (Pid, Option<OwnedFd>) = if launch_pty {
            match unsafe { nix::pty::forkpty(winsize, termios) }
                .map_err(|e| CranedError::SpawnFail(format!("forkpty() failed: {e}")))?
            {
                nix::pty::ForkptyResult::Parent { child, master } => (child, Some(master)),
                nix::pty::ForkptyResult::Child => {
                    drop(ctrl_parent);
                    exec::run_child(ctrl_child, child_setup_base(ChildStdio::Pty));
                }
            }
        } else if is_crun {
            let (io_parent, io_child) = socketpair(
                AddressFamily::Unix,
                SockType::Stream,
                None,
                SockFlag::empty(),
            )
            .map_err(|e| {
                CranedError::System(format!("cannot create io socket pair: {e}"))
            })?;
            match unsafe { nix::unistd::fork() }
                .map_err(|e| CranedError::SpawnFail(format!("fork() failed: {e}")))?
            {
                ForkResult::Parent { child } => {
                    drop(io_child);
                    (child, Some(io_parent))
                }
                ForkResult::Child => {
                    drop(ctrl_parent);
                    drop(io_parent);
                    exec::run_child(ctrl_child, child_setup_base(ChildStdio::Socket(io_child)));
                }
            }
        } else {
            match unsafe { nix::unistd::fork() }
                .map_err(|e| CranedError::SpawnFail(format!("fork() failed: {e}")))?
            {
                ForkResult::Parent { child } => (child, None),
                ForkResult::Child => {
                    drop(ctrl_parent);
                    exec::run_child(ctrl_child, child_setup_base(stdio));
                }
            }
        };

        // Parent from here on.
        drop(ctrl_child);
        let pid = child_pid.as_raw();
        tracing::debug!(job_id, pid, "Subprocess was created");

        // Move the child into the job cgroup before letting it exec.
        let migrated = migrate_into_cgroup(&self.config, pid);

        let handshake = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut ctrl = File::from(ctrl_parent);
            if !migrated {
                // Ask the child to quit; it aborts before exec.
                let _ = exec::write_delimited(&mut ctrl, &CanStartMessage { ok: false });
                return Err(CranedError::Cgroup(
                    "terminating the subprocess due to cgroup migration failure".to_string(),
                ));
            }
            exec::write_delimited(&mut ctrl, &CanStartMessage { ok: true })
                .map_err(|e| CranedError::Protocol(format!("cannot send ok to subprocess: {e}")))?;
            let ready: ChildProcessReady = exec::read_delimited(&mut ctrl)
                .map_err(|e| CranedError::Protocol(format!("subprocess endpoint failed: {e}")))?;
            if !ready.ok {
                return Err(CranedError::Protocol(
                    "subprocess reported failed setup".to_string(),
                ));
            }
            Ok(())
        })
        .await
        .unwrap_or_else(|e| Err(CranedError::System(format!("join error: {e}"))));

        match handshake {
            Ok(()) => {}
            Err(CranedError::Cgroup(e)) => {
                // The child aborts on its own; it is reaped normally and
                // exactly one status change is produced.
                tracing::error!(job_id, pid, error = %e, "Cgroup migration failed");
            }
            Err(e) => {
                // Handshake broke: the child cannot be asked to quit, kill
                // the process group.
                tracing::error!(job_id, pid, error = %e, "Control handshake failed. Killing subprocess");
                let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
            }
        }

        // Interactive tasks get their stdio endpoint registered with the
        // relay before the program starts producing output in earnest.
        if let Some(io_fd) = io_fd {
            let (done_tx, mut done_rx) = mpsc::channel(1);
            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                if done_rx.recv().await.is_some() {
                    let _ = event_tx.send(TaskEvent::OutputDone).await;
                }
            });

            let client = CforedClient::new(
                task.cfored_name.clone(),
                self.config.craned_id.clone(),
                job_id,
                task.step_id,
                io_fd,
                launch_pty,
                self.cfored_stop.clone(),
                done_tx,
            );
            tokio::spawn(async move {
                if let Err(e) = client.run().await {
                    tracing::error!(error = %e, "Relay client failed");
                }
            });
        }

        let time_limit_seconds = task.time_limit_seconds;
        self.task = Some(RunningTask {
            pid,
            spec: task,
            start_time: Utc::now(),
            proc_stopped: false,
            // Batch output goes to files; nothing to drain.
            output_done: !is_crun,
            wait_result: None,
        });
        self.arm_timer(time_limit_seconds, Utc::now());

        Ok(pid)
    }

    async fn change_time_limit(&mut self, seconds: i64) -> bool {
        let Some(task) = self.task.as_ref() else {
            return false;
        };
        let start_time = task.start_time;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        let deadline = start_time + chrono::Duration::seconds(seconds.max(0));
        if Utc::now() >= deadline {
            tracing::debug!("New time limit already exceeded. Terminating task");
            self.kill_task(TaskStatus::ExceedTimeLimit);
        } else {
            self.arm_timer(seconds, start_time);
        }
        true
    }

    fn arm_timer(&mut self, limit_seconds: i64, start_time: DateTime<Utc>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let deadline = start_time + chrono::Duration::seconds(limit_seconds.max(0));
        let remaining = (deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let event_tx = self.event_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let _ = event_tx.send(TaskEvent::TimerFired).await;
        }));
    }

    /// SIGTERM the task's process group, then SIGKILL after the grace
    /// period. Repeated calls cause at most one TERM/KILL pair.
    fn kill_task(&mut self, reason: TaskStatus) {
        let Some(task) = self.task.as_ref() else {
            return;
        };
        if task.proc_stopped {
            return;
        }
        if self.killed_by.is_none() {
            self.killed_by = Some(reason);
        }
        if self.kill_escalation.is_some() {
            return;
        }

        let pgid = Pid::from_raw(-task.pid);
        tracing::debug!(pid = task.pid, reason = ?reason, "Sending SIGTERM to task process group");
        let _ = kill(pgid, Signal::SIGTERM);

        self.kill_escalation = Some(tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            let _ = kill(pgid, Signal::SIGKILL);
        }));
    }

    /// Non-blocking reap loop over SIGCHLD deliveries.
    async fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.record_exit(pid.as_raw(), TaskStatus::Completed, code as u32);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.record_exit(
                        pid.as_raw(),
                        TaskStatus::Failed,
                        exit_code::from_wait_signal(sig as i32),
                    );
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "waitpid() error");
                    break;
                }
            }
        }
        self.maybe_report().await;
    }

    fn record_exit(&mut self, pid: i32, status: TaskStatus, exit_code: u32) {
        let Some(task) = self.task.as_mut() else {
            return;
        };
        if task.pid != pid {
            return;
        }
        tracing::info!(pid, status = ?status, exit_code, "Task process ended");
        task.proc_stopped = true;
        task.wait_result = Some((status, exit_code));
    }

    /// Report the terminal status once the process has exited AND its
    /// output is fully drained.
    async fn maybe_report(&mut self) {
        let Some(task) = self.task.as_ref() else {
            return;
        };
        if !task.proc_stopped || !task.output_done || self.status_reported {
            return;
        }

        let (wait_status, exit_code) = task
            .wait_result
            .unwrap_or((TaskStatus::Failed, exit_code::SPAWN_PROCESS_FAIL));
        // A kill initiated here carries its reason upstream.
        let status = self.killed_by.unwrap_or(wait_status);
        let job_id = task.spec.job_id;

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(escalation) = self.kill_escalation.take() {
            escalation.abort();
        }

        self.status_reported = true;
        self.cfored_stop.cancel();

        if self.orphaned {
            tracing::info!(job_id, "Task is orphaned. Suppressing status change report");
        } else if let Err(e) = self.report_status(job_id, status, exit_code).await {
            tracing::error!(job_id, error = %e, "Failed to report status change to the agent");
        }

        if self.terminate_requested {
            self.exit.cancel();
        }
    }

    async fn report_status(
        &self,
        job_id: u32,
        status: TaskStatus,
        exit_code: u32,
    ) -> Result<()> {
        let channel = connect_uds(self.config.craned_unix_sock_path.clone()).await?;
        let mut client = CranedClient::new(channel);
        client
            .task_status_change(proto::TaskStatusChangeRequest {
                craned_id: self.config.craned_id.clone(),
                job_id,
                new_status: status as i32,
                exit_code,
                reason: None,
            })
            .await?;
        tracing::debug!(job_id, status = ?status, exit_code, "Status change reported");
        Ok(())
    }
}

/// Attach a pid to every cgroup.procs file of the job's cgroup, retrying
/// transient interruptions.
fn migrate_into_cgroup(config: &SupervisorConfig, pid: i32) -> bool {
    for procs_path in &config.cgroup_procs_paths {
        if let Err(e) = crate::cgroup::write_cgroup_file(procs_path, &pid.to_string()) {
            tracing::error!(
                pid,
                path = %procs_path.display(),
                error = %e,
                "Cannot attach pid to cgroup"
            );
            return false;
        }
    }
    true
}
