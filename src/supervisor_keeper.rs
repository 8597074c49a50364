//! Registry of live supervisor children.
//!
//! Each running job has one supervisor process listening on
//! `<base>/task_<job_id>.sock`. The keeper spawns supervisors, dials their
//! sockets, forwards per-job control RPCs, and rediscovers survivors after
//! an agent restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use regex::Regex;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::config::{CranedConfig, SupervisorConfig};
use crate::error::{CranedError, Result};
use crate::proto;
use crate::proto::supervisor_client::SupervisorClient;
use crate::JobId;

/// How long a supervisor gets to answer a dial or a status probe.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

fn sock_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^task_(\d+)\.sock$").unwrap())
}

/// Dial a tonic channel over a unix-domain socket. The URI is ignored by
/// the connector; only the socket path matters.
pub async fn connect_uds(sock_path: PathBuf) -> Result<Channel> {
    let channel = Endpoint::try_from("http://supervisor.local")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let sock_path = sock_path.clone();
            async move {
                Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(sock_path).await?))
            }
        }))
        .await?;
    Ok(channel)
}

struct SupervisorRecord {
    pid: i32,
    client: SupervisorClient<Channel>,
}

#[derive(Default)]
pub struct SupervisorKeeper {
    supervisors: Mutex<HashMap<JobId, SupervisorRecord>>,
}

impl SupervisorKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the socket directory and reconnect to every supervisor that
    /// survived an agent restart. Sockets that fail to answer within the
    /// deadline are closed and unlinked. Returns the surviving
    /// `{job_id -> task pid}` map.
    pub async fn recover(&self, sock_dir: &Path) -> HashMap<JobId, i32> {
        let mut survivors = HashMap::new();

        let entries = match std::fs::read_dir(sock_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %sock_dir.display(), error = %e, "Cannot scan supervisor socket directory");
                return survivors;
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(job_id) = sock_name_regex()
                .captures(name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<JobId>().ok())
            else {
                continue;
            };

            let sock_path = entry.path();
            match self.probe_supervisor(job_id, sock_path.clone()).await {
                Ok(pid) => {
                    tracing::info!(job_id, pid, "Reconnected to surviving supervisor");
                    survivors.insert(job_id, pid);
                }
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Supervisor socket is dead. Unlinking it");
                    let _ = std::fs::remove_file(&sock_path);
                }
            }
        }

        survivors
    }

    async fn probe_supervisor(&self, job_id: JobId, sock_path: PathBuf) -> Result<i32> {
        let channel = tokio::time::timeout(CONNECT_TIMEOUT, connect_uds(sock_path))
            .await
            .map_err(|_| CranedError::SupervisorLost(job_id))??;
        let mut client = SupervisorClient::new(channel);

        let reply = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client.check_task_status(proto::CheckTaskStatusRequest {}),
        )
        .await
        .map_err(|_| CranedError::SupervisorLost(job_id))??
        .into_inner();

        if !reply.ok || reply.job_id != job_id {
            return Err(CranedError::Protocol(format!(
                "supervisor on task_{job_id}.sock answered for job {}",
                reply.job_id
            )));
        }

        self.supervisors.lock().await.insert(
            job_id,
            SupervisorRecord {
                pid: reply.pid,
                client,
            },
        );
        Ok(reply.pid)
    }

    /// Fork the supervisor executable for a job in its own session and
    /// establish the control channel over its socket.
    pub async fn spawn_supervisor(
        &self,
        config: &CranedConfig,
        sv_config: &SupervisorConfig,
    ) -> Result<()> {
        let job_id = sv_config.job_id;
        let sock_path = config.supervisor_sock_path(job_id);
        // A stale socket file would make bind() fail in the child.
        let _ = std::fs::remove_file(&sock_path);

        let exe = supervisor_executable()?;
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.arg("--job-id")
            .arg(job_id.to_string())
            .arg("--craned-id")
            .arg(&sv_config.craned_id)
            .arg("--base-dir")
            .arg(&sv_config.crane_base_dir)
            .arg("--script-dir")
            .arg(&sv_config.craned_script_dir)
            .arg("--craned-sock")
            .arg(&sv_config.craned_unix_sock_path)
            .arg("--log-file")
            .arg(&sv_config.log_file)
            .arg("--debug-level")
            .arg(&sv_config.debug_level)
            .arg("--memory-limit-bytes")
            .arg(sv_config.memory_limit_bytes.to_string());
        for procs_path in &sv_config.cgroup_procs_paths {
            cmd.arg("--cgroup-procs").arg(procs_path);
        }
        for (name, value) in &sv_config.device_env {
            cmd.arg("--device-env").arg(format!("{name}={value}"));
        }

        // The supervisor must outlive the agent, in its own session.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| CranedError::SpawnFail(format!("cannot spawn supervisor: {e}")))?;
        let supervisor_pid = child.id().unwrap_or_default() as i32;
        tracing::debug!(job_id, pid = supervisor_pid, "Supervisor process spawned");

        // The child binds and listens; dial back within the deadline.
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        let channel = loop {
            if sock_path.exists() {
                if let Ok(channel) = connect_uds(sock_path.clone()).await {
                    break channel;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CranedError::SpawnFail(format!(
                    "supervisor for job {job_id} did not open {} in time",
                    sock_path.display()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        self.supervisors.lock().await.insert(
            job_id,
            SupervisorRecord {
                pid: supervisor_pid,
                client: SupervisorClient::new(channel),
            },
        );
        Ok(())
    }

    pub async fn contains(&self, job_id: JobId) -> bool {
        self.supervisors.lock().await.contains_key(&job_id)
    }

    async fn client(&self, job_id: JobId) -> Result<SupervisorClient<Channel>> {
        self.supervisors
            .lock()
            .await
            .get(&job_id)
            .map(|record| record.client.clone())
            .ok_or(CranedError::JobNotFound(job_id))
    }

    /// Drop the record and unlink the socket file once the supervisor's
    /// terminal status has been propagated.
    pub async fn remove(&self, job_id: JobId, sock_dir: &Path) {
        self.supervisors.lock().await.remove(&job_id);
        let _ = std::fs::remove_file(sock_dir.join(format!("task_{job_id}.sock")));
    }

    pub async fn execute_task(&self, job_id: JobId, task: proto::TaskSpec) -> Result<i32> {
        let mut client = self.client(job_id).await?;
        let reply = client
            .execute_task(proto::TaskExecutionRequest { task: Some(task) })
            .await
            .map_err(|_| CranedError::SupervisorLost(job_id))?
            .into_inner();
        if !reply.ok {
            return Err(CranedError::SpawnFail(format!(
                "supervisor failed to start the task of job {job_id}"
            )));
        }
        Ok(reply.pid)
    }

    pub async fn check_task_status(&self, job_id: JobId) -> Result<(JobId, i32)> {
        let mut client = self.client(job_id).await?;
        let reply = client
            .check_task_status(proto::CheckTaskStatusRequest {})
            .await
            .map_err(|_| CranedError::SupervisorLost(job_id))?
            .into_inner();
        if !reply.ok {
            return Err(CranedError::JobNotFound(job_id));
        }
        Ok((reply.job_id, reply.pid))
    }

    pub async fn change_task_time_limit(&self, job_id: JobId, seconds: i64) -> Result<()> {
        let mut client = self.client(job_id).await?;
        let reply = client
            .change_task_time_limit(proto::SupervisorChangeTaskTimeLimitRequest {
                time_limit_seconds: seconds,
            })
            .await
            .map_err(|_| CranedError::SupervisorLost(job_id))?
            .into_inner();
        if !reply.ok {
            return Err(CranedError::Protocol(format!(
                "supervisor rejected the time limit change for job {job_id}"
            )));
        }
        Ok(())
    }

    pub async fn terminate_task(&self, job_id: JobId, mark_orphaned: bool) -> Result<()> {
        let mut client = self.client(job_id).await?;
        client
            .terminate_task(proto::TerminateTaskRequest { mark_orphaned })
            .await
            .map_err(|_| CranedError::SupervisorLost(job_id))?;
        Ok(())
    }

    /// Ask the supervisor to exit after its task has ended.
    pub async fn terminate_supervisor(&self, job_id: JobId) -> Result<()> {
        let mut client = self.client(job_id).await?;
        client
            .terminate(proto::TerminateRequest {})
            .await
            .map_err(|_| CranedError::SupervisorLost(job_id))?;
        Ok(())
    }
}

fn supervisor_executable() -> Result<PathBuf> {
    let current = std::env::current_exe()
        .map_err(|e| CranedError::SpawnFail(format!("cannot locate own executable: {e}")))?;
    Ok(current
        .parent()
        .map(|dir| dir.join("csupervisor"))
        .unwrap_or_else(|| PathBuf::from("csupervisor")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_names() {
        let re = sock_name_regex();
        assert!(re.is_match("task_7.sock"));
        assert_eq!(
            re.captures("task_123.sock")
                .and_then(|c| c.get(1))
                .map(|m| m.as_str()),
            Some("123")
        );
        assert!(!re.is_match("task_.sock"));
        assert!(!re.is_match("task_7.sock.bak"));
        assert!(!re.is_match("craned.sock"));
    }
}
