//! Controller-facing gRPC surface of the agent.
//!
//! The same service is exposed on the TCP listener (controller) and on the
//! agent's unix socket (supervisors reporting status changes, PAM modules
//! resolving ssh sessions). Controller-sourced requests are rejected until
//! startup recovery has finished and the controller link is up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::config::CranedConfig;
use crate::error::Result;
use crate::grpc::ctld_client::CtldClient;
use crate::grpc::port_lookup;
use crate::job::{JobManager, JobSpec};
use crate::proto;
use crate::proto::craned_server::{Craned, CranedServer as CranedGrpcServer};

#[derive(Clone)]
pub struct CranedServiceImpl {
    job_manager: JobManager,
    ctld: Arc<CtldClient>,
    recovered: Arc<AtomicBool>,
    configure_tx: Arc<Mutex<Option<oneshot::Sender<proto::ConfigureCranedRequest>>>>,
}

impl CranedServiceImpl {
    fn check_ready(&self) -> std::result::Result<(), Status> {
        if !self.recovered.load(Ordering::Acquire) {
            return Err(Status::unavailable("agent is still recovering"));
        }
        if !self.ctld.is_connected() {
            return Err(Status::unavailable("controller link is down"));
        }
        Ok(())
    }

    fn check_recovered(&self) -> std::result::Result<(), Status> {
        if !self.recovered.load(Ordering::Acquire) {
            return Err(Status::unavailable("agent is still recovering"));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Craned for CranedServiceImpl {
    async fn configure(
        &self,
        request: Request<proto::ConfigureCranedRequest>,
    ) -> std::result::Result<Response<proto::ConfigureCranedReply>, Status> {
        let req = request.into_inner();
        tracing::info!(
            jobs = req.job_map.len(),
            "Received configuration from the controller"
        );

        let tx = self.configure_tx.lock().unwrap().take();
        match tx {
            Some(tx) => {
                let _ = tx.send(req);
                Ok(Response::new(proto::ConfigureCranedReply { ok: true }))
            }
            None => Err(Status::failed_precondition("agent is already configured")),
        }
    }

    async fn create_cgroup_for_tasks(
        &self,
        request: Request<proto::CreateCgroupForTasksRequest>,
    ) -> std::result::Result<Response<proto::CreateCgroupForTasksReply>, Status> {
        self.check_ready()?;
        let specs: Vec<JobSpec> = request
            .into_inner()
            .job_specs
            .into_iter()
            .map(JobSpec::from)
            .collect();

        let results = self.job_manager.allocate_jobs(specs).await;
        let failed_job_ids = results
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(job_id, _)| job_id)
            .collect();
        Ok(Response::new(proto::CreateCgroupForTasksReply {
            failed_job_ids,
        }))
    }

    async fn release_cgroup_for_tasks(
        &self,
        request: Request<proto::ReleaseCgroupForTasksRequest>,
    ) -> std::result::Result<Response<proto::ReleaseCgroupForTasksReply>, Status> {
        self.check_ready()?;
        let job_ids = request.into_inner().job_ids;
        let results = self.job_manager.free_job_allocation(job_ids).await;
        let failed_job_ids = results
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(job_id, _)| job_id)
            .collect();
        Ok(Response::new(proto::ReleaseCgroupForTasksReply {
            failed_job_ids,
        }))
    }

    async fn execute_task(
        &self,
        request: Request<proto::ExecuteTasksRequest>,
    ) -> std::result::Result<Response<proto::ExecuteTasksReply>, Status> {
        self.check_ready()?;
        let mut failed_job_ids = Vec::new();
        for task in request.into_inner().tasks {
            let job_id = task.job_id;
            if let Err(e) = self.job_manager.execute_task(task).await {
                tracing::warn!(job_id, error = %e, "ExecuteTask rejected");
                failed_job_ids.push(job_id);
            }
        }
        Ok(Response::new(proto::ExecuteTasksReply { failed_job_ids }))
    }

    async fn terminate_tasks(
        &self,
        request: Request<proto::TerminateTasksRequest>,
    ) -> std::result::Result<Response<proto::TerminateTasksReply>, Status> {
        self.check_ready()?;
        for job_id in request.into_inner().job_ids {
            self.job_manager.terminate_task(job_id).await;
        }
        Ok(Response::new(proto::TerminateTasksReply { ok: true }))
    }

    async fn terminate_orphaned_task(
        &self,
        request: Request<proto::TerminateOrphanedTaskRequest>,
    ) -> std::result::Result<Response<proto::TerminateOrphanedTaskReply>, Status> {
        self.check_ready()?;
        let job_id = request.into_inner().job_id;
        self.job_manager.mark_orphaned_and_terminate(job_id).await;
        Ok(Response::new(proto::TerminateOrphanedTaskReply { ok: true }))
    }

    async fn change_task_time_limit(
        &self,
        request: Request<proto::ChangeTaskTimeLimitRequest>,
    ) -> std::result::Result<Response<proto::ChangeTaskTimeLimitReply>, Status> {
        self.check_ready()?;
        let req = request.into_inner();
        let ok = self
            .job_manager
            .change_task_time_limit(req.job_id, req.time_limit_seconds)
            .await;
        Ok(Response::new(proto::ChangeTaskTimeLimitReply { ok }))
    }

    async fn query_task_id_from_port(
        &self,
        request: Request<proto::QueryTaskIdFromPortRequest>,
    ) -> std::result::Result<Response<proto::QueryTaskIdFromPortReply>, Status> {
        self.check_recovered()?;
        let port = request.into_inner().port as u16;

        let job_id = tokio::task::spawn_blocking(move || {
            port_lookup::pid_of_local_port(port).and_then(port_lookup::job_id_of_pid)
        })
        .await
        .map_err(|_| Status::internal("lookup task failed"))?;

        Ok(Response::new(proto::QueryTaskIdFromPortReply {
            ok: job_id.is_some(),
            job_id: job_id.unwrap_or_default(),
        }))
    }

    async fn query_task_id_from_port_forward(
        &self,
        request: Request<proto::QueryTaskIdFromPortForwardRequest>,
    ) -> std::result::Result<Response<proto::QueryTaskIdFromPortForwardReply>, Status> {
        self.check_recovered()?;
        let port = request.into_inner().ssh_remote_port as u16;

        let job_id = tokio::task::spawn_blocking(move || {
            port_lookup::pid_of_local_port(port).and_then(port_lookup::job_id_of_pid)
        })
        .await
        .map_err(|_| Status::internal("lookup task failed"))?;

        Ok(Response::new(proto::QueryTaskIdFromPortForwardReply {
            ok: job_id.is_some(),
            job_id: job_id.unwrap_or_default(),
        }))
    }

    async fn query_task_env_variables(
        &self,
        request: Request<proto::QueryTaskEnvVariablesRequest>,
    ) -> std::result::Result<Response<proto::QueryTaskEnvVariablesReply>, Status> {
        self.check_recovered()?;
        let job_id = request.into_inner().job_id;
        let env = self.job_manager.query_task_env_map(job_id).await;
        Ok(Response::new(proto::QueryTaskEnvVariablesReply {
            ok: env.is_some(),
            env: env.unwrap_or_default(),
        }))
    }

    async fn query_task_env_variables_forward(
        &self,
        request: Request<proto::QueryTaskEnvVariablesForwardRequest>,
    ) -> std::result::Result<Response<proto::QueryTaskEnvVariablesForwardReply>, Status> {
        self.check_recovered()?;
        let job_id = request.into_inner().job_id;
        let env = self.job_manager.query_task_env_map(job_id).await;
        Ok(Response::new(proto::QueryTaskEnvVariablesForwardReply {
            ok: env.is_some(),
            env: env.unwrap_or_default(),
        }))
    }

    async fn migrate_ssh_proc_to_cgroup(
        &self,
        request: Request<proto::MigrateSshProcToCgroupRequest>,
    ) -> std::result::Result<Response<proto::MigrateSshProcToCgroupReply>, Status> {
        self.check_recovered()?;
        let req = request.into_inner();
        let ok = self
            .job_manager
            .migrate_proc_to_cgroup(req.pid, req.job_id)
            .await;
        Ok(Response::new(proto::MigrateSshProcToCgroupReply { ok }))
    }

    async fn task_status_change(
        &self,
        request: Request<proto::TaskStatusChangeRequest>,
    ) -> std::result::Result<Response<proto::TaskStatusChangeReply>, Status> {
        self.check_recovered()?;
        let req = request.into_inner();
        let status = proto::TaskStatus::try_from(req.new_status)
            .unwrap_or(proto::TaskStatus::Failed);
        self.job_manager
            .task_status_change(req.job_id, status, req.exit_code, req.reason)
            .await;
        Ok(Response::new(proto::TaskStatusChangeReply { ok: true }))
    }
}

pub struct CranedServer {
    service: CranedServiceImpl,
    listen_addr: SocketAddr,
    unix_sock_path: std::path::PathBuf,
}

impl CranedServer {
    pub fn new(
        config: &CranedConfig,
        job_manager: JobManager,
        ctld: Arc<CtldClient>,
        configure_tx: oneshot::Sender<proto::ConfigureCranedRequest>,
    ) -> Result<(Self, Arc<AtomicBool>)> {
        let listen_addr: SocketAddr = format!("{}:{}", config.listen_addr, config.listen_port)
            .parse()
            .map_err(|e| {
                crate::error::CranedError::Config(format!("listening address is invalid: {e}"))
            })?;

        let recovered = Arc::new(AtomicBool::new(false));
        let service = CranedServiceImpl {
            job_manager,
            ctld,
            recovered: recovered.clone(),
            configure_tx: Arc::new(Mutex::new(Some(configure_tx))),
        };

        Ok((
            CranedServer {
                service,
                listen_addr,
                unix_sock_path: config.craned_unix_sock_path.clone(),
            },
            recovered,
        ))
    }

    /// Serve on both listeners until shutdown. The unix socket serves
    /// supervisors and the PAM module; TCP serves the controller.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let _ = std::fs::remove_file(&self.unix_sock_path);
        let uds = UnixListener::bind(&self.unix_sock_path)?;
        let uds_stream = UnixListenerStream::new(uds);

        let uds_service = self.service.clone();
        let uds_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(CranedGrpcServer::new(uds_service))
                .serve_with_incoming_shutdown(uds_stream, uds_shutdown.cancelled())
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Unix socket server failed");
            }
        });

        tracing::info!(addr = %self.listen_addr, "Starting gRPC server");
        Server::builder()
            .add_service(CranedGrpcServer::new(self.service))
            .serve_with_shutdown(self.listen_addr, shutdown.cancelled())
            .await?;
        Ok(())
    }
}
