//! Control service of one supervisor, listening on its per-job unix
//! socket. The agent holds the single client connection.

use std::path::Path;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::error::Result;
use crate::proto;
use crate::proto::supervisor_server::{Supervisor, SupervisorServer};
use crate::supervisor::task::TaskRunner;

pub struct SupervisorServiceImpl {
    job_id: u32,
    runner: TaskRunner,
}

#[tonic::async_trait]
impl Supervisor for SupervisorServiceImpl {
    async fn execute_task(
        &self,
        request: Request<proto::TaskExecutionRequest>,
    ) -> std::result::Result<Response<proto::TaskExecutionReply>, Status> {
        let Some(task) = request.into_inner().task else {
            return Err(Status::invalid_argument("missing task spec"));
        };
        match self.runner.execute_task(task).await {
            Ok(pid) => Ok(Response::new(proto::TaskExecutionReply { ok: true, pid })),
            Err(e) => {
                tracing::error!(error = %e, "ExecuteTask failed");
                Ok(Response::new(proto::TaskExecutionReply { ok: false, pid: 0 }))
            }
        }
    }

    async fn check_task_status(
        &self,
        _request: Request<proto::CheckTaskStatusRequest>,
    ) -> std::result::Result<Response<proto::CheckTaskStatusReply>, Status> {
        match self.runner.check_status().await {
            Some(pid) => Ok(Response::new(proto::CheckTaskStatusReply {
                ok: true,
                job_id: self.job_id,
                pid,
            })),
            None => Ok(Response::new(proto::CheckTaskStatusReply {
                ok: true,
                job_id: self.job_id,
                pid: 0,
            })),
        }
    }

    async fn change_task_time_limit(
        &self,
        request: Request<proto::SupervisorChangeTaskTimeLimitRequest>,
    ) -> std::result::Result<Response<proto::SupervisorChangeTaskTimeLimitReply>, Status> {
        let seconds = request.into_inner().time_limit_seconds;
        let ok = self.runner.change_time_limit(seconds).await;
        Ok(Response::new(proto::SupervisorChangeTaskTimeLimitReply {
            ok,
        }))
    }

    async fn terminate_task(
        &self,
        request: Request<proto::TerminateTaskRequest>,
    ) -> std::result::Result<Response<proto::TerminateTaskReply>, Status> {
        let mark_orphaned = request.into_inner().mark_orphaned;
        self.runner.terminate_task(mark_orphaned).await;
        Ok(Response::new(proto::TerminateTaskReply { ok: true }))
    }

    async fn terminate(
        &self,
        _request: Request<proto::TerminateRequest>,
    ) -> std::result::Result<Response<proto::TerminateReply>, Status> {
        self.runner.terminate_supervisor().await;
        Ok(Response::new(proto::TerminateReply { ok: true }))
    }
}

/// Bind `task_<job_id>.sock` and serve until shutdown.
pub async fn serve(
    sock_path: &Path,
    job_id: u32,
    runner: TaskRunner,
    shutdown: CancellationToken,
) -> Result<()> {
    let _ = std::fs::remove_file(sock_path);
    let listener = UnixListener::bind(sock_path)?;
    let incoming = UnixListenerStream::new(listener);

    tracing::info!(sock = %sock_path.display(), "Supervisor listening");
    let service = SupervisorServiceImpl { job_id, runner };
    Server::builder()
        .add_service(SupervisorServer::new(service))
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
        .await?;
    Ok(())
}
