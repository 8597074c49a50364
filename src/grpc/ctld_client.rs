//! Client side of the agent-to-controller link.
//!
//! Terminal status events are buffered and replayed: a controller outage
//! never loses a `TaskStatusChange`, and running tasks continue while the
//! link is down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tonic::transport::Channel;

use crate::error::Result;
use crate::proto::crane_ctld_client::CraneCtldClient;
use crate::proto::{self, TaskStatus};
use crate::JobId;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

pub struct CtldClient {
    craned_id: String,
    target: String,
    connected: AtomicBool,
    /// Status changes not yet acknowledged by the controller, oldest first.
    pending: Mutex<VecDeque<proto::TaskStatusChangeRequest>>,
    wakeup: Notify,
}

impl CtldClient {
    pub fn new(craned_id: String, ctld_addr: &str) -> Arc<Self> {
        Arc::new(CtldClient {
            craned_id,
            target: format!("http://{ctld_addr}"),
            connected: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<CraneCtldClient<Channel>> {
        let client = CraneCtldClient::connect(self.target.clone()).await?;
        Ok(client)
    }

    /// Report readiness after startup recovery, carrying the job ids the
    /// controller should cancel because no supervisor answers for them.
    /// Retries until the controller accepts.
    pub async fn craned_ready(&self, nonexistent_jobs: Vec<JobId>) {
        loop {
            match self.try_craned_ready(&nonexistent_jobs).await {
                Ok(()) => {
                    self.connected.store(true, Ordering::Release);
                    tracing::info!("Registered with the controller");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Controller not reachable. Retrying");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    async fn try_craned_ready(&self, nonexistent_jobs: &[JobId]) -> Result<()> {
        let mut client = self.connect().await?;
        client
            .craned_ready(proto::CranedReadyRequest {
                craned_id: self.craned_id.clone(),
                nonexistent_jobs: nonexistent_jobs.to_vec(),
            })
            .await?;
        Ok(())
    }

    /// Queue one terminal status for upstream delivery. At most one status
    /// is ever delivered per job unless the controller fails to
    /// acknowledge.
    pub async fn task_status_change(
        &self,
        job_id: JobId,
        status: TaskStatus,
        exit_code: u32,
        reason: Option<String>,
    ) {
        let request = proto::TaskStatusChangeRequest {
            craned_id: self.craned_id.clone(),
            job_id,
            new_status: status as i32,
            exit_code,
            reason,
        };
        self.pending.lock().await.push_back(request);
        self.wakeup.notify_one();
    }

    /// Drain the pending queue toward the controller, reconnecting with
    /// backoff on failure. Spawned once at startup; runs for the agent's
    /// lifetime.
    pub async fn run(self: Arc<Self>) {
        let mut client: Option<CraneCtldClient<Channel>> = None;

        loop {
            let request = {
                let mut pending = self.pending.lock().await;
                pending.pop_front()
            };

            let Some(request) = request else {
                self.wakeup.notified().await;
                continue;
            };

            loop {
                if client.is_none() {
                    match self.connect().await {
                        Ok(c) => {
                            self.connected.store(true, Ordering::Release);
                            client = Some(c);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Lost controller connection. Reconnecting");
                            self.connected.store(false, Ordering::Release);
                            tokio::time::sleep(RECONNECT_BACKOFF).await;
                            continue;
                        }
                    }
                }

                match client
                    .as_mut()
                    .unwrap()
                    .task_status_change(request.clone())
                    .await
                {
                    Ok(_) => {
                        tracing::debug!(
                            job_id = request.job_id,
                            status = request.new_status,
                            "Status change delivered to controller"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = request.job_id,
                            error = %e,
                            "Status change delivery failed. Replaying after reconnect"
                        );
                        self.connected.store(false, Ordering::Release);
                        client = None;
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        }
    }
}
