//! Relay client for interactive stdio.
//!
//! One long-lived bidirectional stream per interactive job, registered with
//! the front-end relay by `(craned_id, job_id, step_id)`. Task output is
//! queued and written upstream with at most one write in flight; inbound
//! `TASK_INPUT` frames are written to the child's stdin fd. The connection
//! walks an explicit state machine:
//!
//! ```text
//! Registering -> WaitRegisterAck -> Forwarding -> Unregistering -> End
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_CFORED_PORT;
use crate::error::{CranedError, Result};
use crate::proto::crane_fored_client::CraneForedClient;
use crate::proto::stream_task_io_reply::ReplyType;
use crate::proto::stream_task_io_request::{
    Payload, RegisterRequest, RequestType, TaskOutputRequest, UnregisterRequest,
};
use crate::proto::StreamTaskIoRequest;

const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Registering,
    WaitRegisterAck,
    Forwarding,
    Unregistering,
    End,
}

pub struct CforedClient {
    cfored_name: String,
    craned_id: String,
    job_id: u32,
    step_id: u32,
    /// The task's stdio endpoint: the pty master or the io socket. Reads
    /// drain output; writes feed stdin.
    io_fd: Arc<OwnedFd>,
    pty: bool,
    /// Set when the stream should unregister: the task has ended and its
    /// terminal status was reported.
    stop: CancellationToken,
    /// Notified once when the output side reaches EOF.
    output_done_tx: mpsc::Sender<()>,
    input_stopped: Arc<AtomicBool>,
}

impl CforedClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfored_name: String,
        craned_id: String,
        job_id: u32,
        step_id: u32,
        io_fd: OwnedFd,
        pty: bool,
        stop: CancellationToken,
        output_done_tx: mpsc::Sender<()>,
    ) -> Self {
        CforedClient {
            cfored_name,
            craned_id,
            job_id,
            step_id,
            io_fd: Arc::new(io_fd),
            pty,
            stop,
            output_done_tx,
            input_stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Drive the stream until unregistered or broken.
    pub async fn run(self) -> Result<()> {
        let target = format!("http://{}:{}", self.cfored_name, DEFAULT_CFORED_PORT);
        let mut client = CraneForedClient::connect(target).await?;

        let (request_tx, request_rx) = mpsc::channel::<StreamTaskIoRequest>(64);
        let response = client
            .task_io_stream(ReceiverStream::new(request_rx))
            .await?;
        let mut inbound = response.into_inner();

        tracing::debug!(cfored = %self.cfored_name, "TaskIoStream established");

        // Output pump: blocking reads from the task fd into the queue.
        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
        let pump_fd = self.io_fd.clone();
        let pump_pty = self.pty;
        let pump_done_tx = self.output_done_tx.clone();
        let pump_job_id = self.job_id;
        tokio::task::spawn_blocking(move || {
            output_pump(pump_fd, pump_pty, pump_job_id, output_tx);
            let _ = pump_done_tx.blocking_send(());
        });

        let mut state = State::Registering;
        let mut output_drained = false;

        while state != State::End {
            match state {
                State::Registering => {
                    tracing::trace!(cfored = %self.cfored_name, "Registering new stream");
                    request_tx
                        .send(self.register_request())
                        .await
                        .map_err(|_| CranedError::Protocol("stream closed".to_string()))?;
                    state = State::WaitRegisterAck;
                }

                State::WaitRegisterAck => match inbound.message().await? {
                    Some(_ack) => {
                        tracing::trace!("Register ack received. Start forwarding");
                        state = State::Forwarding;
                    }
                    None => {
                        tracing::error!("Relay closed the stream before acking registration");
                        state = State::End;
                    }
                },

                State::Forwarding => {
                    tokio::select! {
                        chunk = output_rx.recv(), if !output_drained => match chunk {
                            Some(data) => {
                                request_tx
                                    .send(self.output_request(data))
                                    .await
                                    .map_err(|_| CranedError::Protocol("stream closed".to_string()))?;
                            }
                            None => {
                                output_drained = true;
                            }
                        },
                        reply = inbound.message() => match reply? {
                            Some(reply) => self.dispatch_input(reply),
                            None => {
                                tracing::error!("Relay connection failed");
                                state = State::End;
                            }
                        },
                        _ = self.stop.cancelled() => {
                            state = State::Unregistering;
                        }
                    }
                }

                State::Unregistering => {
                    // Drain the output queue before the final write.
                    while let Ok(data) = output_rx.try_recv() {
                        request_tx
                            .send(self.output_request(data))
                            .await
                            .map_err(|_| CranedError::Protocol("stream closed".to_string()))?;
                    }

                    tracing::trace!(cfored = %self.cfored_name, "Unregistering from relay");
                    request_tx
                        .send(self.unregister_request())
                        .await
                        .map_err(|_| CranedError::Protocol("stream closed".to_string()))?;

                    loop {
                        match inbound.message().await {
                            Ok(Some(reply)) if reply.r#type == ReplyType::SupervisorUnregisterReply as i32 => {
                                tracing::trace!("Unregister reply received");
                                break;
                            }
                            Ok(Some(reply)) => {
                                tracing::trace!(got = reply.r#type, "Expected unregister reply. Ignoring frame");
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                    state = State::End;
                    break;
                }

                State::End => {}
            }
        }

        tracing::debug!(cfored = %self.cfored_name, "Relay stream ended");
        Ok(())
    }

    fn register_request(&self) -> StreamTaskIoRequest {
        StreamTaskIoRequest {
            r#type: RequestType::SupervisorRegister as i32,
            payload: Some(Payload::PayloadRegisterReq(RegisterRequest {
                craned_id: self.craned_id.clone(),
                job_id: self.job_id,
                step_id: self.step_id,
            })),
        }
    }

    fn output_request(&self, data: Vec<u8>) -> StreamTaskIoRequest {
        StreamTaskIoRequest {
            r#type: RequestType::TaskOutput as i32,
            payload: Some(Payload::PayloadTaskOutputReq(TaskOutputRequest {
                msg: data,
            })),
        }
    }

    fn unregister_request(&self) -> StreamTaskIoRequest {
        StreamTaskIoRequest {
            r#type: RequestType::SupervisorUnregister as i32,
            payload: Some(Payload::PayloadUnregisterReq(UnregisterRequest {
                craned_id: self.craned_id.clone(),
                job_id: self.job_id,
                step_id: self.step_id,
            })),
        }
    }

    fn dispatch_input(&self, reply: crate::proto::StreamTaskIoReply) {
        if reply.r#type != ReplyType::SupervisorTaskInput as i32 {
            tracing::error!(got = reply.r#type, "Expected TASK_INPUT frame");
            return;
        }
        let Some(crate::proto::stream_task_io_reply::Payload::PayloadTaskInputReq(input)) =
            reply.payload
        else {
            return;
        };

        if self.input_stopped.load(Ordering::Acquire) {
            return;
        }

        let fd = self.io_fd.clone();
        let input_stopped = self.input_stopped.clone();
        tokio::task::spawn_blocking(move || {
            let dup = match fd.try_clone() {
                Ok(dup) => dup,
                Err(e) => {
                    tracing::error!(error = %e, "Cannot dup task input fd");
                    return;
                }
            };
            let mut writer = File::from(dup);
            if writer.write_all(&input.msg).and_then(|_| writer.flush()).is_err() {
                tracing::error!("Pipe to the task's stdin was broken");
                input_stopped.store(true, Ordering::Release);
            }
        });
    }
}

/// Blocking read loop draining the task's output fd in 4096-byte chunks.
///
/// EOF semantics differ between the two fd kinds:
/// - socket: `read() == 0` means the output is done;
/// - pty master: `read() == 0` is transient, EIO means the process has
///   exited, EAGAIN means the read raced exec and is ignored.
fn output_pump(fd: Arc<OwnedFd>, pty: bool, job_id: u32, output_tx: mpsc::Sender<Vec<u8>>) {
    let dup = match fd.try_clone() {
        Ok(dup) => dup,
        Err(e) => {
            tracing::error!(error = %e, "Cannot dup task output fd");
            return;
        }
    };
    let mut reader = File::from(dup);
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                if !pty {
                    tracing::trace!(job_id, "Task finished its output");
                    break;
                }
                tracing::trace!(job_id, "Read EOF from pty");
            }
            Ok(n) => {
                if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EIO) if pty => {
                    // The pty slave side is gone: the process has exited.
                    tracing::trace!(job_id, "Pty closed. Task finished its output");
                    break;
                }
                Some(libc::EAGAIN) => continue,
                Some(libc::EINTR) => continue,
                _ => {
                    tracing::error!(job_id, error = %e, "Error reading task output");
                    break;
                }
            },
        }
    }
}
