use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Watch for SIGINT/SIGTERM and cancel the returned token once.
///
/// Cancellation only stops intake: the job manager rejects new
/// allocations, keeps draining the live set, and the agent exits when it
/// is empty. Supervisors and their user processes are never signalled
/// from here, so they survive an agent restart.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();

    for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
        let token = token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(
                        signal = kind.as_raw_value(),
                        error = %e,
                        "Cannot install shutdown signal handler"
                    );
                    return;
                }
            };
            if stream.recv().await.is_some() {
                tracing::info!(
                    signal = kind.as_raw_value(),
                    "Termination signal received. Rejecting new jobs and draining the live set"
                );
                token.cancel();
            }
        });
    }

    token
}
