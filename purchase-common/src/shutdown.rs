//! Process shutdown signalling.
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancel the returned token on SIGINT or SIGTERM.
pub fn install_signal_handler() -> CancellationToken {
    cancel_on(shutdown_signal())
}

/// A token cancelled once `signal` resolves.
pub fn cancel_on<F>(signal: F) -> CancellationToken
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        signal.await;
        cancel.cancel();
    });

    token
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = interrupt() => {}
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        },
        Err(e) => {
            warn!("failed to listen for SIGTERM, only SIGINT shuts down gracefully: {}", e);
            interrupt().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    interrupt().await
}

/// Resolves on SIGINT. Never resolves if it cannot be listened for, leaving the default
/// disposition to terminate the process.
async fn interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received SIGINT, shutting down"),
        Err(e) => {
            error!("failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await
        }
    }
}

/// A token cancelled `grace` after `shutdown` is. Work that should be finished rather than
/// abandoned on shutdown watches this one instead.
pub fn drain_token(shutdown: &CancellationToken, grace: Duration) -> CancellationToken {
    let drain = CancellationToken::new();
    let shutdown = shutdown.clone();
    let cancel = drain.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tokio::select! {
                    _ = tokio::time::sleep(grace) => {
                        info!(grace_ms = grace.as_millis() as u64, "shutdown grace period elapsed");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            }
            _ = cancel.cancelled() => {}
        }
    });

    drain
}
