use std::sync::Arc;

use tokio::signal;

use crate::server::AppState;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Cancel in-flight runs and log the final backend picture.
///
/// Cancelled runs finish as `failed`; their unfinished claims are still
/// reported as `unverified`.
pub async fn graceful_shutdown(state: &Arc<AppState>) {
    tracing::info!("Starting graceful shutdown...");

    state.shutdown.cancel();

    for snapshot in state.registry.snapshots() {
        tracing::info!(
            backend = %snapshot.backend,
            circuit = %snapshot.circuit.state,
            tokens_admitted = snapshot.tokens_admitted,
            tokens_rejected = snapshot.tokens_rejected,
            "Backend state at shutdown"
        );
    }

    let metrics = state.metrics.snapshot();
    tracing::info!(
        stages_started = metrics.stages_started,
        claims_supported = metrics.claims_supported,
        claims_insufficient = metrics.claims_insufficient,
        claims_unverified = metrics.claims_unverified,
        "Graceful shutdown complete"
    );
}
