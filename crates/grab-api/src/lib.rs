pub mod app;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use grab_core::Orchestrator;
use tokio::task::JoinHandle;

use crate::app::build_app;
use crate::state::AppState;

const SPOOL_PRUNE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_state(addr, state, shutdown_signal()).await
}

pub async fn serve_with_state(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let pruner = spawn_spool_pruner(Arc::clone(&state.orchestrator), SPOOL_PRUNE_INTERVAL);
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    pruner.abort();
    served?;
    Ok(())
}

/// Periodically deletes spooled artifacts whose grants have expired.
pub fn spawn_spool_pruner(orchestrator: Arc<Orchestrator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = orchestrator.prune_spool().await;
            if removed > 0 {
                tracing::info!(removed, "Pruned expired artifacts");
            }
        }
    })
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
