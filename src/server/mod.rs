/*!
HTTP transport.

- `GET /terminal?token=..&session_id=..`: WebSocket terminal
- `POST /api/sessions`, `POST /api/sessions/{id}/terminate`, `GET /api/sessions`
- `GET /healthz`
*/

mod routes;
mod ws;

use std::future::Future;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use crate::orchestrator::Orchestrator;

pub fn router(orch: Orchestrator) -> Router {
    Router::new()
        .route("/terminal", get(ws::terminal_handler))
        .route(
            "/api/sessions",
            post(routes::start_session).get(routes::list_sessions),
        )
        .route(
            "/api/sessions/{id}/terminate",
            post(routes::terminate_session),
        )
        .route("/healthz", get(routes::healthz))
        .with_state(orch)
}

/// Serve until `shutdown` resolves, then drain the orchestrator's sessions.
pub async fn serve<F>(listener: TcpListener, orch: Orchestrator, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");
    let app = router(orch.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("shutdown requested");
            orch.shutdown().await;
        })
        .await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
