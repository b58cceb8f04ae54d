//! HTTP surface: session control, polling listing, and the SSE push
//! channel.

pub mod error;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::orchestrator::Orchestrator;
use crate::{AppError, Result};

pub use routes::ApiState;

/// Build the router over `orchestrator`.
///
/// Open event streams end when `shutdown` fires.
pub fn router(orchestrator: Arc<Orchestrator>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/events",
            get(routes::stream_events).post(routes::publish_event),
        )
        .route(
            "/sessions",
            get(routes::list_sessions).post(routes::launch_session),
        )
        .route("/sessions/resumable", get(routes::resumable_session))
        .route("/sessions/{id}", get(routes::get_session))
        .route("/sessions/{id}/cancel", post(routes::cancel_session))
        .with_state(ApiState {
            orchestrator,
            shutdown,
        })
}

/// Serve on `127.0.0.1:<http_port>` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the port cannot be bound or the server
/// fails.
pub async fn serve(orchestrator: Arc<Orchestrator>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], orchestrator.config().http_port));
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;
    serve_on(listener, orchestrator, ct).await
}

/// Serve on an already bound listener until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails.
pub async fn serve_on(
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
    ct: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "starting HTTP/SSE server");

    axum::serve(listener, router(orchestrator, ct.clone()))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("HTTP server error: {err}")))?;

    info!("HTTP/SSE server shut down");
    Ok(())
}
