//! HTTP trigger.
//!
//! Every request to `/` runs one invocation; the request itself carries no
//! input. `GET /healthz` answers liveness without touching the proxy.

use crate::runner::{InvocationResponse, Runner};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Builds the trigger router around a shared runner.
pub fn router(runner: Arc<Runner>) -> Router {
    Router::new()
        .route("/", any(invoke))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(runner)
}

async fn invoke(State(runner): State<Arc<Runner>>) -> (StatusCode, Json<InvocationResponse>) {
    let invocation = runner.invoke_isolated().await;
    let status =
        StatusCode::from_u16(invocation.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(invocation.response))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serves the trigger on `addr` until ctrl-c, then stops the resident proxy.
pub async fn serve(runner: Arc<Runner>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Listening for invocations");

    axum::serve(listener, router(Arc::clone(&runner)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runner.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
