// Liveness server - tiny axum app so the host can tell the relay is up.
//
// `/` answers with a fixed plaintext line, `/health` with a JSON ok for
// platform health checks, and `/status` reports the driver state and the
// dispatcher counters. Shuts down with the rest of the process.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pipeline::dispatch::Dispatcher;
use crate::pipeline::driver::DriverState;

/// Body of `GET /`.
pub const ACKNOWLEDGEMENT: &str = "Tweet Relay is working...";

/// Shared state for the status route.
#[derive(Clone)]
pub struct LivenessState {
    pub dispatcher: Dispatcher,
    pub driver_state: watch::Receiver<DriverState>,
}

/// Bind the liveness listener. Done before anything else starts so a port
/// conflict fails the process instead of a background task.
pub async fn bind(addr: &str) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind liveness server to {addr}"))
}

/// Serve on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: LivenessState,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Liveness server listening on http://{addr}");
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Liveness server failed")?;
    Ok(())
}

pub fn build_router(state: LivenessState) -> Router {
    Router::new()
        .route("/", get(acknowledge))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn acknowledge() -> &'static str {
    ACKNOWLEDGEMENT
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status(State(state): State<LivenessState>) -> impl IntoResponse {
    let driver = *state.driver_state.borrow();
    Json(serde_json::json!({
        "driver": driver,
        "deliveries": state.dispatcher.stats(),
        "pending_tasks": state.dispatcher.pending_tasks(),
    }))
}
