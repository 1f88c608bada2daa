//! Local backend for jobwatch: the status endpoint, the push channel and a
//! simulated job runner, all in memory.

pub mod sim;
pub mod state;
pub mod ws;

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use state::DevState;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn app(state: DevState) -> Router {
    // Browser UIs on another port poll this server directly.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/jobs/{id}/start", post(start_job))
        .route("/jobs/{id}/status", get(job_status))
        .route("/ws/jobs/{id}", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve `state` on an ephemeral loopback port. Used by integration tests.
pub async fn serve_local(state: DevState) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app(state)).await {
            tracing::error!(error = %e, "dev server stopped");
        }
    });
    Ok((addr, server))
}

async fn start_job(
    Path(job_id): Path<String>,
    State(state): State<DevState>,
    body: Bytes,
) -> impl IntoResponse {
    let plan: sim::SimPlan = if body.is_empty() {
        sim::SimPlan::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(plan) => plan,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid start request: {e}") })),
                )
            }
        }
    };

    if !state.create(&job_id) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "job is already running" })),
        );
    }
    tokio::spawn(sim::run(state.clone(), job_id.clone(), plan));
    (
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "status": "queued" })),
    )
}

async fn job_status(Path(job_id): Path<String>, State(state): State<DevState>) -> impl IntoResponse {
    match state.record(&job_id) {
        Some(record) => (StatusCode::OK, Json(json!(record.body))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job" })),
        ),
    }
}
