use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use render_common::job::QueueStats;

use super::jobs::error_response;
use super::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecoverResponse {
    recovered_workers: u32,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime: u64,
    queue: QueueStats,
}

pub async fn recover_workers(State(state): State<AppState>) -> Response {
    match state.service.recover_workers().await {
        Ok(recovered_workers) => Json(RecoverResponse { recovered_workers }).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn workers_status(State(state): State<AppState>) -> Response {
    match state.service.workers_status().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    match state.service.queue_stats().await {
        Ok(queue) => Json(HealthResponse {
            status: "ok",
            uptime: state.service.uptime_seconds(),
            queue,
        })
        .into_response(),
        Err(err) => {
            error!("health check cannot reach the queue backend: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "degraded" })),
            )
                .into_response()
        }
    }
}
