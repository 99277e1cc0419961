//! Out-of-band HTTP surface (§4.6): health/readiness probes, the metrics
//! snapshot, and the downlink command endpoint. Runs alongside the TCP
//! ingest listener on its own port.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::downlink::{Command, DownlinkController, DownlinkError};
use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub downlink: Arc<DownlinkController>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/devices/:imei/command", post(send_command))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Ready once at least the process is up; this server has no external
/// dependency to probe readiness against, unlike a queue-backed ingester.
async fn readyz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(s): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = s.metrics.snapshot(s.registry.len());
    Json(serde_json::to_value(snapshot).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

#[instrument(skip(state))]
async fn send_command(
    State(state): State<AppState>,
    Path(imei): Path<String>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    let Ok(command) = req.command.parse::<Command>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(CommandResponse { success: false, message: format!("unknown command: {}", req.command) }),
        );
    };

    match state.downlink.send(&imei, command).await {
        Ok(reply) => (
            StatusCode::OK,
            Json(CommandResponse { success: reply.success, message: reply.message }),
        ),
        Err(DownlinkError::NotConnected) => {
            state.metrics.downlink_not_connected();
            (
                StatusCode::NOT_FOUND,
                Json(CommandResponse { success: false, message: "device not connected".into() }),
            )
        }
        Err(DownlinkError::Timeout) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(CommandResponse { success: false, message: "command timed out".into() }),
        ),
        Err(DownlinkError::Io(e)) => (
            StatusCode::BAD_GATEWAY,
            Json(CommandResponse { success: false, message: e }),
        ),
    }
}
