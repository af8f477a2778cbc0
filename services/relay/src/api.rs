use crate::config::ApiConfig;
use crate::server::{RelayStats, StatsSnapshot};
use crate::store::RecordSink;
use crate::watchdog::ActivityTracker;
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub sink: Arc<dyn RecordSink>,
    pub stats: Arc<RelayStats>,
    pub activity: Arc<ActivityTracker>,
}

/// Relay status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub packets: StatsSnapshot,
    pub images_produced: u64,
    /// Seconds since the last produced image, null before the first one
    pub seconds_since_last_image: Option<f64>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.sink.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: state.service_name.clone(),
        packets: state.stats.snapshot(),
        images_produced: state.activity.images_recorded(),
        seconds_since_last_image: state
            .activity
            .since_last_image()
            .map(|d| d.as_secs_f64()),
    })
}

/// Start the status API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting status API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
