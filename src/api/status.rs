//! Dashboard, admin hooks, and operational endpoints.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use rust_embed::RustEmbed;
use std::sync::Arc;
use tracing::info;

use crate::api::types::{ApiError, EnableModelRequest, TestKeyRequest, TestKeyResponse};
use crate::api::AppState;

/// Embedded dashboard assets from dashboard/ directory
#[derive(RustEmbed)]
#[folder = "dashboard/"]
struct DashboardAssets;

/// GET /status - serves the dashboard HTML page.
pub async fn status_page() -> Response {
    match DashboardAssets::get("status.html") {
        Some(content) => match std::str::from_utf8(&content.data) {
            Ok(html) => Html(html.to_string()).into_response(),
            Err(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid HTML encoding").into_response()
            }
        },
        None => (StatusCode::INTERNAL_SERVER_ERROR, "Dashboard HTML not found").into_response(),
    }
}

/// GET /api/status_data - JSON snapshot for the dashboard.
pub async fn status_data(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.status_snapshot()).into_response()
}

/// POST /api/test_key - one validation call upstream with the given key.
/// Only the upstream status code is reported back.
pub async fn test_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TestKeyRequest>,
) -> Result<Json<TestKeyResponse>, ApiError> {
    let url = format!(
        "{}/v1beta/models/{}:generateContent",
        state.upstream.base_url, request.model_name
    );
    let body = serde_json::json!({
        "contents": [{"parts": [{"text": "test"}]}]
    });

    let response = state
        .http_client
        .post(url)
        .query(&[("key", request.api_key.as_str())])
        .timeout(std::time::Duration::from_secs(20))
        .json(&body)
        .send()
        .await
        .map_err(|e| ApiError::bad_gateway(&format!("Failed to reach upstream: {}", e)))?;

    Ok(Json(TestKeyResponse {
        status_code: response.status().as_u16(),
    }))
}

/// POST /api/enable_model - clear the soft-disable flags for a (model, key)
/// pair after a successful test call.
pub async fn enable_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnableModelRequest>,
) -> Response {
    info!(model = %request.model_name, "Enable model requested");
    state
        .engine
        .enable_key(&request.model_name, &request.api_key);
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

/// GET /health - liveness with version and uptime.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
    .into_response()
}

/// GET /metrics - Prometheus exposition.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}
