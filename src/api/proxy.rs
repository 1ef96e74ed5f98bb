//! Native upstream proxy path.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::info;

use crate::api::types::{passthrough_response, ApiError};
use crate::api::AppState;
use crate::dispatch::{self, DispatchOutcome, ProxyRequest, NATIVE_ADAPTER};

/// POST /v1beta/models/{model[:action]} - forward a native request through
/// the key pool.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Response {
    let (model, action) = match model_action.split_once(':') {
        Some((model, action)) => (model.to_string(), action.to_string()),
        None => (model_action, String::new()),
    };

    if model.is_empty() {
        return ApiError::bad_request("Model not specified").into_response();
    }

    info!(model = %model, action = %action, "Native proxy request");

    let request = ProxyRequest {
        model,
        action,
        body: body.to_vec(),
    };

    let outcome = dispatch::run_dispatch(
        &state.engine,
        &state.http_client,
        &state.upstream,
        &NATIVE_ADAPTER,
        &request,
        &state.shutdown,
    )
    .await;

    into_response(outcome)
}

/// Map a terminal dispatch outcome onto the client response. Success and
/// upstream errors pass through verbatim.
pub fn into_response(outcome: DispatchOutcome) -> Response {
    match outcome {
        DispatchOutcome::Success(reply) | DispatchOutcome::UpstreamError(reply) => {
            passthrough_response(reply)
        }
        DispatchOutcome::NoKeyAvailable => {
            ApiError::too_many_requests("No available API keys for the requested model")
                .into_response()
        }
        DispatchOutcome::RetriesExhausted => {
            ApiError::service_unavailable("Service unavailable after multiple retries")
                .into_response()
        }
        DispatchOutcome::Cancelled => {
            ApiError::service_unavailable("Request cancelled").into_response()
        }
        DispatchOutcome::Unreachable(message) => {
            ApiError::bad_gateway(&format!("Failed to reach upstream: {}", message))
                .into_response()
        }
    }
}
