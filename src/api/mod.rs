//! # HTTP surface
//!
//! All endpoints the proxy exposes around the engine:
//!
//! - `POST /v1beta/models/{model[:action]}` - native upstream proxy path
//! - `POST /v1/chat/completions` - OpenAI-compatible alias (model in body)
//! - `GET /v1/models` - configured model list
//! - `POST /api/chat` - Ollama-compatible alias
//! - `GET /status` - HTML dashboard
//! - `GET /api/status_data` - JSON snapshot
//! - `POST /api/test_key` - single validation call upstream
//! - `POST /api/enable_model` - re-enable a soft-disabled (model, key) pair
//! - `GET /health`, `GET /metrics` - operational endpoints

pub mod ollama;
pub mod openai;
pub mod proxy;
pub mod status;
pub mod translate;
pub mod types;

pub use types::{ApiError, EnableModelRequest, TestKeyRequest, TestKeyResponse};

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::ProxyConfig;
use crate::dispatch::Upstream;
use crate::engine::Engine;

/// Maximum request body size (10 MB).
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Arc<ProxyConfig>,
    pub http_client: reqwest::Client,
    pub upstream: Upstream,
    /// Server startup time for uptime tracking
    pub start_time: Instant,
    /// Prometheus exposition handle
    pub prometheus: PrometheusHandle,
    /// Process-wide shutdown signal; also cancels in-flight dispatch sleeps
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new application state with the given engine and configuration.
    pub fn new(engine: Arc<Engine>, config: Arc<ProxyConfig>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.server.request_timeout_seconds,
            ))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to create HTTP client");

        let upstream = Upstream {
            base_url: config.upstream.url.trim_end_matches('/').to_string(),
        };

        Self {
            engine,
            config,
            http_client,
            upstream,
            start_time: Instant::now(),
            prometheus: setup_metrics(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Install the Prometheus recorder, reusing a fresh handle when one is
/// already installed (tests create several states per process).
pub fn setup_metrics() -> PrometheusHandle {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::debug!("Metrics already initialized, creating new handle: {}", e);
            PrometheusBuilder::new().build_recorder().handle()
        }
    }
}

/// Create the main API router with all endpoints configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1beta/models/{model_action}", post(proxy::handle))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::list_models))
        .route("/api/chat", post(ollama::chat))
        .route("/status", get(status::status_page))
        .route("/api/status_data", get(status::status_data))
        .route("/api/test_key", post(status::test_key))
        .route("/api/enable_model", post(status::enable_model))
        .route("/health", get(status::health))
        .route("/metrics", get(status::metrics_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(state)
}
