//! Shared test utilities for Turnstile integration tests.
//!
//! Provides reusable helpers for building configurations, engines, and
//! router apps backed by a mock upstream.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use turnstile::api::{create_router, AppState};
use turnstile::config::{ModelConfig, ProxyConfig};
use turnstile::engine::Engine;

/// Standard scenario pool: priority keys K1, K2; secondary key K3; one
/// model "m" with a 1000 TPM budget and no TPD cap.
pub fn pool_config(dir: &Path) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.priority_keys = vec!["K1-abcdef".into(), "K2-abcdef".into()];
    config.secondary_keys = vec!["K3-abcdef".into()];
    config.models.clear();
    config.models.insert(
        "m".into(),
        ModelConfig {
            tpm_limit: 1000,
            tpd_limit: None,
        },
    );
    config.default_model = "m".into();
    config.usage_file = dir.join("key_usage.json");
    config
}

pub const K1: &str = "K1-abcdef";
pub const K2: &str = "K2-abcdef";
pub const K3: &str = "K3-abcdef";

/// Build an engine over a fresh usage file.
pub fn make_engine(config: &ProxyConfig) -> Arc<Engine> {
    Arc::new(Engine::from_config(config).unwrap())
}

/// Build a router app whose upstream is the given mock server.
pub fn make_app_with_mock(
    mock_server: &wiremock::MockServer,
    dir: &Path,
) -> (axum::Router, Arc<Engine>) {
    let mut config = pool_config(dir);
    config.upstream.url = mock_server.uri();

    let engine = make_engine(&config);
    let state = Arc::new(AppState::new(Arc::clone(&engine), Arc::new(config)));
    (create_router(state), engine)
}

/// A minimal native generate response carrying a total token count.
pub fn native_success_body(total_tokens: u64) -> serde_json::Value {
    serde_json::json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": "hello from upstream"}]}
        }],
        "usageMetadata": {
            "promptTokenCount": total_tokens / 2,
            "candidatesTokenCount": total_tokens - total_tokens / 2,
            "totalTokenCount": total_tokens
        }
    })
}
