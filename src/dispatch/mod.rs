//! Request-dispatch state machine.
//!
//! One dispatch run serves one logical client request: select a key, sleep
//! the throttle delay outside all locks, forward upstream, and feed the
//! outcome back into the engine. Rate limits re-enter the selection loop
//! (the two-strike policy may move it to another key); 503s retry the same
//! key after a fixed pause; every other upstream error is passed through
//! verbatim.

pub mod tokens;

pub use tokens::extract_total_tokens;

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;

/// Bounded retry budget per client request.
pub const MAX_ATTEMPTS: u32 = 5;

/// Pause before retrying after an upstream 503.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upstream vendor endpoint.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub base_url: String,
}

/// A client request ready to forward: the requested model, the upstream
/// action, and the raw JSON body.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub model: String,
    /// Upstream action, e.g. "generateContent"; empty for plain model paths
    pub action: String,
    pub body: Vec<u8>,
}

/// Protocol surface adapter: how to build the outbound call and how to read
/// a token count back out of the response body.
#[derive(Clone, Copy)]
pub struct ProtocolAdapter {
    pub name: &'static str,
    pub build_request:
        fn(&reqwest::Client, &Upstream, &ProxyRequest, &str, &str) -> reqwest::RequestBuilder,
    pub parse_tokens: fn(&[u8]) -> Option<u64>,
}

fn native_build_request(
    client: &reqwest::Client,
    upstream: &Upstream,
    request: &ProxyRequest,
    key: &str,
    model: &str,
) -> reqwest::RequestBuilder {
    let url = if request.action.is_empty() {
        format!("{}/v1beta/models/{}", upstream.base_url, model)
    } else {
        format!("{}/v1beta/models/{}:{}", upstream.base_url, model, request.action)
    };
    client
        .post(url)
        .query(&[("key", key)])
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(request.body.clone())
}

/// The native upstream wire format.
pub const NATIVE_ADAPTER: ProtocolAdapter = ProtocolAdapter {
    name: "native",
    build_request: native_build_request,
    parse_tokens: extract_total_tokens,
};

/// Buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Terminal outcome of one dispatch run.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// 2xx from upstream; usage has been recorded
    Success(UpstreamReply),
    /// Non-retryable upstream error, to be returned verbatim
    UpstreamError(UpstreamReply),
    /// Neither an available nor a degraded key exists for the model
    NoKeyAvailable,
    /// The retry budget ran out on rate limits / transient errors
    RetriesExhausted,
    /// The caller's cancellation signal fired
    Cancelled,
    /// The upstream could not be reached at all
    Unreachable(String),
}

/// Run the dispatch loop for one client request.
pub async fn run_dispatch(
    engine: &Engine,
    client: &reqwest::Client,
    upstream: &Upstream,
    adapter: &ProtocolAdapter,
    request: &ProxyRequest,
    cancel: &CancellationToken,
) -> DispatchOutcome {
    let started = std::time::Instant::now();

    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return DispatchOutcome::Cancelled;
        }

        let selection = match engine.select_key(&request.model) {
            Ok(s) => s,
            Err(e) => {
                warn!(adapter = adapter.name, error = %e, "Key selection failed");
                metrics::counter!("turnstile_errors_total", "error_type" => "no_key_available")
                    .increment(1);
                return DispatchOutcome::NoKeyAvailable;
            }
        };

        if !selection.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return DispatchOutcome::Cancelled,
                _ = tokio::time::sleep(selection.delay) => {}
            }
        }

        let outbound =
            (adapter.build_request)(client, upstream, request, &selection.key, &selection.model);
        let response = match outbound.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(adapter = adapter.name, error = %e, "Upstream request failed");
                metrics::counter!("turnstile_errors_total", "error_type" => "unreachable")
                    .increment(1);
                return DispatchOutcome::Unreachable(e.to_string());
            }
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        if response.status().is_success() {
            let body = match response.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    warn!(error = %e, "Failed to read upstream response body");
                    return DispatchOutcome::Unreachable(e.to_string());
                }
            };

            match (adapter.parse_tokens)(&body) {
                Some(total) => {
                    engine.record_usage(&selection.model, &selection.key, total);
                    metrics::histogram!("turnstile_tokens_total", "model" => selection.model.clone())
                        .record(total as f64);
                }
                None => {
                    warn!(
                        model = %selection.model,
                        "No token count in upstream response, usage not recorded"
                    );
                }
            }

            metrics::counter!("turnstile_requests_total",
                "model" => selection.model.clone(),
                "status" => "200"
            )
            .increment(1);
            metrics::histogram!("turnstile_request_duration_seconds",
                "model" => selection.model.clone()
            )
            .record(started.elapsed().as_secs_f64());

            return DispatchOutcome::Success(UpstreamReply {
                status,
                content_type,
                body,
            });
        }

        if status == 429 {
            engine.handle_rate_limit(&selection.model, &selection.key);
            metrics::counter!("turnstile_retries_total", "reason" => "rate_limited").increment(1);
            info!(
                model = %selection.model,
                attempt,
                "Upstream rate limit, retrying"
            );
            continue;
        }

        if status == 503 {
            metrics::counter!("turnstile_retries_total", "reason" => "transient").increment(1);
            info!(
                model = %selection.model,
                attempt,
                "Upstream transient failure, retrying after pause"
            );
            tokio::select! {
                _ = cancel.cancelled() => return DispatchOutcome::Cancelled,
                _ = tokio::time::sleep(TRANSIENT_RETRY_DELAY) => {}
            }
            continue;
        }

        // Any other upstream error goes back to the client untouched.
        let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        metrics::counter!("turnstile_requests_total",
            "model" => selection.model.clone(),
            "status" => status.to_string()
        )
        .increment(1);
        return DispatchOutcome::UpstreamError(UpstreamReply {
            status,
            content_type,
            body,
        });
    }

    metrics::counter!("turnstile_errors_total", "error_type" => "retries_exhausted").increment(1);
    DispatchOutcome::RetriesExhausted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_url_with_action() {
        let client = reqwest::Client::new();
        let upstream = Upstream {
            base_url: "https://example.test".to_string(),
        };
        let request = ProxyRequest {
            model: "gemini-1.5-pro-latest".to_string(),
            action: "streamGenerateContent".to_string(),
            body: b"{}".to_vec(),
        };

        let built = native_build_request(&client, &upstream, &request, "K1", "gemini-1.5-pro-latest")
            .build()
            .unwrap();
        assert_eq!(
            built.url().as_str(),
            "https://example.test/v1beta/models/gemini-1.5-pro-latest:streamGenerateContent?key=K1"
        );
        assert_eq!(built.method(), reqwest::Method::POST);
    }

    #[test]
    fn test_native_url_without_action() {
        let client = reqwest::Client::new();
        let upstream = Upstream {
            base_url: "https://example.test".to_string(),
        };
        let request = ProxyRequest {
            model: "m".to_string(),
            action: String::new(),
            body: Vec::new(),
        };

        let built = native_build_request(&client, &upstream, &request, "K1", "m")
            .build()
            .unwrap();
        assert_eq!(
            built.url().as_str(),
            "https://example.test/v1beta/models/m?key=K1"
        );
    }
}
