//! Ollama-compatible alias surface.
//!
//! Accepts Ollama `/api/chat` requests, normalizes the conversation into
//! native contents, and answers in the Ollama chat shape. Responses are
//! delivered buffered regardless of the `stream` flag.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::api::translate::{
    to_native_contents, AliasMessage, NativeGenerateRequest, NativeGenerateResponse,
    response_text,
};
use crate::api::types::{passthrough_response, ApiError};
use crate::api::{proxy, AppState};
use crate::dispatch::{self, DispatchOutcome, ProxyRequest, NATIVE_ADAPTER};

/// Ollama chat request.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// Additional fields are accepted and ignored
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One chat message, shared between request and response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Ollama chat response (non-streaming shape).
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: String,
    pub message: Message,
    pub done: bool,
    pub done_reason: String,
    pub prompt_eval_count: u64,
    pub eval_count: u64,
}

/// POST /api/chat - Ollama-compatible chat.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    info!(model = %request.model, "Ollama chat request");

    let messages: Vec<AliasMessage> = request
        .messages
        .iter()
        .map(|m| AliasMessage {
            role: m.role.clone(),
            text: m.content.clone(),
        })
        .collect();

    let contents = to_native_contents(&messages);
    if contents.is_empty() {
        return ApiError::bad_request("Conversation contains no forwardable messages")
            .into_response();
    }

    let native_body = match serde_json::to_vec(&NativeGenerateRequest { contents }) {
        Ok(body) => body,
        Err(e) => {
            return ApiError::bad_request(&format!("Failed to encode request: {}", e))
                .into_response()
        }
    };

    let proxy_request = ProxyRequest {
        model: request.model.clone(),
        action: "generateContent".to_string(),
        body: native_body,
    };

    let outcome = dispatch::run_dispatch(
        &state.engine,
        &state.http_client,
        &state.upstream,
        &NATIVE_ADAPTER,
        &proxy_request,
        &state.shutdown,
    )
    .await;

    match outcome {
        DispatchOutcome::Success(reply) => {
            let native: NativeGenerateResponse = match serde_json::from_slice(&reply.body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    return ApiError::bad_gateway(&format!("Invalid upstream response: {}", e))
                        .into_response()
                }
            };

            let (prompt_eval_count, eval_count) = native
                .usage_metadata
                .as_ref()
                .map(|m| (m.prompt_token_count, m.candidates_token_count))
                .unwrap_or_default();

            let response = ChatResponse {
                model: request.model,
                created_at: chrono::Utc::now().to_rfc3339(),
                message: Message {
                    role: "assistant".to_string(),
                    content: response_text(&native),
                },
                done: true,
                done_reason: "stop".to_string(),
                prompt_eval_count,
                eval_count,
            };
            Json(response).into_response()
        }
        DispatchOutcome::UpstreamError(reply) => passthrough_response(reply),
        other => proxy::into_response(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_with_stream_flag() {
        let body = serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "stream": false
        });
        let request: ChatRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.stream, Some(false));
    }

    #[test]
    fn test_response_serializes_ollama_shape() {
        let response = ChatResponse {
            model: "m".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            message: Message {
                role: "assistant".to_string(),
                content: "hello".to_string(),
            },
            done: true,
            done_reason: "stop".to_string(),
            prompt_eval_count: 4,
            eval_count: 6,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["done"], true);
        assert_eq!(json["message"]["role"], "assistant");
        assert_eq!(json["prompt_eval_count"], 4);
    }
}
