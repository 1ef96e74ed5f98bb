//! OpenAI-compatible alias surface.
//!
//! The model name travels in the JSON body; the conversation is normalized
//! into native contents, forwarded through the dispatch loop, and the
//! native response is translated back into a chat completion. Responses are
//! always delivered buffered, including when a client asks for streaming.

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

/// Chat completion request matching OpenAI format.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Additional fields are accepted and ignored
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A single message in the conversation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Message content - either text or multimodal parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Content part for multimodal messages; only text parts are forwarded.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Chat completion response (non-streaming).
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// POST /v1/chat/completions - OpenAI-compatible chat completion.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    info!(model = %request.model, stream = request.stream, "Chat completion request");

    let messages: Vec<AliasMessage> = request
        .messages
        .iter()
        .map(|m| AliasMessage {
            role: m.role.clone(),
            text: m.content.to_text(),
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

            let usage = native
                .usage_metadata
                .as_ref()
                .map(|m| Usage {
                    prompt_tokens: m.prompt_token_count,
                    completion_tokens: m.candidates_token_count,
                    total_tokens: m.total_token_count,
                })
                .unwrap_or_default();

            let response = ChatCompletionResponse {
                id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
                object: "chat.completion".to_string(),
                created: chrono::Utc::now().timestamp(),
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: AssistantMessage {
                        role: "assistant".to_string(),
                        content: response_text(&native),
                    },
                    finish_reason: "stop".to_string(),
                }],
                usage,
            };
            Json(response).into_response()
        }
        DispatchOutcome::UpstreamError(reply) => passthrough_response(reply),
        other => proxy::into_response(other),
    }
}

/// GET /v1/models - list the configured models in OpenAI format.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let mut names: Vec<&String> = state.engine.models.keys().collect();
    names.sort();

    let data: Vec<serde_json::Value> = names
        .into_iter()
        .map(|name| {
            serde_json::json!({
                "id": name,
                "object": "model",
                "created": 0,
                "owned_by": "turnstile",
            })
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": data })).into_response()
}
