//! Request, response, and error envelope types for the HTTP surface.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::dispatch::UpstreamReply;

/// API error response in OpenAI-style envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip_serializing)]
    pub status: StatusCode,
    pub error: ApiErrorBody,
}

/// Error details.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub message: String,
    pub r#type: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: &str) -> Self {
        Self {
            status,
            error: ApiErrorBody {
                message: message.to_string(),
                r#type: kind.to_string(),
                param: None,
                code: Some(kind.to_string()),
            },
        }
    }

    /// Create a bad request error (400).
    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    /// Create a rate limit error (429), used when no pool key is available.
    pub fn too_many_requests(message: &str) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", message)
    }

    /// Create a service unavailable error (503).
    pub fn service_unavailable(message: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            message,
        )
    }

    /// Create a bad gateway error (502).
    pub fn bad_gateway(message: &str) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "bad_gateway", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// Pass a buffered upstream reply through to the client unchanged: status,
/// content type, and body.
pub fn passthrough_response(reply: UpstreamReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = reply.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(reply.body))
        .unwrap_or_else(|_| status.into_response())
}

/// Body of `POST /api/test_key`.
#[derive(Debug, Clone, Deserialize)]
pub struct TestKeyRequest {
    pub api_key: String,
    pub model_name: String,
}

/// Reply of `POST /api/test_key`: only the upstream status matters.
#[derive(Debug, Clone, Serialize)]
pub struct TestKeyResponse {
    pub status_code: u16,
}

/// Body of `POST /api/enable_model`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnableModelRequest {
    pub api_key: String,
    pub model_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_serializes_envelope_only() {
        let err = ApiError::too_many_requests("no keys left");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["message"], "no keys left");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_api_error_status_mapping() {
        assert_eq!(
            ApiError::bad_request("x").status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::service_unavailable("x").status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::bad_gateway("x").status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_passthrough_preserves_status_and_content_type() {
        let reply = UpstreamReply {
            status: 451,
            content_type: Some("application/json".to_string()),
            body: b"{\"reason\":\"legal\"}".to_vec(),
        };
        let response = passthrough_response(reply);
        assert_eq!(response.status().as_u16(), 451);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
