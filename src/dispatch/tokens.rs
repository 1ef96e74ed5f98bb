//! Token-count extraction from upstream response bodies.
//!
//! Well-formed responses carry `usageMetadata.totalTokenCount`. Streamed
//! responses arrive as a chunk series that does not parse as one document;
//! for those a scan takes the largest decimal following any
//! `"totalTokenCount"` occurrence (the final chunk carries the full total).

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

fn token_count_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#""totalTokenCount"\s*:\s*(\d+)"#).unwrap())
}

/// Extract the total token count from an upstream response body.
pub fn extract_total_tokens(body: &[u8]) -> Option<u64> {
    if let Ok(response) = serde_json::from_slice::<GenerateContentResponse>(body) {
        if let Some(total) = response
            .usage_metadata
            .and_then(|m| m.total_token_count)
        {
            return Some(total);
        }
    }

    let text = String::from_utf8_lossy(body);
    token_count_pattern()
        .captures_iter(&text)
        .filter_map(|c| c[1].parse().ok())
        .max()
}
