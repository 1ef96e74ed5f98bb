//! Message translation between compatibility surfaces and the native
//! upstream wire format.
//!
//! The upstream expects alternating `user`/`model` turns. Both alias
//! surfaces normalize their conversations the same way: map roles
//! (assistant becomes model, system becomes user), drop a leading `model`
//! message, and join consecutive same-role messages into one turn.

use serde::{Deserialize, Serialize};

/// One part of a native content turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativePart {
    pub text: String,
}

/// One native conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeContent {
    pub role: String,
    pub parts: Vec<NativePart>,
}

/// Native request body for a generate call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeGenerateRequest {
    pub contents: Vec<NativeContent>,
}

/// Native response subset: the generated text and the usage block.
#[derive(Debug, Clone, Deserialize)]
pub struct NativeGenerateResponse {
    #[serde(default)]
    pub candidates: Vec<NativeCandidate>,
    #[serde(rename = "usageMetadata")]
    pub usage_metadata: Option<NativeUsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NativeCandidate {
    pub content: Option<NativeContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NativeUsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    pub candidates_token_count: u64,
    #[serde(rename = "totalTokenCount", default)]
    pub total_token_count: u64,
}

/// A role/text message as both alias surfaces carry it.
#[derive(Debug, Clone)]
pub struct AliasMessage {
    pub role: String,
    pub text: String,
}

/// Normalize alias-surface messages into native contents.
pub fn to_native_contents(messages: &[AliasMessage]) -> Vec<NativeContent> {
    let mapped = messages.iter().map(|m| {
        let role = match m.role.as_str() {
            "assistant" => "model",
            "system" => "user",
            "model" => "model",
            _ => "user",
        };
        (role.to_string(), m.text.clone())
    });

    // Drop a leading model turn: the upstream requires a user turn first.
    let mut contents: Vec<NativeContent> = Vec::new();
    for (role, text) in mapped {
        if contents.is_empty() && role == "model" {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role == role => {
                let joined = &mut last.parts[0].text;
                joined.push('\n');
                joined.push_str(&text);
            }
            _ => contents.push(NativeContent {
                role,
                parts: vec![NativePart { text }],
            }),
        }
    }
    contents
}

/// Concatenate the first candidate's text parts.
pub fn response_text(response: &NativeGenerateResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, text: &str) -> AliasMessage {
        AliasMessage {
            role: role.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_role_mapping() {
        let contents = to_native_contents(&[
            msg("system", "be brief"),
            msg("assistant", "ok"),
            msg("user", "hi"),
        ]);
        // system joins the user class; assistant becomes model
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[1].role, "model");
        assert_eq!(contents[2].role, "user");
    }

    #[test]
    fn test_consecutive_same_role_joined() {
        let contents = to_native_contents(&[
            msg("system", "be brief"),
            msg("user", "hi"),
            msg("user", "hello?"),
        ]);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].parts[0].text, "be brief\nhi\nhello?");
    }

    #[test]
    fn test_leading_model_message_stripped() {
        let contents = to_native_contents(&[msg("assistant", "welcome!"), msg("user", "hi")]);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[0].parts[0].text, "hi");
    }

    #[test]
    fn test_response_text_concatenates_parts() {
        let response = NativeGenerateResponse {
            candidates: vec![NativeCandidate {
                content: Some(NativeContent {
                    role: "model".to_string(),
                    parts: vec![
                        NativePart {
                            text: "Hello ".to_string(),
                        },
                        NativePart {
                            text: "there".to_string(),
                        },
                    ],
                }),
            }],
            usage_metadata: None,
        };
        assert_eq!(response_text(&response), "Hello there");
    }

    #[test]
    fn test_response_text_empty_without_candidates() {
        let response = NativeGenerateResponse {
            candidates: vec![],
            usage_metadata: None,
        };
        assert_eq!(response_text(&response), "");
    }
}
