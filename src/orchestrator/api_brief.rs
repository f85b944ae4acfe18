//! Brief generation through the Messages API
//!
//! Used when the user has configured an API key. Sends the brief template
//! plus transcript as a single user message and returns the text blocks of
//! the reply.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

use super::collaborators::{BriefGenerator, BriefResult, CollaboratorError};
use super::continuation::brief_prompt;
use crate::model::{BriefGeneratorKind, ConversationTurn};

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
pub const DEFAULT_BRIEF_MODEL: &str = "claude-sonnet-4-20250514";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Clone)]
pub struct ApiBriefGenerator {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ApiBriefGenerator {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::with_base_url(DEFAULT_API_BASE, api_key, model)
    }

    pub fn with_base_url(base_url: &str, api_key: &str, model: &str) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn request_body(&self, turns: &[ConversationTurn]) -> Value {
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [
                { "role": "user", "content": brief_prompt(turns) }
            ],
        })
    }
}

/// Concatenate the text blocks of a Messages API reply
fn parse_reply(body: &str) -> Result<(String, String), CollaboratorError> {
    let reply: MessagesResponse =
        serde_json::from_str(body).map_err(|e| CollaboratorError::Other(format!("Bad API reply: {}", e)))?;
    let text: Vec<&str> = reply
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text.as_deref())
        .collect();
    if text.is_empty() {
        return Err(CollaboratorError::Other("API reply contained no text".to_string()));
    }
    Ok((text.join("\n"), reply.model))
}

#[async_trait]
impl BriefGenerator for ApiBriefGenerator {
    async fn generate(&self, turns: &[ConversationTurn]) -> Result<BriefResult, CollaboratorError> {
        debug!(turns = turns.len(), model = %self.model, "Requesting brief");
        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(turns))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            error!(status = %status, "Brief request failed");
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(CollaboratorError::Unavailable(format!("API returned {}", status)));
            }
            return Err(CollaboratorError::Http(format!("API returned {}: {}", status, body)));
        }

        let (text, model) = parse_reply(&body)?;
        Ok(BriefResult {
            text,
            model,
            generated_at: Utc::now(),
            generator: BriefGeneratorKind::Api,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TurnRole;

    #[test]
    fn test_request_body() {
        let generator = ApiBriefGenerator::new("sk-test", DEFAULT_BRIEF_MODEL);
        let body = generator.request_body(&[ConversationTurn {
            role: TurnRole::User,
            content: "hello".to_string(),
            timestamp: None,
        }]);
        assert_eq!(body["model"], DEFAULT_BRIEF_MODEL);
        assert_eq!(body["messages"][0]["role"], "user");
        let content = body["messages"][0]["content"].as_str().unwrap();
        assert!(content.ends_with("User: hello"));
    }

    #[test]
    fn test_parse_reply_joins_text_blocks() {
        let body = r#"{
            "id": "msg_1",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "1. IDENTITY"},
                {"type": "tool_use", "id": "x", "name": "y", "input": {}},
                {"type": "text", "text": "2. DECISIONS"}
            ]
        }"#;
        let (text, model) = parse_reply(body).unwrap();
        assert_eq!(text, "1. IDENTITY\n2. DECISIONS");
        assert_eq!(model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_parse_reply_without_text() {
        assert!(parse_reply(r#"{"model": "m", "content": []}"#).is_err());
        assert!(parse_reply("<html>").is_err());
    }
}
