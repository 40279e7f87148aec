use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::config::AiConfig;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MOCK_REPLY: &str = "[mock] no API key configured; set ai.api_key or ANTHROPIC_API_KEY";

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Minimal client for the Claude messages API.
#[derive(Debug, Clone)]
pub struct ClaudeClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl ClaudeClient {
    pub fn new(api_key: Option<String>, model: String, max_tokens: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            max_tokens,
        }
    }

    pub fn from_config(config: &AiConfig) -> Self {
        Self::new(
            config.resolve_api_key(),
            config.model.clone(),
            config.max_tokens,
        )
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Single-turn completion. Without an API key a mock reply is returned
    /// so flows remain runnable in development.
    pub async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String> {
        let Some(api_key) = &self.api_key else {
            return Ok(MOCK_REPLY.to_string());
        };

        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_message}],
        });

        let response = self
            .http
            .post(MESSAGES_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("failed to reach the Claude API")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("Claude API error: {status} {detail}"));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("failed to decode Claude API response")?;

        parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| anyhow!("Claude API response contained no text content"))
    }
}
