//! Tier-2 healing: ask a vision model to find the element on a screenshot.
//!
//! The oracle is opaque to the rest of the locator: it takes the logical key
//! plus a base64 screenshot and returns a selector string or nothing. All
//! failures are absorbed by the caller into "not found".

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::VisionConfig;

#[async_trait]
pub trait VisionOracle: Send + Sync {
    /// Return a CSS selector for the element described by `key`, or None when
    /// the model cannot find it.
    async fn selector_for(&self, key: &str, screenshot_b64: &str) -> Result<Option<String>>;
}

/// JSON-over-HTTP vision client against an OpenAI-style chat endpoint.
pub struct HttpVisionOracle {
    client: reqwest::Client,
    cfg: VisionConfig,
}

impl HttpVisionOracle {
    pub fn new(cfg: VisionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("build vision http client")?;
        Ok(Self { client, cfg })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct SelectorAnswer {
    selector: Option<String>,
}

#[async_trait]
impl VisionOracle for HttpVisionOracle {
    async fn selector_for(&self, key: &str, screenshot_b64: &str) -> Result<Option<String>> {
        let api_key = self
            .cfg
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("vision oracle has no api key configured"))?;

        let prompt = format!(
            "You are looking at a screenshot of a betting site. Find the UI element \
             matching the logical name '{key}'. Respond with JSON only: \
             {{\"selector\": \"<css selector>\"}} or {{\"selector\": null}} if absent."
        );
        let body = json!({
            "model": self.cfg.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/png;base64,{screenshot_b64}")
                    }},
                ],
            }],
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("vision request failed")?
            .error_for_status()
            .context("vision request rejected")?;

        let parsed: ChatResponse = response.json().await.context("decode vision response")?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();

        let answer: SelectorAnswer =
            serde_json::from_str(content).context("vision answer is not the expected JSON")?;
        let selector = answer
            .selector
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        debug!(key, ?selector, "vision oracle answered");
        Ok(selector)
    }
}
