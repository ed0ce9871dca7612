//! Thin W3C WebDriver client.
//!
//! JSON over HTTP against a chromedriver-compatible endpoint. Only the
//! handful of commands the actuator needs; every call is bounded by the
//! client-wide timeout so nothing upstream can hang on a wedged browser.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// W3C element identifier key in find-element responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

pub struct WebDriverClient {
    http: reqwest::Client,
    base: String,
}

impl WebDriverClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build webdriver http client")?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a session. With `debugger_address` the driver attaches to an
    /// already-running browser instead of launching its own.
    pub async fn new_session(&self, debugger_address: Option<&str>) -> Result<String> {
        let mut chrome_options = json!({ "args": ["--disable-blink-features=AutomationControlled"] });
        if let Some(address) = debugger_address {
            chrome_options = json!({ "debuggerAddress": address });
        }
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": chrome_options,
                }
            }
        });

        let value = self.post("/session", &body).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("session response missing sessionId"))?
            .to_string();
        debug!(session_id, attached = debugger_address.is_some(), "webdriver session created");
        Ok(session_id)
    }

    pub async fn delete_session(&self, session: &str) -> Result<()> {
        let url = format!("{}/session/{session}", self.base);
        self.http
            .delete(&url)
            .send()
            .await
            .context("delete session")?;
        Ok(())
    }

    pub async fn navigate(&self, session: &str, url: &str) -> Result<()> {
        self.post(&format!("/session/{session}/url"), &json!({ "url": url }))
            .await?;
        Ok(())
    }

    pub async fn title(&self, session: &str) -> Result<String> {
        let value = self.get(&format!("/session/{session}/title")).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// `Ok(None)` when the selector matches nothing; errors are transport or
    /// protocol failures.
    pub async fn find_element(&self, session: &str, css: &str) -> Result<Option<String>> {
        let body = json!({ "using": "css selector", "value": css });
        let url = format!("{}/session/{session}/element", self.base);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("find element request")?;

        let status = response.status();
        let payload: Value = response.json().await.context("decode find element")?;
        if status.is_success() {
            let id = payload
                .get("value")
                .and_then(|v| v.get(ELEMENT_KEY))
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("find element response missing element id"))?
                .to_string();
            return Ok(Some(id));
        }

        let error_kind = payload
            .get("value")
            .and_then(|v| v.get("error"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if error_kind == "no such element" {
            return Ok(None);
        }
        bail!("find element failed: {}", wire_message(&payload));
    }

    pub async fn is_displayed(&self, session: &str, element: &str) -> Result<bool> {
        let value = self
            .get(&format!("/session/{session}/element/{element}/displayed"))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn click(&self, session: &str, element: &str) -> Result<()> {
        self.post(
            &format!("/session/{session}/element/{element}/click"),
            &json!({}),
        )
        .await?;
        Ok(())
    }

    pub async fn clear(&self, session: &str, element: &str) -> Result<()> {
        self.post(
            &format!("/session/{session}/element/{element}/clear"),
            &json!({}),
        )
        .await?;
        Ok(())
    }

    pub async fn send_keys(&self, session: &str, element: &str, text: &str) -> Result<()> {
        self.post(
            &format!("/session/{session}/element/{element}/value"),
            &json!({ "text": text }),
        )
        .await?;
        Ok(())
    }

    pub async fn element_text(&self, session: &str, element: &str) -> Result<String> {
        let value = self
            .get(&format!("/session/{session}/element/{element}/text"))
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn execute(&self, session: &str, script: &str) -> Result<Value> {
        self.post(
            &format!("/session/{session}/execute/sync"),
            &json!({ "script": script, "args": [] }),
        )
        .await
    }

    /// PNG screenshot, base64-encoded as returned by the driver.
    pub async fn screenshot_b64(&self, session: &str) -> Result<String> {
        let value = self.get(&format!("/session/{session}/screenshot")).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("screenshot response is not a string"))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{path}", self.base);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        Self::unwrap_value(path, response).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        Self::unwrap_value(path, response).await
    }

    async fn unwrap_value(path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .with_context(|| format!("decode response for {path}"))?;
        if !status.is_success() {
            bail!("{path} failed ({status}): {}", wire_message(&payload));
        }
        Ok(payload.get("value").cloned().unwrap_or(Value::Null))
    }
}

fn wire_message(payload: &Value) -> String {
    payload
        .get("value")
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown webdriver error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_extraction() {
        let payload = json!({ "value": { "error": "no such element", "message": "nope" } });
        assert_eq!(wire_message(&payload), "nope");
        assert_eq!(wire_message(&json!({})), "unknown webdriver error");
    }

    #[test]
    fn base_url_trailing_slash_normalized() {
        let client = WebDriverClient::new("http://127.0.0.1:9515/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base, "http://127.0.0.1:9515");
    }
}
