use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Minimal client for a local language model serving the Ollama generate
/// API. One call, one prompt, one text completion.
pub struct LlmClient {
    http: Client,
    url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl LlmClient {
    pub fn new(
        url: &str,
        model: &str,
        temperature: f64,
        max_tokens: u32,
        timeout_secs: u64,
    ) -> Self {
        Self {
            http: Client::new(),
            url: url.to_string(),
            model: model.to_string(),
            temperature,
            max_tokens,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });

        let resp = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("model request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("model returned {}: {}", status, body);
        }

        let data: GenerateResponse = resp
            .json()
            .await
            .context("failed to parse model response")?;
        Ok(data.response)
    }
}
