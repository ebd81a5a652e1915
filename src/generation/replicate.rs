//! Replicate prediction client.
//!
//! Creates a prediction, then polls it until a terminal state
//! (`succeeded` / `failed` / `canceled`) or the polling budget runs out.

use super::{GeneratedHeadshot, HeadshotGenerator};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.replicate.com";

/// Pause between polls of a pending prediction.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum polls before a pending prediction counts as timed out.
const DEFAULT_MAX_POLLS: u32 = 60;

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl Prediction {
    fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "canceled")
    }
}

/// Headshot generator backed by the Replicate predictions API.
pub struct ReplicateGenerator {
    http: reqwest::Client,
    api_base: String,
    api_token: String,
    model_version: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl ReplicateGenerator {
    /// Create a client for the given API token and model version hash.
    pub fn new(api_token: &str, model_version: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            api_token: api_token.to_string(),
            model_version: model_version.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        })
    }

    /// Point the client at a different API host (tests).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    /// Override the polling cadence.
    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    async fn create_prediction(&self, image: &str, prompt: &str) -> Result<Prediction> {
        let payload = serde_json::json!({
            "version": self.model_version,
            "input": {
                "image": image,
                "prompt": prompt,
                "num_outputs": 1,
            },
        });

        let resp = self
            .http
            .post(format!("{}/v1/predictions", self.api_base))
            .header("Authorization", format!("Token {}", self.api_token))
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Replicate start error ({status}): {body}");
        }

        Ok(resp.json().await?)
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction> {
        let resp = self
            .http
            .get(format!("{}/v1/predictions/{id}", self.api_base))
            .header("Authorization", format!("Token {}", self.api_token))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Replicate poll error ({status}): {body}");
        }

        Ok(resp.json().await?)
    }
}

/// The output field is a bare URL string for some models and an array of
/// URLs for others; take the first either way.
fn first_output_url(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(url) => Some(url.clone()),
        serde_json::Value::Array(items) => items
            .first()
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

#[async_trait]
impl HeadshotGenerator for ReplicateGenerator {
    async fn generate(&self, image: &str, prompt: &str) -> Result<GeneratedHeadshot> {
        let mut prediction = self.create_prediction(image, prompt).await?;
        tracing::debug!(prediction_id = %prediction.id, "prediction created");

        let mut polls = 0;
        while !prediction.is_terminal() {
            if polls >= self.max_polls {
                bail!("image generation timed out after {polls} polls");
            }
            tokio::time::sleep(self.poll_interval).await;
            prediction = self.get_prediction(&prediction.id).await?;
            polls += 1;
        }

        if prediction.status != "succeeded" {
            let detail = prediction
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no detail".to_string());
            bail!("image generation {}: {detail}", prediction.status);
        }

        prediction
            .output
            .as_ref()
            .and_then(first_output_url)
            .map(|image_url| GeneratedHeadshot { image_url })
            .ok_or_else(|| anyhow!("prediction succeeded but returned no output"))
    }
}

// ── Tests ────────────────────────────────────────────────────────
