//! Language detection over the translation REST API.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use super::LanguageDetector;

pub struct CloudLanguageDetector {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CloudLanguageDetector {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl LanguageDetector for CloudLanguageDetector {
    async fn detect(&self, text: &str) -> Result<String> {
        debug!(chars = text.len(), "detecting language");
        let response = self
            .client
            .post(format!("{}/detect", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({ "q": text }))
            .send()
            .await
            .context("Failed to send language detection request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("language detection error ({status}): {body}");
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse language detection response")?;
        let detection = &parsed["data"]["detections"][0][0];
        let language = detection["language"]
            .as_str()
            .context("detection response missing language")?
            .to_string();
        if let Some(confidence) = detection["confidence"].as_f64() {
            debug!(confidence, "detection confidence");
        }
        info!(language, "language detected");
        Ok(language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_response_path() {
        // The nested array shape the detect endpoint returns.
        let parsed: serde_json::Value = serde_json::json!({
            "data": { "detections": [[ { "language": "fr", "confidence": 0.98 } ]] }
        });
        assert_eq!(parsed["data"]["detections"][0][0]["language"], "fr");
    }
}
