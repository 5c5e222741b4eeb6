use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::EmbedError;

/// Remote embedding tier. Posts to an Ollama-compatible `/api/embed`
/// endpoint, truncates input to the provider's character budget, and
/// retries with exponential backoff.
#[derive(Clone)]
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    max_chars: usize,
    max_retries: u32,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);

impl RemoteEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
            max_chars: 8_000,
            max_retries: 3,
        }
    }

    /// Provider character budget for a single input.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn provider(&self) -> &str {
        &self.base_url
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| EmbedError::Parse("empty embedding response".into()))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let input: Vec<String> = texts.iter().map(|t| self.truncate(t)).collect();

        let mut attempt = 0;
        loop {
            match self.call(&input).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if attempt < self.max_retries => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "remote embedding failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call(&self, input: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest {
            model: self.model.clone(),
            input: input.to_vec(),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Provider { status, body });
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Parse(e.to_string()))?;

        if parsed.embeddings.len() != input.len() {
            return Err(EmbedError::Parse(format!(
                "expected {} embeddings, got {}",
                input.len(),
                parsed.embeddings.len()
            )));
        }

        // Providers with wider native dimensions get truncated to ours.
        Ok(parsed
            .embeddings
            .into_iter()
            .map(|mut v| {
                v.truncate(self.dimension);
                v
            })
            .collect())
    }

    fn truncate(&self, text: &str) -> String {
        if text.len() <= self.max_chars {
            return text.to_string();
        }
        let mut end = self.max_chars;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_to_char_budget() {
        let e = RemoteEmbedder::new("http://localhost:11434", "nomic-embed-text", 384)
            .with_max_chars(10);
        assert_eq!(e.truncate(&"x".repeat(100)).len(), 10);
        assert_eq!(e.truncate("short"), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let e = RemoteEmbedder::new("http://localhost:11434", "m", 384).with_max_chars(5);
        // 'é' is two bytes; byte 5 falls mid-char.
        let out = e.truncate("ééééé");
        assert!(out.len() <= 5);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
