//! Summarization adapter.
//!
//! The producer only needs `text -> summary`. Production calls a hosted
//! summarization model over HTTP; tests substitute a fake.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use crate::config::SummarizerConfig;
use crate::error::SummarizeError;

/// Longest input sent to the model, in characters.
const MAX_INPUT_CHARS: usize = 2048;

/// Text in, summary out.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, SummarizeError>;
}

/// Hosted inference endpoint speaking the `{"inputs": ...}` /
/// `[{"summary_text": ...}]` protocol.
pub struct HttpSummarizer {
    client: reqwest::Client,
    config: SummarizerConfig,
}

#[derive(Debug, Deserialize)]
struct SummaryItem {
    summary_text: String,
}

impl HttpSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SummarizeError::Request(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, SummarizeError> {
        let input = truncate_chars(text.trim(), MAX_INPUT_CHARS);
        if input.is_empty() {
            return Ok(String::new());
        }

        let mut request = self
            .client
            .post(&self.config.url)
            .json(&serde_json::json!({
                "inputs": input,
                "parameters": { "truncation": "only_first" },
            }));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let started = std::time::Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| SummarizeError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizeError::Request(format!("HTTP {status}: {body}")));
        }

        let items: Vec<SummaryItem> = response
            .json()
            .await
            .map_err(|e| SummarizeError::InvalidResponse(e.to_string()))?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Summary received");

        items
            .into_iter()
            .next()
            .map(|item| item.summary_text.trim().to_string())
            .ok_or_else(|| SummarizeError::InvalidResponse("empty summary list".into()))
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
