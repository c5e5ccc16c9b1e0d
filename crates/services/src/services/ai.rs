//! Text summarization through the Anthropic Messages API.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const SUMMARY_MAX_TOKENS: u32 = 512;

#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("AI features are not configured")]
    NotConfigured,
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("rate limited")]
    RateLimited,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl AiError {
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::RateLimited => true,
            Self::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [UserMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

impl MessagesResponse {
    fn into_text(self) -> Option<String> {
        let text: String = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

fn summary_prompt(text: &str) -> String {
    format!("Summarize the following content in 2-3 sentences:\n\n{text}")
}

/// Client for the language model behind `ai.summarize`. Without an API key every
/// call fails with [`AiError::NotConfigured`].
#[derive(Debug, Clone)]
pub struct AiClient {
    http: Client,
    api_key: Option<SecretString>,
    model: String,
    endpoint: String,
}

impl AiClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(api_key: Option<SecretString>, model: Option<String>) -> Result<Self, AiError> {
        let http = Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("postboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AiError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            endpoint: MESSAGES_URL.to_string(),
        })
    }

    /// Point the client at another Messages-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn summarize(&self, text: &str) -> Result<String, AiError> {
        let api_key = self.api_key.as_ref().ok_or(AiError::NotConfigured)?;
        let prompt = summary_prompt(text);
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: SUMMARY_MAX_TOKENS,
            messages: [UserMessage {
                role: "user",
                content: &prompt,
            }],
        };

        let response = (|| async { self.send(api_key, &request).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(500))
                    .with_max_delay(Duration::from_secs(10))
                    .with_max_times(3)
                    .with_jitter(),
            )
            .when(|e: &AiError| e.should_retry())
            .notify(|e, dur| {
                warn!(
                    error = %e,
                    retry_in_ms = dur.as_millis() as u64,
                    "Summarization request failed, retrying"
                )
            })
            .await?;

        let summary = response
            .into_text()
            .ok_or_else(|| AiError::Decode("no text in response".to_string()))?;
        debug!(input_chars = text.chars().count(), summary_chars = summary.chars().count(), "Summarized text");
        Ok(summary)
    }

    async fn send(
        &self,
        api_key: &SecretString,
        request: &MessagesRequest<'_>,
    ) -> Result<MessagesResponse, AiError> {
        let res = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Timeout
                } else {
                    AiError::Transport(e.to_string())
                }
            })?;

        match res.status() {
            s if s.is_success() => res
                .json::<MessagesResponse>()
                .await
                .map_err(|e| AiError::Decode(e.to_string())),
            StatusCode::UNAUTHORIZED => Err(AiError::InvalidApiKey),
            StatusCode::TOO_MANY_REQUESTS => Err(AiError::RateLimited),
            s => Err(AiError::Http {
                status: s.as_u16(),
                body: res.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_client_refuses() {
        let client = AiClient::new(None, None).unwrap();
        assert!(!client.is_configured());
        assert!(matches!(
            client.summarize("some text").await,
            Err(AiError::NotConfigured)
        ));
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(AiError::Timeout.should_retry());
        assert!(AiError::Http { status: 503, body: String::new() }.should_retry());
        assert!(!AiError::Http { status: 400, body: String::new() }.should_retry());
        assert!(!AiError::InvalidApiKey.should_retry());
        assert!(!AiError::NotConfigured.should_retry());
    }

    #[test]
    fn response_text_joins_text_blocks() {
        let response: MessagesResponse = serde_json::from_value(serde_json::json!({
            "id": "msg_1",
            "content": [
                { "type": "text", "text": " A short " },
                { "type": "tool_use", "id": "t", "name": "x", "input": {} },
                { "type": "text", "text": "summary. " }
            ],
            "usage": { "input_tokens": 1, "output_tokens": 2 }
        }))
        .unwrap();
        assert_eq!(response.into_text().as_deref(), Some("A short summary."));

        let empty: MessagesResponse =
            serde_json::from_value(serde_json::json!({ "content": [] })).unwrap();
        assert!(empty.into_text().is_none());
    }

    #[test]
    fn prompt_asks_for_a_short_summary() {
        assert!(summary_prompt("body").starts_with("Summarize the following content in 2-3 sentences"));
        assert!(summary_prompt("body").ends_with("\n\nbody"));
    }
}
