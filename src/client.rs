//! HTTP client for an OpenAI-compatible chat-completions endpoint.

use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{InspectError, Result, TransportError};
use crate::metrics;
use crate::request::InferenceRequest;
use crate::retry::{RetryExecutor, RetryPolicy};

/// Assistant output for one request. Must go through the validator before
/// anything in it is trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub raw_text: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct InferenceClient {
    http: reqwest::Client,
    url: Url,
    api_key: Option<String>,
    retry: RetryExecutor,
}

impl InferenceClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout()?)
            .build()
            .map_err(|e| InspectError::config(format!("cannot build HTTP client: {}", e)))?;

        let policy = RetryPolicy::new(
            config.max_attempts,
            std::time::Duration::from_millis(config.backoff_base_ms),
            std::time::Duration::from_millis(config.backoff_max_ms),
        );

        Ok(Self {
            http,
            url: config.completions_url()?,
            api_key: config.api_key.clone(),
            retry: RetryExecutor::new(policy),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send `request`, retrying transient failures with backoff.
    pub async fn submit(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let timer = metrics::Timer::new();
        let outcome = self
            .retry
            .execute(|attempt| async move {
                metrics::INFERENCE_ATTEMPTS.inc();
                if attempt > 1 {
                    metrics::INFERENCE_RETRIES.inc();
                }
                self.send_once(request).await
            })
            .await;
        timer.observe_duration_seconds(&metrics::INFERENCE_LATENCY);

        let body = outcome.map_err(|e| {
            warn!("Giving up on {} after {} attempt(s): {}", self.url, e.attempts, e.last);
            InspectError::InferenceUnavailable {
                attempts: e.attempts,
                source: e.last,
            }
        })?;

        parse_completion(&body)
    }

    async fn send_once(&self, request: &InferenceRequest) -> std::result::Result<String, TransportError> {
        let mut builder = self.http.post(self.url.clone()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!("Endpoint answered HTTP {} ({} bytes)", status.as_u16(), body.len());

        if !status.is_success() {
            return Err(TransportError::status(status.as_u16(), &body));
        }
        Ok(body)
    }
}

/// Pull the assistant message out of a chat-completion body.
pub fn parse_completion(body: &str) -> Result<InferenceResponse> {
    let completion: ChatCompletion = serde_json::from_str(body)
        .map_err(|e| InspectError::ResponseFormat(format!("not a chat completion: {}", e)))?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InspectError::ResponseFormat("completion has no choices".to_string()))?;

    if choice.finish_reason.as_deref() == Some("length") {
        warn!("Completion was cut off at max_tokens; output is likely truncated");
    }

    match choice.message.content {
        Some(text) if !text.trim().is_empty() => Ok(InferenceResponse {
            raw_text: text,
            finish_reason: choice.finish_reason,
        }),
        _ => Err(InspectError::ResponseFormat(
            "completion message has no content".to_string(),
        )),
    }
}
