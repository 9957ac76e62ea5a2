//! Anthropic Messages API critic

use crate::auth::resolve_api_key;
use crate::circuit_breaker::CircuitBreaker;
use crate::types::{Message, MessagesRequest, MessagesResponse, Model};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use stagehand_core::{CriticConfig, Result, StagehandError};
use stagehand_gate::{Critic, CritiqueRequest};
use std::sync::Arc;
use std::time::Duration;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Retry schedule for 429 and 5xx responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), doubling up to the cap
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Critic that asks a Claude model to review stage output
#[derive(Debug, Clone)]
pub struct AnthropicCritic {
    model: Model,
    max_tokens: usize,
    api_key_env: String,
    endpoint: String,
    retry: RetryPolicy,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl AnthropicCritic {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            max_tokens: 4096,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            endpoint: ANTHROPIC_API_URL.to_string(),
            retry: RetryPolicy::default(),
            http: reqwest::Client::new(),
            breaker: Arc::new(CircuitBreaker::default()),
        }
    }

    pub fn from_config(config: &CriticConfig) -> Result<Self> {
        let model = config
            .model
            .parse::<Model>()
            .map_err(StagehandError::Config)?;
        Ok(Self::new(model)
            .with_max_tokens(config.max_tokens)
            .with_api_key_env(config.api_key_env.clone()))
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = var.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn model(&self) -> Model {
        self.model
    }

    async fn send(&self, request: &MessagesRequest, api_key: &str) -> Result<String> {
        let mut retries = 0;

        loop {
            tracing::debug!("Sending critique request (attempt {})", retries + 1);

            let response = match self
                .http
                .post(&self.endpoint)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(StagehandError::Api(format!("Failed to send request: {}", e)));
                }
            };

            let status = response.status();

            if status.as_u16() == 429 {
                retries += 1;
                if retries > self.retry.max_retries {
                    let body = response.text().await.unwrap_or_default();
                    self.breaker.record_failure();
                    return Err(StagehandError::ApiLimit(format!(
                        "Rate limit exceeded after {} retries: {}",
                        self.retry.max_retries, body
                    )));
                }

                let wait = retry_after(response.headers())
                    .unwrap_or_else(|| self.retry.backoff(retries))
                    .min(self.retry.max_backoff);
                tracing::warn!(
                    "Rate limited (429). Waiting {:?} before retry {}/{}",
                    wait,
                    retries,
                    self.retry.max_retries
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();

                if status.is_server_error() && retries < self.retry.max_retries {
                    retries += 1;
                    let wait = self.retry.backoff(retries);
                    tracing::warn!(
                        "Server error ({}). Waiting {:?} before retry {}/{}",
                        status,
                        wait,
                        retries,
                        self.retry.max_retries
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }

                self.breaker.record_failure();
                tracing::error!(
                    "Critic API error {} (breaker failures: {})",
                    status,
                    self.breaker.failure_count()
                );
                return Err(StagehandError::Api(format!(
                    "Anthropic API error {}: {}",
                    status, body
                )));
            }

            let parsed: MessagesResponse = response
                .json()
                .await
                .map_err(|e| StagehandError::Api(format!("Failed to parse response: {}", e)))?;
            self.breaker.record_success();

            let text = parsed.text();
            if text.is_empty() {
                return Err(StagehandError::Api("No text content in response".to_string()));
            }

            match parsed.usage {
                Some(usage) => tracing::info!(
                    "Critique received ({} chars, {} input tokens, {} output tokens)",
                    text.len(),
                    usage.input_tokens,
                    usage.output_tokens
                ),
                None => tracing::info!("Critique received ({} chars)", text.len()),
            }
            return Ok(text);
        }
    }
}

#[async_trait]
impl Critic for AnthropicCritic {
    async fn critique(&self, request: &CritiqueRequest) -> Result<String> {
        if !self.breaker.can_execute() {
            return Err(StagehandError::ApiLimit(format!(
                "Circuit breaker is open after repeated API failures; retry in {}s",
                self.breaker.time_until_retry().as_secs()
            )));
        }

        let api_key = resolve_api_key(&self.api_key_env)?;
        tracing::info!("Requesting {} critique from {}", request.stage, self.model);

        let body = MessagesRequest {
            model: self.model.api_name().to_string(),
            max_tokens: self.max_tokens,
            system: request.system.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
        };

        self.send(&body, &api_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::StageId;

    fn request() -> CritiqueRequest {
        CritiqueRequest {
            stage: StageId::Review,
            system: "review".to_string(),
            prompt: "output".to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(100));
        assert_eq!(policy.backoff(40), Duration::from_secs(100));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert("retry-after", "12".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_from_config_rejects_unknown_model() {
        let mut config = CriticConfig::default();
        config.model = "gpt-4".to_string();
        assert!(matches!(
            AnthropicCritic::from_config(&config),
            Err(StagehandError::Config(_))
        ));

        config.model = "haiku".to_string();
        let critic = AnthropicCritic::from_config(&config).unwrap();
        assert_eq!(critic.model(), Model::Haiku);
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error() {
        std::env::remove_var("STAGEHAND_CLIENT_TEST_NO_KEY");
        let critic = AnthropicCritic::new(Model::Sonnet).with_api_key_env("STAGEHAND_CLIENT_TEST_NO_KEY");
        assert!(matches!(
            critic.critique(&request()).await,
            Err(StagehandError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(600)));
        breaker.record_failure();

        let critic = AnthropicCritic::new(Model::Sonnet).with_circuit_breaker(breaker);
        assert!(matches!(
            critic.critique(&request()).await,
            Err(StagehandError::ApiLimit(_))
        ));
    }
}
