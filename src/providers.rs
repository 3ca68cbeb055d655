//! AI provider gateway: chat completion and embeddings behind one facade.
//!
//! Two backends are supported: any OpenAI-compatible endpoint (`"openai"`)
//! and a local Ollama instance (`"ollama"`). The gateway owns the retry
//! policy and the fallback chain:
//!
//! - Transport errors and HTTP 5xx are retried up to `max_retry_attempts`
//!   with the configured delay policy (fixed, linear, exponential-backoff).
//! - HTTP 4xx fails immediately, except 429 which is retried and whose
//!   `Retry-After` is honored as a minimum delay.
//! - After the primary exhausts its retries, each fallback provider is
//!   tried exactly once, in order.
//!
//! Embedding requests additionally pass through a minimum-interval gate
//! (token bucket of one) when `embedding_min_interval_ms` is set.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{AiConfig, AiProviderConfig, RetryPolicyKind};
use crate::error::{HarnessError, Result};

/// Outcome of a single provider HTTP call, before retry policy is applied.
#[derive(Debug)]
pub struct ProviderCallError {
    pub message: String,
    pub retryable: bool,
    /// Server-requested minimum delay (HTTP 429 `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl ProviderCallError {
    fn transport(e: reqwest::Error) -> Self {
        Self {
            message: e.to_string(),
            retryable: true,
            retry_after: None,
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }
}

/// Uniform interface over chat-completion and embedding backends.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;
    fn default_system_message(&self) -> Option<&str>;

    /// One user turn plus optional system message and conversation history.
    async fn generate_text(
        &self,
        system: Option<&str>,
        history: Option<&str>,
        prompt: &str,
    ) -> std::result::Result<String, ProviderCallError>;

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderCallError>;
}

/// Map an HTTP error response to a provider error under the retry rules.
async fn classify_response(
    provider: &str,
    response: reqwest::Response,
) -> std::result::Result<serde_json::Value, ProviderCallError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| ProviderCallError::fatal(format!("{provider}: invalid JSON: {e}")));
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response.text().await.unwrap_or_default();
    let message = format!("{provider} API error {status}: {body}");

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(ProviderCallError {
            message,
            retryable: true,
            retry_after,
        })
    } else {
        Err(ProviderCallError::fatal(message))
    }
}

// ============ OpenAI-compatible provider ============

/// Chat + embeddings against an OpenAI-compatible HTTP API.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
    system_message: Option<String>,
}

impl OpenAiProvider {
    pub fn new(config: &AiProviderConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                HarnessError::validation(format!("environment variable {var} not set"))
            })?),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            api_key,
            system_message: config.system_message.clone(),
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn default_system_message(&self) -> Option<&str> {
        self.system_message.as_deref()
    }

    async fn generate_text(
        &self,
        system: Option<&str>,
        history: Option<&str>,
        prompt: &str,
    ) -> std::result::Result<String, ProviderCallError> {
        let mut messages = Vec::new();
        if let Some(system) = system.or(self.system_message.as_deref()) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        if let Some(history) = history {
            messages.push(json!({
                "role": "system",
                "content": format!("Conversation so far:\n{history}"),
            }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let body = json!({ "model": self.model, "messages": messages });
        let response = self
            .request("/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(ProviderCallError::transport)?;

        let value = classify_response("openai", response).await?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderCallError::fatal("openai: response missing message content"))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderCallError> {
        let body = json!({ "model": self.embedding_model, "input": texts });
        let response = self
            .request("/embeddings")
            .json(&body)
            .send()
            .await
            .map_err(ProviderCallError::transport)?;

        let value = classify_response("openai", response).await?;
        let data = value["data"]
            .as_array()
            .ok_or_else(|| ProviderCallError::fatal("openai: response missing data array"))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let vector = item["embedding"]
                .as_array()
                .ok_or_else(|| ProviderCallError::fatal("openai: item missing embedding"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            embeddings.push(vector);
        }
        Ok(embeddings)
    }
}

// ============ Ollama provider ============

/// Chat + embeddings against a local Ollama instance.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
    system_message: Option<String>,
}

impl OllamaProvider {
    pub fn new(config: &AiProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            system_message: config.system_message.clone(),
        })
    }
}

#[async_trait]
impl AiProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn default_system_message(&self) -> Option<&str> {
        self.system_message.as_deref()
    }

    async fn generate_text(
        &self,
        system: Option<&str>,
        history: Option<&str>,
        prompt: &str,
    ) -> std::result::Result<String, ProviderCallError> {
        let mut messages = Vec::new();
        if let Some(system) = system.or(self.system_message.as_deref()) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        if let Some(history) = history {
            messages.push(json!({
                "role": "system",
                "content": format!("Conversation so far:\n{history}"),
            }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let body = json!({ "model": self.model, "messages": messages, "stream": false });
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(ProviderCallError::transport)?;

        let value = classify_response("ollama", response).await?;
        value["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderCallError::fatal("ollama: response missing message content"))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderCallError> {
        let body = json!({ "model": self.embedding_model, "input": texts });
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(ProviderCallError::transport)?;

        let value = classify_response("ollama", response).await?;
        let data = value["embeddings"]
            .as_array()
            .ok_or_else(|| ProviderCallError::fatal("ollama: response missing embeddings"))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let vector = item
                .as_array()
                .ok_or_else(|| ProviderCallError::fatal("ollama: embedding is not an array"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            embeddings.push(vector);
        }
        Ok(embeddings)
    }
}

// ============ Retry settings ============

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub policy: RetryPolicyKind,
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.policy {
            RetryPolicyKind::Fixed => self.base_delay,
            RetryPolicyKind::Linear => self.base_delay * attempt,
            RetryPolicyKind::ExponentialBackoff => {
                self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
            }
        }
    }
}

// ============ Gateway ============

fn create_provider(config: &AiProviderConfig) -> Result<Box<dyn AiProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        other => Err(HarnessError::validation(format!(
            "Unknown AI provider: {other}"
        ))),
    }
}

/// Facade over the primary provider and its fallbacks.
///
/// Stateless except for the embedding rate gate.
pub struct AiGateway {
    primary: Box<dyn AiProvider>,
    fallbacks: Vec<Box<dyn AiProvider>>,
    enable_fallbacks: bool,
    retry: RetrySettings,
    embed_min_interval: Duration,
    embedding_batch_size: usize,
    last_embed_at: Mutex<Option<Instant>>,
}

impl AiGateway {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let primary = create_provider(&config.primary)?;
        let fallbacks = config
            .fallback
            .iter()
            .map(create_provider)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            primary,
            fallbacks,
            enable_fallbacks: config.enable_fallback_providers,
            retry: RetrySettings {
                max_attempts: config.max_retry_attempts.max(1),
                base_delay: Duration::from_millis(config.retry_delay_ms),
                policy: config.retry_policy,
            },
            embed_min_interval: Duration::from_millis(config.primary.embedding_min_interval_ms),
            embedding_batch_size: config.primary.embedding_batch_size.max(1),
            last_embed_at: Mutex::new(None),
        })
    }

    pub fn provider_name(&self) -> &str {
        self.primary.name()
    }

    pub fn model_name(&self) -> &str {
        self.primary.model_name()
    }

    pub fn embedding_batch_size(&self) -> usize {
        self.embedding_batch_size
    }

    /// Generate an answer for one user turn.
    pub async fn generate_text(
        &self,
        system: Option<&str>,
        history: Option<&str>,
        prompt: &str,
    ) -> Result<String> {
        let mut last_err: Option<ProviderCallError> = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                self.sleep_before_retry(attempt, last_err.as_ref()).await;
            }
            match self.primary.generate_text(system, history, prompt).await {
                Ok(answer) => return Ok(answer),
                Err(e) if e.retryable => {
                    debug!(attempt, error = %e.message, "provider call failed, will retry");
                    last_err = Some(e);
                }
                Err(e) => return Err(HarnessError::Provider(e.message)),
            }
        }

        if self.enable_fallbacks {
            for fallback in &self.fallbacks {
                warn!(provider = fallback.name(), "primary exhausted, trying fallback");
                match fallback.generate_text(system, history, prompt).await {
                    Ok(answer) => return Ok(answer),
                    Err(e) => last_err = Some(e),
                }
            }
        }

        Err(HarnessError::Provider(
            last_err
                .map(|e| e.message)
                .unwrap_or_else(|| "provider call failed".to_string()),
        ))
    }

    /// Embed one text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let batch = self.embed_batch(&texts).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::provider("empty embedding response"))
    }

    /// Embed a batch of texts, in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err: Option<ProviderCallError> = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                self.sleep_before_retry(attempt, last_err.as_ref()).await;
            }
            self.wait_for_embed_slot().await;
            match self.primary.embed_batch(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.retryable => {
                    debug!(attempt, error = %e.message, "embedding call failed, will retry");
                    last_err = Some(e);
                }
                Err(e) => return Err(HarnessError::Provider(e.message)),
            }
        }

        if self.enable_fallbacks {
            for fallback in &self.fallbacks {
                warn!(provider = fallback.name(), "primary exhausted, trying fallback");
                match fallback.embed_batch(texts).await {
                    Ok(vectors) => return Ok(vectors),
                    Err(e) => last_err = Some(e),
                }
            }
        }

        Err(HarnessError::Provider(
            last_err
                .map(|e| e.message)
                .unwrap_or_else(|| "embedding call failed".to_string()),
        ))
    }

    async fn sleep_before_retry(&self, attempt: u32, last_err: Option<&ProviderCallError>) {
        let mut delay = self.retry.delay_for(attempt);
        if let Some(requested) = last_err.and_then(|e| e.retry_after) {
            delay = delay.max(requested);
        }
        tokio::time::sleep(delay).await;
    }

    /// Token bucket of one: enforce the minimum spacing between embedding
    /// requests.
    async fn wait_for_embed_slot(&self) {
        if self.embed_min_interval.is_zero() {
            return;
        }
        let mut last = self.last_embed_at.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.embed_min_interval {
                tokio::time::sleep(self.embed_min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicyKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_config(base_url: &str) -> AiProviderConfig {
        AiProviderConfig {
            provider: "openai".into(),
            model: "test-model".into(),
            embedding_model: "test-embed".into(),
            base_url: Some(base_url.to_string()),
            api_key_env: None,
            system_message: None,
            timeout_secs: 5,
            embedding_min_interval_ms: 0,
            embedding_batch_size: 8,
        }
    }

    fn gateway_config(base_url: &str, retries: u32, delay_ms: u64) -> AiConfig {
        AiConfig {
            primary: provider_config(base_url),
            max_retry_attempts: retries,
            retry_delay_ms: delay_ms,
            retry_policy: RetryPolicyKind::ExponentialBackoff,
            enable_fallback_providers: false,
            fallback: vec![],
        }
    }

    fn chat_body(content: &str) -> serde_json::Value {
        json!({ "choices": [ { "message": { "role": "assistant", "content": content } } ] })
    }

    #[test]
    fn test_delay_policies() {
        let base = Duration::from_millis(100);
        let fixed = RetrySettings {
            max_attempts: 3,
            base_delay: base,
            policy: RetryPolicyKind::Fixed,
        };
        assert_eq!(fixed.delay_for(1), base);
        assert_eq!(fixed.delay_for(3), base);

        let linear = RetrySettings {
            policy: RetryPolicyKind::Linear,
            ..fixed.clone()
        };
        assert_eq!(linear.delay_for(2), base * 2);
        assert_eq!(linear.delay_for(3), base * 3);

        let expo = RetrySettings {
            policy: RetryPolicyKind::ExponentialBackoff,
            ..fixed
        };
        assert_eq!(expo.delay_for(1), base);
        assert_eq!(expo.delay_for(2), base * 2);
        assert_eq!(expo.delay_for(3), base * 4);
    }

    #[tokio::test]
    async fn test_retry_until_success_with_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("recovered")))
            .mount(&server)
            .await;

        let gateway = AiGateway::new(&gateway_config(&server.uri(), 3, 100)).unwrap();
        let started = std::time::Instant::now();
        let answer = gateway.generate_text(None, None, "hi").await.unwrap();
        assert_eq!(answer, "recovered");
        // Exponential backoff: 100ms then 200ms between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = AiGateway::new(&gateway_config(&server.uri(), 3, 10)).unwrap();
        let err = gateway.generate_text(None, None, "hi").await.unwrap_err();
        assert!(matches!(err, HarnessError::Provider(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("ok")))
            .mount(&server)
            .await;

        let gateway = AiGateway::new(&gateway_config(&server.uri(), 2, 10)).unwrap();
        let started = std::time::Instant::now();
        let answer = gateway.generate_text(None, None, "hi").await.unwrap();
        assert_eq!(answer, "ok");
        // The Retry-After floor (1s) dominates the 10ms policy delay.
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fallback_called_once_after_primary_exhausted() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&primary)
            .await;

        let fallback = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("from fallback")))
            .expect(1)
            .mount(&fallback)
            .await;

        let mut config = gateway_config(&primary.uri(), 3, 1);
        config.enable_fallback_providers = true;
        config.fallback = vec![provider_config(&fallback.uri())];

        let gateway = AiGateway::new(&config).unwrap();
        let answer = gateway.generate_text(None, None, "hi").await.unwrap();
        assert_eq!(answer, "from fallback");
    }

    #[tokio::test]
    async fn test_embed_batch_parses_vectors_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "index": 0, "embedding": [0.1, 0.2] },
                    { "index": 1, "embedding": [0.3, 0.4] },
                ]
            })))
            .mount(&server)
            .await;

        let gateway = AiGateway::new(&gateway_config(&server.uri(), 1, 1)).unwrap();
        let vectors = gateway
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_embedding_min_interval_spacing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [ { "index": 0, "embedding": [1.0] } ]
            })))
            .mount(&server)
            .await;

        let mut config = gateway_config(&server.uri(), 1, 1);
        config.primary.embedding_min_interval_ms = 150;
        let gateway = AiGateway::new(&config).unwrap();

        let started = std::time::Instant::now();
        gateway.embed("one").await.unwrap();
        gateway.embed("two").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
