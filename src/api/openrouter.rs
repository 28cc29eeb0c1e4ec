use crate::config::LlmConfig;
use crate::{logi, logw, snippet};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{Duration, Instant};

const MAX_UPSTREAM_BODY_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// Per-call bookkeeping reported back to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallMeta {
    pub status: u16,
    pub tries: u32,
    pub latency_ms: u64,
    pub model: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("Missing OPENROUTER_API_KEY.")]
    ServerConfig,
    #[error("{status} from OpenRouter")]
    Upstream { status: u16, body: Value },
    #[error("Model request timed out.")]
    Timeout,
    #[error("{0}")]
    Request(String),
    #[error("No content returned from model.")]
    BadResponse { body: Value },
    #[error("{0}")]
    Server(String),
}

impl CompletionError {
    pub fn code(&self) -> &'static str {
        match self {
            CompletionError::ServerConfig => "SERVER_CONFIG",
            CompletionError::Upstream { .. } => "UPSTREAM_ERROR",
            CompletionError::Timeout => "UPSTREAM_TIMEOUT",
            CompletionError::Request(_) => "UPSTREAM_REQUEST_ERROR",
            CompletionError::BadResponse { .. } => "BAD_RESPONSE",
            CompletionError::Server(_) => "SERVER_ERROR",
        }
    }

    /// Client-facing shape. Upstream bodies are only exposed in debug mode.
    pub fn to_json(&self, debug: bool) -> Value {
        let mut out = json!({ "code": self.code(), "message": self.to_string() });
        let upstream = match self {
            CompletionError::Upstream { status, body } => {
                out["status"] = json!(status);
                Some(body)
            }
            CompletionError::BadResponse { body } => Some(body),
            _ => None,
        };
        if let Some(body) = upstream {
            out["upstream"] = if debug {
                body.clone()
            } else {
                json!({ "hint": "Enable DEBUG to see upstream body" })
            };
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub result: Result<String, CompletionError>,
    pub meta: CallMeta,
}

#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Completion;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPair {
    pub primary: String,
    pub fallback: String,
}

impl ModelPair {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            primary: cfg.model_primary.clone(),
            fallback: cfg.model_fallback.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub meta: CallMeta,
}

/// Both models failed. `meta` describes the fallback call.
#[derive(Debug, Clone)]
pub struct GenerationFailure {
    pub meta: CallMeta,
    pub primary: CompletionError,
    pub fallback: CompletionError,
}

impl GenerationFailure {
    pub fn to_json(&self, debug: bool) -> Value {
        json!({
            "primary": self.primary.to_json(debug),
            "fallback": self.fallback.to_json(debug),
        })
    }
}

/// Calls the primary model and, if it fails for any reason, the fallback
/// model once with the same messages.
pub async fn generate_with_fallback(
    client: &dyn ChatCompletion,
    models: &ModelPair,
    messages: &[ChatMessage],
) -> std::result::Result<Generation, GenerationFailure> {
    let first = client.complete(&models.primary, messages).await;
    let primary_err = match first.result {
        Ok(text) => return Ok(Generation { text, meta: first.meta }),
        Err(e) => e,
    };

    logw(format!(
        "Primary model {} failed ({}: {}); falling back to {}",
        models.primary,
        primary_err.code(),
        primary_err,
        models.fallback
    ));

    let second = client.complete(&models.fallback, messages).await;
    match second.result {
        Ok(text) => Ok(Generation { text, meta: second.meta }),
        Err(fallback_err) => Err(GenerationFailure {
            meta: second.meta,
            primary: primary_err,
            fallback: fallback_err,
        }),
    }
}

pub struct OpenRouterClient {
    client: Client,
    cfg: LlmConfig,
}

impl OpenRouterClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .read_timeout(cfg.read_timeout)
            .build()
            .context("failed to build OpenRouter HTTP client")?;
        Ok(Self { client, cfg })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.cfg.base_url)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.cfg.retry_backoff * attempt
    }

    /// One HTTP round trip. `Err((error, retryable))` on failure.
    async fn attempt(
        &self,
        body: &Value,
        last_status: &mut u16,
    ) -> std::result::Result<String, (CompletionError, bool)> {
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.cfg.api_key)
            .header("Referer", &self.cfg.app_public_url)
            .header("X-Title", &self.cfg.app_title)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status().as_u16();
        *last_status = status;
        let raw = resp.text().await.map_err(|e| classify_transport(&e))?;

        if status >= 400 {
            let upstream = serde_json::from_str::<Value>(&raw)
                .unwrap_or_else(|_| json!({ "raw": snippet(&raw, MAX_UPSTREAM_BODY_CHARS) }));
            let retryable = self.cfg.retry_status.contains(&status);
            return Err((CompletionError::Upstream { status, body: upstream }, retryable));
        }

        let data: Value = serde_json::from_str(&raw).map_err(|e| {
            (
                CompletionError::Server(snippet(&format!("invalid JSON from OpenRouter: {e}"), 300)),
                false,
            )
        })?;

        match extract_content(&data) {
            Some(text) => Ok(text),
            None => Err((CompletionError::BadResponse { body: data }, false)),
        }
    }
}

fn classify_transport(e: &reqwest::Error) -> (CompletionError, bool) {
    if e.is_timeout() {
        (CompletionError::Timeout, true)
    } else {
        (CompletionError::Request(snippet(&e.to_string(), 300)), true)
    }
}

fn extract_content(data: &Value) -> Option<String> {
    let content = data
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()?;
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

#[async_trait]
impl ChatCompletion for OpenRouterClient {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Completion {
        if self.cfg.api_key.is_empty() {
            return Completion {
                result: Err(CompletionError::ServerConfig),
                meta: CallMeta { model: model.to_string(), ..CallMeta::default() },
            };
        }

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.cfg.temperature,
            "top_p": self.cfg.top_p,
            "max_tokens": self.cfg.max_tokens,
            "stop": ["</script>"],
        });

        let start = Instant::now();
        let max_attempts = self.cfg.max_retries + 1;
        let mut last_status = 0u16;
        let mut tries = 0u32;

        let result = loop {
            tries += 1;
            match self.attempt(&body, &mut last_status).await {
                Ok(text) => break Ok(text),
                Err((err, retryable)) if retryable && tries < max_attempts => {
                    logw(format!(
                        "OpenRouter attempt {}/{} for {} failed: {}; retrying",
                        tries,
                        max_attempts,
                        model,
                        err.code()
                    ));
                    tokio::time::sleep(self.backoff(tries)).await;
                }
                Err((err, _)) => break Err(err),
            }
        };

        let meta = CallMeta {
            status: last_status,
            tries,
            latency_ms: start.elapsed().as_millis() as u64,
            model: model.to_string(),
        };
        if result.is_ok() {
            logi(format!(
                "OpenRouter {} answered in {} ms after {} tries",
                model, meta.latency_ms, meta.tries
            ));
        }
        Completion { result, meta }
    }
}
