//! LLM provider gateway.
//!
//! One client per process, pointed at an OpenRouter-compatible chat
//! endpoint. The gateway never retries on success; on a provider-side
//! failure it retries exactly once against the configured fallback model,
//! and only when the caller did not pin a model.

use std::pin::Pin;
use std::str;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autopilot_types::EngineConfig;

const ATTRIBUTION_REFERER: &str = "https://autopilot.frumu.ai";
const ATTRIBUTION_TITLE: &str = "Autopilot";

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("provider rate limited")]
    ProviderRateLimited,
    #[error("unknown or unavailable model `{0}`")]
    InvalidModel(String),
    #[error("prompt exceeds the provider's context window")]
    ContentTooLong,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion request. `model: None` lets the gateway pick the
/// default and enables the fallback retry.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub history: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub usage: TokenUsage,
}

/// Streaming fragments; a finite sequence terminated by `Done`. Not
/// restartable — the consumer drains it once.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamChunk>> + Send>>;

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> GatewayResult<ChatResponse>;
    async fn stream(&self, request: ChatRequest, cancel: CancellationToken)
        -> GatewayResult<ChunkStream>;
}

/// Production gateway speaking the OpenRouter chat protocol.
pub struct OpenRouterGateway {
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    fallback_model: String,
    temperature: f32,
    max_tokens: u32,
    client: Client,
}

impl OpenRouterGateway {
    pub fn new(config: &EngineConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.provider_base_url.trim_end_matches('/').to_string(),
            api_key: config.provider_api_key.clone(),
            default_model: config.default_model.clone(),
            fallback_model: config.fallback_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        }
    }

    fn build_messages(&self, request: &ChatRequest) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.history {
            messages.push(json!({"role": message.role, "content": message.content}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));
        messages
    }

    fn build_body(&self, request: &ChatRequest, model: &str, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": model,
            "messages": self.build_messages(request),
            "temperature": request.temperature.unwrap_or(self.temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
        });
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn request_builder(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(url)
            .header("HTTP-Referer", ATTRIBUTION_REFERER)
            .header("X-Title", ATTRIBUTION_TITLE)
            .json(body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }

    async fn chat_once(&self, request: &ChatRequest, model: &str) -> GatewayResult<ChatResponse> {
        let body = self.build_body(request, model, false);
        info!(model, "provider_request");

        let response = self
            .request_builder(&body)
            .send()
            .await
            .map_err(|err| GatewayError::ProviderUnavailable(err.to_string()))?;
        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| GatewayError::ProviderUnavailable(err.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &value, model));
        }
        if let Some(detail) = extract_error(&value) {
            return Err(GatewayError::ProviderUnavailable(detail));
        }

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if content.is_empty() {
            return Err(GatewayError::ProviderUnavailable(format!(
                "provider returned no completion content for model `{model}`"
            )));
        }

        let parsed = ChatResponse {
            id: value["id"].as_str().unwrap_or_default().to_string(),
            model: value["model"].as_str().unwrap_or(model).to_string(),
            content,
            usage: extract_usage(&value).unwrap_or_default(),
        };
        info!(
            model = %parsed.model,
            tokens_used = parsed.usage.total_tokens,
            "provider_response"
        );
        Ok(parsed)
    }
}

#[async_trait]
impl LlmGateway for OpenRouterGateway {
    async fn chat(&self, request: ChatRequest) -> GatewayResult<ChatResponse> {
        let pinned = request.model.as_deref().map(str::trim).filter(|m| !m.is_empty());
        let model = pinned.unwrap_or(self.default_model.as_str());

        match self.chat_once(&request, model).await {
            Ok(response) => Ok(response),
            // One retry against the fallback model, only when the caller did
            // not pin a model and a different fallback exists.
            Err(err) if pinned.is_none() && self.fallback_model != self.default_model => {
                warn!(error = %err, fallback = %self.fallback_model, "trying_fallback_model");
                self.chat_once(&request, self.fallback_model.as_str()).await
            }
            Err(err) => Err(err),
        }
    }

    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> GatewayResult<ChunkStream> {
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let body = self.build_body(&request, &model, true);

        let response = self
            .request_builder(&body)
            .send()
            .await
            .map_err(|err| GatewayError::ProviderUnavailable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let value: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
            return Err(classify_status(status, &value, &model));
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut done = false;
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    done = true;
                    break;
                }

                let chunk = chunk.map_err(|err| {
                    GatewayError::ProviderUnavailable(err.to_string())
                })?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            yield StreamChunk::Done {
                                finish_reason: "stop".to_string(),
                                usage: None,
                            };
                            done = true;
                            continue;
                        }

                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };
                        if let Some(detail) = extract_error(&value) {
                            Err(GatewayError::ProviderUnavailable(detail))?;
                        }

                        let choices = value
                            .get("choices")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        for choice in choices {
                            let delta = choice.get("delta").cloned().unwrap_or_default();
                            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    yield StreamChunk::Text(text.to_string());
                                }
                            }
                            if let Some(reason) =
                                choice.get("finish_reason").and_then(|v| v.as_str())
                            {
                                if !reason.is_empty() {
                                    yield StreamChunk::Done {
                                        finish_reason: reason.to_string(),
                                        usage: extract_usage(&value),
                                    };
                                    done = true;
                                }
                            }
                        }
                    }
                }
            }
            if !done {
                yield StreamChunk::Done {
                    finish_reason: "stop".to_string(),
                    usage: None,
                };
            }
        };

        Ok(Box::pin(stream))
    }
}

fn classify_status(
    status: StatusCode,
    value: &serde_json::Value,
    model: &str,
) -> GatewayError {
    let detail = extract_error(value)
        .unwrap_or_else(|| format!("provider request failed with status {status}"));
    match status.as_u16() {
        429 => GatewayError::ProviderRateLimited,
        404 | 422 if detail.to_ascii_lowercase().contains("model") => {
            GatewayError::InvalidModel(model.to_string())
        }
        413 => GatewayError::ContentTooLong,
        400 if detail.to_ascii_lowercase().contains("context length")
            || detail.to_ascii_lowercase().contains("too long") =>
        {
            GatewayError::ContentTooLong
        }
        _ => GatewayError::ProviderUnavailable(detail),
    }
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}
