use anyhow::{anyhow, Context, Result};
use reqwest::{header::HeaderValue, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use tokio::time::{sleep, Duration};

use paperchat_core::{ConversationTurn, Role};

mod models;
mod stream;

pub use models::{default_models, find_model, ModelSpec, DEFAULT_MODEL_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Cerebras,
    OpenAi,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Cerebras => "cerebras",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "cerebras" => Some(LlmProvider::Cerebras),
            "openai" => Some(LlmProvider::OpenAi),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub turns: Vec<ConversationTurn>,
    /// Ask the provider for a JSON object instead of prose.
    pub json_output: bool,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: Option<String>,
}

impl ChatCompletion {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    Cerebras(HttpConfig),
    OpenAi(HttpConfig),
    Local,
}

#[derive(Clone)]
struct HttpConfig {
    api_key: String,
    base_url: String,
}

const MAX_RETRIES: usize = 6;

impl ChatClient {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        let http = Client::new();
        let config = match provider {
            LlmProvider::Cerebras => ProviderConfig::Cerebras(HttpConfig {
                api_key: read_api_key("CEREBRAS_API_KEY")?,
                base_url: env::var("CEREBRAS_BASE_URL")
                    .unwrap_or_else(|_| "https://api.cerebras.ai/v1".to_string()),
            }),
            LlmProvider::OpenAi => ProviderConfig::OpenAi(HttpConfig {
                api_key: read_api_key("OPENAI_API_KEY")?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        Ok(Self {
            http,
            provider,
            model,
            config,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One non-streaming completion. Rate limits are retried with backoff,
    /// honoring `Retry-After` when the provider sends one.
    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatCompletion> {
        match &self.config {
            ProviderConfig::Cerebras(cfg) | ProviderConfig::OpenAi(cfg) => {
                self.chat_http(cfg, req).await
            }
            ProviderConfig::Local => Ok(local::complete(req)),
        }
    }

    async fn chat_http(&self, cfg: &HttpConfig, req: &ChatRequest) -> Result<ChatCompletion> {
        let url = format!(
            "{}/chat/completions",
            cfg.base_url.trim_end_matches('/')
        );
        let payload = self.build_payload(req, false);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match self
                .http
                .post(&url)
                .bearer_auth(&cfg.api_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt > MAX_RETRIES {
                        return Err(err).with_context(|| {
                            format!("{} request failed", self.provider.as_str())
                        });
                    }
                    sleep(backoff_delay(attempt, None)).await;
                    continue;
                }
            };
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt > MAX_RETRIES {
                    return Err(anyhow!(
                        "{} rate limited after {MAX_RETRIES} retries",
                        self.provider.as_str()
                    ));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                sleep(wait).await;
                continue;
            }
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(anyhow!(
                    "{} returned error (status {status}): {body}",
                    self.provider.as_str()
                ));
            }
            let value: Value = serde_json::from_str(&body)
                .with_context(|| format!("failed to decode {} response", self.provider.as_str()))?;
            return parse_completion(&value);
        }
    }

    fn build_payload(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for turn in &req.turns {
            messages.push(json!({ "role": role_name(turn.role), "content": turn.content }));
        }
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        if req.json_output {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        if stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({ "include_usage": true });
        }
        payload
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

fn parse_completion(value: &Value) -> Result<ChatCompletion> {
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
        .ok_or_else(|| anyhow!("missing choices in completion response"))?;
    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("missing text in completion response"))?
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .map(|r| r.to_string());
    let usage: Usage = value
        .get("usage")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    Ok(ChatCompletion {
        content,
        prompt_tokens: usage.prompt_tokens.unwrap_or(0),
        completion_tokens: usage.completion_tokens.unwrap_or(0),
        finish_reason,
    })
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(value) = retry_after {
        if let Ok(text) = value.to_str() {
            if let Ok(secs) = text.parse::<u64>() {
                return Duration::from_secs(secs.max(1));
            }
        }
    }
    let capped = attempt.min(6) as u32;
    Duration::from_secs(1u64 << capped)
}

fn read_api_key(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!(format!("{var} is not set")))?;
    validate_api_key(var, &value)?;
    Ok(value)
}

fn validate_api_key(var: &str, value: &str) -> Result<()> {
    if var.contains("OPENAI") && !value.starts_with("sk-") {
        return Err(anyhow!(format!(
            "{} must start with 'sk-' (see https://platform.openai.com/)",
            var
        )));
    }
    if var.contains("CEREBRAS") && value.trim().is_empty() {
        return Err(anyhow!(format!("{} must not be empty", var)));
    }
    Ok(())
}

#[derive(Default, Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

pub(crate) mod local {
    use super::{ChatCompletion, ChatRequest};
    use paperchat_core::most_recent_user_message;

    /// Deterministic offline completion. Shaped after the question styles
    /// the rag crate actually sends, so suggestion parsing and streaming can
    /// be exercised without a provider.
    pub fn complete(req: &ChatRequest) -> ChatCompletion {
        let user = most_recent_user_message(&req.turns)
            .map(|turn| turn.content.as_str())
            .unwrap_or_default();
        let content = if req.json_output {
            serde_json::json!({
                "suggestions": [
                    {
                        "title": "What are the main findings",
                        "label": "of this paper?",
                        "action": "What are the main findings of this paper?"
                    },
                    {
                        "title": "Explain the methodology",
                        "label": "used in this research",
                        "action": "Can you explain the methodology used in this research paper?"
                    },
                    {
                        "title": "What are the limitations",
                        "label": "of this approach?",
                        "action": "What limitations does this approach have?"
                    }
                ]
            })
            .to_string()
        } else {
            summarize_text(user, 40)
        };
        ChatCompletion {
            content,
            prompt_tokens: 0,
            completion_tokens: 0,
            finish_reason: Some("stop".to_string()),
        }
    }

    pub fn summarize_text(text: &str, max_words: usize) -> String {
        if max_words == 0 {
            return String::new();
        }
        let cleaned = text
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<&str>>()
            .join(" ");
        cleaned
            .split_whitespace()
            .take(max_words)
            .collect::<Vec<&str>>()
            .join(" ")
    }
}
