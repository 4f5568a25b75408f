use std::env;
use std::future::Future;

use serde::Deserialize;
use serde_json::json;

use paperchat_core::{
    strip_control_chars, ChatError, HashEmbedder, HashEmbedderConfig, Result, RetryPolicy,
    EMBEDDING_DIM,
};

/// Text-to-vector client. One value, enum-dispatched backends: the HTTP
/// backend for real corpora, the hash backend for offline work and tests.
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
    policy: RetryPolicy,
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
}

impl EmbeddingClient {
    /// `EMBEDDING_PROVIDER=openai` selects the HTTP backend (model from
    /// `EMBEDDING_MODEL`); anything else falls back to the hash embedder.
    pub fn from_env() -> Result<Self> {
        match env::var("EMBEDDING_PROVIDER")
            .unwrap_or_else(|_| "hash".to_string())
            .to_lowercase()
            .as_str()
        {
            "openai" => {
                let model = env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string());
                Ok(Self {
                    backend: EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(&model)?),
                    policy: RetryPolicy::default(),
                })
            }
            _ => {
                let dims = env::var("HASH_EMBED_DIMENSIONS")
                    .ok()
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(EMBEDDING_DIM);
                Ok(Self {
                    backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                        dimensions: dims,
                        seed: 1337,
                    })),
                    policy: RetryPolicy::default(),
                })
            }
        }
    }

    pub fn hash() -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig::default())),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_backend(backend: EmbeddingBackend) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut output = self.embed_batch(&[text.to_string()]).await?;
        output
            .pop()
            .ok_or_else(|| ChatError::Embedding("empty embedding response".to_string()))
    }

    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let cleaned: Vec<String> = inputs
            .iter()
            .map(|text| strip_control_chars(text))
            .collect();
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => Ok(cleaned
                .iter()
                .map(|text| embedder.embed_text(text))
                .collect()),
            EmbeddingBackend::OpenAi(client) => {
                with_retry(&self.policy, || client.embed_batch(&cleaned)).await
            }
        }
    }
}

/// Run `op` under the retry policy: up to `max_attempts` tries, sleeping the
/// policy's delay between failures, surfacing the last error untouched.
pub(crate) async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !policy.should_retry(attempt) {
                    return Err(err);
                }
                tracing::warn!(attempt, error = %err, "embedding attempt failed, retrying");
                tokio::time::sleep(policy.delay(attempt)).await;
            }
        }
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(model: &str) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            ChatError::Embedding("OPENAI_API_KEY is required for openai embeddings".to_string())
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            model: model.to_string(),
            api_key,
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        })
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "input": inputs,
            "dimensions": EMBEDDING_DIM,
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ChatError::Embedding(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Embedding(format!(
                "openai embeddings request failed (status {status}): {body}"
            )));
        }
        let parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|err| ChatError::Embedding(err.to_string()))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&fast_policy(3), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ChatError::Embedding("upstream unreachable".to_string()))
            }
        })
        .await;
        assert!(matches!(result, Err(ChatError::Embedding(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&fast_policy(3), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ChatError::Embedding("transient".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hash_backend_strips_control_characters() {
        let client = EmbeddingClient::hash();
        let dirty = client.embed("atten\u{0}tion mech\u{1}anism").await.unwrap();
        let clean = client.embed("attention mechanism").await.unwrap();
        assert_eq!(dirty, clean);
    }

    #[tokio::test]
    async fn hash_backend_produces_fixed_dimension() {
        let client = EmbeddingClient::hash();
        let vector = client.embed("a query").await.unwrap();
        assert_eq!(vector.len(), EMBEDDING_DIM);
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let client = EmbeddingClient::hash();
        assert!(client.embed_batch(&[]).await.unwrap().is_empty());
    }
}
