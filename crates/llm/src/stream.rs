//! Streaming completions over the provider's SSE wire format.
//!
//! The provider emits `data: {json}` frames terminated by `data: [DONE]`.
//! Text deltas are forwarded through an mpsc channel as they decode; the
//! assembled completion (with usage, which arrives in the final frames) is
//! returned to the caller once the stream ends. A dropped receiver stops
//! the read loop, which releases the upstream connection.

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{ChatClient, ChatCompletion, ChatRequest, ProviderConfig};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseFrame {
    Delta(String),
    FinishReason(String),
    Usage { prompt: u32, completion: u32 },
    Done,
}

impl ChatClient {
    /// Stream one completion, forwarding text deltas through `tx`.
    ///
    /// Returns the fully assembled completion. If the receiver goes away
    /// mid-stream the partial completion assembled so far is returned; the
    /// caller decides whether that still matters.
    pub async fn stream_chat(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatCompletion> {
        match &self.config {
            ProviderConfig::Cerebras(cfg) | ProviderConfig::OpenAi(cfg) => {
                self.stream_http(cfg, req, tx).await
            }
            ProviderConfig::Local => {
                let completion = crate::local::complete(req);
                for word in completion.content.split_inclusive(' ') {
                    if tx.send(word.to_string()).await.is_err() {
                        break;
                    }
                }
                Ok(completion)
            }
        }
    }

    async fn stream_http(
        &self,
        cfg: &crate::HttpConfig,
        req: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatCompletion> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let payload = self.build_payload(req, true);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&cfg.api_key)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{} request failed", self.provider.as_str()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "{} returned error (status {status}): {body}",
                self.provider.as_str()
            ));
        }

        let mut content = String::new();
        let mut prompt_tokens = 0u32;
        let mut completion_tokens = 0u32;
        let mut finish_reason = None;
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| "error reading completion stream")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].to_string();
                buffer.drain(..=line_end);
                for frame in parse_sse_line(line.trim_end()) {
                    match frame {
                        SseFrame::Delta(delta) => {
                            content.push_str(&delta);
                            if tx.send(delta).await.is_err() {
                                // Receiver gone: the caller was cancelled.
                                break 'read;
                            }
                        }
                        SseFrame::FinishReason(reason) => finish_reason = Some(reason),
                        SseFrame::Usage { prompt, completion } => {
                            prompt_tokens = prompt;
                            completion_tokens = completion;
                        }
                        SseFrame::Done => break 'read,
                    }
                }
            }
        }

        Ok(ChatCompletion {
            content,
            prompt_tokens,
            completion_tokens,
            finish_reason,
        })
    }
}

/// Decode one line of the SSE body. Non-data lines (comments, event names,
/// blanks) produce nothing.
pub(crate) fn parse_sse_line(line: &str) -> Vec<SseFrame> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Vec::new();
    };
    if data.is_empty() {
        return Vec::new();
    }
    if data == "[DONE]" {
        return vec![SseFrame::Done];
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        tracing::debug!(line = %data, "skipping undecodable stream frame");
        return Vec::new();
    };
    let mut frames = Vec::new();
    if let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
    {
        if let Some(delta) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            if !delta.is_empty() {
                frames.push(SseFrame::Delta(delta.to_string()));
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            frames.push(SseFrame::FinishReason(reason.to_string()));
        }
    }
    if let Some(usage) = value.get("usage") {
        if !usage.is_null() {
            frames.push(SseFrame::Usage {
                prompt: usage
                    .get("prompt_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                completion: usage
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
            });
        }
    }
    frames
}
