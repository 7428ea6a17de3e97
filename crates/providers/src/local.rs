//! Local model adapter.
//!
//! Talks to the on-device llama.cpp server over its OpenAI-compatible
//! endpoint. Key-less, tool-less, and used when the selector decides the
//! gateway is offline.
//!
//! Local-model contract:
//! - an empty message list returns a fixed greeting without a server call;
//! - earlier conversation turns are replayed silently — only the last
//!   non-system message produces a completion.

use serde_json::Value;

use hb_domain::config::ProviderConfig;
use hb_domain::error::{Error, Result};
use hb_domain::message::{ChatMessage, Role};
use hb_domain::stream::{BoxStream, StreamChunk, Usage};

use crate::traits::{ChatRequest, ChatResponse, LlmClient};
use crate::util::from_reqwest;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

/// Greeting returned for an empty conversation.
pub const LOCAL_GREETING: &str =
    "Hello! I'm running locally on this device. Cloud models are unavailable, \
     but I can still help with basic requests.";

pub struct LocalClient {
    id: String,
    base_url: String,
    default_model: String,
    client: reqwest::Client,
}

impl LocalClient {
    pub fn from_config(cfg: &ProviderConfig, timeout_ms: u64) -> Result<Self> {
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            id: cfg.id.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: cfg.default_model.clone(),
            client,
        })
    }

    /// Reduce a conversation to what the local model actually answers:
    /// the system prompt plus the last non-system message.
    fn effective_messages(messages: &[ChatMessage]) -> Vec<Value> {
        let mut wire = Vec::new();
        for msg in messages.iter().filter(|m| m.role == Role::System) {
            wire.push(serde_json::json!({
                "role": "system",
                "content": msg.content.extract_all_text(),
            }));
        }
        if let Some(last) = messages.iter().rev().find(|m| m.role != Role::System) {
            wire.push(serde_json::json!({
                "role": "user",
                "content": last.content.extract_all_text(),
            }));
        }
        wire
    }
}

#[async_trait::async_trait]
impl LlmClient for LocalClient {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        if req.messages.iter().all(|m| m.role == Role::System) {
            return Ok(ChatResponse {
                content: LOCAL_GREETING.to_string(),
                model: self.default_model.clone(),
                provider: self.id.clone(),
                usage: Some(Usage::default()),
                tool_calls: Vec::new(),
            });
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": Self::effective_messages(&req.messages),
            "temperature": req.temperature.unwrap_or(0.7),
            "max_tokens": req.max_tokens.unwrap_or(1024),
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = resp.status();
        let text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let json: Value = serde_json::from_str(&text)?;
        let content = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        Ok(ChatResponse {
            content,
            model: self.default_model.clone(),
            provider: self.id.clone(),
            usage: None,
            tool_calls: Vec::new(),
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        // The local server streams too, but a single buffered completion is
        // fine at local latencies.
        let resp = self.chat(req).await?;
        let stream = async_stream::stream! {
            yield Ok(StreamChunk::text(resp.content));
            yield Ok(StreamChunk::done());
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
