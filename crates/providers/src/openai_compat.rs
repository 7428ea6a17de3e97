//! OpenAI-compatible chat-completions adapter.
//!
//! Covers every provider speaking the `/chat/completions` dialect: OpenAI,
//! DeepSeek, and Gemini's OpenAI compatibility surface. The config supplies
//! the base URL; the adapter is otherwise identical across them.

use serde_json::Value;

use hb_domain::config::ProviderConfig;
use hb_domain::error::{Error, Result};
use hb_domain::message::{ChatMessage, ContentPart, MessageContent, Role, ToolCall};
use hb_domain::stream::{BoxStream, StreamChunk, Usage};

use crate::sse::{sse_chunk_stream, SseParse};
use crate::traits::{ChatRequest, ChatResponse, LlmClient};
use crate::util::{from_reqwest, resolve_api_key};

/// An LLM client for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiCompatClient {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn from_config(cfg: &ProviderConfig, timeout_ms: u64) -> Result<Self> {
        let api_key = resolve_api_key(cfg.api_key_env.as_deref())?;
        let base_url = cfg
            .base_url
            .clone()
            .ok_or_else(|| Error::Config(format!("provider '{}' needs base_url", cfg.id)))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            id: cfg.id.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.default_model.clone(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn message_to_wire(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::System => serde_json::json!({
            "role": "system",
            "content": msg.content.extract_all_text(),
        }),
        Role::User => match &msg.content {
            MessageContent::Text(t) => serde_json::json!({"role": "user", "content": t}),
            MessageContent::Parts(parts) => {
                let content: Vec<Value> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => {
                            Some(serde_json::json!({"type": "text", "text": text}))
                        }
                        ContentPart::Image { media_type, data } => Some(serde_json::json!({
                            "type": "image_url",
                            "image_url": {"url": format!("data:{media_type};base64,{data}")},
                        })),
                        _ => None,
                    })
                    .collect();
                serde_json::json!({"role": "user", "content": content})
            }
        },
        Role::Assistant => {
            let mut out = serde_json::json!({"role": "assistant"});
            match &msg.content {
                MessageContent::Text(t) => out["content"] = serde_json::json!(t),
                MessageContent::Parts(parts) => {
                    let text = msg.content.extract_all_text();
                    out["content"] = serde_json::json!(text);
                    let tool_calls: Vec<Value> = parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::ToolUse { id, name, input } => Some(serde_json::json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": input.to_string(),
                                }
                            })),
                            _ => None,
                        })
                        .collect();
                    if !tool_calls.is_empty() {
                        out["tool_calls"] = Value::Array(tool_calls);
                    }
                }
            }
            out
        }
        Role::Tool => {
            // One wire message per tool_result part.
            let (id, content) = match &msg.content {
                MessageContent::Parts(parts) => parts
                    .iter()
                    .find_map(|p| match p {
                        ContentPart::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => Some((tool_use_id.clone(), content.clone())),
                        _ => None,
                    })
                    .unwrap_or_default(),
                MessageContent::Text(t) => (String::new(), t.clone()),
            };
            serde_json::json!({"role": "tool", "tool_call_id": id, "content": content})
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_response(provider: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Parse("response has no choices".into()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| Error::Parse("choice has no message".into()))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in calls {
            let func = tc.get("function").cloned().unwrap_or(Value::Null);
            let args_raw = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("");
            // Arguments arrive as a JSON string; empty means empty object.
            let arguments: Value = if args_raw.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(args_raw).unwrap_or(Value::Object(Default::default()))
            };
            tool_calls.push(ToolCall {
                call_id: tc
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                tool_name: func
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                arguments,
            });
        }
    }

    let usage = body.get("usage").and_then(|u| {
        Some(Usage {
            input_tokens: u.get("prompt_tokens")?.as_u64()? as u32,
            output_tokens: u.get("completion_tokens")?.as_u64()? as u32,
        })
    });

    Ok(ChatResponse {
        content,
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        provider: provider.to_string(),
        usage,
        tool_calls,
    })
}

fn parse_sse(data: &str) -> SseParse {
    if data == "[DONE]" {
        return SseParse::Done;
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return SseParse::Text(String::new()),
    };
    if let Some(err) = v.get("error") {
        return SseParse::Error(
            err.get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        );
    }
    let delta = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    SseParse::Text(delta.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req, false);

        tracing::debug!(provider = %self.id, url = %url, "openai-compat chat request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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
        parse_response(&self.id, &json)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req, true);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        Ok(sse_chunk_stream(resp, |data| parse_sse(data)))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
