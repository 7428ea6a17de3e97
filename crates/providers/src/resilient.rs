//! Resilient LLM client.
//!
//! Wraps the provider registry with per-role fallback chains: when the
//! primary model fails with a retryable error (429/5xx, connection reset,
//! timeout), the next configured (provider, model) in the chain is tried
//! with the original request. Non-retryable errors propagate unchanged.
//!
//! Every completed call records token usage, fire-and-forget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use hb_domain::config::{LlmConfig, RoleConfig};
use hb_domain::error::{Error, Result};
use hb_domain::role::ModelRole;
use hb_domain::stream::{BoxStream, StreamChunk};

use crate::registry::ProviderRegistry;
use crate::tokens::{TokenTracker, UsageRow};
use crate::traits::{ChatRequest, ChatResponse, LlmClient};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retryable classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const RETRYABLE_STATUS: [&str; 5] = ["HTTP 429", "HTTP 500", "HTTP 502", "HTTP 503", "HTTP 504"];

/// Closed-set retryable classification: 429/500/502/503/504, connection
/// resets, and timeouts. Everything else is final.
pub fn is_retryable_error(err: &Error) -> bool {
    match err {
        Error::Timeout(_) => true,
        Error::Http(msg) => {
            msg.contains("connection reset")
                || msg.contains("connection closed")
                || msg.contains("error sending request")
                || msg.contains("connect")
        }
        Error::Provider { message, .. } => {
            RETRYABLE_STATUS.iter().any(|s| message.contains(s))
                || message.contains("connection reset")
        }
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ResilientClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Attribution for token accounting.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub device_id: Option<String>,
    pub agent_id: Option<String>,
}

pub struct ResilientClient {
    registry: Arc<ProviderRegistry>,
    roles: HashMap<String, RoleConfig>,
    tracker: Arc<TokenTracker>,
    request_timeout: Duration,
}

impl ResilientClient {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: &LlmConfig,
        tracker: Arc<TokenTracker>,
    ) -> Self {
        Self {
            registry,
            roles: config.roles.clone(),
            tracker,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The ordered (provider, model) candidates for a role: primary first,
    /// then the configured fallback chain.
    fn candidates(&self, role: ModelRole) -> Result<(Vec<String>, u32)> {
        let cfg = self
            .roles
            .get(role.as_str())
            .ok_or_else(|| Error::Config(format!("no role config for '{role}'")))?;
        let mut specs = vec![cfg.model.clone()];
        specs.extend(cfg.fallbacks.iter().cloned());
        Ok((specs, cfg.max_tokens))
    }

    /// Send a chat request for a role, walking the fallback chain on
    /// retryable errors.
    pub async fn chat_for_role(
        &self,
        role: ModelRole,
        mut req: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse> {
        let (specs, max_tokens) = self.candidates(role)?;
        if req.max_tokens.is_none() {
            req.max_tokens = Some(max_tokens);
        }

        let mut last_err: Option<Error> = None;
        for (idx, spec) in specs.iter().enumerate() {
            let (provider_id, model) = split_spec(spec);
            let Some(client) = self.registry.get(provider_id) else {
                tracing::warn!(provider = %provider_id, "provider unavailable, skipping");
                continue;
            };

            if idx > 0 {
                tracing::info!(
                    role = %role,
                    provider = %provider_id,
                    model = %model,
                    fallback_index = idx,
                    "falling back to next provider in chain"
                );
            }

            let mut attempt = req.clone();
            if !model.is_empty() {
                attempt.model = Some(model.to_string());
            }

            match self.try_chat(client.as_ref(), attempt).await {
                Ok(resp) => {
                    self.record_usage(role, &resp, ctx);
                    return Ok(resp);
                }
                Err(e) if is_retryable_error(&e) => {
                    tracing::warn!(
                        provider = %provider_id,
                        model = %model,
                        error = %e,
                        "retryable LLM error, trying next in chain"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "resilient".into(),
            message: format!("no provider available for role '{role}'"),
        }))
    }

    /// Open a chunk stream for a role. The chain is walked at open time;
    /// the returned stream always ends with a `{done: true}` chunk.
    pub async fn stream_for_role(
        &self,
        role: ModelRole,
        req: ChatRequest,
        _ctx: &CallContext,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let (specs, max_tokens) = self.candidates(role)?;

        let mut last_err: Option<Error> = None;
        for spec in &specs {
            let (provider_id, model) = split_spec(spec);
            let Some(client) = self.registry.get(provider_id) else {
                continue;
            };
            let mut attempt = req.clone();
            if !model.is_empty() {
                attempt.model = Some(model.to_string());
            }
            if attempt.max_tokens.is_none() {
                attempt.max_tokens = Some(max_tokens);
            }
            match client.chat_stream(attempt).await {
                Ok(stream) => return Ok(stream),
                Err(e) if is_retryable_error(&e) => {
                    tracing::warn!(provider = %provider_id, error = %e, "stream open failed, trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "resilient".into(),
            message: format!("no provider available for role '{role}'"),
        }))
    }

    async fn try_chat(&self, client: &dyn LlmClient, req: ChatRequest) -> Result<ChatResponse> {
        match tokio::time::timeout(self.request_timeout, client.chat(req)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "provider '{}' timed out after {}ms",
                client.provider_id(),
                self.request_timeout.as_millis()
            ))),
        }
    }

    fn record_usage(&self, role: ModelRole, resp: &ChatResponse, ctx: &CallContext) {
        let Some(usage) = resp.usage else { return };
        self.tracker.record(UsageRow {
            device_id: ctx.device_id.clone(),
            timestamp: Utc::now(),
            model: resp.model.clone(),
            role: role.as_str().to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            agent_id: ctx.agent_id.clone(),
        });
    }
}

/// Split a `"provider_id/model_name"` spec. Without a `/` the whole string
/// is the provider id and the provider's default model is used.
pub fn split_spec(spec: &str) -> (&str, &str) {
    match spec.split_once('/') {
        Some((provider, model)) => (provider, model),
        None => (spec, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_domain::stream::Usage;
    use parking_lot::Mutex;

    struct MockClient {
        id: String,
        // Pop-front script of responses.
        script: Mutex<Vec<Result<ChatResponse>>>,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl MockClient {
        fn new(id: &str, script: Vec<Result<ChatResponse>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn ok(id: &str, content: &str) -> ChatResponse {
            ChatResponse {
                content: content.into(),
                model: format!("{id}-model"),
                provider: id.into(),
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                tool_calls: Vec::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for MockClient {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
            self.calls.lock().push(req.model.clone());
            self.script.lock().remove(0)
        }
        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
            Err(Error::Other("not scripted".into()))
        }
        fn provider_id(&self) -> &str {
            &self.id
        }
    }

    fn client_with(
        providers: Vec<(&str, Arc<MockClient>)>,
        role_model: &str,
        fallbacks: Vec<String>,
    ) -> (ResilientClient, tempfile::TempDir) {
        let mut map: HashMap<String, Arc<dyn LlmClient>> = HashMap::new();
        for (id, c) in providers {
            map.insert(id.to_string(), c);
        }
        let registry = Arc::new(ProviderRegistry::from_clients(map));
        let mut config = LlmConfig::default();
        config.roles.insert(
            "architect".into(),
            RoleConfig {
                model: role_model.into(),
                max_tokens: 2048,
                fallbacks,
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(TokenTracker::new(dir.path()));
        (ResilientClient::new(registry, &config, tracker), dir)
    }

    #[tokio::test]
    async fn retryable_error_walks_fallback_chain() {
        let primary = MockClient::new(
            "primary",
            vec![Err(Error::Provider {
                provider: "primary".into(),
                message: "HTTP 503 - overloaded".into(),
            })],
        );
        let backup = MockClient::new("backup", vec![Ok(MockClient::ok("backup", "plan ready"))]);

        let (client, _dir) = client_with(
            vec![("primary", primary.clone()), ("backup", backup.clone())],
            "primary/big-model",
            vec!["backup/small-model".into()],
        );

        let resp = client
            .chat_for_role(ModelRole::Architect, ChatRequest::default(), &CallContext::default())
            .await
            .unwrap();
        assert_eq!(resp.provider, "backup");
        assert_eq!(resp.content, "plan ready");
        // Fallback received the original request with its own model set.
        assert_eq!(backup.calls.lock()[0].as_deref(), Some("small-model"));
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_unchanged() {
        let primary = MockClient::new(
            "primary",
            vec![Err(Error::Provider {
                provider: "primary".into(),
                message: "HTTP 400 - bad schema".into(),
            })],
        );
        let backup = MockClient::new("backup", vec![Ok(MockClient::ok("backup", "unused"))]);

        let (client, _dir) = client_with(
            vec![("primary", primary), ("backup", backup.clone())],
            "primary/big-model",
            vec!["backup/small-model".into()],
        );

        let err = client
            .chat_for_role(ModelRole::Architect, ChatRequest::default(), &CallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        assert!(backup.calls.lock().is_empty(), "fallback must not be called");
    }

    #[tokio::test]
    async fn missing_provider_is_skipped() {
        let backup = MockClient::new("backup", vec![Ok(MockClient::ok("backup", "ok"))]);
        let (client, _dir) = client_with(
            vec![("backup", backup)],
            "ghost/none",
            vec!["backup/small-model".into()],
        );
        let resp = client
            .chat_for_role(ModelRole::Architect, ChatRequest::default(), &CallContext::default())
            .await
            .unwrap();
        assert_eq!(resp.provider, "backup");
    }

    #[tokio::test]
    async fn exhausted_chain_returns_last_error() {
        let primary = MockClient::new(
            "primary",
            vec![Err(Error::Timeout("120s elapsed".into()))],
        );
        let (client, _dir) = client_with(vec![("primary", primary)], "primary/m", vec![]);
        let err = client
            .chat_for_role(ModelRole::Architect, ChatRequest::default(), &CallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn missing_role_config_is_config_error() {
        let (client, _dir) = client_with(vec![], "p/m", vec![]);
        let err = client
            .chat_for_role(ModelRole::Vision, ChatRequest::default(), &CallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn retryable_classification_is_closed_set() {
        for msg in ["HTTP 429 - rate", "HTTP 500 - x", "HTTP 502 - x", "HTTP 503 - x", "HTTP 504 - x"] {
            assert!(is_retryable_error(&Error::Provider {
                provider: "p".into(),
                message: msg.into(),
            }));
        }
        assert!(is_retryable_error(&Error::Timeout("t".into())));
        assert!(is_retryable_error(&Error::Http("connection reset by peer".into())));

        assert!(!is_retryable_error(&Error::Provider {
            provider: "p".into(),
            message: "HTTP 401 - unauthorized".into(),
        }));
        assert!(!is_retryable_error(&Error::Parse("bad json".into())));
        assert!(!is_retryable_error(&Error::Config("x".into())));
    }

    #[test]
    fn split_spec_forms() {
        assert_eq!(split_spec("anthropic/claude-sonnet-4-20250514"),
                   ("anthropic", "claude-sonnet-4-20250514"));
        assert_eq!(split_spec("local"), ("local", ""));
    }
}
