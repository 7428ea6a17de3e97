//! Provider registry.
//!
//! Constructs and holds all configured LLM clients. Providers whose API key
//! is missing are skipped with a recorded init error rather than aborting
//! startup; the resilient client walks fallback chains over whatever
//! initialized.

use std::collections::HashMap;
use std::sync::Arc;

use hb_domain::config::{LlmConfig, ProviderKind};
use hb_domain::error::{Error, Result};

use crate::anthropic::AnthropicClient;
use crate::local::LocalClient;
use crate::openai_compat::OpenAiCompatClient;
use crate::traits::LlmClient;

/// Records a provider that failed to initialize.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_id: String,
    pub kind: String,
    pub error: String,
}

pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    init_errors: Vec<ProviderInitError>,
}

impl ProviderRegistry {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut clients: HashMap<String, Arc<dyn LlmClient>> = HashMap::new();
        let mut init_errors = Vec::new();
        let timeout_ms = config.request_timeout_ms;

        for pc in &config.providers {
            let result: Result<Arc<dyn LlmClient>> = match pc.kind {
                ProviderKind::Anthropic => AnthropicClient::from_config(pc, timeout_ms)
                    .map(|c| Arc::new(c) as Arc<dyn LlmClient>),
                ProviderKind::OpenaiCompat => OpenAiCompatClient::from_config(pc, timeout_ms)
                    .map(|c| Arc::new(c) as Arc<dyn LlmClient>),
                ProviderKind::Local => LocalClient::from_config(pc, timeout_ms)
                    .map(|c| Arc::new(c) as Arc<dyn LlmClient>),
            };

            match result {
                Ok(client) => {
                    tracing::info!(provider_id = %pc.id, kind = ?pc.kind, "registered LLM provider");
                    clients.insert(pc.id.clone(), client);
                }
                Err(e) => {
                    tracing::warn!(
                        provider_id = %pc.id,
                        kind = ?pc.kind,
                        error = %e,
                        "failed to initialize LLM provider, skipping"
                    );
                    init_errors.push(ProviderInitError {
                        provider_id: pc.id.clone(),
                        kind: format!("{:?}", pc.kind),
                        error: e.to_string(),
                    });
                }
            }
        }

        if clients.is_empty() && !config.providers.is_empty() {
            return Err(Error::Config(
                "all configured LLM providers failed to initialize".into(),
            ));
        }

        Ok(Self {
            clients,
            init_errors,
        })
    }

    /// Look up a client by its config id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(provider_id).cloned()
    }

    pub fn has(&self, provider_id: &str) -> bool {
        self.clients.contains_key(provider_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }

    /// Registry with pre-built clients (tests / embedding).
    pub fn from_clients(clients: HashMap<String, Arc<dyn LlmClient>>) -> Self {
        Self {
            clients,
            init_errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_domain::config::ProviderConfig;

    #[test]
    fn missing_key_is_recorded_not_fatal() {
        let config = LlmConfig {
            providers: vec![
                ProviderConfig {
                    id: "anthropic".into(),
                    kind: ProviderKind::Anthropic,
                    base_url: None,
                    api_key_env: Some("HB_TEST_DEFINITELY_UNSET_KEY".into()),
                    default_model: "claude-sonnet-4-20250514".into(),
                },
                ProviderConfig {
                    id: "local".into(),
                    kind: ProviderKind::Local,
                    base_url: None,
                    api_key_env: None,
                    default_model: "qwen2.5-3b-instruct".into(),
                },
            ],
            ..Default::default()
        };
        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert!(registry.has("local"));
        assert!(!registry.has("anthropic"));
        assert_eq!(registry.init_errors().len(), 1);
        assert_eq!(registry.init_errors()[0].provider_id, "anthropic");
    }

    #[test]
    fn all_failed_is_fatal() {
        let config = LlmConfig {
            providers: vec![ProviderConfig {
                id: "anthropic".into(),
                kind: ProviderKind::Anthropic,
                base_url: None,
                api_key_env: Some("HB_TEST_DEFINITELY_UNSET_KEY".into()),
                default_model: "m".into(),
            }],
            ..Default::default()
        };
        assert!(ProviderRegistry::from_config(&config).is_err());
    }

    #[test]
    fn empty_config_is_allowed() {
        let registry = ProviderRegistry::from_config(&LlmConfig::default()).unwrap();
        assert!(registry.is_empty());
    }
}
