//! Model selector.
//!
//! Maps a role plus request criteria to a concrete (provider, model,
//! max_tokens) selection. Detects the offline case with a cached
//! connectivity probe and pins the local provider when offline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hb_domain::config::LlmConfig;
use hb_domain::error::{Error, Result};
use hb_domain::role::{ModelRole, SelectionCriteria};

use crate::registry::ProviderRegistry;
use crate::resilient::split_spec;
use crate::traits::LlmClient;

/// File context above this size bumps the role tier to architect.
const LARGE_FILE_CONTEXT_BYTES: u64 = 128 * 1024;

/// How long one connectivity probe result is trusted.
const PROBE_TTL: Duration = Duration::from_secs(60);

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A concrete model selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub provider: String,
    pub model: String,
    pub max_tokens: u32,
    pub role: ModelRole,
}

pub struct ModelSelector {
    config: LlmConfig,
    registry: Arc<ProviderRegistry>,
    probe_cache: Mutex<Option<(Instant, bool)>>,
    http: reqwest::Client,
}

impl ModelSelector {
    pub fn new(config: LlmConfig, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            config,
            registry,
            probe_cache: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    /// Map criteria to a concrete selection.
    ///
    /// Offline pins the local provider. Otherwise the role is the explicit
    /// one if given, defaulting to workhorse, bumped to architect for
    /// architect tasks or large file context.
    pub fn select(&self, criteria: &SelectionCriteria) -> Result<Selection> {
        if criteria.is_offline {
            return self.local_selection(criteria.explicit_role.unwrap_or(ModelRole::Workhorse));
        }

        let mut role = criteria.explicit_role.unwrap_or(ModelRole::Workhorse);
        let bump = criteria.architect_task
            || criteria
                .file_context_bytes
                .is_some_and(|b| b > LARGE_FILE_CONTEXT_BYTES);
        if bump && matches!(role, ModelRole::Intake | ModelRole::Workhorse) {
            role = ModelRole::Architect;
        }

        let cfg = self
            .config
            .roles
            .get(role.as_str())
            .ok_or_else(|| Error::Config(format!("no role config for '{role}'")))?;
        let (provider, model) = split_spec(&cfg.model);
        Ok(Selection {
            provider: provider.to_string(),
            model: model.to_string(),
            max_tokens: cfg.max_tokens,
            role,
        })
    }

    fn local_selection(&self, role: ModelRole) -> Result<Selection> {
        let provider = self.config.local_provider.clone();
        if !self.registry.has(&provider) {
            return Err(Error::Config(format!(
                "offline but local provider '{provider}' is not registered"
            )));
        }
        Ok(Selection {
            provider,
            model: String::new(), // provider default
            max_tokens: 1024,
            role,
        })
    }

    /// Resolve a selection and a client for it, reusing `current` when the
    /// provider is unchanged.
    pub async fn resolve_model_and_client(
        &self,
        current: Option<(&str, Arc<dyn LlmClient>)>,
        mut criteria: SelectionCriteria,
    ) -> Result<(Selection, Arc<dyn LlmClient>)> {
        if !criteria.is_offline {
            criteria.is_offline = self.is_offline().await;
        }
        let selection = self.select(&criteria)?;

        if let Some((current_provider, client)) = current {
            if current_provider == selection.provider {
                return Ok((selection, client));
            }
        }

        let client = self
            .registry
            .get(&selection.provider)
            .ok_or_else(|| Error::Config(format!("provider '{}' not registered", selection.provider)))?;
        Ok((selection, client))
    }

    /// Cached connectivity probe; one HTTP round-trip per minute at most.
    pub async fn is_offline(&self) -> bool {
        if let Some((at, offline)) = *self.probe_cache.lock() {
            if at.elapsed() < PROBE_TTL {
                return offline;
            }
        }

        let offline = !self.probe_once().await;
        *self.probe_cache.lock() = Some((Instant::now(), offline));
        if offline {
            tracing::warn!("connectivity probe failed, selecting local provider");
        }
        offline
    }

    async fn probe_once(&self) -> bool {
        let fut = self.http.head(&self.config.connectivity_probe_url).send();
        matches!(tokio::time::timeout(PROBE_TIMEOUT, fut).await, Ok(Ok(_)))
    }

    /// Force the probe cache (tests, manual override).
    pub fn set_offline_cached(&self, offline: bool) {
        *self.probe_cache.lock() = Some((Instant::now(), offline));
    }
}
