//! Shared application state passed to all handlers and background tasks.

use std::sync::Arc;

use hb_domain::config::Config;
use hb_providers::{ModelSelector, ProviderRegistry, ResilientClient, TokenTracker};

use crate::devices::bridge::DeviceBridge;
use crate::devices::registry::DeviceRegistry;
use crate::runtime::briefing::PrincipleSet;
use crate::runtime::catalog::{PersonaCatalog, ToolManifest};
use crate::runtime::handlers::{HandlerDeps, ScreenshotStore};
use crate::runtime::memory_models::MemoryModels;
use crate::runtime::monitor::TaskMonitor;
use crate::runtime::research::ResearchStore;
use crate::runtime::signals::{RoutingLockMap, SignalHub};
use crate::runtime::workspace::WorkspaceClient;
use crate::sched::{DeferredScheduler, RecurringScheduler};

/// Everything the gateway's concurrent parts share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<ResilientClient>,
    pub providers: Arc<ProviderRegistry>,
    pub selector: Arc<ModelSelector>,
    pub tokens: Arc<TokenTracker>,

    // ── Devices ───────────────────────────────────────────────────
    pub devices: Arc<DeviceRegistry>,
    pub bridge: Arc<DeviceBridge>,

    // ── Pipeline ──────────────────────────────────────────────────
    pub memory: Arc<dyn MemoryModels>,
    pub workspace: Arc<WorkspaceClient>,
    pub research: Arc<ResearchStore>,
    pub screenshots: Arc<ScreenshotStore>,
    pub routing_locks: Arc<RoutingLockMap>,
    pub signals: Arc<SignalHub>,
    pub manifest: Arc<ToolManifest>,
    pub personas: Arc<PersonaCatalog>,
    pub principles: Arc<PrincipleSet>,
    pub monitor: Arc<TaskMonitor>,

    // ── Schedulers ────────────────────────────────────────────────
    pub deferred: Arc<DeferredScheduler>,
    pub recurring: Arc<RecurringScheduler>,
}

impl AppState {
    /// Dependency bundle for building per-agent handler registries.
    pub fn handler_deps(&self) -> HandlerDeps {
        HandlerDeps {
            bridge: self.bridge.clone(),
            workspace: self.workspace.clone(),
            research: self.research.clone(),
            screenshots: self.screenshots.clone(),
            llm: self.llm.clone(),
            deferred: self.deferred.clone(),
            recurring: self.recurring.clone(),
            default_tool_timeout_ms: self.config.pipeline.default_tool_timeout_ms,
            result_cap: self.config.pipeline.result_cap_chars,
        }
    }
}
