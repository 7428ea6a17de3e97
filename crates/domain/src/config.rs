//! Gateway configuration.
//!
//! Loaded once at startup from a TOML file; every field has a serde default
//! so a partial (or missing) file still yields a runnable config. Provider
//! API keys are resolved from the environment, never stored in the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// Load from a TOML file. A missing file yields the default config;
    /// a malformed file is a fatal config error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the WebSocket + HTTP surface.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory for persisted state (schedules, token ledger, memory models).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Env var holding the device pre-shared token. Unset = open (dev mode).
    #[serde(default = "default_device_token_env")]
    pub device_token_env: String,
    /// Seconds without traffic before a device is considered stale.
    #[serde(default = "default_device_stale_secs")]
    pub device_stale_secs: i64,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_device_token_env() -> String {
    "HB_DEVICE_TOKEN".to_string()
}
fn default_device_stale_secs() -> i64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            state_dir: default_state_dir(),
            device_token_env: default_device_token_env(),
            device_stale_secs: default_device_stale_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Adapter kind for a configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    /// Any OpenAI-compatible chat-completions endpoint (OpenAI, DeepSeek,
    /// Gemini's compatibility surface, ...).
    OpenaiCompat,
    /// The on-device llama.cpp server. Always key-less.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry id, referenced as the first segment of "provider/model".
    pub id: String,
    pub kind: ProviderKind,
    /// Base URL override (required for openai_compat variants).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Env var holding the API key. Local providers leave this unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Model used when a role spec omits the model segment.
    #[serde(default)]
    pub default_model: String,
}

/// Per-role model assignment and fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Primary "provider_id/model_name".
    pub model: String,
    #[serde(default = "default_role_max_tokens")]
    pub max_tokens: u32,
    /// Ordered "provider_id/model_name" alternatives tried on retryable
    /// errors.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

fn default_role_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Keyed by role name (intake, workhorse, architect, codegen, vision).
    #[serde(default)]
    pub roles: HashMap<String, RoleConfig>,
    /// Per-request fetch timeout.
    #[serde(default = "default_llm_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Probed to decide whether cloud providers are reachable.
    #[serde(default = "default_probe_url")]
    pub connectivity_probe_url: String,
    /// Registry id of the local provider used when offline.
    #[serde(default = "default_local_provider")]
    pub local_provider: String,
}

fn default_llm_timeout_ms() -> u64 {
    120_000
}
fn default_probe_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_local_provider() -> String {
    "local".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            roles: HashMap::new(),
            request_timeout_ms: default_llm_timeout_ms(),
            connectivity_probe_url: default_probe_url(),
            local_provider: default_local_provider(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum tool-loop iterations per step.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Tool results longer than this are truncated with a research pointer.
    #[serde(default = "default_result_cap")]
    pub result_cap_chars: usize,
    /// Raw research results larger than this trigger background summarization.
    #[serde(default = "default_summary_threshold")]
    pub research_summary_threshold: usize,
    /// Directory of principle files (rules + triggered principles).
    #[serde(default = "default_principles_dir")]
    pub principles_dir: PathBuf,
    /// Directory of persona files offered to the recruiter.
    #[serde(default = "default_personas_dir")]
    pub personas_dir: PathBuf,
    /// Default timeout for proxied device tool calls.
    #[serde(default = "default_proxy_timeout_ms")]
    pub default_tool_timeout_ms: u64,
}

fn default_max_iterations() -> usize {
    20
}
fn default_result_cap() -> usize {
    8_000
}
fn default_summary_threshold() -> usize {
    8_192
}
fn default_principles_dir() -> PathBuf {
    PathBuf::from("./data/principles")
}
fn default_personas_dir() -> PathBuf {
    PathBuf::from("./data/personas")
}
fn default_proxy_timeout_ms() -> u64 {
    30_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            result_cap_chars: default_result_cap(),
            research_summary_threshold: default_summary_threshold(),
            principles_dir: default_principles_dir(),
            personas_dir: default_personas_dir(),
            default_tool_timeout_ms: default_proxy_timeout_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedulers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max concurrently executing deferred tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Default attempt cap for deferred tasks.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Consecutive-failure cap before a recurring task is cancelled.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Seconds allowed for in-flight executions during shutdown.
    #[serde(default = "default_drain_secs")]
    pub shutdown_drain_secs: u64,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_failures() -> u32 {
    5
}
fn default_drain_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            max_failures: default_max_failures(),
            shutdown_drain_secs: default_drain_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace & heartbeat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root of per-agent workspaces on the device.
    #[serde(default = "default_workspace_root")]
    pub root: String,
    /// Hours a completed workspace is retained before the sweep removes it.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
}

fn default_workspace_root() -> String {
    "~/.bot/agent-workspaces".to_string()
}
fn default_retention_hours() -> i64 {
    72
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            retention_hours: default_retention_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u64,
    /// Checklist injected into the heartbeat prompt.
    #[serde(default)]
    pub checklist: Vec<String>,
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_heartbeat_interval(),
            checklist: Vec::new(),
        }
    }
}
