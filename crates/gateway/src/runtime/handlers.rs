//! Tool handler registry.
//!
//! Built in layers, latest wins on tool-id collision:
//! 1. proxy-by-default — every manifest tool becomes a device execution
//!    command with a category-aware timeout and a result cap;
//! 2. server-side overrides — `memory.*`/`knowledge.*` ride the memory
//!    channel, `schedule.*` hits the schedulers, `premium.*` upgrades the
//!    model tier, `imagegen.*`/`research.*` run in-process;
//! 3. screenshot extraction — wraps every handler, lifting
//!    `screenshot_ref`/`image_base64` out of results into media blocks;
//! 4. research persistence — wraps search/http/market/research tools with
//!    full-result persistence and pointer truncation;
//! 5. synthetic meta-tools — escalate, wait_for_user, request_tools,
//!    request_research; each breaks the current batch and signals the
//!    step-executor.
//!
//! Handler errors never abort the loop: the error text becomes the tool
//! message so the model can react.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use hb_protocol::{ExecutionCommand, MemoryRequestPayload, MessageBody};

use crate::devices::bridge::DeviceBridge;
use crate::runtime::model::SyntheticSignal;
use crate::runtime::research::ResearchStore;
use crate::runtime::workspace::{AgentHandle, WorkspaceClient};
use crate::runtime::catalog::{ToolManifest, ToolSpec};
use crate::sched::model::{DeferredTask, RecurringTask, ScheduleSpec};
use crate::sched::{timeparse, DeferredScheduler, RecurringScheduler};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome & trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub content: String,
    /// (media_type, base64 data) pairs attached to the tool message.
    pub images: Vec<(String, String)>,
    pub is_error: bool,
    /// Stop dispatching the rest of this assistant turn's tool calls.
    pub break_batch: bool,
    /// Control signal for the step-executor.
    pub signal: Option<SyntheticSignal>,
    /// Workspace path the result was persisted to, if any.
    pub output_path: Option<String>,
}

impl HandlerOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, args: Value) -> HandlerOutcome;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Category timeouts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-category proxy timeouts.
pub fn category_timeout(category: &str, default_ms: u64) -> Duration {
    let ms = match category {
        "codegen" => 11 * 60 * 1000,
        "secrets" => 16 * 60 * 1000,
        "shell" => 5 * 60 * 1000,
        "market" => 3 * 60 * 1000,
        "browser" | "gui" => 60 * 1000,
        _ => default_ms,
    };
    Duration::from_millis(ms)
}

/// Tool categories whose results get research persistence.
fn is_research_category(category: &str) -> bool {
    matches!(category, "search" | "http" | "market" | "research")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Screenshot store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide store of captured screenshots, keyed by ref. Single-writer
/// by construction: the device WS demux inserts, handlers take.
#[derive(Default)]
pub struct ScreenshotStore {
    images: Mutex<HashMap<String, (String, String)>>,
}

impl ScreenshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: impl Into<String>, media_type: impl Into<String>, data: impl Into<String>) {
        self.images
            .lock()
            .insert(reference.into(), (media_type.into(), data.into()));
    }

    pub fn take(&self, reference: &str) -> Option<(String, String)> {
        self.images.lock().remove(reference)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Insert a handler; an existing handler for the id is replaced.
    pub fn insert(&mut self, tool_id: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(tool_id.into(), handler);
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.handlers.contains_key(tool_id)
    }

    pub async fn dispatch(&self, tool_id: &str, args: Value) -> HandlerOutcome {
        match self.handlers.get(tool_id) {
            Some(handler) => handler.handle(args).await,
            None => HandlerOutcome::error(format!("unknown tool: {tool_id}")),
        }
    }
}

/// Shared services the handler layers draw on.
#[derive(Clone)]
pub struct HandlerDeps {
    pub bridge: Arc<DeviceBridge>,
    pub workspace: Arc<WorkspaceClient>,
    pub research: Arc<ResearchStore>,
    pub screenshots: Arc<ScreenshotStore>,
    pub llm: Arc<hb_providers::ResilientClient>,
    pub deferred: Arc<DeferredScheduler>,
    pub recurring: Arc<RecurringScheduler>,
    pub default_tool_timeout_ms: u64,
    pub result_cap: usize,
}

/// Build the layered registry for one agent and tool subset.
pub fn build_registry(
    deps: &HandlerDeps,
    manifest: &ToolManifest,
    agent: &AgentHandle,
    tool_ids: &[String],
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for id in tool_ids {
        let Some(spec) = manifest.get(id) else { continue };

        // 1. Proxy by default.
        let mut handler: Arc<dyn ToolHandler> = Arc::new(ProxyHandler {
            bridge: deps.bridge.clone(),
            device_id: agent.device_id.clone(),
            spec: spec.clone(),
            timeout: category_timeout(&spec.category, deps.default_tool_timeout_ms),
            result_cap: deps.result_cap,
        });

        // 2. Server-side overrides.
        if let Some(override_handler) = server_side_override(deps, agent, spec) {
            handler = override_handler;
        }

        // 3. Screenshot extraction wraps every handler.
        handler = Arc::new(ScreenshotExtractor {
            inner: handler,
            screenshots: deps.screenshots.clone(),
        });

        // 4. Research persistence for research-shaped categories.
        if is_research_category(&spec.category) {
            handler = Arc::new(ResearchWrap {
                inner: handler,
                research: deps.research.clone(),
                agent: agent.clone(),
                tool_id: spec.id.clone(),
            });
        }

        registry.insert(&spec.id, handler);
    }

    // 5. Synthetic meta-tools last; latest wins.
    for (id, maker) in synthetic_handlers() {
        registry.insert(id, maker);
    }

    registry
}

fn server_side_override(
    deps: &HandlerDeps,
    agent: &AgentHandle,
    spec: &ToolSpec,
) -> Option<Arc<dyn ToolHandler>> {
    let prefix = spec.id.split('.').next().unwrap_or("");
    match prefix {
        "memory" | "knowledge" => Some(Arc::new(MemoryHandler {
            bridge: deps.bridge.clone(),
            device_id: agent.device_id.clone(),
            action: spec.id.clone(),
        })),
        "schedule" => Some(Arc::new(ScheduleHandler {
            deferred: deps.deferred.clone(),
            recurring: deps.recurring.clone(),
            tool_id: spec.id.clone(),
            user_id: agent.user_id.clone(),
        })),
        "premium" => Some(Arc::new(PremiumHandler {
            llm: deps.llm.clone(),
            agent: agent.clone(),
        })),
        "imagegen" => Some(Arc::new(ImagegenHandler)),
        "research" => Some(Arc::new(ResearchNotesHandler {
            workspace: deps.workspace.clone(),
            agent: agent.clone(),
        })),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layer 1: proxy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ProxyHandler {
    bridge: Arc<DeviceBridge>,
    device_id: String,
    spec: ToolSpec,
    timeout: Duration,
    result_cap: usize,
}

#[async_trait::async_trait]
impl ToolHandler for ProxyHandler {
    async fn handle(&self, args: Value) -> HandlerOutcome {
        let mut cmd =
            ExecutionCommand::tool_execute(&self.spec.id, args, self.timeout.as_millis() as u64);
        cmd.sandboxed = self.spec.sandboxed;
        cmd.requires_approval = self.spec.requires_approval;

        match self.bridge.execute_tool(&self.device_id, cmd, self.timeout).await {
            Ok(result) if result.success => {
                let text = match &result.result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let capped = if text.chars().count() > self.result_cap {
                    let head: String = text.chars().take(self.result_cap).collect();
                    format!("{head}\n[truncated]")
                } else {
                    text
                };
                HandlerOutcome::text(capped)
            }
            Ok(result) => HandlerOutcome::error(
                result
                    .error
                    .unwrap_or_else(|| format!("{} failed on device", self.spec.id)),
            ),
            Err(e) => HandlerOutcome::error(e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layer 2: server-side overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// memory.* / knowledge.* ride the dedicated memory channel.
struct MemoryHandler {
    bridge: Arc<DeviceBridge>,
    device_id: String,
    action: String,
}

#[async_trait::async_trait]
impl ToolHandler for MemoryHandler {
    async fn handle(&self, args: Value) -> HandlerOutcome {
        let body = MessageBody::MemoryRequest(MemoryRequestPayload {
            action: self.action.clone(),
            params: args,
            extra: Default::default(),
        });
        match self
            .bridge
            .request(&self.device_id, body, Duration::from_secs(30))
            .await
        {
            Ok(MessageBody::MemoryResponse(reply)) => match reply.error {
                Some(err) => HandlerOutcome::error(err),
                None => HandlerOutcome::text(reply.result.to_string()),
            },
            Ok(other) => HandlerOutcome::error(format!("unexpected reply: {}", other.kind())),
            Err(e) => HandlerOutcome::error(e.to_string()),
        }
    }
}

/// schedule.defer / schedule.recurring hit the schedulers in-process.
struct ScheduleHandler {
    deferred: Arc<DeferredScheduler>,
    recurring: Arc<RecurringScheduler>,
    tool_id: String,
    user_id: String,
}

#[async_trait::async_trait]
impl ToolHandler for ScheduleHandler {
    async fn handle(&self, args: Value) -> HandlerOutcome {
        match self.tool_id.as_str() {
            "schedule.defer" => {
                let prompt = args.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
                let when = args.get("when").and_then(|v| v.as_str()).unwrap_or("");
                let tz = args
                    .get("timezone")
                    .and_then(|v| v.as_str())
                    .map(crate::sched::cron::parse_tz)
                    .unwrap_or(chrono_tz::UTC);
                match timeparse::parse_when(when, chrono::Utc::now(), tz) {
                    Ok(at) => {
                        let mut task = DeferredTask::new(&self.user_id, prompt, at, 3);
                        task.deferred_by = "agent".into();
                        if let Some(reason) = args.get("reason").and_then(|v| v.as_str()) {
                            task.defer_reason = reason.to_string();
                        }
                        let id = self.deferred.schedule(task).await;
                        HandlerOutcome::text(format!("deferred task {id} scheduled for {at}"))
                    }
                    Err(e) => HandlerOutcome::error(format!("could not parse time: {e}")),
                }
            }
            "schedule.recurring" => {
                let name = args.get("name").and_then(|v| v.as_str()).unwrap_or("unnamed");
                let prompt = args.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
                let timezone = args
                    .get("timezone")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UTC")
                    .to_string();
                let schedule: ScheduleSpec = match args
                    .get("schedule")
                    .cloned()
                    .map(serde_json::from_value)
                {
                    Some(Ok(spec)) => spec,
                    _ => return HandlerOutcome::error("missing or invalid schedule spec"),
                };
                let task =
                    RecurringTask::new(&self.user_id, name, prompt, schedule, timezone, 5);
                let id = self.recurring.create(task).await;
                HandlerOutcome::text(format!("recurring task {id} created"))
            }
            other => HandlerOutcome::error(format!("unknown schedule tool: {other}")),
        }
    }
}

/// premium.* runs the request against the architect tier.
struct PremiumHandler {
    llm: Arc<hb_providers::ResilientClient>,
    agent: AgentHandle,
}

#[async_trait::async_trait]
impl ToolHandler for PremiumHandler {
    async fn handle(&self, args: Value) -> HandlerOutcome {
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if prompt.is_empty() {
            return HandlerOutcome::error("premium call needs a prompt");
        }
        let req = hb_providers::ChatRequest {
            messages: vec![hb_domain::message::ChatMessage::user(prompt)],
            ..Default::default()
        };
        let ctx = hb_providers::CallContext {
            device_id: Some(self.agent.device_id.clone()),
            agent_id: Some(self.agent.agent_id.to_string()),
        };
        match self
            .llm
            .chat_for_role(hb_domain::role::ModelRole::Architect, req, &ctx)
            .await
        {
            Ok(resp) => HandlerOutcome::text(resp.content),
            Err(e) => HandlerOutcome::error(e.to_string()),
        }
    }
}

struct ImagegenHandler;

#[async_trait::async_trait]
impl ToolHandler for ImagegenHandler {
    async fn handle(&self, _args: Value) -> HandlerOutcome {
        HandlerOutcome::error("image generation backend is not configured on this gateway")
    }
}

/// research.notes reads back persisted research files.
struct ResearchNotesHandler {
    workspace: Arc<WorkspaceClient>,
    agent: AgentHandle,
}

#[async_trait::async_trait]
impl ToolHandler for ResearchNotesHandler {
    async fn handle(&self, args: Value) -> HandlerOutcome {
        if let Some(file) = args.get("file").and_then(|v| v.as_str()) {
            // Workspace-relative reads only.
            if file.contains("..") {
                return HandlerOutcome::error("file must be workspace-relative");
            }
            match self.workspace.read_file(&self.agent, file).await {
                Ok(content) => HandlerOutcome::text(content),
                Err(e) => HandlerOutcome::error(e.to_string()),
            }
        } else {
            match self.workspace.list_tree(&self.agent, 2).await {
                Ok(tree) => HandlerOutcome::text(tree),
                Err(e) => HandlerOutcome::error(e.to_string()),
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layer 3: screenshot extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ScreenshotExtractor {
    inner: Arc<dyn ToolHandler>,
    screenshots: Arc<ScreenshotStore>,
}

#[async_trait::async_trait]
impl ToolHandler for ScreenshotExtractor {
    async fn handle(&self, args: Value) -> HandlerOutcome {
        let mut outcome = self.inner.handle(args).await;
        if outcome.is_error {
            return outcome;
        }
        let Ok(mut parsed) = serde_json::from_str::<Value>(&outcome.content) else {
            return outcome;
        };
        let Some(obj) = parsed.as_object_mut() else {
            return outcome;
        };

        let mut extracted = false;
        if let Some(data) = obj.remove("image_base64").and_then(|v| v.as_str().map(str::to_string)) {
            let media = obj
                .get("media_type")
                .and_then(|v| v.as_str())
                .unwrap_or("image/png")
                .to_string();
            outcome.images.push((media, data));
            extracted = true;
        }
        if let Some(reference) = obj.remove("screenshot_ref").and_then(|v| v.as_str().map(str::to_string)) {
            match self.screenshots.take(&reference) {
                Some((media, data)) => {
                    outcome.images.push((media, data));
                    extracted = true;
                }
                None => tracing::warn!(reference = %reference, "screenshot ref not found in store"),
            }
        }

        if extracted {
            obj.insert("screenshot".into(), Value::String("[attached as image]".into()));
            outcome.content = Value::Object(obj.clone()).to_string();
        }
        outcome
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layer 4: research wrap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ResearchWrap {
    inner: Arc<dyn ToolHandler>,
    research: Arc<ResearchStore>,
    agent: AgentHandle,
    tool_id: String,
}

#[async_trait::async_trait]
impl ToolHandler for ResearchWrap {
    async fn handle(&self, args: Value) -> HandlerOutcome {
        let mut outcome = self.inner.handle(args).await;
        if outcome.is_error || outcome.content.is_empty() {
            return outcome;
        }
        outcome.content =
            self.research
                .persist_and_truncate(&self.agent, &self.tool_id, &outcome.content);
        outcome
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layer 5: synthetic meta-tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SyntheticHandler {
    tool_id: &'static str,
}

#[async_trait::async_trait]
impl ToolHandler for SyntheticHandler {
    async fn handle(&self, args: Value) -> HandlerOutcome {
        let signal = match self.tool_id {
            "escalate" => SyntheticSignal::Escalate {
                reason: str_arg(&args, "reason"),
            },
            "wait_for_user" => SyntheticSignal::WaitForUser {
                question: str_arg(&args, "question"),
            },
            "request_tools" => SyntheticSignal::RequestTools {
                hints: args
                    .get("hints")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "request_research" => SyntheticSignal::RequestResearch {
                query: str_arg(&args, "query"),
            },
            other => return HandlerOutcome::error(format!("unknown synthetic tool: {other}")),
        };
        HandlerOutcome {
            content: format!("{} acknowledged", self.tool_id),
            break_batch: true,
            signal: Some(signal),
            ..Default::default()
        }
    }
}

fn str_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn synthetic_handlers() -> Vec<(&'static str, Arc<dyn ToolHandler>)> {
    ["escalate", "wait_for_user", "request_tools", "request_research"]
        .into_iter()
        .map(|id| {
            (
                id,
                Arc::new(SyntheticHandler { tool_id: id }) as Arc<dyn ToolHandler>,
            )
        })
        .collect()
}

/// Tool specs for the synthetic meta-tools, appended to every step's tool
/// offer.
pub fn synthetic_tool_specs() -> Vec<ToolSpec> {
    let spec = |id: &str, description: &str, params: Value| ToolSpec {
        id: id.into(),
        description: description.into(),
        parameters: params,
        category: "control".into(),
        sandboxed: false,
        requires_approval: false,
    };
    vec![
        spec(
            "escalate",
            "Escalate the current step to the architect for replanning",
            serde_json::json!({"type": "object", "properties": {"reason": {"type": "string"}}}),
        ),
        spec(
            "wait_for_user",
            "Pause and ask the user for input before continuing",
            serde_json::json!({"type": "object", "properties": {"question": {"type": "string"}}}),
        ),
        spec(
            "request_tools",
            "Request additional tools for this task",
            serde_json::json!({"type": "object", "properties": {"hints": {"type": "array", "items": {"type": "string"}}}}),
        ),
        spec(
            "request_research",
            "Request a focused research pass before continuing",
            serde_json::json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_timeout_table() {
        assert_eq!(category_timeout("codegen", 30_000), Duration::from_secs(660));
        assert_eq!(category_timeout("secrets", 30_000), Duration::from_secs(960));
        assert_eq!(category_timeout("shell", 30_000), Duration::from_secs(300));
        assert_eq!(category_timeout("market", 30_000), Duration::from_secs(180));
        assert_eq!(category_timeout("browser", 30_000), Duration::from_secs(60));
        assert_eq!(category_timeout("gui", 30_000), Duration::from_secs(60));
        assert_eq!(category_timeout("fs", 30_000), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn unknown_tool_dispatch_is_error_outcome() {
        let registry = HandlerRegistry::new();
        let outcome = registry.dispatch("ghost", Value::Null).await;
        assert!(outcome.is_error);
        assert!(outcome.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn latest_insert_wins_on_collision() {
        struct Fixed(&'static str);
        #[async_trait::async_trait]
        impl ToolHandler for Fixed {
            async fn handle(&self, _args: Value) -> HandlerOutcome {
                HandlerOutcome::text(self.0)
            }
        }
        let mut registry = HandlerRegistry::new();
        registry.insert("x", Arc::new(Fixed("first")));
        registry.insert("x", Arc::new(Fixed("second")));
        assert_eq!(registry.dispatch("x", Value::Null).await.content, "second");
    }

    #[tokio::test]
    async fn synthetic_tools_signal_and_break_batch() {
        let mut registry = HandlerRegistry::new();
        for (id, h) in synthetic_handlers() {
            registry.insert(id, h);
        }

        let outcome = registry
            .dispatch("escalate", serde_json::json!({"reason": "stuck"}))
            .await;
        assert!(outcome.break_batch);
        assert_eq!(
            outcome.signal,
            Some(SyntheticSignal::Escalate { reason: "stuck".into() })
        );

        let outcome = registry
            .dispatch("wait_for_user", serde_json::json!({"question": "which account?"}))
            .await;
        assert!(outcome.break_batch);
        assert!(matches!(outcome.signal, Some(SyntheticSignal::WaitForUser { .. })));

        let outcome = registry
            .dispatch("request_tools", serde_json::json!({"hints": ["browser.navigate"]}))
            .await;
        assert_eq!(
            outcome.signal,
            Some(SyntheticSignal::RequestTools { hints: vec!["browser.navigate".into()] })
        );
    }

    #[tokio::test]
    async fn screenshot_extractor_lifts_inline_images() {
        struct FakeShot;
        #[async_trait::async_trait]
        impl ToolHandler for FakeShot {
            async fn handle(&self, _args: Value) -> HandlerOutcome {
                HandlerOutcome::text(
                    serde_json::json!({"ok": true, "image_base64": "aGVsbG8=", "media_type": "image/jpeg"})
                        .to_string(),
                )
            }
        }
        let extractor = ScreenshotExtractor {
            inner: Arc::new(FakeShot),
            screenshots: Arc::new(ScreenshotStore::new()),
        };
        let outcome = extractor.handle(Value::Null).await;
        assert_eq!(outcome.images.len(), 1);
        assert_eq!(outcome.images[0].0, "image/jpeg");
        // Base64 is redacted from the text content.
        assert!(!outcome.content.contains("aGVsbG8="));
        assert!(outcome.content.contains("[attached as image]"));
    }

    #[tokio::test]
    async fn screenshot_extractor_resolves_refs_from_store() {
        struct RefShot;
        #[async_trait::async_trait]
        impl ToolHandler for RefShot {
            async fn handle(&self, _args: Value) -> HandlerOutcome {
                HandlerOutcome::text(serde_json::json!({"screenshot_ref": "shot-1"}).to_string())
            }
        }
        let store = Arc::new(ScreenshotStore::new());
        store.insert("shot-1", "image/png", "ZGF0YQ==");
        let extractor = ScreenshotExtractor {
            inner: Arc::new(RefShot),
            screenshots: store.clone(),
        };
        let outcome = extractor.handle(Value::Null).await;
        assert_eq!(outcome.images.len(), 1);
        // Ref is consumed.
        assert!(store.take("shot-1").is_none());
    }

    #[tokio::test]
    async fn non_json_results_pass_through_extractor() {
        struct Plain;
        #[async_trait::async_trait]
        impl ToolHandler for Plain {
            async fn handle(&self, _args: Value) -> HandlerOutcome {
                HandlerOutcome::text("plain text result")
            }
        }
        let extractor = ScreenshotExtractor {
            inner: Arc::new(Plain),
            screenshots: Arc::new(ScreenshotStore::new()),
        };
        let outcome = extractor.handle(Value::Null).await;
        assert_eq!(outcome.content, "plain text result");
        assert!(outcome.images.is_empty());
    }
}
