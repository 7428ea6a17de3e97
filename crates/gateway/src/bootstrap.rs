//! Gateway bootstrap: construct shared state, wire the schedulers back
//! into the pipeline, spawn background loops, and serve.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;

use hb_domain::config::Config;
use hb_providers::{ModelSelector, ProviderRegistry, ResilientClient, TokenTracker};

use crate::devices::bridge::DeviceBridge;
use crate::devices::registry::DeviceRegistry;
use crate::runtime;
use crate::runtime::briefing::PrincipleSet;
use crate::runtime::catalog::{PersonaCatalog, ToolManifest};
use crate::runtime::handlers::{self, ScreenshotStore};
use crate::runtime::heartbeat::{self, HeartbeatInputs, ScheduledCounts};
use crate::runtime::memory_models::FileMemoryModels;
use crate::runtime::monitor::TaskMonitor;
use crate::runtime::research::ResearchStore;
use crate::runtime::signals::{RoutingLockMap, SignalHub};
use crate::runtime::workspace::{AgentHandle, WorkspaceClient};
use crate::sched::deferred::DeferredExecuteFn;
use crate::sched::recurring::RecurringExecuteFn;
use crate::sched::store::{DeferredStore, RecurringStore};
use crate::sched::{DeferredScheduler, RecurringScheduler};
use crate::state::AppState;

/// Build the full application state. Scheduler execute callbacks route
/// fired tasks back into the pipeline via a state cell filled in below
/// (the schedulers exist before the state does).
pub fn build_state(config: Config) -> anyhow::Result<AppState> {
    let config = Arc::new(config);
    let state_dir = &config.server.state_dir;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    // ── LLM stack ─────────────────────────────────────────────────
    let providers = Arc::new(
        ProviderRegistry::from_config(&config.llm).context("initializing LLM providers")?,
    );
    let tokens = Arc::new(TokenTracker::new(state_dir));
    let llm = Arc::new(ResilientClient::new(providers.clone(), &config.llm, tokens.clone()));
    let selector = Arc::new(ModelSelector::new(config.llm.clone(), providers.clone()));

    // ── Devices ───────────────────────────────────────────────────
    let devices = Arc::new(DeviceRegistry::new());
    let bridge = Arc::new(DeviceBridge::new(
        devices.clone(),
        config.pipeline.default_tool_timeout_ms,
    ));

    // ── Pipeline services ─────────────────────────────────────────
    let workspace = Arc::new(WorkspaceClient::new(
        bridge.clone(),
        config.workspace.root.clone(),
        config.pipeline.default_tool_timeout_ms,
    ));
    let research = Arc::new(ResearchStore::new(
        workspace.clone(),
        llm.clone(),
        config.pipeline.result_cap_chars,
        config.pipeline.research_summary_threshold,
    ));
    let memory = Arc::new(FileMemoryModels::new(state_dir));
    let manifest = Arc::new(ToolManifest::load(state_dir));
    let personas = Arc::new(PersonaCatalog::load(&config.pipeline.personas_dir));
    let principles = Arc::new(PrincipleSet::load(&config.pipeline.principles_dir));

    // ── Schedulers, wired back into the pipeline ──────────────────
    let state_cell: Arc<OnceLock<AppState>> = Arc::new(OnceLock::new());

    let deferred_exec: DeferredExecuteFn = {
        let cell = state_cell.clone();
        Arc::new(move |task| {
            let cell = cell.clone();
            Box::pin(async move {
                let state = cell
                    .get()
                    .ok_or_else(|| hb_domain::Error::Other("state not ready".into()))?
                    .clone();
                run_scheduled_prompt(state, &task.user_id, &task.original_prompt).await
            })
        })
    };
    let recurring_exec: RecurringExecuteFn = {
        let cell = state_cell.clone();
        Arc::new(move |task| {
            let cell = cell.clone();
            Box::pin(async move {
                let state = cell
                    .get()
                    .ok_or_else(|| hb_domain::Error::Other("state not ready".into()))?
                    .clone();
                run_scheduled_prompt(state, &task.user_id, &task.prompt).await
            })
        })
    };

    let deferred = Arc::new(DeferredScheduler::new(
        Arc::new(DeferredStore::new(state_dir)),
        &config.scheduler,
        deferred_exec,
    ));
    let recurring = Arc::new(RecurringScheduler::new(
        Arc::new(RecurringStore::new(state_dir)),
        &config.scheduler,
        recurring_exec,
    ));

    let state = AppState {
        config,
        llm,
        providers,
        selector,
        tokens,
        devices,
        bridge,
        memory,
        workspace,
        research,
        screenshots: Arc::new(ScreenshotStore::new()),
        routing_locks: Arc::new(RoutingLockMap::new()),
        signals: Arc::new(SignalHub::new()),
        manifest,
        personas,
        principles,
        monitor: Arc::new(TaskMonitor::new()),
        deferred,
        recurring,
    };
    // Close the loop: the scheduler callbacks can now reach the state.
    let _ = state_cell.set(state.clone());
    Ok(state)
}

/// A scheduler fired: feed the prompt back into the pipeline on the
/// user's first online device.
async fn run_scheduled_prompt(
    state: AppState,
    user_id: &str,
    prompt: &str,
) -> hb_domain::Result<String> {
    let devices = state.devices.devices_for_user(user_id);
    let Some(device_id) = devices.first().cloned() else {
        return Err(hb_domain::Error::Transport(format!(
            "no device online for user {user_id}"
        )));
    };
    let result = runtime::handle_prompt(
        state,
        device_id,
        user_id.to_string(),
        prompt.to_string(),
    )
    .await;
    if result.execution_success {
        Ok(result.execution_response)
    } else {
        Err(hb_domain::Error::Other(result.execution_response))
    }
}

/// Run the gateway until ctrl-c, then drain.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = build_state(config)?;

    let deferred_handle = state.deferred.start();
    let recurring_handle = state.recurring.start();
    spawn_device_pruner(state.clone());
    spawn_workspace_sweeper(state.clone());
    if state.config.heartbeat.enabled {
        spawn_heartbeat_loop(state.clone());
    }

    let bind = state.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(bind = %bind, "homebase gateway listening");

    let app = crate::api::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("serving")?;

    // Drain schedulers for up to the configured window.
    state.deferred.shutdown().await;
    state.recurring.shutdown().await;
    deferred_handle.abort();
    recurring_handle.abort();
    Ok(())
}

fn spawn_device_pruner(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            for device_id in state.devices.prune_stale(state.config.server.device_stale_secs) {
                state.bridge.fail_pending_for_device(&device_id);
            }
        }
    });
}

fn spawn_workspace_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            runtime::sweep_workspaces(&state).await;
        }
    });
}

fn spawn_heartbeat_loop(state: AppState) {
    tokio::spawn(async move {
        let minutes = state.config.heartbeat.interval_minutes.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs(minutes * 60));
        loop {
            interval.tick().await;
            run_heartbeats(&state).await;
        }
    });
}

/// One heartbeat pass over every user with a connected device.
async fn run_heartbeats(state: &AppState) {
    let mut users: Vec<(String, String, Option<String>)> = state
        .devices
        .list()
        .into_iter()
        .map(|d| (d.user_id, d.device_id, d.timezone))
        .collect();
    users.sort();
    users.dedup_by(|a, b| a.0 == b.0);

    for (user_id, device_id, timezone) in users {
        let deferred_stats = state.deferred.stats().await;
        let recurring_stats = state.recurring.stats().await;
        let pending = *deferred_stats.counts.get("pending").unwrap_or(&0);
        let due_now = state
            .deferred
            .store
            .due(chrono::Utc::now())
            .await
            .len();
        let total: usize = deferred_stats.counts.values().sum::<usize>()
            + recurring_stats.counts.values().sum::<usize>();

        let assistant = state.personas.default_persona();
        let tool_ids = assistant.default_tools.clone();
        let tool_defs = state.manifest.definitions_for(&tool_ids);
        let handle = AgentHandle::new(&device_id, &user_id, hb_domain::AgentId::generate());
        let registry = handlers::build_registry(
            &state.handler_deps(),
            &state.manifest,
            &handle,
            &tool_ids,
        );
        let ctx = hb_providers::CallContext {
            device_id: Some(device_id.clone()),
            agent_id: None,
        };

        let result = heartbeat::run_heartbeat(
            state.llm.as_ref(),
            &ctx,
            &registry,
            tool_defs,
            HeartbeatInputs {
                checklist: state.config.heartbeat.checklist.clone(),
                timezone: timezone.unwrap_or_else(|| "UTC".into()),
                idle: "unknown".into(),
                consecutive_failures: 0,
                scheduled: ScheduledCounts {
                    due: due_now,
                    upcoming: pending.saturating_sub(due_now),
                    total,
                },
            },
        )
        .await;

        tracing::info!(
            user_id = %user_id,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "heartbeat completed"
        );
        if result.status == heartbeat::HeartbeatStatus::Alert {
            let _ = state
                .bridge
                .notify(&device_id, "assistant check-in", &result.content)
                .await;
        }
    }
}
