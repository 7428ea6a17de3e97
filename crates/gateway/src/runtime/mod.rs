//! The agent pipeline: intake → briefing → routing → recruiter → planner →
//! step-executor loop, with re-entrant handoff for queued follow-ups.
//!
//! [`handle_prompt`] is the entry point; each user message runs on its own
//! worker. Per-device serialization happens only through the routing lock.

pub mod briefing;
pub mod catalog;
pub mod handlers;
pub mod heartbeat;
pub mod intake;
pub mod memory_models;
pub mod model;
pub mod monitor;
pub mod planner;
pub mod queue;
pub mod recruiter;
pub mod research;
pub mod routing;
pub mod signals;
pub mod steps;
pub mod tool_loop;
pub mod workspace;

use chrono::Utc;

use hb_domain::role::ModelRole;
use hb_domain::AgentId;
use hb_providers::{CallContext, LlmClient};
use hb_protocol::{DeviceMessage, LlmCallRequestPayload, MessageBody, ReplyPayload};

use crate::state::AppState;
use model::{
    AgentStatus, MemoryRef, PersonaFile, QueuedRequest, RouterDecision, TaskFile, TaskProgress,
};
use monitor::MonitorEvent;
use routing::RouteOutcome;
use signals::AgentSignal;
use steps::StepLoopEnd;
use tool_loop::LoopChat;
use workspace::AgentHandle;

/// Pipeline result surfaced to callers and the lifecycle channel.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub execution_response: String,
    pub execution_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

pub(crate) fn truncate_str(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// handle_prompt — one user message, end to end
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn handle_prompt(
    state: AppState,
    device_id: String,
    user_id: String,
    text: String,
) -> PipelineResult {
    let task_id = uuid::Uuid::new_v4().to_string();
    let ctx = CallContext {
        device_id: Some(device_id.clone()),
        agent_id: None,
    };
    let llm: &dyn LoopChat = state.llm.as_ref();

    tracing::info!(device_id = %device_id, user_id = %user_id, task_id = %task_id, "prompt received");

    // ── Offline fast path ─────────────────────────────────────────
    // With cloud providers unreachable, the selector pins the local model
    // and the message gets a single direct completion instead of the full
    // pipeline.
    if state.selector.is_offline().await {
        let criteria = hb_domain::role::SelectionCriteria {
            is_offline: true,
            prompt_len: Some(text.len()),
            ..Default::default()
        };
        match state.selector.resolve_model_and_client(None, criteria).await {
            Ok((selection, client)) => {
                let req = hb_providers::ChatRequest {
                    messages: vec![hb_domain::message::ChatMessage::user(&text)],
                    max_tokens: Some(selection.max_tokens),
                    ..Default::default()
                };
                return match client.chat(req).await {
                    Ok(resp) => PipelineResult {
                        execution_response: resp.content,
                        execution_success: true,
                        agent_id: None,
                    },
                    Err(e) => PipelineResult {
                        execution_response: format!("offline and the local model failed: {e}"),
                        execution_success: false,
                        agent_id: None,
                    },
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "offline but no local provider, continuing with cloud chain");
            }
        }
    }

    // ── Intake ────────────────────────────────────────────────────
    let intake_result = intake::run_intake(llm, &ctx, "", "", "", &text).await;
    let classification = intake_result
        .classification
        .clone()
        .unwrap_or_else(|| "ACTION".to_string());

    // ── Task monitor ──────────────────────────────────────────────
    {
        let bridge = state.bridge.clone();
        let device = device_id.clone();
        state.monitor.start(
            &task_id,
            &classification,
            std::sync::Arc::new(move |event| {
                let bridge = bridge.clone();
                let device = device.clone();
                let (title, body) = match event {
                    MonitorEvent::Progress { message } => ("running".to_string(), message),
                    MonitorEvent::Timeout => (
                        "timeout".to_string(),
                        "the task is taking much longer than expected".to_string(),
                    ),
                };
                tokio::spawn(async move {
                    let _ = bridge.notify(&device, &title, &body).await;
                });
            }),
        );
    }

    // ── Briefing (tailor → select → consolidate) ──────────────────
    let tailored = briefing::tailor(llm, &ctx, "", &text).await;
    let selected = briefing::select_principles(&state.principles, &text, tailored.complexity);
    let briefing_text = briefing::consolidate(llm, &ctx, &selected, &tailored).await;

    let restated = if !tailored.restated_request.trim().is_empty() {
        tailored.restated_request.clone()
    } else {
        intake_result
            .restated_request
            .clone()
            .unwrap_or_else(|| text.clone())
    };

    // Union of intake and tailor memory hits.
    let mut relevant: Vec<MemoryRef> = intake_result.relevant_memories.clone();
    for m in &tailored.relevant_memories {
        if !relevant.iter().any(|r| r.name == m.name) {
            relevant.push(m.clone());
        }
    }

    // ── Routing ───────────────────────────────────────────────────
    let route = routing::route_or_coalesce(
        &state.routing_locks,
        &state.signals,
        &state.workspace,
        state.memory.as_ref(),
        llm,
        &ctx,
        &device_id,
        &user_id,
        &text,
        &relevant,
    )
    .await;

    let lock_held = match route {
        RouteOutcome::Coalesced { agent_id } => {
            state
                .bridge
                .publish_lifecycle(&user_id, &device_id, &agent_id, "routing_modify", None);
            state.monitor.clear(&task_id);
            return PipelineResult {
                execution_response: "your update was folded into the running task".into(),
                execution_success: true,
                agent_id: Some(agent_id),
            };
        }
        RouteOutcome::Proceed { decision, lock_held } => match decision {
            RouterDecision::New => lock_held,
            RouterDecision::Modify { agent_id } => {
                state.signals.push(&agent_id, AgentSignal::new(&text));
                routing::append_persona_request(
                    &state.workspace,
                    AgentHandle::new(&device_id, &user_id, agent_id.clone()),
                    &text,
                );
                state
                    .bridge
                    .publish_lifecycle(&user_id, &device_id, &agent_id, "routing_modify", None);
                if lock_held {
                    state.routing_locks.release(&device_id);
                }
                state.monitor.clear(&task_id);
                return PipelineResult {
                    execution_response: "your update was routed to the agent already working on this".into(),
                    execution_success: true,
                    agent_id: Some(agent_id),
                };
            }
            RouterDecision::Queue { agent_id } => {
                let handle = AgentHandle::new(&device_id, &user_id, agent_id.clone());
                enqueue_request(&state, &handle, &text).await;
                state
                    .bridge
                    .publish_lifecycle(&user_id, &device_id, &agent_id, "routing_queue", None);
                if lock_held {
                    state.routing_locks.release(&device_id);
                }
                state.monitor.clear(&task_id);
                return PipelineResult {
                    execution_response: "queued behind the task currently in progress".into(),
                    execution_success: true,
                    agent_id: Some(agent_id),
                };
            }
            RouterDecision::Stop { agent_id } => {
                let handle = AgentHandle::new(&device_id, &user_id, agent_id.clone());
                stop_agent(&state, &handle).await;
                if lock_held {
                    state.routing_locks.release(&device_id);
                }
                state.monitor.clear(&task_id);
                return PipelineResult {
                    execution_response: "stopped the running task".into(),
                    execution_success: true,
                    agent_id: Some(agent_id),
                };
            }
        },
    };

    // ── Receptionist: fresh agent + workspace ─────────────────────
    let agent_id = AgentId::generate();
    let handle = AgentHandle::new(&device_id, &user_id, agent_id.clone());

    if let Err(e) = create_agent_workspace(&state, &handle, &task_id, &text, &restated, &briefing_text).await {
        tracing::error!(agent_id = %agent_id, error = %e, "workspace creation failed");
        if lock_held {
            state.routing_locks.release(&device_id);
        }
        state.monitor.clear(&task_id);
        return PipelineResult {
            execution_response: format!("could not start the task: {e}"),
            execution_success: false,
            agent_id: None,
        };
    }

    // Attach the agent to every matched memory model (fire-and-forget).
    for memory_ref in &relevant {
        let memory = state.memory.clone();
        let slug = memory_ref.name.clone();
        let agent_ref = memory_models::AgentRef {
            agent_id: agent_id.clone(),
            status: "running".into(),
            workspace: Some(state.workspace.workspace_root(&agent_id)),
            device_id: Some(device_id.clone()),
        };
        tokio::spawn(async move {
            if let Err(e) = memory.attach_agent(&slug, agent_ref).await {
                tracing::warn!(error = %e, "memory model attach failed");
            }
        });
    }

    if lock_held {
        state.routing_locks.set_active(
            &device_id,
            agent_id.clone(),
            Some(state.workspace.workspace_root(&agent_id)),
        );
    }
    state
        .bridge
        .publish_lifecycle(&user_id, &device_id, &agent_id, "created", None);

    // ── Recruit → plan → execute (with queued-handoff loop) ───────
    let end = run_agent_cycles(&state, handle.clone(), &restated, &briefing_text).await;

    // ── Finalize ──────────────────────────────────────────────────
    let result = match end {
        CycleEnd::Completed { summary, last_agent } => {
            state
                .bridge
                .publish_run_log(&user_id, &device_id, &last_agent, "info", "task completed");
            PipelineResult {
                execution_response: summary,
                execution_success: true,
                agent_id: Some(last_agent),
            }
        }
        CycleEnd::Paused { question, last_agent } => {
            let _ = state
                .bridge
                .notify(&device_id, "input needed", &question)
                .await;
            PipelineResult {
                execution_response: question,
                execution_success: true,
                agent_id: Some(last_agent),
            }
        }
        CycleEnd::Failed { reason, last_agent } => {
            state
                .bridge
                .publish_run_log(&user_id, &device_id, &last_agent, "error", reason.clone());
            PipelineResult {
                execution_response: reason,
                execution_success: false,
                agent_id: Some(last_agent),
            }
        }
    };

    if lock_held {
        state.routing_locks.release(&device_id);
    }
    state.monitor.clear(&task_id);
    result
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent cycles (recruiter → planner → steps, re-entrant for queue)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum CycleEnd {
    Completed { summary: String, last_agent: AgentId },
    Paused { question: String, last_agent: AgentId },
    Failed { reason: String, last_agent: AgentId },
}

async fn run_agent_cycles(
    state: &AppState,
    first_handle: AgentHandle,
    restated: &str,
    briefing_text: &str,
) -> CycleEnd {
    let llm: &dyn LoopChat = state.llm.as_ref();
    let mut handle = first_handle;
    let mut request = restated.to_string();
    let mut brief = briefing_text.to_string();
    let mut previous_agent: Option<AgentId> = None;
    let mut last_summary = String::new();

    loop {
        let ctx = CallContext {
            device_id: Some(handle.device_id.clone()),
            agent_id: Some(handle.agent_id.to_string()),
        };

        // Recruit and persist the persona file.
        let mut recruitment =
            recruiter::recruit(llm, &ctx, &state.personas, &state.manifest, &request, &brief).await;
        let mut persona = PersonaFile {
            agent_id: handle.agent_id.clone(),
            previous_agent_id: previous_agent.clone(),
            custom_prompt: recruitment.custom_prompt.clone(),
            selected_personas: recruitment.selected_personas.clone(),
            council: recruitment.council.clone(),
            tools: recruitment.tools.clone(),
            model_role: recruitment.model_role.as_str().to_string(),
            restated_requests: vec![request.clone()],
            status: AgentStatus::Running,
            queue: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        };
        persist_persona(state, &handle, &persona).await;

        // Plan.
        let mut plan = planner::create_plan(llm, &ctx, &request, &brief, &recruitment.custom_prompt).await;
        if let Err(e) = state.workspace.write_json(&handle, "plan.json", &plan).await {
            tracing::warn!(agent_id = %handle.agent_id, error = %e, "plan.json write failed");
        }

        // Execute.
        let deps = steps::StepLoopDeps {
            llm,
            ctx: &ctx,
            workspace: &state.workspace,
            manifest: &state.manifest,
            catalog: &state.personas,
            signals: &state.signals,
            max_iterations: state.config.pipeline.max_iterations,
        };
        let handler_deps = state.handler_deps();
        let manifest = state.manifest.clone();
        let registry_handle = handle.clone();
        let builder = move |ids: &[String]| {
            handlers::build_registry(&handler_deps, &manifest, &registry_handle, ids)
        };

        let end = steps::execute_plan(&deps, &handle, &mut recruitment, &mut plan, &builder, &request).await;

        match end {
            StepLoopEnd::Completed { summary } => {
                last_summary = if summary.is_empty() { last_summary } else { summary };
                finish_agent(state, &handle, &mut persona, AgentStatus::Completed, None).await;
                // Completion deletes task.json: its absence marks the task done.
                if let Err(e) = state.workspace.delete_file(&handle, "task.json").await {
                    tracing::debug!(agent_id = %handle.agent_id, error = %e, "task.json delete skipped");
                }
                state.bridge.publish_lifecycle(
                    &handle.user_id,
                    &handle.device_id,
                    &handle.agent_id,
                    "completed",
                    None,
                );

                // Queue-executor: follow-ups coalesced behind this agent get
                // a fresh agent in the same workspace.
                let queued: Vec<QueuedRequest> = state
                    .workspace
                    .read_json::<PersonaFile>(&handle, "persona.json")
                    .await
                    .map(|p| p.queue)
                    .unwrap_or_default();
                if queued.is_empty() {
                    return CycleEnd::Completed {
                        summary: last_summary,
                        last_agent: handle.agent_id,
                    };
                }

                tracing::info!(
                    agent_id = %handle.agent_id,
                    queued = queued.len(),
                    "running queued follow-ups in the same workspace"
                );
                request = queue::concat_requests(&queued);
                brief = queue::build_handoff_brief(handle.agent_id.as_str(), &plan);
                // The stale intake knowledge belongs to the finished run.
                let _ = state.workspace.delete_file(&handle, "intake_knowledge.md").await;

                let next_id = AgentId::generate();
                previous_agent = Some(handle.agent_id.clone());
                handle = AgentHandle::new(&handle.device_id, &handle.user_id, next_id)
                    .with_workspace(handle.workspace_id.clone());
                state.bridge.publish_lifecycle(
                    &handle.user_id,
                    &handle.device_id,
                    &handle.agent_id,
                    "created",
                    Some("queued follow-up".into()),
                );
            }
            StepLoopEnd::Paused { question } => {
                finish_agent(state, &handle, &mut persona, AgentStatus::WaitingOnHuman, None).await;
                state.bridge.publish_lifecycle(
                    &handle.user_id,
                    &handle.device_id,
                    &handle.agent_id,
                    "waiting_on_human",
                    Some(question.clone()),
                );
                return CycleEnd::Paused {
                    question,
                    last_agent: handle.agent_id,
                };
            }
            StepLoopEnd::Failed { reason } => {
                finish_agent(state, &handle, &mut persona, AgentStatus::Failed, Some(reason.clone())).await;
                state.bridge.publish_lifecycle(
                    &handle.user_id,
                    &handle.device_id,
                    &handle.agent_id,
                    "failed",
                    Some(reason.clone()),
                );
                return CycleEnd::Failed {
                    reason,
                    last_agent: handle.agent_id,
                };
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Receptionist & persona helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn create_agent_workspace(
    state: &AppState,
    handle: &AgentHandle,
    task_id: &str,
    original_text: &str,
    restated: &str,
    briefing_text: &str,
) -> hb_domain::Result<()> {
    state.workspace.create_workspace(handle).await?;

    let task = TaskFile {
        task_id: task_id.to_string(),
        topic: truncate_str(restated, 120),
        status: AgentStatus::Running,
        last_active_at: Utc::now(),
        failure_reason: None,
        persona: String::new(),
        selected_tool_ids: Vec::new(),
        conversation: vec![serde_json::json!({"role": "user", "content": original_text})],
        progress: TaskProgress::default(),
        parent_agent_id: None,
        child_agent_ids: Vec::new(),
        original_message_indices: vec![0],
        original_conversation_snapshot: vec![serde_json::json!({"role": "user", "content": original_text})],
    };
    state.workspace.write_json(handle, "task.json", &task).await?;
    state
        .workspace
        .write_file(handle, "intake_knowledge.md", briefing_text)
        .await?;
    Ok(())
}

async fn persist_persona(state: &AppState, handle: &AgentHandle, persona: &PersonaFile) {
    if let Err(e) = state.workspace.write_json(handle, "persona.json", persona).await {
        tracing::warn!(agent_id = %handle.agent_id, error = %e, "persona.json write failed");
    }
    // Status mirroring to memory models is fire-and-forget.
    let memory = state.memory.clone();
    let agent_id = handle.agent_id.clone();
    let status = format!("{:?}", persona.status).to_lowercase();
    tokio::spawn(async move {
        if let Err(e) = memory.set_agent_status(&agent_id, &status).await {
            tracing::debug!(error = %e, "memory status mirror failed");
        }
    });
}

async fn finish_agent(
    state: &AppState,
    handle: &AgentHandle,
    persona: &mut PersonaFile,
    status: AgentStatus,
    failure_reason: Option<String>,
) {
    if !persona.transition(status) {
        tracing::warn!(
            agent_id = %handle.agent_id,
            from = ?persona.status,
            to = ?status,
            "invalid persona status transition skipped"
        );
    }
    persist_persona(state, handle, persona).await;

    if let Some(reason) = failure_reason {
        // A failed task keeps its task.json, annotated with the reason.
        if let Ok(mut task) = state.workspace.read_json::<TaskFile>(handle, "task.json").await {
            task.status = AgentStatus::Failed;
            task.failure_reason = Some(reason);
            task.last_active_at = Utc::now();
            let _ = state.workspace.write_json(handle, "task.json", &task).await;
        }
    }
    state.signals.remove(&handle.agent_id);
}

/// Append a queued request to a (running) agent's persona file.
async fn enqueue_request(state: &AppState, handle: &AgentHandle, text: &str) {
    match state.workspace.read_json::<PersonaFile>(handle, "persona.json").await {
        Ok(mut persona) => {
            persona.queue.push(QueuedRequest {
                id: uuid::Uuid::new_v4().to_string(),
                request: text.to_string(),
                added_at: Utc::now(),
            });
            if let Err(e) = state.workspace.write_json(handle, "persona.json", &persona).await {
                tracing::warn!(agent_id = %handle.agent_id, error = %e, "queue append failed");
            }
        }
        Err(e) => tracing::warn!(agent_id = %handle.agent_id, error = %e, "queue target persona unreadable"),
    }
}

async fn stop_agent(state: &AppState, handle: &AgentHandle) {
    if let Ok(mut persona) = state.workspace.read_json::<PersonaFile>(handle, "persona.json").await {
        persona.transition(AgentStatus::Stopped);
        persist_persona(state, handle, &persona).await;
    }
    state.signals.remove(&handle.agent_id);
    state.bridge.publish_lifecycle(
        &handle.user_id,
        &handle.device_id,
        &handle.agent_id,
        "stopped",
        None,
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device-proxied LLM calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A device asked the gateway to run an LLM call on its behalf
/// (`llm_call_request` → `llm_call_response`).
pub async fn handle_device_llm_call(
    state: AppState,
    device_id: String,
    request_id: String,
    call: LlmCallRequestPayload,
) {
    let role = ModelRole::from_str(&call.role).unwrap_or(ModelRole::Workhorse);
    let messages: Vec<hb_domain::message::ChatMessage> =
        serde_json::from_value(call.messages).unwrap_or_default();
    let ctx = CallContext {
        device_id: Some(device_id.clone()),
        agent_id: None,
    };
    let req = hb_providers::ChatRequest {
        messages,
        ..Default::default()
    };

    let (result, error) = match state.llm.chat_for_role(role, req, &ctx).await {
        Ok(resp) => (
            serde_json::json!({"content": resp.content, "model": resp.model}),
            None,
        ),
        Err(e) => (serde_json::Value::Null, Some(e.to_string())),
    };

    let reply = DeviceMessage::new(MessageBody::LlmCallResponse(ReplyPayload {
        request_id: Some(request_id),
        result,
        error,
        extra: Default::default(),
    }));
    if let Err(e) = state.bridge.send(&device_id, reply).await {
        tracing::warn!(device_id = %device_id, error = %e, "llm_call_response send failed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace retention sweep
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Remove workspaces of terminal agents older than the retention window.
pub async fn sweep_workspaces(state: &AppState) {
    let retention = chrono::Duration::hours(state.config.workspace.retention_hours);
    let cutoff = Utc::now() - retention;

    for device in state.devices.list() {
        let root = state.config.workspace.root.clone();
        let cmd = hb_protocol::ExecutionCommand::tool_execute(
            "fs.list",
            serde_json::json!({"path": root, "depth": 1}),
            30_000,
        );
        let Ok(result) = state
            .bridge
            .execute_tool(&device.device_id, cmd, std::time::Duration::from_secs(30))
            .await
        else {
            continue;
        };
        let entries = result
            .result
            .get("entries")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for entry in entries {
            let Some(name) = entry.as_str() else { continue };
            let Ok(agent_id) = AgentId::parse(name.trim_end_matches('/')) else {
                continue;
            };
            let handle = AgentHandle::new(&device.device_id, &device.user_id, agent_id.clone());
            let Ok(persona) = state
                .workspace
                .read_json::<PersonaFile>(&handle, "persona.json")
                .await
            else {
                continue;
            };
            let expired = persona.status.is_terminal()
                && persona.completed_at.is_some_and(|at| at < cutoff);
            if expired {
                tracing::info!(agent_id = %agent_id, "sweeping expired workspace");
                if let Err(e) = state.workspace.remove_workspace(&handle).await {
                    tracing::warn!(agent_id = %agent_id, error = %e, "workspace sweep failed");
                }
            }
        }
    }
}
