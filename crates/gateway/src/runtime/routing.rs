//! Routing: decide whether an incoming message starts a new agent,
//! modifies a running one, queues behind it, or stops it.
//!
//! The per-device routing lock makes decisions serial: at most one router
//! LLM call is in flight per device. Messages arriving while the lock is
//! held coalesce into the active agent's signal queue (rapid-fire
//! protection) or fall through as NEW when no agent is active yet.
//!
//! The router fails open: any LLM or parse failure yields a conservative
//! NEW decision.

use std::sync::Arc;

use hb_domain::message::ChatMessage;
use hb_domain::role::ModelRole;
use hb_domain::AgentId;
use hb_providers::{CallContext, ChatRequest};

use crate::prompts;
use crate::runtime::intake::extract_first_json;
use crate::runtime::memory_models::MemoryModels;
use crate::runtime::model::{MemoryRef, Plan, RouterDecision};
use crate::runtime::signals::{AgentSignal, RoutingLockMap, SignalHub};
use crate::runtime::tool_loop::LoopChat;
use crate::runtime::workspace::{AgentHandle, WorkspaceClient};

/// A live agent found on a matched memory model, enriched with plan
/// progress from its workspace.
#[derive(Debug, Clone)]
pub struct RoutingCandidate {
    pub agent_id: AgentId,
    pub model_slug: String,
    pub status: String,
    pub device_id: Option<String>,
    pub progress: Option<String>,
}

/// How the routing stage resolved.
#[derive(Debug)]
pub enum RouteOutcome {
    /// The message was coalesced as a signal into a running agent; the
    /// pipeline stops here.
    Coalesced { agent_id: AgentId },
    /// Continue the pipeline with this decision. `lock_held` tells the
    /// caller whether it owns the routing lock and must release it.
    Proceed {
        decision: RouterDecision,
        lock_held: bool,
    },
}

const CANDIDATE_STATUSES: [&str; 4] = ["active", "running", "paused", "blocked"];

/// Walk matched memory models for live agents and enrich each with plan
/// progress read from its workspace.
pub async fn collect_candidates(
    memory: &dyn MemoryModels,
    workspace: &WorkspaceClient,
    relevant: &[MemoryRef],
) -> Vec<RoutingCandidate> {
    let names: Vec<String> = relevant.iter().map(|m| m.name.clone()).collect();
    if names.is_empty() {
        return Vec::new();
    }
    let models = match memory.models_by_name(&names).await {
        Ok(models) => models,
        Err(e) => {
            tracing::warn!(error = %e, "memory model lookup failed");
            return Vec::new();
        }
    };

    let mut candidates = Vec::new();
    for model in models {
        for agent in model.agents {
            if !CANDIDATE_STATUSES.contains(&agent.status.as_str()) {
                continue;
            }
            let progress = match &agent.device_id {
                Some(device_id) => {
                    let handle = AgentHandle::new(device_id.clone(), "", agent.agent_id.clone());
                    workspace
                        .read_json::<Plan>(&handle, "plan.json")
                        .await
                        .ok()
                        .map(|plan| {
                            format!(
                                "{}/{} steps done",
                                plan.progress.completed_step_ids.len(),
                                plan.steps.len()
                            )
                        })
                }
                None => None,
            };
            candidates.push(RoutingCandidate {
                agent_id: agent.agent_id,
                model_slug: model.slug.clone(),
                status: agent.status,
                device_id: agent.device_id,
                progress,
            });
        }
    }
    candidates
}

/// One router LLM call over the candidate summaries. Fails open to NEW.
pub async fn decide(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    candidates: &[RoutingCandidate],
    user_message: &str,
) -> RouterDecision {
    let summary = candidates
        .iter()
        .map(|c| {
            format!(
                "- {} (model: {}, status: {}, progress: {})",
                c.agent_id,
                c.model_slug,
                c.status,
                c.progress.as_deref().unwrap_or("unknown")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = prompts::fill(
        prompts::ROUTER,
        &[("candidates", &summary), ("user_message", user_message)],
    );
    let req = ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.1),
        json_mode: true,
        ..Default::default()
    };

    let raw = match llm.chat(ModelRole::Intake, req, ctx).await {
        Ok(resp) => resp.content,
        Err(e) => {
            tracing::warn!(error = %e, "router call failed, falling open to NEW");
            return RouterDecision::New;
        }
    };

    let parsed = extract_first_json(&raw)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok());
    let Some(value) = parsed else {
        tracing::warn!("router response unparseable, falling open to NEW");
        return RouterDecision::New;
    };

    let decision = value.get("decision").and_then(|v| v.as_str()).unwrap_or("new");
    let target = value
        .get("agentId")
        .and_then(|v| v.as_str())
        .and_then(|raw| AgentId::parse(raw).ok())
        .filter(|id| candidates.iter().any(|c| &c.agent_id == id));

    match (decision, target) {
        ("modify", Some(agent_id)) => RouterDecision::Modify { agent_id },
        ("queue", Some(agent_id)) => RouterDecision::Queue { agent_id },
        ("stop", Some(agent_id)) => RouterDecision::Stop { agent_id },
        ("new", _) => RouterDecision::New,
        (other, _) => {
            tracing::warn!(decision = other, "router decision unusable, falling open to NEW");
            RouterDecision::New
        }
    }
}

/// Full routing stage for one incoming message.
pub async fn route_or_coalesce(
    locks: &RoutingLockMap,
    signals: &SignalHub,
    workspace: &Arc<WorkspaceClient>,
    memory: &dyn MemoryModels,
    llm: &dyn LoopChat,
    ctx: &CallContext,
    device_id: &str,
    user_id: &str,
    user_message: &str,
    relevant: &[MemoryRef],
) -> RouteOutcome {
    if !locks.try_acquire(device_id) {
        // Lock contention is not an error: coalesce behind the active
        // agent, or fall through as NEW while the router call is still
        // deciding for a previous message.
        if let Some(agent_id) = locks.observe(device_id).and_then(|s| s.active_agent_id) {
            tracing::info!(device_id = %device_id, agent_id = %agent_id, "coalescing message into running agent");
            signals.push(&agent_id, AgentSignal::new(user_message));
            append_persona_request(
                workspace,
                AgentHandle::new(device_id, user_id, agent_id.clone()),
                user_message,
            );
            return RouteOutcome::Coalesced { agent_id };
        }
        return RouteOutcome::Proceed {
            decision: RouterDecision::New,
            lock_held: false,
        };
    }

    let candidates = collect_candidates(memory, workspace, relevant).await;
    if candidates.is_empty() {
        return RouteOutcome::Proceed {
            decision: RouterDecision::New,
            lock_held: true,
        };
    }

    let decision = decide(llm, ctx, &candidates, user_message).await;
    tracing::info!(device_id = %device_id, decision = ?decision, "routing decision");
    RouteOutcome::Proceed {
        decision,
        lock_held: true,
    }
}

/// Append a coalesced request to the agent's `persona_requests.json`
/// (fire-and-forget; the file is advisory).
pub fn append_persona_request(workspace: &Arc<WorkspaceClient>, agent: AgentHandle, request: &str) {
    let workspace = workspace.clone();
    let request = request.to_string();
    tokio::spawn(async move {
        let mut entries: Vec<AgentSignal> = workspace
            .read_json(&agent, "persona_requests.json")
            .await
            .unwrap_or_default();
        entries.push(AgentSignal::new(request));
        if let Err(e) = workspace
            .write_json(&agent, "persona_requests.json", &entries)
            .await
        {
            tracing::warn!(agent_id = %agent.agent_id, error = %e, "persona_requests append failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::bridge::DeviceBridge;
    use crate::devices::registry::DeviceRegistry;
    use crate::runtime::memory_models::{AgentRef, FileMemoryModels};
    use hb_domain::error::Result;
    use hb_domain::stream::Usage;
    use hb_providers::ChatResponse;
    use parking_lot::Mutex;

    struct FixedChat {
        reply: Mutex<Option<Result<String>>>,
    }

    impl FixedChat {
        fn ok(content: &str) -> Self {
            Self {
                reply: Mutex::new(Some(Ok(content.to_string()))),
            }
        }
        fn err() -> Self {
            Self {
                reply: Mutex::new(Some(Err(hb_domain::Error::Timeout("t".into())))),
            }
        }
    }

    #[async_trait::async_trait]
    impl LoopChat for FixedChat {
        async fn chat(
            &self,
            _role: ModelRole,
            _req: ChatRequest,
            _ctx: &CallContext,
        ) -> Result<ChatResponse> {
            match self.reply.lock().take().unwrap() {
                Ok(content) => Ok(ChatResponse {
                    content,
                    model: "m".into(),
                    provider: "p".into(),
                    usage: Some(Usage::default()),
                    tool_calls: vec![],
                }),
                Err(e) => Err(e),
            }
        }
    }

    fn candidate(id: &AgentId) -> RoutingCandidate {
        RoutingCandidate {
            agent_id: id.clone(),
            model_slug: "household".into(),
            status: "running".into(),
            device_id: Some("dev-1".into()),
            progress: Some("1/3 steps done".into()),
        }
    }

    fn bare_workspace() -> Arc<WorkspaceClient> {
        let devices = Arc::new(DeviceRegistry::new());
        let bridge = Arc::new(DeviceBridge::new(devices, 100));
        Arc::new(WorkspaceClient::new(bridge, "~/.bot/agent-workspaces", 100))
    }

    #[tokio::test]
    async fn decide_parses_all_decisions() {
        let agent = AgentId::parse("agent_ABCDEFGH12").unwrap();
        let candidates = vec![candidate(&agent)];

        for (reply, expected) in [
            (
                r#"{"decision": "modify", "agentId": "agent_ABCDEFGH12"}"#,
                RouterDecision::Modify { agent_id: agent.clone() },
            ),
            (
                r#"{"decision": "queue", "agentId": "agent_ABCDEFGH12"}"#,
                RouterDecision::Queue { agent_id: agent.clone() },
            ),
            (
                r#"{"decision": "stop", "agentId": "agent_ABCDEFGH12"}"#,
                RouterDecision::Stop { agent_id: agent.clone() },
            ),
            (r#"{"decision": "new"}"#, RouterDecision::New),
        ] {
            let chat = FixedChat::ok(reply);
            let decision = decide(&chat, &CallContext::default(), &candidates, "msg").await;
            assert_eq!(decision, expected);
        }
    }

    #[tokio::test]
    async fn decide_fails_open_to_new() {
        let agent = AgentId::parse("agent_ABCDEFGH12").unwrap();
        let candidates = vec![candidate(&agent)];

        // LLM failure.
        let decision = decide(&FixedChat::err(), &CallContext::default(), &candidates, "m").await;
        assert_eq!(decision, RouterDecision::New);

        // Garbage response.
        let decision = decide(
            &FixedChat::ok("no json"),
            &CallContext::default(),
            &candidates,
            "m",
        )
        .await;
        assert_eq!(decision, RouterDecision::New);

        // Unknown target agent.
        let decision = decide(
            &FixedChat::ok(r#"{"decision": "modify", "agentId": "agent_ZZZZZZZZ99"}"#),
            &CallContext::default(),
            &candidates,
            "m",
        )
        .await;
        assert_eq!(decision, RouterDecision::New);
    }

    #[tokio::test]
    async fn held_lock_with_active_agent_coalesces() {
        let locks = RoutingLockMap::new();
        let signals = SignalHub::new();
        let workspace = bare_workspace();
        let dir = tempfile::tempdir().unwrap();
        let memory = FileMemoryModels::new(dir.path());
        let agent = AgentId::parse("agent_ABCDEFGH12").unwrap();

        assert!(locks.try_acquire("dev-1"));
        locks.set_active("dev-1", agent.clone(), None);

        let outcome = route_or_coalesce(
            &locks,
            &signals,
            &workspace,
            &memory,
            &FixedChat::err(),
            &CallContext::default(),
            "dev-1",
            "user-1",
            "also water the plants",
            &[],
        )
        .await;

        match outcome {
            RouteOutcome::Coalesced { agent_id } => assert_eq!(agent_id, agent),
            other => panic!("expected coalesce, got {other:?}"),
        }
        let drained = signals.drain(&agent);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].request, "also water the plants");
        // The lock is still held by the original owner.
        assert!(locks.is_held("dev-1"));
    }

    #[tokio::test]
    async fn held_lock_without_active_agent_falls_through_as_new() {
        let locks = RoutingLockMap::new();
        let signals = SignalHub::new();
        let workspace = bare_workspace();
        let dir = tempfile::tempdir().unwrap();
        let memory = FileMemoryModels::new(dir.path());

        assert!(locks.try_acquire("dev-1"));

        let outcome = route_or_coalesce(
            &locks,
            &signals,
            &workspace,
            &memory,
            &FixedChat::err(),
            &CallContext::default(),
            "dev-1",
            "user-1",
            "second message",
            &[],
        )
        .await;

        match outcome {
            RouteOutcome::Proceed { decision, lock_held } => {
                assert_eq!(decision, RouterDecision::New);
                assert!(!lock_held, "fall-through must not claim the lock");
            }
            other => panic!("expected proceed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_candidates_skip_router_llm() {
        let locks = RoutingLockMap::new();
        let signals = SignalHub::new();
        let workspace = bare_workspace();
        let dir = tempfile::tempdir().unwrap();
        let memory = FileMemoryModels::new(dir.path());

        // An erroring chat proves the router LLM is never consulted.
        let outcome = route_or_coalesce(
            &locks,
            &signals,
            &workspace,
            &memory,
            &FixedChat::err(),
            &CallContext::default(),
            "dev-1",
            "user-1",
            "hello",
            &[MemoryRef { name: "nothing-matches".into(), confidence: 0.2 }],
        )
        .await;

        match outcome {
            RouteOutcome::Proceed { decision, lock_held } => {
                assert_eq!(decision, RouterDecision::New);
                assert!(lock_held);
            }
            other => panic!("expected proceed, got {other:?}"),
        }
        assert!(locks.is_held("dev-1"));
    }

    #[tokio::test]
    async fn collect_candidates_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let memory = FileMemoryModels::new(dir.path());
        let workspace = bare_workspace();

        let live = AgentId::generate();
        let dead = AgentId::generate();
        memory
            .attach_agent(
                "household",
                AgentRef {
                    agent_id: live.clone(),
                    status: "running".into(),
                    workspace: None,
                    device_id: None,
                },
            )
            .await
            .unwrap();
        memory
            .attach_agent(
                "household",
                AgentRef {
                    agent_id: dead,
                    status: "completed".into(),
                    workspace: None,
                    device_id: None,
                },
            )
            .await
            .unwrap();

        let candidates = collect_candidates(
            &memory,
            &workspace,
            &[MemoryRef { name: "household".into(), confidence: 0.9 }],
        )
        .await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].agent_id, live);
    }
}
