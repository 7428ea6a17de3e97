//! Step-executor: runs the plan one step at a time through the tool loop.
//!
//! Every step gets a workspace briefing (depth-2 tree, prior step
//! summaries, remaining steps), the recruiter's persona prompt, and the
//! recruited tool subset plus the synthetic meta-tools. Tool calls are
//! journaled into `plan.json.progress.currentStepToolCalls` as they
//! happen; completed steps write `logs/{step_id}-output.md`. Between
//! steps the planner reviews the remaining suffix, consuming any signals
//! coalesced during the step.

use std::sync::Arc;

use hb_domain::message::{ChatMessage, ToolDefinition};
use hb_providers::CallContext;

use crate::runtime::catalog::{PersonaCatalog, ToolManifest};
use crate::runtime::handlers::{synthetic_tool_specs, HandlerRegistry};
use crate::runtime::model::{Plan, PlanStep, StepResult, SyntheticSignal};
use crate::runtime::planner;
use crate::runtime::recruiter::{self, Recruitment};
use crate::runtime::signals::SignalHub;
use crate::runtime::tool_loop::{run_tool_loop, LoopChat, ToolLoopConfig};
use crate::runtime::workspace::{AgentHandle, WorkspaceClient};

/// How many times one step may be re-entered (tool requests, research,
/// escalations) before it is marked failed.
const MAX_STEP_ATTEMPTS: usize = 3;

pub struct StepLoopDeps<'a> {
    pub llm: &'a dyn LoopChat,
    pub ctx: &'a CallContext,
    pub workspace: &'a Arc<WorkspaceClient>,
    pub manifest: &'a ToolManifest,
    pub catalog: &'a PersonaCatalog,
    pub signals: &'a SignalHub,
    pub max_iterations: usize,
}

/// Builds a handler registry for a tool subset. Injected so tests can
/// supply scripted handlers.
pub type RegistryBuilder<'a> = dyn Fn(&[String]) -> HandlerRegistry + Send + Sync + 'a;

/// Terminal state of the step loop.
#[derive(Debug)]
pub enum StepLoopEnd {
    Completed { summary: String },
    Paused { question: String },
    Failed { reason: String },
}

pub async fn execute_plan(
    deps: &StepLoopDeps<'_>,
    agent: &AgentHandle,
    recruitment: &mut Recruitment,
    plan: &mut Plan,
    registry_builder: &RegistryBuilder<'_>,
    restated_request: &str,
) -> StepLoopEnd {
    let mut completed_summaries: Vec<(String, String)> = Vec::new();
    let mut research_notes: Option<String> = None;
    let mut step_attempts = 0usize;

    while let Some(step) = plan.current_step().cloned() {
        step_attempts += 1;
        if step_attempts > MAX_STEP_ATTEMPTS {
            let reason = format!("step {} exceeded {MAX_STEP_ATTEMPTS} attempts", step.id);
            tracing::warn!(agent_id = %agent.agent_id, step_id = %step.id, "{reason}");
            return StepLoopEnd::Failed { reason };
        }

        plan.begin_step(&step.id);
        persist_plan(deps.workspace, agent, plan).await;

        let outcome = run_step(
            deps,
            agent,
            recruitment,
            plan,
            &step,
            registry_builder,
            &completed_summaries,
            research_notes.take(),
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                return StepLoopEnd::Failed {
                    reason: format!("step {} failed: {e}", step.id),
                };
            }
        };

        match outcome.signal.clone() {
            None => {
                // Step done: journal output and advance.
                let output_rel = format!("logs/{}-output.md", step.id);
                deps.workspace.write_file_background(
                    agent,
                    &output_rel,
                    format!("# {}\n\n{}", step.title, outcome.final_text),
                );
                completed_summaries.push((
                    step.id.clone(),
                    outcome.final_text.chars().take(400).collect(),
                ));

                plan.complete_step(&step.id);
                persist_plan(deps.workspace, agent, plan).await;
                step_attempts = 0;

                let result = StepResult {
                    step_id: step.id.clone(),
                    success: true,
                    output: outcome.final_text.clone(),
                    iterations: outcome.iterations,
                    tool_calls_made: outcome.tool_calls.iter().map(|t| t.tool_id.clone()).collect(),
                    escalated: false,
                    escalation_reason: None,
                };

                if plan.is_finished() {
                    break;
                }

                // Review the remaining suffix, consuming coalesced signals.
                let pending = deps.signals.drain(&agent.agent_id);
                if !plan.is_simple_task || !pending.is_empty() {
                    let listing = deps.workspace.list_tree(agent, 2).await.unwrap_or_default();
                    planner::replan(
                        deps.llm, deps.ctx, plan, &result, &listing, &pending, false,
                    )
                    .await;
                    persist_plan(deps.workspace, agent, plan).await;
                }
            }
            Some(SyntheticSignal::Escalate { reason }) => {
                tracing::info!(agent_id = %agent.agent_id, step_id = %step.id, reason = %reason, "step escalated to architect");
                let result = StepResult {
                    step_id: step.id.clone(),
                    success: false,
                    output: outcome.final_text.clone(),
                    iterations: outcome.iterations,
                    tool_calls_made: vec![],
                    escalated: true,
                    escalation_reason: Some(reason),
                };
                let pending = deps.signals.drain(&agent.agent_id);
                let listing = deps.workspace.list_tree(agent, 2).await.unwrap_or_default();
                planner::replan(deps.llm, deps.ctx, plan, &result, &listing, &pending, true).await;
                persist_plan(deps.workspace, agent, plan).await;
            }
            Some(SyntheticSignal::WaitForUser { question }) => {
                persist_plan(deps.workspace, agent, plan).await;
                return StepLoopEnd::Paused { question };
            }
            Some(SyntheticSignal::RequestTools { hints }) => {
                tracing::info!(agent_id = %agent.agent_id, hints = ?hints, "agent requested more tools");
                *recruitment = recruiter::rewrite_with_tool_hints(
                    deps.llm,
                    deps.ctx,
                    deps.catalog,
                    deps.manifest,
                    restated_request,
                    recruitment,
                    &hints,
                )
                .await;
                // Same step runs again with the widened tool subset.
            }
            Some(SyntheticSignal::RequestResearch { query }) => {
                tracing::info!(agent_id = %agent.agent_id, query = %query, "agent requested a research pass");
                research_notes =
                    Some(inline_research(deps, agent, registry_builder, &query).await);
            }
        }
    }

    let summary = completed_summaries
        .last()
        .map(|(_, text)| text.clone())
        .unwrap_or_default();
    StepLoopEnd::Completed { summary }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// One step
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn run_step(
    deps: &StepLoopDeps<'_>,
    agent: &AgentHandle,
    recruitment: &Recruitment,
    plan: &mut Plan,
    step: &PlanStep,
    registry_builder: &RegistryBuilder<'_>,
    completed_summaries: &[(String, String)],
    research_notes: Option<String>,
) -> hb_domain::Result<crate::runtime::tool_loop::ToolLoopOutcome> {
    // Tool subset: recruited tools plus step hints, deduped, plus the
    // synthetic meta-tools.
    let mut tool_ids = recruitment.tools.clone();
    for hint in &step.tool_hints {
        if !tool_ids.contains(hint) {
            tool_ids.push(hint.clone());
        }
    }
    let mut tool_defs = deps.manifest.definitions_for(&tool_ids);
    tool_defs.extend(synthetic_tool_specs().into_iter().map(|spec| ToolDefinition {
        name: spec.id,
        description: spec.description,
        parameters: spec.parameters,
    }));

    let registry = registry_builder(&tool_ids);

    // Workspace briefing.
    let tree = deps.workspace.list_tree(agent, 2).await.unwrap_or_default();
    let prior = if completed_summaries.is_empty() {
        "(first step)".to_string()
    } else {
        completed_summaries
            .iter()
            .map(|(id, text)| format!("- {id}: {text}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let remaining = plan
        .progress
        .remaining_step_ids
        .iter()
        .skip(1)
        .filter_map(|id| plan.steps.iter().find(|s| &s.id == id))
        .map(|s| format!("- {} ({})", s.id, s.title))
        .collect::<Vec<_>>()
        .join("\n");

    let mut system = format!(
        "{}\n\n## Workspace\n{}\n\n## Completed steps\n{}\n\n## Remaining steps\n{}",
        recruitment.custom_prompt, tree, prior, remaining
    );
    if let Some(notes) = research_notes {
        system.push_str("\n\n## Research notes\n");
        system.push_str(&notes);
    }

    let user = format!(
        "Execute step {} — {}\n\n{}\n\nExpected output: {}",
        step.id, step.title, step.description, step.expected_output
    );

    let cfg = ToolLoopConfig {
        role: recruitment.model_role,
        temperature: 0.7,
        max_iterations: deps.max_iterations,
        json_mode: false,
    };

    // Journal every tool call as it happens: into the plan progress and,
    // in the background, into logs/tool-calls.jsonl.
    let workspace = deps.workspace.clone();
    let journal_agent = agent.clone();
    let progress = &mut plan.progress;
    let outcome = run_tool_loop(
        deps.llm,
        deps.ctx,
        &cfg,
        vec![ChatMessage::system(system), ChatMessage::user(user)],
        tool_defs,
        &registry,
        |entry| {
            progress.current_step_tool_calls.push(entry.clone());
            let jsonl = progress
                .current_step_tool_calls
                .iter()
                .filter_map(|e| serde_json::to_string(e).ok())
                .collect::<Vec<_>>()
                .join("\n");
            workspace.write_file_background(&journal_agent, "logs/tool-calls.jsonl", jsonl);
        },
    )
    .await?;

    // Rewrite plan.json with the accumulated tool-call journal.
    persist_plan(deps.workspace, agent, plan).await;
    Ok(outcome)
}

/// A focused research sub-agent run inline; its output is injected into
/// the next attempt of the current step.
async fn inline_research(
    deps: &StepLoopDeps<'_>,
    agent: &AgentHandle,
    registry_builder: &RegistryBuilder<'_>,
    query: &str,
) -> String {
    let research_tools: Vec<String> = ["web.search", "web.fetch", "research.notes"]
        .iter()
        .map(|s| s.to_string())
        .filter(|id| deps.manifest.get(id).is_some())
        .collect();
    let tool_defs = deps.manifest.definitions_for(&research_tools);
    let registry = registry_builder(&research_tools);

    let cfg = ToolLoopConfig {
        role: hb_domain::role::ModelRole::Intake,
        temperature: 0.3,
        max_iterations: 6,
        json_mode: false,
    };
    let messages = vec![
        ChatMessage::system(
            "You are a research assistant. Gather what is asked and reply with a \
             compact summary of findings.",
        ),
        ChatMessage::user(query.to_string()),
    ];
    match run_tool_loop(deps.llm, deps.ctx, &cfg, messages, tool_defs, &registry, |_| {}).await {
        Ok(outcome) => outcome.final_text,
        Err(e) => {
            tracing::warn!(agent_id = %agent.agent_id, error = %e, "inline research failed");
            format!("(research unavailable: {e})")
        }
    }
}

async fn persist_plan(workspace: &Arc<WorkspaceClient>, agent: &AgentHandle, plan: &Plan) {
    if let Err(e) = workspace.write_json(agent, "plan.json", plan).await {
        tracing::warn!(agent_id = %agent.agent_id, error = %e, "plan.json write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::bridge::DeviceBridge;
    use crate::devices::registry::DeviceRegistry;
    use crate::runtime::handlers::{HandlerOutcome, ToolHandler};
    use crate::runtime::model::SelectedPersona;
    use hb_domain::error::Result;
    use hb_domain::message::ToolCall;
    use hb_domain::role::ModelRole;
    use hb_domain::stream::Usage;
    use hb_domain::AgentId;
    use hb_providers::{ChatRequest, ChatResponse};
    use parking_lot::Mutex;

    struct ScriptedChat {
        replies: Mutex<Vec<ChatResponse>>,
    }

    impl ScriptedChat {
        fn new(replies: Vec<ChatResponse>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }

        fn text(content: &str) -> ChatResponse {
            Self::with_calls(content, vec![])
        }

        fn with_calls(content: &str, tool_calls: Vec<ToolCall>) -> ChatResponse {
            ChatResponse {
                content: content.into(),
                model: "m".into(),
                provider: "p".into(),
                usage: Some(Usage::default()),
                tool_calls,
            }
        }
    }

    #[async_trait::async_trait]
    impl LoopChat for ScriptedChat {
        async fn chat(
            &self,
            _role: ModelRole,
            _req: ChatRequest,
            _ctx: &CallContext,
        ) -> Result<ChatResponse> {
            let mut replies = self.replies.lock();
            assert!(!replies.is_empty(), "script exhausted");
            Ok(replies.remove(0))
        }
    }

    struct EchoTool;
    #[async_trait::async_trait]
    impl ToolHandler for EchoTool {
        async fn handle(&self, _args: serde_json::Value) -> HandlerOutcome {
            HandlerOutcome::text("tool ran")
        }
    }

    struct WaitTool;
    #[async_trait::async_trait]
    impl ToolHandler for WaitTool {
        async fn handle(&self, args: serde_json::Value) -> HandlerOutcome {
            HandlerOutcome {
                content: "acknowledged".into(),
                break_batch: true,
                signal: Some(SyntheticSignal::WaitForUser {
                    question: args["question"].as_str().unwrap_or("?").into(),
                }),
                ..Default::default()
            }
        }
    }

    fn build_registry(_ids: &[String]) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.insert("datetime.now", Arc::new(EchoTool));
        registry.insert("wait_for_user", Arc::new(WaitTool));
        registry
    }

    fn fixtures() -> (
        Arc<WorkspaceClient>,
        ToolManifest,
        PersonaCatalog,
        SignalHub,
        AgentHandle,
        Recruitment,
    ) {
        let devices = Arc::new(DeviceRegistry::new());
        let bridge = Arc::new(DeviceBridge::new(devices, 50));
        let workspace = Arc::new(WorkspaceClient::new(bridge, "~/.bot/agent-workspaces", 50));
        let manifest = ToolManifest::load(std::path::Path::new("/nonexistent"));
        let catalog = PersonaCatalog::load(std::path::Path::new("/nonexistent"));
        let signals = SignalHub::new();
        let agent = AgentHandle::new("dev-1", "u", AgentId::generate());
        let recruitment = Recruitment {
            custom_prompt: "You are helpful.".into(),
            selected_personas: vec![SelectedPersona {
                id: "personal-assistant".into(),
                reason: "r".into(),
            }],
            council: None,
            tools: vec!["datetime.now".into()],
            model_role: ModelRole::Workhorse,
        };
        (workspace, manifest, catalog, signals, agent, recruitment)
    }

    fn plan_of(steps: &[&str]) -> Plan {
        Plan::new(
            "test",
            false,
            steps
                .iter()
                .map(|id| PlanStep {
                    id: id.to_string(),
                    title: format!("step {id}"),
                    description: "do it".into(),
                    expected_output: "done".into(),
                    tool_hints: vec![],
                    requires_external_data: false,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn single_simple_step_completes() {
        let (workspace, manifest, catalog, signals, agent, mut recruitment) = fixtures();
        let chat = ScriptedChat::new(vec![ScriptedChat::text("the time is 9am")]);
        let deps = StepLoopDeps {
            llm: &chat,
            ctx: &CallContext::default(),
            workspace: &workspace,
            manifest: &manifest,
            catalog: &catalog,
            signals: &signals,
            max_iterations: 5,
        };
        let mut plan = plan_of(&["s1"]);
        plan.is_simple_task = true;

        let end = execute_plan(
            &deps,
            &agent,
            &mut recruitment,
            &mut plan,
            &build_registry,
            "what time is it",
        )
        .await;

        match end {
            StepLoopEnd::Completed { summary } => assert_eq!(summary, "the time is 9am"),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(plan.is_finished());
        assert!(plan.progress_is_consistent());
    }

    #[tokio::test]
    async fn tool_calls_are_journaled_then_cleared_on_completion() {
        let (workspace, manifest, catalog, signals, agent, mut recruitment) = fixtures();
        let chat = ScriptedChat::new(vec![
            ScriptedChat::with_calls(
                "",
                vec![ToolCall {
                    call_id: "c1".into(),
                    tool_name: "datetime__now".into(),
                    arguments: serde_json::json!({}),
                }],
            ),
            ScriptedChat::text("done"),
        ]);
        let deps = StepLoopDeps {
            llm: &chat,
            ctx: &CallContext::default(),
            workspace: &workspace,
            manifest: &manifest,
            catalog: &catalog,
            signals: &signals,
            max_iterations: 5,
        };
        let mut plan = plan_of(&["s1"]);
        plan.is_simple_task = true;

        let end = execute_plan(
            &deps,
            &agent,
            &mut recruitment,
            &mut plan,
            &build_registry,
            "x",
        )
        .await;
        assert!(matches!(end, StepLoopEnd::Completed { .. }));
        // Completion clears the per-step journal.
        assert!(plan.progress.current_step_tool_calls.is_empty());
        assert!(plan.progress.completed_step_ids.contains(&"s1".to_string()));
    }

    #[tokio::test]
    async fn wait_for_user_pauses_the_loop() {
        let (workspace, manifest, catalog, signals, agent, mut recruitment) = fixtures();
        let chat = ScriptedChat::new(vec![ScriptedChat::with_calls(
            "",
            vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "wait_for_user".into(),
                arguments: serde_json::json!({"question": "which calendar?"}),
            }],
        )]);
        let deps = StepLoopDeps {
            llm: &chat,
            ctx: &CallContext::default(),
            workspace: &workspace,
            manifest: &manifest,
            catalog: &catalog,
            signals: &signals,
            max_iterations: 5,
        };
        let mut plan = plan_of(&["s1", "s2"]);

        let end = execute_plan(
            &deps,
            &agent,
            &mut recruitment,
            &mut plan,
            &build_registry,
            "x",
        )
        .await;
        match end {
            StepLoopEnd::Paused { question } => assert_eq!(question, "which calendar?"),
            other => panic!("expected pause, got {other:?}"),
        }
        // Nothing was completed.
        assert!(plan.progress.completed_step_ids.is_empty());
    }

    #[tokio::test]
    async fn multi_step_plan_replans_between_steps() {
        let (workspace, manifest, catalog, signals, agent, mut recruitment) = fixtures();
        // Script: step s1 answer, replan (unchanged), step s2 answer.
        let chat = ScriptedChat::new(vec![
            ScriptedChat::text("s1 output"),
            ScriptedChat::text(r#"{"changed": false, "reasoning": "fine"}"#),
            ScriptedChat::text("s2 output"),
        ]);
        let deps = StepLoopDeps {
            llm: &chat,
            ctx: &CallContext::default(),
            workspace: &workspace,
            manifest: &manifest,
            catalog: &catalog,
            signals: &signals,
            max_iterations: 5,
        };
        let mut plan = plan_of(&["s1", "s2"]);

        let end = execute_plan(
            &deps,
            &agent,
            &mut recruitment,
            &mut plan,
            &build_registry,
            "x",
        )
        .await;
        match end {
            StepLoopEnd::Completed { summary } => assert_eq!(summary, "s2 output"),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(plan.progress.completed_step_ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn coalesced_signal_forces_replan_even_for_simple_tasks() {
        let (workspace, manifest, catalog, signals, agent, mut recruitment) = fixtures();
        // Simple task, but a signal arrives during s1: replan runs and
        // appends a new step honoring it.
        let chat = ScriptedChat::new(vec![
            ScriptedChat::text("s1 output"),
            ScriptedChat::text(
                r#"{"changed": true, "reasoning": "user added work",
                    "remainingSteps": [{"id": "s2", "title": "extra", "description": "added"}]}"#,
            ),
            ScriptedChat::text("s2 output"),
        ]);
        let deps = StepLoopDeps {
            llm: &chat,
            ctx: &CallContext::default(),
            workspace: &workspace,
            manifest: &manifest,
            catalog: &catalog,
            signals: &signals,
            max_iterations: 5,
        };
        let mut plan = plan_of(&["s1", "s2"]);
        plan.is_simple_task = true;
        signals.push(&agent.agent_id, crate::runtime::signals::AgentSignal::new("also do this"));

        let end = execute_plan(
            &deps,
            &agent,
            &mut recruitment,
            &mut plan,
            &build_registry,
            "x",
        )
        .await;
        assert!(matches!(end, StepLoopEnd::Completed { .. }));
        // The drained signal is gone.
        assert_eq!(signals.pending(&agent.agent_id), 0);
    }
}
