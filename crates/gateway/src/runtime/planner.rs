//! Planner: create the step plan, then review it after every step.
//!
//! Plan creation runs on the architect role. Replanning picks its model by
//! stakes: architect when four or more steps remain or the last step
//! escalated/failed, intake otherwise. A replanner parse failure keeps the
//! original plan; a changed plan replaces only the remaining suffix.

use hb_domain::message::ChatMessage;
use hb_domain::role::ModelRole;
use hb_providers::{CallContext, ChatRequest};

use crate::prompts;
use crate::runtime::intake::extract_first_json;
use crate::runtime::model::{Plan, PlanStep, StepResult};
use crate::runtime::signals::AgentSignal;
use crate::runtime::tool_loop::LoopChat;

/// Create a plan for the restated request. Parse failures degrade to a
/// single catch-all step so the pipeline always has something to execute.
pub async fn create_plan(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    restated_request: &str,
    briefing: &str,
    custom_prompt: &str,
) -> Plan {
    let prompt = prompts::fill(
        prompts::PLAN,
        &[
            ("restated_request", restated_request),
            ("briefing", briefing),
            ("custom_prompt", custom_prompt),
        ],
    );
    let req = ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.2),
        json_mode: true,
        ..Default::default()
    };

    let raw = match llm.chat(ModelRole::Architect, req, ctx).await {
        Ok(resp) => resp.content,
        Err(e) => {
            tracing::warn!(error = %e, "plan creation failed, using single-step fallback");
            return fallback_plan(restated_request);
        }
    };

    let Some(value) = extract_first_json(&raw)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
    else {
        tracing::warn!("plan response unparseable, using single-step fallback");
        return fallback_plan(restated_request);
    };

    let approach = value
        .get("approach")
        .and_then(|v| v.as_str())
        .unwrap_or("direct execution")
        .to_string();
    let is_simple_task = value
        .get("isSimpleTask")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let mut steps = parse_steps(value.get("steps"));
    if steps.is_empty() {
        return fallback_plan(restated_request);
    }
    assign_missing_ids(&mut steps);

    Plan::new(approach, is_simple_task, steps)
}

fn fallback_plan(restated_request: &str) -> Plan {
    Plan::new(
        "single-step fallback",
        true,
        vec![PlanStep {
            id: "s1".into(),
            title: "Complete the request".into(),
            description: restated_request.to_string(),
            expected_output: "the user's request is satisfied".into(),
            tool_hints: vec![],
            requires_external_data: false,
        }],
    )
}

fn parse_steps(value: Option<&serde_json::Value>) -> Vec<PlanStep> {
    value
        .and_then(|v| serde_json::from_value::<Vec<PlanStep>>(v.clone()).ok())
        .unwrap_or_default()
}

fn assign_missing_ids(steps: &mut [PlanStep]) {
    for (idx, step) in steps.iter_mut().enumerate() {
        if step.id.trim().is_empty() {
            step.id = format!("s{}", idx + 1);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct ReplanOutcome {
    pub changed: bool,
    pub reasoning: String,
}

/// Which model reviews the plan after a step.
pub fn replan_role(plan: &Plan, last_result: &StepResult) -> ModelRole {
    if plan.progress.remaining_step_ids.len() >= 4 || last_result.escalated || !last_result.success
    {
        ModelRole::Architect
    } else {
        ModelRole::Intake
    }
}

/// Review the remaining plan after a completed step; mutates `plan` in
/// place when the reviewer changes it. Any failure keeps the original.
pub async fn replan(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    plan: &mut Plan,
    last_result: &StepResult,
    workspace_listing: &str,
    signals: &[AgentSignal],
    force_architect: bool,
) -> ReplanOutcome {
    let role = if force_architect {
        ModelRole::Architect
    } else {
        replan_role(plan, last_result)
    };

    let remaining_text = plan
        .progress
        .remaining_step_ids
        .iter()
        .filter_map(|id| plan.steps.iter().find(|s| &s.id == id))
        .map(|s| format!("- {} ({}): {}", s.id, s.title, s.description))
        .collect::<Vec<_>>()
        .join("\n");
    let signals_text = if signals.is_empty() {
        "(none)".to_string()
    } else {
        signals
            .iter()
            .map(|s| format!("- {}", s.request))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let prompt = prompts::fill(
        prompts::REPLAN,
        &[
            ("last_output", &last_result.output),
            ("remaining_steps", &remaining_text),
            ("workspace_listing", workspace_listing),
            ("signals", &signals_text),
        ],
    );
    let req = ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.2),
        json_mode: true,
        ..Default::default()
    };

    let raw = match llm.chat(role, req, ctx).await {
        Ok(resp) => resp.content,
        Err(e) => {
            tracing::warn!(error = %e, "replan call failed, keeping original plan");
            return ReplanOutcome {
                changed: false,
                reasoning: "replan failed; original plan kept".into(),
            };
        }
    };

    let Some(value) = extract_first_json(&raw)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
    else {
        tracing::warn!("replan response unparseable, keeping original plan");
        return ReplanOutcome {
            changed: false,
            reasoning: "replan unparseable; original plan kept".into(),
        };
    };

    let changed = value.get("changed").and_then(|v| v.as_bool()).unwrap_or(false);
    let reasoning = value
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if !changed {
        return ReplanOutcome { changed: false, reasoning };
    }

    let mut new_steps = parse_steps(value.get("remainingSteps"));
    if new_steps.is_empty() {
        tracing::warn!("replan claimed change but produced no steps, keeping original plan");
        return ReplanOutcome {
            changed: false,
            reasoning,
        };
    }
    assign_missing_ids(&mut new_steps);

    if plan.replace_remaining(new_steps) {
        tracing::info!(
            remaining = plan.progress.remaining_step_ids.len(),
            "plan suffix replaced after step review"
        );
        ReplanOutcome { changed: true, reasoning }
    } else {
        tracing::warn!("replan steps collided with completed ids, keeping original plan");
        ReplanOutcome {
            changed: false,
            reasoning,
        }
    }
}
