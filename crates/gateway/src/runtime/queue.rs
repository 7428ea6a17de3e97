//! Queue-executor helpers.
//!
//! When an agent finishes with queued follow-up requests, a fresh agent is
//! spawned in the same workspace under a new id, linked via
//! `previousAgentId`. The new agent starts from a handoff brief built out
//! of the completed plan, with the queued requests concatenated into one
//! request. The stale `intake_knowledge.md` is deleted before handoff.

use crate::runtime::model::{Plan, QueuedRequest};

/// Concatenate queued requests into a single follow-up request.
pub fn concat_requests(queue: &[QueuedRequest]) -> String {
    queue
        .iter()
        .map(|q| q.request.trim())
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build a structured handoff brief from the predecessor's completed plan.
pub fn build_handoff_brief(previous_agent: &str, plan: &Plan) -> String {
    let mut brief = format!(
        "## Handoff from {previous_agent}\n\nApproach taken: {}\n\nCompleted steps:\n",
        plan.approach
    );
    if plan.progress.completed_step_ids.is_empty() {
        brief.push_str("(none)\n");
    } else {
        for id in &plan.progress.completed_step_ids {
            if let Some(step) = plan.steps.iter().find(|s| &s.id == id) {
                brief.push_str(&format!("- {} — {}\n", step.id, step.title));
                if !step.expected_output.is_empty() {
                    brief.push_str(&format!("  produced: {}\n", step.expected_output));
                }
            }
        }
    }
    if !plan.progress.remaining_step_ids.is_empty() {
        brief.push_str("\nSteps left unfinished:\n");
        for id in &plan.progress.remaining_step_ids {
            if let Some(step) = plan.steps.iter().find(|s| &s.id == id) {
                brief.push_str(&format!("- {} — {}\n", step.id, step.title));
            }
        }
    }
    brief.push_str(
        "\nArtifacts from the previous run are in this workspace (logs/, research/, output/).",
    );
    brief
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::model::PlanStep;
    use chrono::Utc;

    fn step(id: &str, title: &str) -> PlanStep {
        PlanStep {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            expected_output: format!("{id} artifact"),
            tool_hints: vec![],
            requires_external_data: false,
        }
    }

    fn queued(request: &str) -> QueuedRequest {
        QueuedRequest {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.into(),
            added_at: Utc::now(),
        }
    }

    #[test]
    fn concat_joins_and_skips_empties() {
        let queue = vec![queued("also book the hotel"), queued("  "), queued("and a car")];
        assert_eq!(concat_requests(&queue), "also book the hotel\n\nand a car");
    }

    #[test]
    fn handoff_brief_lists_completed_and_remaining() {
        let mut plan = Plan::new("travel booking", false, vec![step("s1", "Find flights"), step("s2", "Book")]);
        plan.complete_step("s1");

        let brief = build_handoff_brief("agent_ABCDEFGH12", &plan);
        assert!(brief.contains("Handoff from agent_ABCDEFGH12"));
        assert!(brief.contains("s1 — Find flights"));
        assert!(brief.contains("produced: s1 artifact"));
        assert!(brief.contains("unfinished"));
        assert!(brief.contains("s2 — Book"));
    }

    #[test]
    fn handoff_brief_for_fully_completed_plan() {
        let mut plan = Plan::new("x", true, vec![step("s1", "Only step")]);
        plan.complete_step("s1");
        let brief = build_handoff_brief("agent_ABCDEFGH12", &plan);
        assert!(!brief.contains("unfinished"));
        assert!(brief.contains("s1 — Only step"));
    }
}
