//! Research persistence and summarization.
//!
//! Large tool outputs are written in full to the workspace's `research/`
//! directory so the model can keep working from a truncated view with
//! pointers back to the complete data. Results past the summary threshold
//! also get a background LLM summary. Both writes are fire-and-forget.

use std::sync::Arc;

use chrono::Utc;

use hb_domain::role::ModelRole;
use hb_providers::{CallContext, ChatRequest, ResilientClient};

use crate::prompts;
use crate::runtime::workspace::{AgentHandle, WorkspaceClient};

pub struct ResearchStore {
    workspace: Arc<WorkspaceClient>,
    llm: Arc<ResilientClient>,
    /// Returned text is capped at this many chars.
    result_cap: usize,
    /// Raw results above this length get a background summary.
    summary_threshold: usize,
}

impl ResearchStore {
    pub fn new(
        workspace: Arc<WorkspaceClient>,
        llm: Arc<ResilientClient>,
        result_cap: usize,
        summary_threshold: usize,
    ) -> Self {
        Self {
            workspace,
            llm,
            result_cap,
            summary_threshold,
        }
    }

    /// Persist a raw tool result and return the (possibly truncated) text
    /// to hand back to the model.
    pub fn persist_and_truncate(self: &Arc<Self>, agent: &AgentHandle, tool_id: &str, raw: &str) -> String {
        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let file_slug = tool_id.replace('.', "_");
        let raw_rel = format!("research/{file_slug}-{ts}.txt");
        let summary_rel = format!("research/{file_slug}-{ts}-summary.md");

        self.workspace
            .write_file_background(agent, &raw_rel, raw.to_string());

        if raw.len() > self.summary_threshold {
            self.spawn_summary(agent, raw, &summary_rel);
        }

        truncate_with_pointer(raw, self.result_cap, &raw_rel, &summary_rel)
    }

    fn spawn_summary(self: &Arc<Self>, agent: &AgentHandle, raw: &str, summary_rel: &str) {
        let llm = self.llm.clone();
        let workspace = self.workspace.clone();
        let agent = agent.clone();
        let summary_rel = summary_rel.to_string();
        // Summaries work from a bounded head of the content.
        let content: String = raw.chars().take(24_000).collect();
        tokio::spawn(async move {
            let req = ChatRequest {
                messages: vec![hb_domain::message::ChatMessage::user(prompts::fill(
                    prompts::RESEARCH_SUMMARY,
                    &[("content", &content)],
                ))],
                temperature: Some(0.3),
                ..Default::default()
            };
            let ctx = CallContext {
                device_id: Some(agent.device_id.clone()),
                agent_id: Some(agent.agent_id.to_string()),
            };
            match llm.chat_for_role(ModelRole::Intake, req, &ctx).await {
                Ok(resp) => {
                    if let Err(e) = workspace.write_file(&agent, &summary_rel, &resp.content).await {
                        tracing::warn!(error = %e, "research summary write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "research summarization failed"),
            }
        });
    }
}

/// Truncate text past `cap` chars, appending intact pointers to the full
/// result and its summary.
pub fn truncate_with_pointer(raw: &str, cap: usize, raw_rel: &str, summary_rel: &str) -> String {
    if raw.chars().count() <= cap {
        return raw.to_string();
    }
    let head: String = raw.chars().take(cap).collect();
    format!(
        "{head}\n\n[result truncated; full output: {raw_rel}; summary: {summary_rel}]"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_results_pass_through_untouched() {
        let out = truncate_with_pointer("small", 8_000, "research/a.txt", "research/a-summary.md");
        assert_eq!(out, "small");
    }

    #[test]
    fn truncation_triggers_past_cap_with_intact_pointer() {
        let raw = "y".repeat(8_001);
        let out = truncate_with_pointer(&raw, 8_000, "research/web_search-1.txt", "research/web_search-1-summary.md");
        assert!(out.len() < raw.len() + 200);
        assert!(out.contains("full output: research/web_search-1.txt"));
        assert!(out.contains("summary: research/web_search-1-summary.md"));
        assert!(out.starts_with(&"y".repeat(100)));
    }

    #[test]
    fn exactly_cap_is_not_truncated() {
        let raw = "z".repeat(8_000);
        let out = truncate_with_pointer(&raw, 8_000, "a", "b");
        assert_eq!(out, raw);
    }
}
