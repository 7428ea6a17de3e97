//! Briefing pipeline: principle loading, tailoring, selection, and
//! consolidation.
//!
//! Principles live as JSON files. Rules (and principles flagged `always`)
//! are always-on; the rest are selected when a trigger keyword
//! substring-matches the message or the tailored complexity clears their
//! threshold. Three or more applicable principles are merged by one LLM
//! call; on failure the assembler concatenates them instead.

use std::path::Path;

use hb_domain::message::ChatMessage;
use hb_domain::role::ModelRole;
use hb_providers::{CallContext, ChatRequest};

use crate::prompts;
use crate::runtime::intake::extract_first_json;
use crate::runtime::model::{Principle, TailorResult};
use crate::runtime::tool_loop::LoopChat;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loader
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Loaded principle files, partitioned into always-on rules and
/// trigger-matched principles.
pub struct PrincipleSet {
    pub rules: Vec<Principle>,
    pub principles: Vec<Principle>,
}

impl PrincipleSet {
    pub fn load(dir: &Path) -> Self {
        let mut rules = Vec::new();
        let mut principles = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<Principle>(&raw).ok())
                {
                    Some(p) if p.is_always_on() => rules.push(p),
                    Some(p) => principles.push(p),
                    None => tracing::warn!(path = %path.display(), "skipping unreadable principle"),
                }
            }
        }
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        principles.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::debug!(rules = rules.len(), principles = principles.len(), "principles loaded");
        Self { rules, principles }
    }

    pub fn from_parts(rules: Vec<Principle>, principles: Vec<Principle>) -> Self {
        Self { rules, principles }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tailor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One structured-output LLM call restating and scoring the request.
/// Any failure falls back to a conservative default.
pub async fn tailor(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    briefing_so_far: &str,
    user_message: &str,
) -> TailorResult {
    let prompt = prompts::fill(
        prompts::TAILOR,
        &[("briefing", briefing_so_far), ("user_message", user_message)],
    );
    let req = ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.2),
        json_mode: true,
        ..Default::default()
    };
    let raw = match llm.chat(ModelRole::Intake, req, ctx).await {
        Ok(resp) => resp.content,
        Err(e) => {
            tracing::warn!(error = %e, "tailor call failed, using fallback");
            return TailorResult::fallback(user_message);
        }
    };
    extract_first_json(&raw)
        .and_then(|json| serde_json::from_str::<TailorResult>(json).ok())
        .map(|mut t| {
            t.complexity = t.complexity.min(10);
            t
        })
        .unwrap_or_else(|| {
            tracing::warn!("tailor response failed to parse, using fallback");
            TailorResult::fallback(user_message)
        })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rule-based selection: rules always; a principle when any trigger
/// substring-matches the lowercased message or the complexity clears its
/// threshold.
pub fn select_principles<'a>(
    set: &'a PrincipleSet,
    user_message: &str,
    complexity: u8,
) -> Vec<&'a Principle> {
    let message = user_message.to_lowercase();
    let mut selected: Vec<&Principle> = set.rules.iter().collect();
    for principle in &set.principles {
        let trigger_hit = principle
            .triggers
            .iter()
            .any(|t| !t.is_empty() && message.contains(&t.to_lowercase()));
        let complexity_hit = principle
            .complexity_threshold
            .is_some_and(|threshold| complexity >= threshold);
        if trigger_hit || complexity_hit {
            selected.push(principle);
        }
    }
    selected
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consolidator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Plain concatenation: tailored directive lines for triggered principles
/// plus raw bodies for always-on ones. Used directly for small sets and as
/// the fallback when the merge call fails.
pub fn assemble(selected: &[&Principle]) -> String {
    let mut out = String::new();
    for principle in selected {
        if principle.is_always_on() {
            out.push_str(&principle.body);
        } else {
            out.push_str(&format!("{}: {}", principle.summary, principle.body));
        }
        out.push_str("\n\n");
    }
    out.trim_end().to_string()
}

/// Merge selected principles into one briefing. Two or fewer skip the LLM
/// entirely.
pub async fn consolidate(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    selected: &[&Principle],
    tailored: &TailorResult,
) -> String {
    if selected.len() <= 2 {
        return assemble(selected);
    }

    let principles_text = selected
        .iter()
        .map(|p| format!("[{}] {}\n{}", p.id, p.summary, p.body))
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = prompts::fill(
        prompts::CONSOLIDATE,
        &[
            ("restated_request", &tailored.restated_request),
            ("principles", &principles_text),
        ],
    );
    let req = ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.3),
        ..Default::default()
    };
    match llm.chat(ModelRole::Intake, req, ctx).await {
        Ok(resp) if !resp.content.trim().is_empty() => resp.content,
        Ok(_) => assemble(selected),
        Err(e) => {
            tracing::warn!(error = %e, "consolidation failed, assembling directly");
            assemble(selected)
        }
    }
}
