//! Recruiter: two LLM passes that staff an agent.
//!
//! Pass 1 picks personas (and optionally a council) from compact
//! summaries. Pass 2 reads the full persona bodies and writes the agent's
//! custom prompt plus a tool subset from the manifest catalog. Both passes
//! degrade to safe defaults on parse failure.

use hb_domain::message::ChatMessage;
use hb_domain::role::ModelRole;
use hb_providers::{CallContext, ChatRequest};

use crate::prompts;
use crate::runtime::catalog::{PersonaCatalog, ToolManifest};
use crate::runtime::intake::extract_first_json;
use crate::runtime::model::SelectedPersona;
use crate::runtime::tool_loop::LoopChat;

/// What the recruiter hands to the planner and step-executor.
#[derive(Debug, Clone)]
pub struct Recruitment {
    pub custom_prompt: String,
    pub selected_personas: Vec<SelectedPersona>,
    pub council: Option<String>,
    pub tools: Vec<String>,
    pub model_role: ModelRole,
}

pub async fn recruit(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    catalog: &PersonaCatalog,
    manifest: &ToolManifest,
    restated_request: &str,
    briefing: &str,
) -> Recruitment {
    let selected = pick_personas(llm, ctx, catalog, restated_request, briefing).await;
    write_prompt(llm, ctx, catalog, manifest, restated_request, selected, None).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 1: picker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Picked {
    personas: Vec<SelectedPersona>,
    council: Option<String>,
}

async fn pick_personas(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    catalog: &PersonaCatalog,
    restated_request: &str,
    briefing: &str,
) -> Picked {
    let prompt = prompts::fill(
        prompts::RECRUIT_PICK,
        &[
            ("restated_request", restated_request),
            ("briefing", briefing),
            ("personas", &catalog.summaries_text()),
            ("councils", &catalog.councils_text()),
        ],
    );
    let req = ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.2),
        json_mode: true,
        ..Default::default()
    };

    let fallback = || Picked {
        personas: vec![SelectedPersona {
            id: catalog.default_persona().id.clone(),
            reason: "default persona".into(),
        }],
        council: None,
    };

    let raw = match llm.chat(ModelRole::Intake, req, ctx).await {
        Ok(resp) => resp.content,
        Err(e) => {
            tracing::warn!(error = %e, "persona picker failed, using default persona");
            return fallback();
        }
    };

    let Some(value) = extract_first_json(&raw)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
    else {
        return fallback();
    };

    let mut personas: Vec<SelectedPersona> = value
        .get("selectedPersonas")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    // Keep only personas that actually exist in the catalog.
    personas.retain(|p| catalog.get(&p.id).is_some());
    if personas.is_empty() {
        return fallback();
    }

    let council = value
        .get("council")
        .and_then(|v| v.as_str())
        .filter(|id| catalog.council(id).is_some())
        .map(str::to_string);

    Picked { personas, council }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 2: writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn write_prompt(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    catalog: &PersonaCatalog,
    manifest: &ToolManifest,
    restated_request: &str,
    picked: Picked,
    extra_tool_hints: Option<&[String]>,
) -> Recruitment {
    let bodies = picked
        .personas
        .iter()
        .filter_map(|p| catalog.get(&p.id))
        .map(|p| format!("## {}\n{}", p.id, p.body))
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = prompts::fill(
        prompts::RECRUIT_WRITE,
        &[
            ("restated_request", restated_request),
            ("persona_bodies", &bodies),
            ("tool_catalog", &manifest.catalog_text()),
        ],
    );
    let req = ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.3),
        json_mode: true,
        ..Default::default()
    };

    let default_tools = || {
        picked
            .personas
            .iter()
            .filter_map(|p| catalog.get(&p.id))
            .flat_map(|p| p.default_tools.clone())
            .collect::<Vec<_>>()
    };

    let parsed = match llm.chat(ModelRole::Intake, req, ctx).await {
        Ok(resp) => extract_first_json(&resp.content)
            .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok()),
        Err(e) => {
            tracing::warn!(error = %e, "prompt writer failed, composing from persona bodies");
            None
        }
    };

    let (custom_prompt, mut tools, model_role) = match parsed {
        Some(value) => {
            let custom_prompt = value
                .get("customPrompt")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| bodies.clone());
            let tools: Vec<String> = value
                .get("tools")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_else(default_tools);
            let model_role = value
                .get("modelRole")
                .and_then(|v| v.as_str())
                .and_then(ModelRole::from_str)
                .unwrap_or(ModelRole::Workhorse);
            (custom_prompt, tools, model_role)
        }
        None => (bodies.clone(), default_tools(), ModelRole::Workhorse),
    };

    if let Some(hints) = extra_tool_hints {
        tools.extend(hints.iter().cloned());
    }
    // Unknown tool ids are dropped; known ones deduped in order.
    let mut seen = std::collections::HashSet::new();
    tools.retain(|id| manifest.get(id).is_some() && seen.insert(id.clone()));
    if tools.is_empty() {
        tools = default_tools();
        tools.retain(|id| manifest.get(id).is_some());
    }

    Recruitment {
        custom_prompt,
        selected_personas: picked.personas,
        council: picked.council,
        tools,
        model_role,
    }
}

/// Re-enter the writer pass with additional tool hints (the
/// `request_tools` synthetic signal).
pub async fn rewrite_with_tool_hints(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    catalog: &PersonaCatalog,
    manifest: &ToolManifest,
    restated_request: &str,
    current: &Recruitment,
    hints: &[String],
) -> Recruitment {
    let picked = Picked {
        personas: current.selected_personas.clone(),
        council: current.council.clone(),
    };
    let mut updated = write_prompt(
        llm,
        ctx,
        catalog,
        manifest,
        restated_request,
        picked,
        Some(hints),
    )
    .await;
    // Never lose tools the agent already had.
    for id in &current.tools {
        if !updated.tools.contains(id) {
            updated.tools.push(id.clone());
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_domain::error::Result;
    use hb_domain::stream::Usage;
    use hb_providers::ChatResponse;
    use parking_lot::Mutex;

    struct ScriptedChat {
        replies: Mutex<Vec<Result<String>>>,
    }

    impl ScriptedChat {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
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
            match self.replies.lock().remove(0) {
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

    fn catalog() -> PersonaCatalog {
        PersonaCatalog::load(std::path::Path::new("/nonexistent"))
    }

    fn manifest() -> ToolManifest {
        ToolManifest::load(std::path::Path::new("/nonexistent"))
    }

    #[tokio::test]
    async fn two_pass_recruitment_happy_path() {
        let chat = ScriptedChat::new(vec![
            Ok(r#"{"selectedPersonas": [{"id": "researcher", "reason": "needs sources"}],
                   "council": null}"#
                .into()),
            Ok(r#"{"customPrompt": "You research flights thoroughly.",
                   "tools": ["web.search", "web.fetch", "ghost.tool"],
                   "modelRole": "workhorse"}"#
                .into()),
        ]);
        let r = recruit(
            &chat,
            &CallContext::default(),
            &catalog(),
            &manifest(),
            "find cheap flights to Tokyo",
            "briefing",
        )
        .await;
        assert_eq!(r.selected_personas[0].id, "researcher");
        assert_eq!(r.custom_prompt, "You research flights thoroughly.");
        // Unknown tool ids dropped.
        assert_eq!(r.tools, vec!["web.search", "web.fetch"]);
        assert_eq!(r.model_role, ModelRole::Workhorse);
    }

    #[tokio::test]
    async fn picker_failure_falls_back_to_default_persona() {
        let chat = ScriptedChat::new(vec![
            Err(hb_domain::Error::Timeout("t".into())),
            Err(hb_domain::Error::Timeout("t".into())),
        ]);
        let r = recruit(
            &chat,
            &CallContext::default(),
            &catalog(),
            &manifest(),
            "anything",
            "",
        )
        .await;
        assert_eq!(r.selected_personas[0].id, "personal-assistant");
        // Writer failure composes from persona body + default tools.
        assert!(r.custom_prompt.contains("personal assistant"));
        assert!(r.tools.contains(&"datetime.now".to_string()));
        assert_eq!(r.model_role, ModelRole::Workhorse);
    }

    #[tokio::test]
    async fn unknown_personas_are_filtered() {
        let chat = ScriptedChat::new(vec![
            Ok(r#"{"selectedPersonas": [{"id": "ghost-persona", "reason": "x"}]}"#.into()),
            Ok(r#"{"customPrompt": "p", "tools": ["shell"], "modelRole": "workhorse"}"#.into()),
        ]);
        let r = recruit(
            &chat,
            &CallContext::default(),
            &catalog(),
            &manifest(),
            "x",
            "",
        )
        .await;
        assert_eq!(r.selected_personas[0].id, "personal-assistant");
    }

    #[tokio::test]
    async fn rewrite_adds_hints_and_keeps_existing_tools() {
        let chat = ScriptedChat::new(vec![Ok(
            r#"{"customPrompt": "updated", "tools": ["browser.navigate"], "modelRole": "workhorse"}"#
                .into(),
        )]);
        let current = Recruitment {
            custom_prompt: "old".into(),
            selected_personas: vec![SelectedPersona {
                id: "operator".into(),
                reason: "device work".into(),
            }],
            council: None,
            tools: vec!["shell".into()],
            model_role: ModelRole::Workhorse,
        };
        let updated = rewrite_with_tool_hints(
            &chat,
            &CallContext::default(),
            &catalog(),
            &manifest(),
            "x",
            &current,
            &["gui.screenshot".into()],
        )
        .await;
        assert!(updated.tools.contains(&"browser.navigate".to_string()));
        assert!(updated.tools.contains(&"gui.screenshot".to_string()));
        assert!(updated.tools.contains(&"shell".to_string()), "existing tools kept");
    }
}
