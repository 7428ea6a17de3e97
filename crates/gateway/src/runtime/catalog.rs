//! Tool manifest and persona catalog.
//!
//! The manifest is the list of tool descriptors offered to the LLM; the
//! persona catalog is what the recruiter picks from. Both load from the
//! state dir with built-in defaults so a fresh install works.

use serde::{Deserialize, Serialize};

use hb_domain::message::{sanitize_tool_name, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool manifest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub sandboxed: bool,
    #[serde(default)]
    pub requires_approval: bool,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

pub struct ToolManifest {
    tools: Vec<ToolSpec>,
}

impl ToolManifest {
    /// Load `tools.json` from the state dir, falling back to the built-in
    /// manifest.
    pub fn load(state_dir: &std::path::Path) -> Self {
        let path = state_dir.join("tools.json");
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<Vec<ToolSpec>>(&raw) {
                Ok(tools) => {
                    tracing::info!(count = tools.len(), "loaded tool manifest");
                    return Self { tools };
                }
                Err(e) => tracing::warn!(error = %e, "tools.json unreadable, using built-ins"),
            }
        }
        Self {
            tools: builtin_tools(),
        }
    }

    pub fn from_specs(tools: Vec<ToolSpec>) -> Self {
        Self { tools }
    }

    pub fn all(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn get(&self, id: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.id.clone()).collect()
    }

    /// Compact one-line-per-tool catalog for recruiter prompts.
    pub fn catalog_text(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.id, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Sanitized tool definitions for a subset of ids; unknown ids are
    /// dropped.
    pub fn definitions_for(&self, ids: &[String]) -> Vec<ToolDefinition> {
        ids.iter()
            .filter_map(|id| self.get(id))
            .map(|spec| ToolDefinition {
                name: sanitize_tool_name(&spec.id),
                description: spec.description.clone(),
                parameters: spec.parameters.clone(),
            })
            .collect()
    }
}

fn builtin_tools() -> Vec<ToolSpec> {
    let spec = |id: &str, description: &str, category: &str| ToolSpec {
        id: id.into(),
        description: description.into(),
        parameters: default_parameters(),
        category: category.into(),
        sandboxed: false,
        requires_approval: false,
    };
    vec![
        spec("shell", "Run a shell command on the device", "shell"),
        spec("fs.read", "Read a file from the device", "fs"),
        spec("fs.write", "Write a file on the device", "fs"),
        spec("fs.list", "List a directory on the device", "fs"),
        spec("datetime.now", "Current date and time, optionally in a timezone", "info"),
        spec("web.search", "Search the web", "search"),
        spec("web.fetch", "Fetch a URL", "http"),
        spec("browser.navigate", "Drive the on-device browser", "browser"),
        spec("gui.screenshot", "Capture the device screen", "gui"),
        spec("market.quote", "Fetch a market quote", "market"),
        spec("memory.search", "Search long-term memory", "memory"),
        spec("memory.store", "Store a fact in long-term memory", "memory"),
        spec("schedule.defer", "Schedule a one-shot follow-up task", "schedule"),
        spec("schedule.recurring", "Create a recurring task", "schedule"),
        spec("research.notes", "Read back persisted research files", "research"),
        spec("codegen.apply", "Generate and apply code on the device", "codegen"),
        spec("secrets.request", "Request an interactive credential session", "secrets"),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persona catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaSpec {
    pub id: String,
    pub summary: String,
    pub body: String,
    #[serde(default)]
    pub default_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Council {
    pub id: String,
    pub summary: String,
    pub member_ids: Vec<String>,
}

pub struct PersonaCatalog {
    personas: Vec<PersonaSpec>,
    councils: Vec<Council>,
}

impl PersonaCatalog {
    pub fn load(dir: &std::path::Path) -> Self {
        let mut personas = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json")
                    || path.file_name().and_then(|n| n.to_str()) == Some("councils.json")
                {
                    continue;
                }
                if let Some(spec) = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<PersonaSpec>(&raw).ok())
                {
                    personas.push(spec);
                }
            }
        }
        if personas.is_empty() {
            personas = builtin_personas();
        }
        let councils = std::fs::read_to_string(dir.join("councils.json"))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        personas.sort_by(|a, b| a.id.cmp(&b.id));
        Self { personas, councils }
    }

    pub fn from_specs(personas: Vec<PersonaSpec>, councils: Vec<Council>) -> Self {
        Self { personas, councils }
    }

    pub fn get(&self, id: &str) -> Option<&PersonaSpec> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn default_persona(&self) -> &PersonaSpec {
        self.get("personal-assistant")
            .unwrap_or(&self.personas[0])
    }

    pub fn summaries_text(&self) -> String {
        self.personas
            .iter()
            .map(|p| format!("- {}: {}", p.id, p.summary))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn councils_text(&self) -> String {
        if self.councils.is_empty() {
            return "(none)".to_string();
        }
        self.councils
            .iter()
            .map(|c| format!("- {}: {} [{}]", c.id, c.summary, c.member_ids.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn council(&self, id: &str) -> Option<&Council> {
        self.councils.iter().find(|c| c.id == id)
    }
}

fn builtin_personas() -> Vec<PersonaSpec> {
    vec![
        PersonaSpec {
            id: "personal-assistant".into(),
            summary: "General-purpose helpful assistant for everyday requests".into(),
            body: "You are a capable personal assistant. Be concise, act on the user's \
                   behalf, and prefer doing over asking."
                .into(),
            default_tools: vec![
                "datetime.now".into(),
                "web.search".into(),
                "memory.search".into(),
            ],
        },
        PersonaSpec {
            id: "researcher".into(),
            summary: "Deep web research with source tracking".into(),
            body: "You are a thorough researcher. Collect sources, cross-check claims, and \
                   persist findings to the workspace."
                .into(),
            default_tools: vec!["web.search".into(), "web.fetch".into(), "research.notes".into()],
        },
        PersonaSpec {
            id: "operator".into(),
            summary: "Hands-on device operation: shell, files, applications".into(),
            body: "You operate the user's device directly. Verify effects after every \
                   action and keep a log of what you changed."
                .into(),
            default_tools: vec!["shell".into(), "fs.read".into(), "fs.write".into()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_manifest_has_sane_definitions() {
        let manifest = ToolManifest::from_specs(builtin_tools());
        let defs = manifest.definitions_for(&["memory.search".into(), "ghost.tool".into()]);
        assert_eq!(defs.len(), 1, "unknown ids dropped");
        assert_eq!(defs[0].name, "memory__search", "names are sanitized");
    }

    #[test]
    fn catalog_text_is_one_line_per_tool() {
        let manifest = ToolManifest::from_specs(builtin_tools());
        let text = manifest.catalog_text();
        assert_eq!(text.lines().count(), manifest.all().len());
        assert!(text.contains("- shell:"));
    }

    #[test]
    fn persona_catalog_falls_back_to_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = PersonaCatalog::load(dir.path());
        assert!(catalog.get("personal-assistant").is_some());
        assert_eq!(catalog.default_persona().id, "personal-assistant");
        assert!(catalog.summaries_text().contains("researcher"));
        assert_eq!(catalog.councils_text(), "(none)");
    }

    #[test]
    fn persona_catalog_loads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("chef.json"),
            serde_json::json!({
                "id": "chef",
                "summary": "meal planning",
                "body": "You plan meals.",
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("councils.json"),
            serde_json::json!([{"id": "kitchen", "summary": "food things", "member_ids": ["chef"]}])
                .to_string(),
        )
        .unwrap();
        let catalog = PersonaCatalog::load(dir.path());
        assert!(catalog.get("chef").is_some());
        assert!(catalog.council("kitchen").is_some());
        assert!(catalog.councils_text().contains("kitchen"));
    }
}
