//! Model roles and selection criteria.
//!
//! A role is a logical LLM bucket; the selector maps it to a concrete
//! (provider, model, max_tokens) using the configured role table.

use serde::{Deserialize, Serialize};

/// Logical model buckets, ordered roughly by capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// Cheap classification and light structured output.
    Intake,
    /// Default tool-running execution model.
    Workhorse,
    /// Planning, replanning, and escalation.
    Architect,
    /// Code generation.
    Codegen,
    /// Image understanding.
    Vision,
}

impl ModelRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelRole::Intake => "intake",
            ModelRole::Workhorse => "workhorse",
            ModelRole::Architect => "architect",
            ModelRole::Codegen => "codegen",
            ModelRole::Vision => "vision",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "intake" => Some(ModelRole::Intake),
            "workhorse" => Some(ModelRole::Workhorse),
            "architect" => Some(ModelRole::Architect),
            "codegen" => Some(ModelRole::Codegen),
            "vision" => Some(ModelRole::Vision),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to model selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Caller pinned a role explicitly.
    pub explicit_role: Option<ModelRole>,
    /// Length of the prompt in characters.
    pub prompt_len: Option<usize>,
    /// Bytes of file context attached to the request.
    pub file_context_bytes: Option<u64>,
    /// The request is architectural (planning, replanning, escalation).
    pub architect_task: bool,
    /// Cloud providers are unreachable; use the local model.
    pub is_offline: bool,
}
