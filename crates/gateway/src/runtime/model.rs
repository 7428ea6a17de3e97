//! Pipeline data model: intake results, briefing inputs, agent persona
//! files, task files, plans, and step results.
//!
//! These are the JSON artifacts persisted into each agent's workspace; the
//! field names follow the on-disk camelCase convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use hb_domain::AgentId;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Intake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryRef {
    pub name: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Structured classification of one user message. The schema is
/// extensible: fields the pipeline reads are typed, the rest ride along in
/// `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeResult {
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub context_confidence: Option<f64>,
    #[serde(default)]
    pub automatability_score: Option<f64>,
    #[serde(default)]
    pub restated_request: Option<String>,
    #[serde(default)]
    pub relevant_memories: Vec<MemoryRef>,
    /// Set when the intake response could not be parsed.
    #[serde(default)]
    pub error: Option<String>,
    /// First 500 chars of the unparseable response.
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IntakeResult {
    pub fn parse_failure(message: impl Into<String>, raw: &str) -> Self {
        Self {
            error: Some(message.into()),
            raw: Some(raw.chars().take(500).collect()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Briefing (principles + tailor)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipleKind {
    Rule,
    Principle,
}

/// One principle file. Rules are always-on; principles are selected by
/// trigger keywords or complexity. A principle flagged `always` behaves
/// like a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principle {
    pub id: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub kind: PrincipleKind,
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub complexity_threshold: Option<u8>,
    pub body: String,
}

impl Principle {
    pub fn is_always_on(&self) -> bool {
        self.kind == PrincipleKind::Rule || self.always
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailorResult {
    pub restated_request: String,
    /// 0..=10.
    #[serde(default)]
    pub complexity: u8,
    #[serde(default)]
    pub context_confidence: f64,
    #[serde(default)]
    pub relevant_memories: Vec<MemoryRef>,
    #[serde(default)]
    pub manufactured_history: Vec<String>,
    #[serde(default)]
    pub topic_segments: Vec<String>,
    #[serde(default)]
    pub skill_search_query: Option<String>,
    #[serde(default)]
    pub skill_feedback: Option<String>,
}

impl TailorResult {
    /// Conservative fallback when the tailor call fails.
    pub fn fallback(user_message: &str) -> Self {
        Self {
            restated_request: user_message.to_string(),
            complexity: 5,
            context_confidence: 0.0,
            relevant_memories: Vec::new(),
            manufactured_history: Vec::new(),
            topic_segments: Vec::new(),
            skill_search_query: None,
            skill_feedback: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent persona file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Queued,
    Running,
    Paused,
    Blocked,
    WaitingOnHuman,
    Researching,
    Completed,
    Stopped,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// Valid walks: queued → running → (paused | blocked | waiting_on_human
    /// | researching)* → (completed | stopped | failed). Terminal states
    /// never transition.
    pub fn can_transition(self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        if self == to {
            return false;
        }
        match self {
            Queued => matches!(to, Running | Stopped | Failed),
            Running => !matches!(to, Queued),
            Paused | Blocked | WaitingOnHuman | Researching => {
                matches!(to, Running | Paused | Blocked | WaitingOnHuman | Researching | Completed | Stopped | Failed)
            }
            Completed | Stopped | Failed => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedPersona {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub id: String,
    pub request: String,
    pub added_at: DateTime<Utc>,
}

/// `persona.json` in the agent workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaFile {
    pub agent_id: AgentId,
    #[serde(default)]
    pub previous_agent_id: Option<AgentId>,
    pub custom_prompt: String,
    #[serde(default)]
    pub selected_personas: Vec<SelectedPersona>,
    #[serde(default)]
    pub council: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub model_role: String,
    #[serde(default)]
    pub restated_requests: Vec<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub queue: Vec<QueuedRequest>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PersonaFile {
    /// Apply a status transition, rejecting invalid walks.
    pub fn transition(&mut self, to: AgentStatus) -> bool {
        if self.status.can_transition(to) {
            self.status = to;
            if to.is_terminal() {
                self.completed_at = Some(Utc::now());
            }
            true
        } else {
            false
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    #[serde(default)]
    pub steps_completed: Vec<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub estimated_remaining: Option<u32>,
}

/// `task.json` — its presence in a workspace implies an incomplete task;
/// completion deletes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFile {
    pub task_id: String,
    pub topic: String,
    pub status: AgentStatus,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub persona: String,
    #[serde(default)]
    pub selected_tool_ids: Vec<String>,
    #[serde(default)]
    pub conversation: Vec<Value>,
    #[serde(default)]
    pub progress: TaskProgress,
    #[serde(default)]
    pub parent_agent_id: Option<AgentId>,
    #[serde(default)]
    pub child_agent_ids: Vec<AgentId>,
    #[serde(default)]
    pub original_message_indices: Vec<usize>,
    #[serde(default)]
    pub original_conversation_snapshot: Vec<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub tool_hints: Vec<String>,
    #[serde(default)]
    pub requires_external_data: bool,
}

/// One journaled tool call during a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEntry {
    pub tool_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// At most 200 chars of the result.
    pub result_snippet: String,
    #[serde(default)]
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanProgress {
    #[serde(default)]
    pub completed_step_ids: Vec<String>,
    #[serde(default)]
    pub remaining_step_ids: Vec<String>,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub current_step_tool_calls: Vec<ToolCallEntry>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

/// `plan.json`. Progress is monotonic: completed ids are a prefix of the
/// step ordering; a replan may replace only the remaining suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub approach: String,
    #[serde(default)]
    pub is_simple_task: bool,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub progress: PlanProgress,
}

impl Plan {
    pub fn new(approach: impl Into<String>, is_simple_task: bool, steps: Vec<PlanStep>) -> Self {
        let remaining = steps.iter().map(|s| s.id.clone()).collect();
        Self {
            approach: approach.into(),
            is_simple_task,
            steps,
            progress: PlanProgress {
                remaining_step_ids: remaining,
                ..Default::default()
            },
        }
    }

    /// The next step to execute, if any.
    pub fn current_step(&self) -> Option<&PlanStep> {
        let next_id = self.progress.remaining_step_ids.first()?;
        self.steps.iter().find(|s| &s.id == next_id)
    }

    /// Mark the head of the remaining suffix complete. Rejects any other id
    /// so completed ids stay a prefix of the plan order.
    pub fn complete_step(&mut self, step_id: &str) -> bool {
        if self.progress.remaining_step_ids.first().map(String::as_str) != Some(step_id) {
            return false;
        }
        self.progress.remaining_step_ids.remove(0);
        self.progress.completed_step_ids.push(step_id.to_string());
        self.progress.current_step_id = None;
        self.progress.current_step_tool_calls.clear();
        if self.progress.remaining_step_ids.is_empty() {
            self.progress.completed_at = Some(Utc::now());
        }
        true
    }

    pub fn begin_step(&mut self, step_id: &str) {
        self.progress.current_step_id = Some(step_id.to_string());
        self.progress.current_step_tool_calls.clear();
    }

    /// Atomically replace the remaining suffix with a new set of steps.
    /// Completed steps are untouched; new step ids must not collide with
    /// completed ones.
    pub fn replace_remaining(&mut self, new_steps: Vec<PlanStep>) -> bool {
        if new_steps
            .iter()
            .any(|s| self.progress.completed_step_ids.contains(&s.id))
        {
            return false;
        }
        let completed: Vec<PlanStep> = self
            .steps
            .iter()
            .filter(|s| self.progress.completed_step_ids.contains(&s.id))
            .cloned()
            .collect();
        self.progress.remaining_step_ids = new_steps.iter().map(|s| s.id.clone()).collect();
        self.steps = completed.into_iter().chain(new_steps).collect();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.progress.remaining_step_ids.is_empty()
    }

    /// Invariant check: completed ids form a prefix of the step order and
    /// remaining ids the matching suffix.
    pub fn progress_is_consistent(&self) -> bool {
        let ids: Vec<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        let completed: Vec<&str> = self
            .progress
            .completed_step_ids
            .iter()
            .map(String::as_str)
            .collect();
        let remaining: Vec<&str> = self
            .progress
            .remaining_step_ids
            .iter()
            .map(String::as_str)
            .collect();
        let concat: Vec<&str> = completed.iter().chain(remaining.iter()).copied().collect();
        concat == ids
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step results & synthetic signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Control signals raised by the synthetic meta-tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyntheticSignal {
    Escalate { reason: String },
    WaitForUser { question: String },
    RequestTools { hints: Vec<String> },
    RequestResearch { query: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub output: String,
    pub iterations: usize,
    pub tool_calls_made: Vec<String>,
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
}

/// Routing decision for an incoming message against existing agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterDecision {
    New,
    Modify { agent_id: AgentId },
    Queue { agent_id: AgentId },
    Stop { agent_id: AgentId },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str) -> PlanStep {
        PlanStep {
            id: id.into(),
            title: format!("step {id}"),
            description: String::new(),
            expected_output: String::new(),
            tool_hints: vec![],
            requires_external_data: false,
        }
    }

    #[test]
    fn plan_completion_is_strictly_in_order() {
        let mut plan = Plan::new("do things", false, vec![step("s1"), step("s2"), step("s3")]);
        assert!(plan.progress_is_consistent());

        assert!(!plan.complete_step("s2"), "out-of-order completion rejected");
        assert!(plan.complete_step("s1"));
        assert!(plan.progress_is_consistent());
        assert_eq!(plan.current_step().unwrap().id, "s2");

        assert!(plan.complete_step("s2"));
        assert!(plan.complete_step("s3"));
        assert!(plan.is_finished());
        assert!(plan.progress.completed_at.is_some());
        assert!(plan.progress_is_consistent());
    }

    #[test]
    fn replan_replaces_only_the_suffix() {
        let mut plan = Plan::new("x", false, vec![step("s1"), step("s2"), step("s3")]);
        plan.complete_step("s1");

        assert!(plan.replace_remaining(vec![step("s2b"), step("s4")]));
        assert!(plan.progress_is_consistent());
        assert_eq!(plan.progress.completed_step_ids, vec!["s1"]);
        assert_eq!(plan.progress.remaining_step_ids, vec!["s2b", "s4"]);
        assert_eq!(plan.current_step().unwrap().id, "s2b");
    }

    #[test]
    fn replan_cannot_resurrect_completed_ids() {
        let mut plan = Plan::new("x", false, vec![step("s1"), step("s2")]);
        plan.complete_step("s1");
        assert!(!plan.replace_remaining(vec![step("s1")]));
        assert!(plan.progress_is_consistent());
    }

    #[test]
    fn status_machine_valid_walks() {
        use AgentStatus::*;
        assert!(Queued.can_transition(Running));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(Running.can_transition(WaitingOnHuman));
        assert!(WaitingOnHuman.can_transition(Completed));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Researching.can_transition(Stopped));
    }

    #[test]
    fn status_machine_invalid_walks() {
        use AgentStatus::*;
        assert!(!Queued.can_transition(Paused));
        assert!(!Running.can_transition(Queued));
        assert!(!Completed.can_transition(Running));
        assert!(!Stopped.can_transition(Completed));
        assert!(!Failed.can_transition(Running));
        assert!(!Running.can_transition(Running));
    }

    #[test]
    fn persona_transition_sets_completed_at_on_terminal() {
        let mut persona = PersonaFile {
            agent_id: AgentId::generate(),
            previous_agent_id: None,
            custom_prompt: "p".into(),
            selected_personas: vec![],
            council: None,
            tools: vec![],
            model_role: "workhorse".into(),
            restated_requests: vec![],
            status: AgentStatus::Queued,
            queue: vec![],
            created_at: Utc::now(),
            completed_at: None,
        };
        assert!(persona.transition(AgentStatus::Running));
        assert!(persona.completed_at.is_none());
        assert!(persona.transition(AgentStatus::Completed));
        assert!(persona.completed_at.is_some());
        assert!(!persona.transition(AgentStatus::Running));
    }

    #[test]
    fn intake_parse_failure_caps_raw_at_500() {
        let long = "x".repeat(2000);
        let result = IntakeResult::parse_failure("bad json", &long);
        assert!(result.is_error());
        assert_eq!(result.raw.unwrap().len(), 500);
    }

    #[test]
    fn persona_file_roundtrips_camel_case() {
        let persona = PersonaFile {
            agent_id: AgentId::parse("agent_ABCDEFGH12").unwrap(),
            previous_agent_id: None,
            custom_prompt: "help".into(),
            selected_personas: vec![SelectedPersona {
                id: "personal-assistant".into(),
                reason: "default".into(),
            }],
            council: None,
            tools: vec!["datetime.now".into()],
            model_role: "workhorse".into(),
            restated_requests: vec!["what time".into()],
            status: AgentStatus::Running,
            queue: vec![],
            created_at: Utc::now(),
            completed_at: None,
        };
        let json = serde_json::to_value(&persona).unwrap();
        assert_eq!(json["agentId"], "agent_ABCDEFGH12");
        assert_eq!(json["modelRole"], "workhorse");
        assert_eq!(json["status"], "running");
        let back: PersonaFile = serde_json::from_value(json).unwrap();
        assert_eq!(back.tools, vec!["datetime.now"]);
    }
}
