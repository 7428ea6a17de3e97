//! Prompt templates.
//!
//! Templates are data: short scaffolds with `{placeholder}` slots filled by
//! [`fill`]. The pipeline cares about the structured outputs it asks for,
//! not the wording.

/// Replace `{key}` placeholders. Unknown placeholders are left in place.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

pub const INTAKE: &str = "\
You are the intake classifier for a personal assistant.

Identity:
{identity}

Conversation history:
{history}

Memory models:
{memory_models}

User message:
{user_message}

Respond with a single JSON object:
{\"classification\": \"INFO_REQUEST|ACTION|COMPOUND|CONTINUATION|CONVERSATIONAL|MEMORY_UPDATE\",
 \"contextConfidence\": 0.0-1.0,
 \"automatabilityScore\": 0.0-1.0,
 \"restatedRequest\": \"...\",
 \"relevantMemories\": [{\"name\": \"...\", \"confidence\": 0.0-1.0}]}";

pub const TAILOR: &str = "\
Restate the request and score it.

Briefing so far:
{briefing}

User message:
{user_message}

Respond with a single JSON object:
{\"restatedRequest\": \"...\", \"complexity\": 0-10, \"contextConfidence\": 0.0-1.0,
 \"relevantMemories\": [], \"manufacturedHistory\": [], \"topicSegments\": [],
 \"skillSearchQuery\": null, \"skillFeedback\": null}";

pub const CONSOLIDATE: &str = "\
Merge the following operating principles into one short briefing for an
agent about to work on: {restated_request}

Principles:
{principles}

Respond with the merged briefing text only.";

pub const ROUTER: &str = "\
A new message arrived for a device that already has agents.

Candidates:
{candidates}

New message:
{user_message}

Decide how to route. Respond with a single JSON object:
{\"decision\": \"new|modify|queue|stop\", \"agentId\": \"agent id when not new\", \"reasoning\": \"...\"}";

pub const RECRUIT_PICK: &str = "\
Pick the personas best suited to this request.

Request: {restated_request}

Briefing:
{briefing}

Available personas:
{personas}

Available councils:
{councils}

Respond with a single JSON object:
{\"selectedPersonas\": [{\"id\": \"...\", \"reason\": \"...\"}], \"council\": null}";

pub const RECRUIT_WRITE: &str = "\
Write the working prompt for an agent handling: {restated_request}

Selected persona bodies:
{persona_bodies}

Tool catalog:
{tool_catalog}

Respond with a single JSON object:
{\"customPrompt\": \"...\", \"tools\": [\"tool ids\"], \"modelRole\": \"intake|workhorse|architect|codegen|vision\"}";

pub const PLAN: &str = "\
Create an execution plan.

Request: {restated_request}

Briefing:
{briefing}

Agent prompt:
{custom_prompt}

Respond with a single JSON object:
{\"approach\": \"...\", \"isSimpleTask\": true|false,
 \"steps\": [{\"id\": \"s1\", \"title\": \"...\", \"description\": \"...\",
              \"expectedOutput\": \"...\", \"toolHints\": [], \"requiresExternalData\": false}]}";

pub const REPLAN: &str = "\
A step just finished. Review the remaining plan.

Completed step output:
{last_output}

Remaining steps:
{remaining_steps}

Workspace files:
{workspace_listing}

User signals received during the step:
{signals}

Respond with a single JSON object:
{\"changed\": true|false, \"reasoning\": \"...\",
 \"remainingSteps\": [{\"id\": \"...\", \"title\": \"...\", \"description\": \"...\",
                       \"expectedOutput\": \"...\", \"toolHints\": [], \"requiresExternalData\": false}]}";

pub const RESEARCH_SUMMARY: &str = "\
Summarize this tool output for later reference. Keep facts, figures, and
links; drop boilerplate.

{content}";

pub const HEARTBEAT: &str = "\
You are the personal assistant performing a routine check.

Checklist:
{checklist}

Current time: {current_time} ({timezone})
Idle for: {idle}
Consecutive failures: {consecutive_failures}
Scheduled tasks: {due} due, {upcoming} upcoming, {total} total

If everything is fine, respond with exactly HEARTBEAT_OK. Otherwise respond
with a 2-3 sentence alert describing what needs attention.";
