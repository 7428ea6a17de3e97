//! Heartbeat: a periodic lightweight check run through the tool loop with
//! the assistant persona.

use chrono::{DateTime, Utc};
use serde::Serialize;

use hb_domain::message::{ChatMessage, ToolDefinition};
use hb_domain::role::ModelRole;
use hb_providers::CallContext;

use crate::prompts;
use crate::runtime::handlers::HandlerRegistry;
use crate::runtime::tool_loop::{run_tool_loop, LoopChat, ToolLoopConfig};

pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Ok,
    Alert,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScheduledCounts {
    pub due: usize,
    pub upcoming: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatResult {
    pub status: HeartbeatStatus,
    pub content: String,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub model: String,
    pub tools_available: usize,
    pub scheduled_tasks: ScheduledCounts,
}

pub struct HeartbeatInputs {
    pub checklist: Vec<String>,
    pub timezone: String,
    pub idle: String,
    pub consecutive_failures: u32,
    pub scheduled: ScheduledCounts,
}

pub async fn run_heartbeat(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    registry: &HandlerRegistry,
    tool_defs: Vec<ToolDefinition>,
    inputs: HeartbeatInputs,
) -> HeartbeatResult {
    let started = std::time::Instant::now();
    let checked_at = Utc::now();
    let tools_available = tool_defs.len();

    let checklist = if inputs.checklist.is_empty() {
        "(none)".to_string()
    } else {
        inputs
            .checklist
            .iter()
            .map(|item| format!("- {item}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let prompt = prompts::fill(
        prompts::HEARTBEAT,
        &[
            ("checklist", &checklist),
            ("current_time", &checked_at.to_rfc3339()),
            ("timezone", &inputs.timezone),
            ("idle", &inputs.idle),
            ("consecutive_failures", &inputs.consecutive_failures.to_string()),
            ("due", &inputs.scheduled.due.to_string()),
            ("upcoming", &inputs.scheduled.upcoming.to_string()),
            ("total", &inputs.scheduled.total.to_string()),
        ],
    );

    let cfg = ToolLoopConfig {
        role: ModelRole::Workhorse,
        temperature: 0.2,
        max_iterations: 5,
        json_mode: false,
    };
    let messages = vec![
        ChatMessage::system("You are the user's personal assistant on a routine check-in."),
        ChatMessage::user(prompt),
    ];

    match run_tool_loop(llm, ctx, &cfg, messages, tool_defs, registry, |_| {}).await {
        Ok(outcome) => {
            let trimmed = outcome.final_text.trim();
            let status = if trimmed == HEARTBEAT_OK {
                HeartbeatStatus::Ok
            } else {
                HeartbeatStatus::Alert
            };
            HeartbeatResult {
                status,
                content: trimmed.to_string(),
                checked_at,
                duration_ms: started.elapsed().as_millis() as u64,
                model: outcome.model,
                tools_available,
                scheduled_tasks: inputs.scheduled,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "heartbeat check failed");
            HeartbeatResult {
                status: HeartbeatStatus::Error,
                content: e.to_string(),
                checked_at,
                duration_ms: started.elapsed().as_millis() as u64,
                model: String::new(),
                tools_available,
                scheduled_tasks: inputs.scheduled,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_domain::error::Result;
    use hb_domain::stream::Usage;
    use hb_providers::{ChatRequest, ChatResponse};
    use parking_lot::Mutex;

    struct FixedChat {
        reply: Mutex<Option<Result<String>>>,
        temperature_seen: Mutex<Option<f32>>,
    }

    #[async_trait::async_trait]
    impl LoopChat for FixedChat {
        async fn chat(
            &self,
            role: ModelRole,
            req: ChatRequest,
            _ctx: &CallContext,
        ) -> Result<ChatResponse> {
            assert_eq!(role, ModelRole::Workhorse);
            *self.temperature_seen.lock() = req.temperature;
            match self.reply.lock().take().unwrap() {
                Ok(content) => Ok(ChatResponse {
                    content,
                    model: "claude-sonnet-4-20250514".into(),
                    provider: "anthropic".into(),
                    usage: Some(Usage::default()),
                    tool_calls: vec![],
                }),
                Err(e) => Err(e),
            }
        }
    }

    fn inputs() -> HeartbeatInputs {
        HeartbeatInputs {
            checklist: vec!["calendar has no conflicts".into()],
            timezone: "Asia/Tokyo".into(),
            idle: "2h".into(),
            consecutive_failures: 0,
            scheduled: ScheduledCounts {
                due: 1,
                upcoming: 3,
                total: 4,
            },
        }
    }

    #[tokio::test]
    async fn ok_marker_yields_ok_status() {
        let chat = FixedChat {
            reply: Mutex::new(Some(Ok(format!("  {HEARTBEAT_OK}\n")))),
            temperature_seen: Mutex::new(None),
        };
        let result = run_heartbeat(
            &chat,
            &CallContext::default(),
            &HandlerRegistry::new(),
            vec![],
            inputs(),
        )
        .await;
        assert_eq!(result.status, HeartbeatStatus::Ok);
        assert_eq!(result.content, HEARTBEAT_OK);
        assert_eq!(result.model, "claude-sonnet-4-20250514");
        assert_eq!(result.scheduled_tasks.due, 1);
        assert_eq!(*chat.temperature_seen.lock(), Some(0.2));
    }

    #[tokio::test]
    async fn non_marker_text_is_an_alert() {
        let chat = FixedChat {
            reply: Mutex::new(Some(Ok(
                "Two scheduled tasks have been failing since midnight. Worth a look.".into(),
            ))),
            temperature_seen: Mutex::new(None),
        };
        let result = run_heartbeat(
            &chat,
            &CallContext::default(),
            &HandlerRegistry::new(),
            vec![],
            inputs(),
        )
        .await;
        assert_eq!(result.status, HeartbeatStatus::Alert);
        assert!(result.content.contains("failing"));
    }

    #[tokio::test]
    async fn llm_failure_is_error_status() {
        let chat = FixedChat {
            reply: Mutex::new(Some(Err(hb_domain::Error::Timeout("t".into())))),
            temperature_seen: Mutex::new(None),
        };
        let result = run_heartbeat(
            &chat,
            &CallContext::default(),
            &HandlerRegistry::new(),
            vec![],
            inputs(),
        )
        .await;
        assert_eq!(result.status, HeartbeatStatus::Error);
    }
}
