//! Tool-loop runtime: drives LLM function-calling iterations against a
//! handler registry.
//!
//! Each iteration sends the accumulated conversation with the (sanitized)
//! tool definitions. Tool calls come back in model order and are
//! dispatched in that order; every call receives exactly one `tool`
//! message with its `tool_call_id` before the next chat call, including
//! calls skipped after a batch break. The loop ends when the model stops
//! calling tools, when `max_iterations` is reached, or when a handler
//! raises a synthetic control signal.

use chrono::Utc;

use hb_domain::error::Result;
use hb_domain::message::{unsanitize_tool_name, ChatMessage, ToolDefinition};
use hb_domain::role::ModelRole;
use hb_domain::stream::Usage;
use hb_providers::{CallContext, ChatRequest, ChatResponse, ResilientClient};

use crate::runtime::handlers::HandlerRegistry;
use crate::runtime::model::{SyntheticSignal, ToolCallEntry};

/// Narrow chat surface so tests can script responses.
#[async_trait::async_trait]
pub trait LoopChat: Send + Sync {
    async fn chat(&self, role: ModelRole, req: ChatRequest, ctx: &CallContext)
        -> Result<ChatResponse>;
}

#[async_trait::async_trait]
impl LoopChat for ResilientClient {
    async fn chat(
        &self,
        role: ModelRole,
        req: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse> {
        self.chat_for_role(role, req, ctx).await
    }
}

#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub role: ModelRole,
    pub temperature: f32,
    pub max_iterations: usize,
    pub json_mode: bool,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            role: ModelRole::Workhorse,
            temperature: 0.7,
            max_iterations: 20,
            json_mode: false,
        }
    }
}

#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub final_text: String,
    pub iterations: usize,
    pub tool_calls: Vec<ToolCallEntry>,
    pub signal: Option<SyntheticSignal>,
    pub usage: Usage,
    /// Model that produced the last response.
    pub model: String,
}

const SNIPPET_LEN: usize = 200;

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_LEN).collect()
}

/// Run the tool loop to completion.
pub async fn run_tool_loop(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    cfg: &ToolLoopConfig,
    mut messages: Vec<ChatMessage>,
    tools: Vec<ToolDefinition>,
    registry: &HandlerRegistry,
    mut on_tool_call: impl FnMut(&ToolCallEntry) + Send,
) -> Result<ToolLoopOutcome> {
    let mut total_usage = Usage::default();
    let mut journal: Vec<ToolCallEntry> = Vec::new();
    let mut last_text = String::new();
    let mut last_model = String::new();

    for iteration in 1..=cfg.max_iterations {
        let req = ChatRequest {
            messages: messages.clone(),
            tools: tools.clone(),
            temperature: Some(cfg.temperature),
            max_tokens: None,
            json_mode: cfg.json_mode,
            model: None,
        };
        let resp = llm.chat(cfg.role, req, ctx).await?;
        if let Some(usage) = resp.usage {
            total_usage.add(&usage);
        }
        last_text = resp.content.clone();
        last_model = resp.model.clone();

        if resp.tool_calls.is_empty() {
            return Ok(ToolLoopOutcome {
                final_text: last_text,
                iterations: iteration,
                tool_calls: journal,
                signal: None,
                usage: total_usage,
                model: last_model,
            });
        }

        messages.push(ChatMessage::assistant_tool_calls(
            &resp.content,
            &resp.tool_calls,
        ));

        // Dispatch in model order. After a batch break, the remaining calls
        // still get a tool message so every tool_call_id resolves before
        // the next chat call.
        let mut pending_signal: Option<SyntheticSignal> = None;
        let mut batch_broken = false;
        for call in &resp.tool_calls {
            let tool_id = unsanitize_tool_name(&call.tool_name);
            if batch_broken {
                messages.push(ChatMessage::tool_result(
                    &call.call_id,
                    "skipped: a prior tool in this batch stopped further processing",
                ));
                continue;
            }

            tracing::debug!(tool_id = %tool_id, iteration, "dispatching tool call");
            let outcome = registry.dispatch(&tool_id, call.arguments.clone()).await;

            let entry = ToolCallEntry {
                tool_id: tool_id.clone(),
                timestamp: Utc::now(),
                success: !outcome.is_error,
                result_snippet: snippet(&outcome.content),
                output_path: outcome.output_path.clone(),
            };
            on_tool_call(&entry);
            journal.push(entry);

            if outcome.images.is_empty() {
                messages.push(ChatMessage::tool_result(&call.call_id, &outcome.content));
            } else {
                messages.push(ChatMessage::tool_result_with_images(
                    &call.call_id,
                    &outcome.content,
                    outcome.images,
                ));
            }

            if outcome.signal.is_some() {
                pending_signal = outcome.signal;
            }
            if outcome.break_batch {
                batch_broken = true;
            }
        }

        // A synthetic signal ends the loop; the step-executor reacts.
        if pending_signal.is_some() {
            return Ok(ToolLoopOutcome {
                final_text: last_text,
                iterations: iteration,
                tool_calls: journal,
                signal: pending_signal,
                usage: total_usage,
                model: last_model.clone(),
            });
        }
    }

    tracing::warn!(max_iterations = cfg.max_iterations, "tool loop hit iteration bound");
    Ok(ToolLoopOutcome {
        final_text: last_text,
        iterations: cfg.max_iterations,
        tool_calls: journal,
        signal: None,
        usage: total_usage,
        model: last_model,
    })
}
