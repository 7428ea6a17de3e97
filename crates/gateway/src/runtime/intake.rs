//! Intake: one LLM call classifying the incoming message.
//!
//! Runs the intake-role model at temperature 0.1 in JSON mode and parses
//! the first JSON object in the response. Parse failures degrade to an
//! `{error, raw}` result; the pipeline tolerates missing fields.

use hb_domain::message::ChatMessage;
use hb_domain::role::ModelRole;
use hb_providers::{CallContext, ChatRequest};

use crate::prompts;
use crate::runtime::model::IntakeResult;
use crate::runtime::tool_loop::LoopChat;

/// Extract the first balanced JSON object from free-form model output.
/// String-aware: braces inside string literals don't count.
pub fn extract_first_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

pub async fn run_intake(
    llm: &dyn LoopChat,
    ctx: &CallContext,
    identity: &str,
    history: &str,
    memory_models: &str,
    user_message: &str,
) -> IntakeResult {
    let prompt = prompts::fill(
        prompts::INTAKE,
        &[
            ("identity", identity),
            ("history", history),
            ("memory_models", memory_models),
            ("user_message", user_message),
        ],
    );
    let req = ChatRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.1),
        json_mode: true,
        ..Default::default()
    };

    let raw = match llm.chat(ModelRole::Intake, req, ctx).await {
        Ok(resp) => resp.content,
        Err(e) => {
            tracing::warn!(error = %e, "intake call failed");
            return IntakeResult::parse_failure(e.to_string(), "");
        }
    };

    let Some(json) = extract_first_json(&raw) else {
        tracing::warn!("intake response contained no JSON object");
        return IntakeResult::parse_failure("no JSON object in response", &raw);
    };
    match serde_json::from_str::<IntakeResult>(json) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(error = %e, "intake response failed to parse");
            IntakeResult::parse_failure(e.to_string(), &raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_domain::error::Result;
    use hb_domain::stream::Usage;
    use hb_providers::ChatResponse;
    use parking_lot::Mutex;

    struct FixedChat {
        reply: Mutex<Option<Result<String>>>,
    }

    #[async_trait::async_trait]
    impl LoopChat for FixedChat {
        async fn chat(
            &self,
            role: ModelRole,
            req: ChatRequest,
            _ctx: &CallContext,
        ) -> Result<ChatResponse> {
            assert_eq!(role, ModelRole::Intake);
            assert!(req.json_mode);
            assert_eq!(req.temperature, Some(0.1));
            match self.reply.lock().take().unwrap() {
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

    fn chat_with(reply: Result<String>) -> FixedChat {
        FixedChat {
            reply: Mutex::new(Some(reply)),
        }
    }

    #[tokio::test]
    async fn parses_structured_classification() {
        let chat = chat_with(Ok(r#"Here you go:
            {"classification": "INFO_REQUEST", "contextConfidence": 0.9,
             "automatabilityScore": 0.8, "restatedRequest": "current time in Tokyo",
             "relevantMemories": [{"name": "travel", "confidence": 0.4}],
             "futureField": 42}"#
            .to_string()));
        let result = run_intake(&chat, &CallContext::default(), "", "", "", "what time in Tokyo?").await;
        assert!(!result.is_error());
        assert_eq!(result.classification.as_deref(), Some("INFO_REQUEST"));
        assert_eq!(result.relevant_memories.len(), 1);
        assert!(result.extra.contains_key("futureField"));
    }

    #[tokio::test]
    async fn parse_error_returns_error_with_capped_raw() {
        let garbage = format!("not json at all {}", "x".repeat(1000));
        let chat = chat_with(Ok(garbage));
        let result = run_intake(&chat, &CallContext::default(), "", "", "", "hi").await;
        assert!(result.is_error());
        assert!(result.raw.unwrap().chars().count() <= 500);
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_error_result() {
        let chat = chat_with(Err(hb_domain::Error::Timeout("120s".into())));
        let result = run_intake(&chat, &CallContext::default(), "", "", "", "hi").await;
        assert!(result.is_error());
    }

    #[test]
    fn extract_first_json_handles_nesting_and_strings() {
        assert_eq!(extract_first_json(r#"x {"a": {"b": 1}} y"#), Some(r#"{"a": {"b": 1}}"#));
        assert_eq!(
            extract_first_json(r#"{"s": "brace } in string"}"#),
            Some(r#"{"s": "brace } in string"}"#)
        );
        assert_eq!(
            extract_first_json(r#"{"s": "escaped \" quote }"}"#),
            Some(r#"{"s": "escaped \" quote }"}"#)
        );
        assert_eq!(extract_first_json("no json here"), None);
        assert_eq!(extract_first_json("{unclosed"), None);
    }
}
