//! Device protocol: the message envelope exchanged between the gateway and
//! local device agents over the persistent WebSocket.
//!
//! Envelope shape on the wire: `{type, id, timestamp, payload}`. Replies
//! correlate by echoing the request's envelope id into `payload.request_id`.
//! Payloads are duck-typed on the device side; every payload struct here
//! flattens unknown fields into `extra` so forward-compat fields survive a
//! decode/encode round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use hb_domain::AgentId;

/// Exit code a device agent uses to self-restart and re-submit prompts
/// queued in `restart-queue.json` on next boot.
pub const RESTART_EXIT_CODE: i32 = 42;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport envelope. `body` flattens to `{type, payload}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl DeviceMessage {
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            body,
        }
    }

    /// Short type tag, for logging.
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

/// All message types, tagged by `type` with the payload under `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    // ── Client → server ───────────────────────────────────────────
    Auth(AuthPayload),
    RegisterDevice(RegisterDevicePayload),
    Prompt(PromptPayload),
    Heartbeat(HeartbeatPayload),
    ExecutionResult(ExecutionResultPayload),
    MemoryResponse(ReplyPayload),
    AdminResponse(ReplyPayload),
    LlmCallRequest(LlmCallRequestPayload),
    CredentialSessionRequest(CredentialSessionPayload),
    CredentialStored(CredentialSessionPayload),

    // ── Server → client ───────────────────────────────────────────
    ExecutionCommand(ExecutionCommand),
    MemoryRequest(MemoryRequestPayload),
    AdminRequest(AdminRequestPayload),
    LlmCallResponse(ReplyPayload),
    CredentialSessionReady(CredentialSessionPayload),
    AgentLifecycle(AgentLifecyclePayload),
    RunLog(RunLogPayload),
    Notification(NotificationPayload),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Auth(_) => "auth",
            MessageBody::RegisterDevice(_) => "register_device",
            MessageBody::Prompt(_) => "prompt",
            MessageBody::Heartbeat(_) => "heartbeat",
            MessageBody::ExecutionResult(_) => "execution_result",
            MessageBody::MemoryResponse(_) => "memory_response",
            MessageBody::AdminResponse(_) => "admin_response",
            MessageBody::LlmCallRequest(_) => "llm_call_request",
            MessageBody::CredentialSessionRequest(_) => "credential_session_request",
            MessageBody::CredentialStored(_) => "credential_stored",
            MessageBody::ExecutionCommand(_) => "execution_command",
            MessageBody::MemoryRequest(_) => "memory_request",
            MessageBody::AdminRequest(_) => "admin_request",
            MessageBody::LlmCallResponse(_) => "llm_call_response",
            MessageBody::CredentialSessionReady(_) => "credential_session_ready",
            MessageBody::AgentLifecycle(_) => "agent_lifecycle",
            MessageBody::RunLog(_) => "run_log",
            MessageBody::Notification(_) => "notification",
        }
    }

    /// The `request_id` this message replies to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            MessageBody::ExecutionResult(p) => p.request_id.as_deref(),
            MessageBody::MemoryResponse(p)
            | MessageBody::AdminResponse(p)
            | MessageBody::LlmCallResponse(p) => p.request_id.as_deref(),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub device_id: String,
    pub user_id: String,
    pub token: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDevicePayload {
    pub device_id: String,
    pub user_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPayload {
    pub text: String,
    #[serde(default)]
    pub conversation: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of an [`ExecutionCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResultPayload {
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Generic correlated reply (memory/admin/llm responses share the shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub request_id: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Device asks the gateway to run an LLM call on its behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallRequestPayload {
    pub role: String,
    pub messages: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSessionPayload {
    pub session_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Server → device: execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCommand {
    #[serde(rename = "type")]
    pub command_type: String,
    pub tool_id: String,
    pub tool_args: Value,
    #[serde(default)]
    pub dry_run: bool,
    pub timeout_ms: u64,
    #[serde(default)]
    pub sandboxed: bool,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionCommand {
    pub fn tool_execute(tool_id: impl Into<String>, tool_args: Value, timeout_ms: u64) -> Self {
        Self {
            command_type: "tool_execute".to_string(),
            tool_id: tool_id.into(),
            tool_args,
            dry_run: false,
            timeout_ms,
            sandboxed: false,
            requires_approval: false,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRequestPayload {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminRequestPayload {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Agent lifecycle transition, fanned out to UI subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLifecyclePayload {
    pub agent_id: AgentId,
    pub event: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogPayload {
    pub agent_id: AgentId,
    pub level: String,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_preserves_fields() {
        let msg = DeviceMessage::new(MessageBody::Prompt(PromptPayload {
            text: "what time is it in Tokyo?".into(),
            conversation: vec![],
            extra: Map::new(),
        }));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "prompt");
        assert!(json["id"].is_string());
        assert!(json["timestamp"].is_string());

        let back: DeviceMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.timestamp, msg.timestamp);
        assert_eq!(back.kind(), "prompt");
    }

    #[test]
    fn unknown_payload_fields_survive_roundtrip() {
        let raw = serde_json::json!({
            "type": "execution_result",
            "id": "m-1",
            "timestamp": "2026-01-01T00:00:00Z",
            "payload": {
                "request_id": "req-9",
                "success": true,
                "result": {"stdout": "ok"},
                "future_field": {"nested": 1}
            }
        });
        let msg: DeviceMessage = serde_json::from_value(raw).unwrap();
        let MessageBody::ExecutionResult(ref p) = msg.body else {
            panic!("wrong variant");
        };
        assert!(p.extra.contains_key("future_field"));

        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["payload"]["future_field"]["nested"], 1);
    }

    #[test]
    fn request_id_extraction() {
        let reply = MessageBody::MemoryResponse(ReplyPayload {
            request_id: Some("abc".into()),
            result: Value::Null,
            error: None,
            extra: Map::new(),
        });
        assert_eq!(reply.request_id(), Some("abc"));

        let prompt = MessageBody::Prompt(PromptPayload {
            text: "hi".into(),
            conversation: vec![],
            extra: Map::new(),
        });
        assert_eq!(prompt.request_id(), None);
    }

    #[test]
    fn execution_command_wire_shape() {
        let cmd = ExecutionCommand::tool_execute(
            "fs.read",
            serde_json::json!({"path": "task.json"}),
            30_000,
        );
        let msg = DeviceMessage::new(MessageBody::ExecutionCommand(cmd));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "execution_command");
        assert_eq!(json["payload"]["type"], "tool_execute");
        assert_eq!(json["payload"]["tool_id"], "fs.read");
        assert_eq!(json["payload"]["timeout_ms"], 30_000);
    }

    #[test]
    fn lifecycle_payload_validates_agent_id() {
        let bad = serde_json::json!({
            "type": "agent_lifecycle",
            "id": "m-2",
            "timestamp": "2026-01-01T00:00:00Z",
            "payload": {"agent_id": "agent_../../x", "event": "created"}
        });
        assert!(serde_json::from_value::<DeviceMessage>(bad).is_err());
    }
}
