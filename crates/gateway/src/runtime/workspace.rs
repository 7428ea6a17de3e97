//! Workspace client.
//!
//! Each agent owns a directory on its device
//! (`{root}/{agent_id}/` with `task.json`, `persona.json`, `plan.json`,
//! `intake_knowledge.md`, `persona_requests.json`, `research/`, `output/`,
//! `logs/`). All file IO goes through the bridge as `fs.*` execution
//! commands, so one correlation/timeout path covers tools and files alike.
//!
//! The agent id is validated by construction ([`hb_domain::AgentId`]), so
//! joining it onto the root cannot escape the root.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use hb_domain::error::{Error, Result};
use hb_domain::AgentId;
use hb_protocol::ExecutionCommand;

use crate::devices::bridge::DeviceBridge;

/// Identifies one agent's execution context. `workspace_id` is the
/// directory owner; it differs from `agent_id` only for handoff agents
/// reusing a predecessor's workspace.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub device_id: String,
    pub user_id: String,
    pub agent_id: AgentId,
    pub workspace_id: AgentId,
}

impl AgentHandle {
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>, agent_id: AgentId) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            workspace_id: agent_id.clone(),
            agent_id,
        }
    }

    /// A fresh agent reusing another agent's workspace directory.
    pub fn with_workspace(mut self, workspace_id: AgentId) -> Self {
        self.workspace_id = workspace_id;
        self
    }
}

pub struct WorkspaceClient {
    bridge: Arc<DeviceBridge>,
    root: String,
    timeout: Duration,
}

impl WorkspaceClient {
    pub fn new(bridge: Arc<DeviceBridge>, root: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            bridge,
            root: root.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Absolute (device-side) path of a workspace-relative file.
    pub fn path_for(&self, agent_id: &AgentId, rel: &str) -> String {
        format!("{}/{}/{}", self.root.trim_end_matches('/'), agent_id, rel)
    }

    pub fn workspace_root(&self, agent_id: &AgentId) -> String {
        format!("{}/{}", self.root.trim_end_matches('/'), agent_id)
    }

    async fn fs(&self, device_id: &str, tool: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        let cmd = ExecutionCommand::tool_execute(tool, args, self.timeout.as_millis() as u64);
        let result = self.bridge.execute_tool(device_id, cmd, self.timeout).await?;
        if result.success {
            Ok(result.result)
        } else {
            Err(Error::Transport(
                result
                    .error
                    .unwrap_or_else(|| format!("{tool} failed on device {device_id}")),
            ))
        }
    }

    // ── Files ─────────────────────────────────────────────────────

    pub async fn read_file(&self, agent: &AgentHandle, rel: &str) -> Result<String> {
        let path = self.path_for(&agent.workspace_id, rel);
        let result = self
            .fs(&agent.device_id, "fs.read", serde_json::json!({"path": path}))
            .await?;
        result
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Transport("fs.read returned no content".into()))
    }

    pub async fn write_file(&self, agent: &AgentHandle, rel: &str, content: &str) -> Result<()> {
        let path = self.path_for(&agent.workspace_id, rel);
        self.fs(
            &agent.device_id,
            "fs.write",
            serde_json::json!({"path": path, "content": content}),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_file(&self, agent: &AgentHandle, rel: &str) -> Result<()> {
        let path = self.path_for(&agent.workspace_id, rel);
        self.fs(&agent.device_id, "fs.delete", serde_json::json!({"path": path}))
            .await?;
        Ok(())
    }

    pub async fn read_json<T: DeserializeOwned>(&self, agent: &AgentHandle, rel: &str) -> Result<T> {
        let raw = self.read_file(agent, rel).await?;
        serde_json::from_str(&raw).map_err(|e| Error::Parse(format!("{rel}: {e}")))
    }

    pub async fn write_json<T: Serialize>(&self, agent: &AgentHandle, rel: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string_pretty(value)?;
        self.write_file(agent, rel, &raw).await
    }

    /// Directory listing rendered as an indented tree, depth-limited.
    pub async fn list_tree(&self, agent: &AgentHandle, depth: usize) -> Result<String> {
        let root = self.workspace_root(&agent.workspace_id);
        let result = self
            .fs(
                &agent.device_id,
                "fs.list",
                serde_json::json!({"path": root, "depth": depth}),
            )
            .await?;
        let entries = result
            .get("entries")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut tree = String::new();
        for entry in entries {
            if let Some(path) = entry.as_str() {
                let indent = path.matches('/').count();
                tree.push_str(&"  ".repeat(indent));
                tree.push_str(path.rsplit('/').next().unwrap_or(path));
                tree.push('\n');
            }
        }
        Ok(tree)
    }

    // ── Workspace lifecycle ───────────────────────────────────────

    /// Create the workspace skeleton for a fresh agent.
    pub async fn create_workspace(&self, agent: &AgentHandle) -> Result<()> {
        let root = self.workspace_root(&agent.workspace_id);
        for dir in ["research", "output", "logs"] {
            self.fs(
                &agent.device_id,
                "fs.mkdir",
                serde_json::json!({"path": format!("{root}/{dir}")}),
            )
            .await?;
        }
        Ok(())
    }

    /// Remove a workspace directory entirely (retention sweep).
    pub async fn remove_workspace(&self, agent: &AgentHandle) -> Result<()> {
        let root = self.workspace_root(&agent.workspace_id);
        self.fs(
            &agent.device_id,
            "fs.delete",
            serde_json::json!({"path": root, "recursive": true}),
        )
        .await?;
        Ok(())
    }

    /// Fire-and-forget write, for journaling paths that must not stall the
    /// pipeline.
    pub fn write_file_background(self: &Arc<Self>, agent: &AgentHandle, rel: &str, content: String) {
        let this = self.clone();
        let agent = agent.clone();
        let rel = rel.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.write_file(&agent, &rel, &content).await {
                tracing::warn!(agent_id = %agent.agent_id, file = %rel, error = %e, "background workspace write failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::registry::{DeviceRegistry, DeviceSession, DeviceStatus};
    use chrono::Utc;
    use hb_protocol::{DeviceMessage, ExecutionResultPayload, MessageBody};
    use tokio::sync::mpsc;

    /// Spawn a fake device that answers fs.* commands from a closure.
    fn fake_device(
        respond: impl Fn(&str, &serde_json::Value) -> (bool, serde_json::Value) + Send + 'static,
    ) -> (Arc<DeviceBridge>, Arc<WorkspaceClient>) {
        let devices = Arc::new(DeviceRegistry::new());
        let (tx, mut rx) = mpsc::channel::<DeviceMessage>(16);
        devices.register(DeviceSession {
            device_id: "dev-1".into(),
            user_id: "u".into(),
            platform: "linux".into(),
            capabilities: vec![],
            timezone: None,
            status: DeviceStatus::Online,
            connected_at: Utc::now(),
            last_seen: Utc::now(),
            sink: tx,
        });
        let bridge = Arc::new(DeviceBridge::new(devices, 1_000));
        let workspace = Arc::new(WorkspaceClient::new(bridge.clone(), "~/.bot/agent-workspaces", 1_000));

        let bridge2 = bridge.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let MessageBody::ExecutionCommand(cmd) = &msg.body {
                    let (success, result) = respond(&cmd.tool_id, &cmd.tool_args);
                    bridge2.resolve(
                        &msg.id,
                        MessageBody::ExecutionResult(ExecutionResultPayload {
                            request_id: Some(msg.id.clone()),
                            success,
                            result,
                            error: (!success).then(|| "nope".into()),
                            extra: Default::default(),
                        }),
                    );
                }
            }
        });
        (bridge, workspace)
    }

    fn handle() -> AgentHandle {
        AgentHandle::new("dev-1", "u", AgentId::parse("agent_ABCDEFGH12").unwrap())
    }

    #[test]
    fn paths_are_rooted_under_the_agent_dir() {
        let devices = Arc::new(DeviceRegistry::new());
        let bridge = Arc::new(DeviceBridge::new(devices, 1_000));
        let ws = WorkspaceClient::new(bridge, "~/.bot/agent-workspaces/", 1_000);
        let id = AgentId::parse("agent_ABCDEFGH12").unwrap();
        assert_eq!(
            ws.path_for(&id, "task.json"),
            "~/.bot/agent-workspaces/agent_ABCDEFGH12/task.json"
        );
        assert_eq!(
            ws.path_for(&id, "logs/s1-output.md"),
            "~/.bot/agent-workspaces/agent_ABCDEFGH12/logs/s1-output.md"
        );
    }

    #[tokio::test]
    async fn read_write_roundtrip_through_bridge() {
        let (_bridge, ws) = fake_device(|tool, args| match tool {
            "fs.read" => {
                assert!(args["path"].as_str().unwrap().ends_with("task.json"));
                (true, serde_json::json!({"content": "{\"taskId\":\"t1\"}"}))
            }
            "fs.write" => (true, serde_json::Value::Null),
            _ => (false, serde_json::Value::Null),
        });
        let agent = handle();
        ws.write_file(&agent, "task.json", "{}").await.unwrap();
        let content = ws.read_file(&agent, "task.json").await.unwrap();
        assert!(content.contains("t1"));
    }

    #[tokio::test]
    async fn failed_fs_call_surfaces_device_error() {
        let (_bridge, ws) = fake_device(|_, _| (false, serde_json::Value::Null));
        let err = ws.read_file(&handle(), "plan.json").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn list_tree_renders_indentation() {
        let (_bridge, ws) = fake_device(|tool, _| {
            assert_eq!(tool, "fs.list");
            (
                true,
                serde_json::json!({"entries": ["task.json", "logs/s1-output.md", "research/web-1.txt"]}),
            )
        });
        let tree = ws.list_tree(&handle(), 2).await.unwrap();
        assert!(tree.contains("task.json"));
        assert!(tree.contains("  s1-output.md"));
    }
}
