//! Device bridge: typed send/request over the WebSocket, with
//! request/response correlation by message id, timeouts, and lifecycle
//! fan-out to per-user subscribers.
//!
//! Every outgoing request registers a pending slot keyed by its envelope
//! id; the inbound demultiplexer resolves it. A request resolves exactly
//! once: fulfillment, timeout, or device disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

use hb_domain::error::{Error, Result};
use hb_domain::AgentId;
use hb_protocol::{
    AgentLifecyclePayload, DeviceMessage, ExecutionCommand, ExecutionResultPayload, MessageBody,
    NotificationPayload, RunLogPayload,
};

use super::registry::DeviceRegistry;

struct PendingRequest {
    device_id: String,
    tx: oneshot::Sender<MessageBody>,
}

pub struct DeviceBridge {
    devices: Arc<DeviceRegistry>,
    /// message id → pending waiter.
    pending: Mutex<HashMap<String, PendingRequest>>,
    /// user id → lifecycle/run-log broadcast channel (UI streaming).
    subscribers: Mutex<HashMap<String, broadcast::Sender<DeviceMessage>>>,
    pub default_timeout: Duration,
}

impl DeviceBridge {
    pub fn new(devices: Arc<DeviceRegistry>, default_timeout_ms: u64) -> Self {
        Self {
            devices,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            default_timeout: Duration::from_millis(default_timeout_ms),
        }
    }

    // ── Outbound ──────────────────────────────────────────────────

    /// Fire-and-forget send through the device's FIFO outbound queue.
    pub async fn send(&self, device_id: &str, msg: DeviceMessage) -> Result<()> {
        let sink = self
            .devices
            .get_sink(device_id)
            .ok_or_else(|| Error::Transport(format!("device {device_id} not connected")))?;
        sink.send(msg)
            .await
            .map_err(|_| Error::Transport(format!("device {device_id} send failed")))
    }

    /// Send a request and wait for the correlated reply.
    ///
    /// The reply is matched by the envelope id echoed into
    /// `payload.request_id`. Exactly one resolution occurs: the reply, a
    /// [`Error::Timeout`], or a [`Error::Transport`] on disconnect.
    pub async fn request(
        &self,
        device_id: &str,
        body: MessageBody,
        timeout: Duration,
    ) -> Result<MessageBody> {
        let msg = DeviceMessage::new(body);
        let request_id = msg.id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                device_id: device_id.to_string(),
                tx,
            },
        );

        if let Err(e) = self.send(device_id, msg).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "device {device_id} disconnected before responding"
            ))),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(Error::Timeout(format!(
                    "device {device_id} request timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Execute a tool on the device and unwrap the execution result.
    pub async fn execute_tool(
        &self,
        device_id: &str,
        command: ExecutionCommand,
        timeout: Duration,
    ) -> Result<ExecutionResultPayload> {
        let reply = self
            .request(device_id, MessageBody::ExecutionCommand(command), timeout)
            .await?;
        match reply {
            MessageBody::ExecutionResult(payload) => Ok(payload),
            other => Err(Error::Transport(format!(
                "expected execution_result, got {}",
                other.kind()
            ))),
        }
    }

    // ── Inbound demux ─────────────────────────────────────────────

    /// Resolve a pending request from an inbound reply. Returns false when
    /// no waiter exists (late reply after timeout).
    pub fn resolve(&self, request_id: &str, body: MessageBody) -> bool {
        match self.pending.lock().remove(request_id) {
            Some(pending) => {
                let _ = pending.tx.send(body);
                true
            }
            None => {
                tracing::warn!(request_id = %request_id, "reply for unknown or timed-out request");
                false
            }
        }
    }

    /// Fail all pending requests for a device (disconnect). Returns how
    /// many were failed.
    pub fn fail_pending_for_device(&self, device_id: &str) -> usize {
        let mut pending = self.pending.lock();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.device_id == device_id)
            .map(|(id, _)| id.clone())
            .collect();
        let count = ids.len();
        for id in ids {
            // Dropping the sender resolves the waiter with a disconnect.
            pending.remove(&id);
        }
        if count > 0 {
            tracing::warn!(
                device_id = %device_id,
                failed_requests = count,
                "failed in-flight requests for disconnected device"
            );
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    // ── Lifecycle fan-out ─────────────────────────────────────────

    /// Subscribe to a user's lifecycle/run-log stream.
    pub fn subscribe_user(&self, user_id: &str) -> broadcast::Receiver<DeviceMessage> {
        let mut subs = self.subscribers.lock();
        subs.entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(128).0)
            .subscribe()
    }

    fn fan_out(&self, user_id: &str, msg: &DeviceMessage) {
        if let Some(tx) = self.subscribers.lock().get(user_id) {
            let _ = tx.send(msg.clone());
        }
    }

    /// Emit an agent lifecycle event: fanned out to subscribers and pushed
    /// to the device (best effort).
    pub fn publish_lifecycle(
        self: &Arc<Self>,
        user_id: &str,
        device_id: &str,
        agent_id: &AgentId,
        event: &str,
        detail: Option<String>,
    ) {
        let msg = DeviceMessage::new(MessageBody::AgentLifecycle(AgentLifecyclePayload {
            agent_id: agent_id.clone(),
            event: event.to_string(),
            detail,
            extra: Default::default(),
        }));
        self.fan_out(user_id, &msg);
        let bridge = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = bridge.send(&device_id, msg).await {
                tracing::debug!(error = %e, "lifecycle push skipped");
            }
        });
    }

    /// Emit a run-log line for an agent.
    pub fn publish_run_log(
        self: &Arc<Self>,
        user_id: &str,
        device_id: &str,
        agent_id: &AgentId,
        level: &str,
        message: impl Into<String>,
    ) {
        let msg = DeviceMessage::new(MessageBody::RunLog(RunLogPayload {
            agent_id: agent_id.clone(),
            level: level.to_string(),
            message: message.into(),
            extra: Default::default(),
        }));
        self.fan_out(user_id, &msg);
        let bridge = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let _ = bridge.send(&device_id, msg).await;
        });
    }

    /// Push a user-visible notification to the device.
    pub async fn notify(&self, device_id: &str, title: &str, body: &str) -> Result<()> {
        self.send(
            device_id,
            DeviceMessage::new(MessageBody::Notification(NotificationPayload {
                title: title.to_string(),
                body: body.to_string(),
                level: None,
                extra: Default::default(),
            })),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::registry::{DeviceSession, DeviceStatus};
    use chrono::Utc;
    use hb_protocol::ReplyPayload;
    use tokio::sync::mpsc;

    fn bridge_with_device(
        device_id: &str,
    ) -> (Arc<DeviceBridge>, mpsc::Receiver<DeviceMessage>) {
        let devices = Arc::new(DeviceRegistry::new());
        let (tx, rx) = mpsc::channel(16);
        devices.register(DeviceSession {
            device_id: device_id.into(),
            user_id: "user-1".into(),
            platform: "linux".into(),
            capabilities: vec![],
            timezone: None,
            status: DeviceStatus::Online,
            connected_at: Utc::now(),
            last_seen: Utc::now(),
            sink: tx,
        });
        (Arc::new(DeviceBridge::new(devices, 30_000)), rx)
    }

    fn reply(request_id: &str) -> MessageBody {
        MessageBody::MemoryResponse(ReplyPayload {
            request_id: Some(request_id.into()),
            result: serde_json::json!({"hits": 2}),
            error: None,
            extra: Default::default(),
        })
    }

    #[tokio::test]
    async fn request_resolves_on_correlated_reply() {
        let (bridge, mut rx) = bridge_with_device("dev-1");

        let bridge2 = bridge.clone();
        let responder = tokio::spawn(async move {
            let outbound = rx.recv().await.unwrap();
            bridge2.resolve(&outbound.id, reply(&outbound.id));
        });

        let body = MessageBody::MemoryRequest(hb_protocol::MemoryRequestPayload {
            action: "search".into(),
            params: serde_json::json!({"query": "x"}),
            extra: Default::default(),
        });
        let result = bridge
            .request("dev-1", body, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.kind(), "memory_response");
        assert_eq!(bridge.pending_count(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_is_a_distinct_error_kind() {
        let (bridge, _rx) = bridge_with_device("dev-1");
        let body = MessageBody::MemoryRequest(hb_protocol::MemoryRequestPayload {
            action: "search".into(),
            params: serde_json::Value::Null,
            extra: Default::default(),
        });
        let err = bridge
            .request("dev-1", body, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_reply_after_timeout_resolves_nothing() {
        let (bridge, mut rx) = bridge_with_device("dev-1");
        let body = MessageBody::MemoryRequest(hb_protocol::MemoryRequestPayload {
            action: "search".into(),
            params: serde_json::Value::Null,
            extra: Default::default(),
        });
        let _ = bridge
            .request("dev-1", body, Duration::from_millis(20))
            .await
            .unwrap_err();

        // Reply arrives after the timeout: at most one resolution per id.
        let outbound = rx.recv().await.unwrap();
        assert!(!bridge.resolve(&outbound.id, reply(&outbound.id)));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_with_transport_error() {
        let (bridge, mut rx) = bridge_with_device("dev-1");
        let bridge2 = bridge.clone();

        let waiter = tokio::spawn(async move {
            let body = MessageBody::MemoryRequest(hb_protocol::MemoryRequestPayload {
                action: "search".into(),
                params: serde_json::Value::Null,
                extra: Default::default(),
            });
            bridge2.request("dev-1", body, Duration::from_secs(5)).await
        });

        // Wait for the request to be registered, then drop the device.
        let _outbound = rx.recv().await.unwrap();
        assert_eq!(bridge.fail_pending_for_device("dev-1"), 1);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn send_to_unknown_device_is_transport_error() {
        let (bridge, _rx) = bridge_with_device("dev-1");
        let err = bridge
            .send("ghost", DeviceMessage::new(MessageBody::Heartbeat(Default::default())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn lifecycle_fans_out_to_user_subscribers() {
        let (bridge, _rx) = bridge_with_device("dev-1");
        let mut sub = bridge.subscribe_user("user-1");

        let agent_id = AgentId::parse("agent_ABCDEFGH12").unwrap();
        bridge.publish_lifecycle("user-1", "dev-1", &agent_id, "created", None);

        let msg = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), "agent_lifecycle");
    }

    #[tokio::test]
    async fn execute_tool_unwraps_result_payload() {
        let (bridge, mut rx) = bridge_with_device("dev-1");
        let bridge2 = bridge.clone();
        tokio::spawn(async move {
            let outbound = rx.recv().await.unwrap();
            assert_eq!(outbound.kind(), "execution_command");
            bridge2.resolve(
                &outbound.id,
                MessageBody::ExecutionResult(ExecutionResultPayload {
                    request_id: Some(outbound.id.clone()),
                    success: true,
                    result: serde_json::json!({"stdout": "ok"}),
                    error: None,
                    extra: Default::default(),
                }),
            );
        });

        let result = bridge
            .execute_tool(
                "dev-1",
                ExecutionCommand::tool_execute("shell", serde_json::json!({"cmd": "ls"}), 30_000),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.result["stdout"], "ok");
    }
}
