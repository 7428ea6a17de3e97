//! WebSocket endpoint for device connections.
//!
//! Flow:
//! 1. Device connects to `/v1/devices/ws`
//! 2. Device sends an `auth` message with its pre-shared token
//! 3. Gateway registers the session and acknowledges with a `notification`
//! 4. Bidirectional loop: the gateway pushes execution/memory commands,
//!    the device streams back results, prompts, and heartbeats

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use hb_protocol::{AuthPayload, DeviceMessage, MessageBody};

use crate::devices::registry::{DeviceSession, DeviceStatus};
use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digests (hashing normalizes
/// lengths so `ct_eq` always compares 32 bytes).
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

/// GET /v1/devices/ws — upgrade to WebSocket.
pub async fn device_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // 1. Wait for auth.
    let auth = match wait_for_auth(&mut ws_stream).await {
        Some(a) => a,
        None => {
            tracing::warn!("device disconnected before authenticating");
            return;
        }
    };

    // Pre-shared token check; unset env = open access (dev mode).
    if let Ok(expected) = std::env::var(&state.config.server.device_token_env) {
        if !token_eq(&auth.token, &expected) {
            tracing::warn!(device_id = %auth.device_id, "device token rejected");
            let _ = ws_sink.send(Message::Close(None)).await;
            return;
        }
    }

    let device_id = auth.device_id.clone();
    let user_id = auth.user_id.clone();

    // 2. Register the session with an outbound FIFO queue.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<DeviceMessage>(64);
    state.devices.register(DeviceSession {
        device_id: device_id.clone(),
        user_id: user_id.clone(),
        platform: auth.platform.clone(),
        capabilities: auth.capabilities.clone(),
        timezone: auth.timezone.clone(),
        status: DeviceStatus::Online,
        connected_at: Utc::now(),
        last_seen: Utc::now(),
        sink: outbound_tx,
    });

    tracing::info!(
        device_id = %device_id,
        user_id = %user_id,
        platform = %auth.platform,
        "device connected"
    );

    // 3. Acknowledge.
    let ack = DeviceMessage::new(MessageBody::Notification(hb_protocol::NotificationPayload {
        title: "connected".into(),
        body: format!("homebase gateway v{}", env!("CARGO_PKG_VERSION")),
        level: None,
        extra: Default::default(),
    }));
    if send_message(&mut ws_sink, &ack).await.is_err() {
        state.devices.remove(&device_id);
        return;
    }

    // 4. Writer task: drain the outbound queue into the socket (per-device
    //    FIFO; no ordering guarantee across devices).
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if send_message(&mut ws_sink, &msg).await.is_err() {
                break;
            }
        }
    });

    // 5. Reader loop.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<DeviceMessage>(&text) {
                Ok(inbound) => handle_inbound(&state, &device_id, &user_id, inbound).await,
                Err(e) => {
                    tracing::debug!(device_id = %device_id, error = %e, "ignoring unparseable message");
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => state.devices.touch(&device_id),
            _ => {}
        }
    }

    // 6. Cleanup: fail in-flight requests, remove the session.
    let failed = state.bridge.fail_pending_for_device(&device_id);
    writer.abort();
    state.devices.remove(&device_id);
    tracing::info!(device_id = %device_id, failed_in_flight = failed, "device disconnected");
}

async fn wait_for_auth(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<AuthPayload> {
    let timeout = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                if let Ok(DeviceMessage {
                    body: MessageBody::Auth(auth),
                    ..
                }) = serde_json::from_str::<DeviceMessage>(&text)
                {
                    return Some(auth);
                }
            }
        }
        None
    })
    .await;
    timeout.unwrap_or(None)
}

async fn send_message(
    sink: &mut (impl SinkExt<Message> + Unpin),
    msg: &DeviceMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

/// Demultiplex one inbound message.
async fn handle_inbound(state: &AppState, device_id: &str, user_id: &str, msg: DeviceMessage) {
    state.devices.touch(device_id);

    // Correlated replies resolve their pending bridge request.
    if let Some(request_id) = msg.body.request_id() {
        let request_id = request_id.to_string();
        state.bridge.resolve(&request_id, msg.body);
        return;
    }

    match msg.body {
        MessageBody::Prompt(prompt) => {
            // Each user message gets its own worker.
            let state = state.clone();
            let device_id = device_id.to_string();
            let user_id = user_id.to_string();
            tokio::spawn(async move {
                crate::runtime::handle_prompt(state, device_id, user_id, prompt.text).await;
            });
        }
        MessageBody::Heartbeat(_) => {
            // touch above is all a heartbeat needs.
        }
        MessageBody::LlmCallRequest(call) => {
            // Device-proxied LLM call: run it with the requested role and
            // reply on the same channel.
            let state = state.clone();
            let device_id = device_id.to_string();
            let request_id = msg.id.clone();
            tokio::spawn(async move {
                crate::runtime::handle_device_llm_call(state, device_id, request_id, call).await;
            });
        }
        MessageBody::CredentialSessionRequest(p) | MessageBody::CredentialStored(p) => {
            // Credential vault flows are an external collaborator; log only.
            tracing::debug!(device_id = %device_id, session_id = %p.session_id, "credential message ignored");
        }
        MessageBody::RegisterDevice(_) | MessageBody::Auth(_) => {
            tracing::debug!(device_id = %device_id, "duplicate registration ignored");
        }
        other => {
            tracing::debug!(device_id = %device_id, kind = other.kind(), "unexpected inbound message type");
        }
    }
}
