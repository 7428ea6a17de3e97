//! In-memory registry of connected devices.
//!
//! A device is the addressable execution target; the user is the
//! authorization principal. Reconnects replace the prior session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use hb_protocol::DeviceMessage;

/// Channel used to push messages to a device's WS writer task.
pub type DeviceSink = mpsc::Sender<DeviceMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Idle,
}

/// A connected device session.
pub struct DeviceSession {
    pub device_id: String,
    pub user_id: String,
    pub platform: String,
    pub capabilities: Vec<String>,
    pub timezone: Option<String>,
    pub status: DeviceStatus,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sink: DeviceSink,
}

/// Summary info for list endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub user_id: String,
    pub platform: String,
    pub capabilities: Vec<String>,
    pub timezone: Option<String>,
    pub status: DeviceStatus,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Thread-safe registry of all connected devices.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceSession>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Register a device connection. Replaces any existing session with the
    /// same `device_id` (reconnect scenario).
    pub fn register(&self, session: DeviceSession) {
        tracing::info!(
            device_id = %session.device_id,
            user_id = %session.user_id,
            platform = %session.platform,
            capabilities = session.capabilities.len(),
            "device registered"
        );
        self.devices
            .write()
            .insert(session.device_id.clone(), session);
    }

    pub fn remove(&self, device_id: &str) {
        if self.devices.write().remove(device_id).is_some() {
            tracing::info!(device_id = %device_id, "device removed");
        }
    }

    /// Update last_seen (called on any inbound message).
    pub fn touch(&self, device_id: &str) {
        if let Some(session) = self.devices.write().get_mut(device_id) {
            session.last_seen = Utc::now();
        }
    }

    pub fn get_sink(&self, device_id: &str) -> Option<DeviceSink> {
        self.devices.read().get(device_id).map(|d| d.sink.clone())
    }

    pub fn user_for(&self, device_id: &str) -> Option<String> {
        self.devices
            .read()
            .get(device_id)
            .map(|d| d.user_id.clone())
    }

    pub fn timezone_for(&self, device_id: &str) -> Option<String> {
        self.devices
            .read()
            .get(device_id)
            .and_then(|d| d.timezone.clone())
    }

    /// Devices for a user, sorted for determinism.
    pub fn devices_for_user(&self, user_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .read()
            .values()
            .filter(|d| d.user_id == user_id)
            .map(|d| d.device_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        self.devices
            .read()
            .values()
            .map(|d| DeviceInfo {
                device_id: d.device_id.clone(),
                user_id: d.user_id.clone(),
                platform: d.platform.clone(),
                capabilities: d.capabilities.clone(),
                timezone: d.timezone.clone(),
                status: d.status,
                connected_at: d.connected_at,
                last_seen: d.last_seen,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Remove devices unseen for longer than `timeout_secs`. Returns the
    /// removed ids so the bridge can fail their in-flight requests.
    pub fn prune_stale(&self, timeout_secs: i64) -> Vec<String> {
        let now = Utc::now();
        let mut devices = self.devices.write();
        let stale: Vec<String> = devices
            .values()
            .filter(|d| now.signed_duration_since(d.last_seen).num_seconds() >= timeout_secs)
            .map(|d| d.device_id.clone())
            .collect();
        for id in &stale {
            devices.remove(id);
        }
        if !stale.is_empty() {
            tracing::info!(pruned = stale.len(), remaining = devices.len(), "pruned stale devices");
        }
        stale
    }
}
