//! Routing lock and signal coalescing.
//!
//! One exclusive, non-blocking lock per device guards routing decisions:
//! at most one routing LLM call is in flight per device. While the lock is
//! held, an `active_agent_id` (and optional workspace path) is observable;
//! rapid-fire messages arriving in that window coalesce into the active
//! agent's signal queue instead of spawning a second pipeline.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use hb_domain::AgentId;

/// What a contender can observe about a held lock.
#[derive(Debug, Clone, Default)]
pub struct RoutingLockState {
    pub active_agent_id: Option<AgentId>,
    pub active_workspace: Option<String>,
}

#[derive(Default)]
struct LockEntry {
    held: bool,
    state: RoutingLockState,
}

/// Per-device routing locks. Exclusive; `try_acquire` never blocks.
pub struct RoutingLockMap {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl Default for RoutingLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take the lock for a device. Returns false when already held.
    pub fn try_acquire(&self, device_id: &str) -> bool {
        let mut locks = self.locks.lock();
        let entry = locks.entry(device_id.to_string()).or_default();
        if entry.held {
            false
        } else {
            entry.held = true;
            true
        }
    }

    /// Observable state while the lock is held; `None` when not held.
    pub fn observe(&self, device_id: &str) -> Option<RoutingLockState> {
        let locks = self.locks.lock();
        locks
            .get(device_id)
            .filter(|e| e.held)
            .map(|e| e.state.clone())
    }

    /// Record the agent currently running under this lock.
    pub fn set_active(&self, device_id: &str, agent_id: AgentId, workspace: Option<String>) {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get_mut(device_id) {
            entry.state = RoutingLockState {
                active_agent_id: Some(agent_id),
                active_workspace: workspace,
            };
        }
    }

    /// Release the lock and clear the active-agent observation.
    pub fn release(&self, device_id: &str) {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get_mut(device_id) {
            entry.held = false;
            entry.state = RoutingLockState::default();
        }
    }

    pub fn is_held(&self, device_id: &str) -> bool {
        self.locks
            .lock()
            .get(device_id)
            .map(|e| e.held)
            .unwrap_or(false)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signal queues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A user message coalesced into a running agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSignal {
    pub request: String,
    pub received_at: DateTime<Utc>,
}

impl AgentSignal {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            received_at: Utc::now(),
        }
    }
}

/// Per-agent FIFO signal queues. Many producers push; the owning agent
/// drains between steps.
pub struct SignalHub {
    queues: Mutex<HashMap<AgentId, VecDeque<AgentSignal>>>,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHub {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, agent_id: &AgentId, signal: AgentSignal) {
        self.queues
            .lock()
            .entry(agent_id.clone())
            .or_default()
            .push_back(signal);
    }

    /// Drain all buffered signals, FIFO.
    pub fn drain(&self, agent_id: &AgentId) -> Vec<AgentSignal> {
        self.queues
            .lock()
            .get_mut(agent_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, agent_id: &AgentId) -> usize {
        self.queues
            .lock()
            .get(agent_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Drop the queue for a finished agent.
    pub fn remove(&self, agent_id: &AgentId) {
        self.queues.lock().remove(agent_id);
    }
}
