//! Per-task timer monitor.
//!
//! Every active task gets an estimate keyed on its intake classification.
//! When the timer fires and the task is still active, a progress
//! notification is emitted and the timer extends by 50% of the original
//! estimate. After five extensions a single timeout event is emitted and
//! the monitor stops. `clear` cancels on completion or failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

const MAX_EXTENSIONS: u32 = 5;

/// Default estimates by intake classification.
pub fn estimate_ms(classification: &str) -> u64 {
    match classification {
        "INFO_REQUEST" => 15_000,
        "ACTION" => 30_000,
        "COMPOUND" => 60_000,
        "CONTINUATION" => 30_000,
        "CONVERSATIONAL" => 10_000,
        "MEMORY_UPDATE" => 10_000,
        _ => 30_000,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Still running; a progress nudge for the user.
    Progress { message: String },
    /// The task blew through its estimate five times.
    Timeout,
}

struct ActiveTimer {
    cancelled: Arc<AtomicBool>,
}

pub struct TaskMonitor {
    timers: Mutex<HashMap<String, ActiveTimer>>,
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the timer for a task. `on_event` is invoked from
    /// the timer task for every notification.
    pub fn start(
        &self,
        task_id: &str,
        classification: &str,
        on_event: Arc<dyn Fn(MonitorEvent) + Send + Sync>,
    ) {
        let estimate = Duration::from_millis(estimate_ms(classification));
        let cancelled = Arc::new(AtomicBool::new(false));

        // Restarting replaces (and cancels) any previous timer.
        if let Some(previous) = self.timers.lock().insert(
            task_id.to_string(),
            ActiveTimer {
                cancelled: cancelled.clone(),
            },
        ) {
            previous.cancelled.store(true, Ordering::Release);
        }

        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(estimate).await;
            let mut extensions = 0u32;
            loop {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                extensions += 1;
                if extensions > MAX_EXTENSIONS {
                    tracing::warn!(task_id = %task_id, "task exceeded all timer extensions");
                    on_event(MonitorEvent::Timeout);
                    return;
                }
                on_event(MonitorEvent::Progress {
                    message: format!(
                        "still working on it ({}x past the initial estimate)",
                        extensions
                    ),
                });
                // Each extension is half the original estimate.
                tokio::time::sleep(estimate / 2).await;
            }
        });
    }

    /// Cancel the timer for a task (completion or failure).
    pub fn clear(&self, task_id: &str) {
        if let Some(timer) = self.timers.lock().remove(task_id) {
            timer.cancelled.store(true, Ordering::Release);
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<dyn Fn(MonitorEvent) + Send + Sync>, Arc<Mutex<Vec<MonitorEvent>>>) {
        let events: Arc<Mutex<Vec<MonitorEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let cb: Arc<dyn Fn(MonitorEvent) + Send + Sync> =
            Arc::new(move |event| sink.lock().push(event));
        (cb, events)
    }

    #[test]
    fn estimates_by_classification() {
        assert_eq!(estimate_ms("INFO_REQUEST"), 15_000);
        assert_eq!(estimate_ms("ACTION"), 30_000);
        assert_eq!(estimate_ms("COMPOUND"), 60_000);
        assert_eq!(estimate_ms("CONTINUATION"), 30_000);
        assert_eq!(estimate_ms("CONVERSATIONAL"), 10_000);
        assert_eq!(estimate_ms("MEMORY_UPDATE"), 10_000);
        assert_eq!(estimate_ms("SOMETHING_ELSE"), 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn five_extensions_then_single_timeout() {
        let monitor = TaskMonitor::new();
        let (cb, events) = collector();
        monitor.start("task-1", "INFO_REQUEST", cb);

        // Run far past every extension: 15s + 5 * 7.5s + slack.
        tokio::time::sleep(Duration::from_secs(120)).await;

        let events = events.lock();
        let progress = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::Progress { .. }))
            .count();
        let timeouts = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::Timeout))
            .count();
        assert_eq!(progress, 5, "exactly five progress notifications");
        assert_eq!(timeouts, 1, "exactly one timeout");
        // Timeout is last.
        assert_eq!(events.last(), Some(&MonitorEvent::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_stops_notifications() {
        let monitor = TaskMonitor::new();
        let (cb, events) = collector();
        monitor.start("task-1", "INFO_REQUEST", cb);

        // Let one progress notification through, then clear.
        tokio::time::sleep(Duration::from_secs(16)).await;
        monitor.clear("task-1");
        tokio::time::sleep(Duration::from_secs(120)).await;

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], MonitorEvent::Progress { .. }));
        assert_eq!(monitor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_before_estimate_emits_nothing() {
        let monitor = TaskMonitor::new();
        let (cb, events) = collector();
        monitor.start("task-1", "CONVERSATIONAL", cb);

        tokio::time::sleep(Duration::from_secs(5)).await;
        monitor.clear("task-1");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(events.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_timer() {
        let monitor = TaskMonitor::new();
        let (cb1, events1) = collector();
        let (cb2, events2) = collector();
        monitor.start("task-1", "CONVERSATIONAL", cb1);
        monitor.start("task-1", "CONVERSATIONAL", cb2);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(events1.lock().is_empty(), "replaced timer is silent");
        assert!(!events2.lock().is_empty());
        monitor.clear("task-1");
    }
}
