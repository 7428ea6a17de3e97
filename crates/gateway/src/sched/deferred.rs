//! Deferred (one-shot) scheduler.
//!
//! A single timer is armed at the earliest pending `scheduled_for`; it is
//! re-armed after every store mutation and after every poll. Failed
//! executions retry with exponential backoff until `max_attempts`, after
//! which the task is marked expired.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use uuid::Uuid;

use hb_domain::config::SchedulerConfig;

use super::model::{clamp_timer_delay_ms, DeferredStatus, DeferredTask, MAX_TIMER_DELAY_MS};
use super::store::DeferredStore;

/// Executes one due task; the string result is informational.
pub type DeferredExecuteFn =
    Arc<dyn Fn(DeferredTask) -> BoxFuture<'static, hb_domain::Result<String>> + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeferredStats {
    pub counts: HashMap<String, usize>,
    pub next_due: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

pub struct DeferredScheduler {
    pub store: Arc<DeferredStore>,
    execute: DeferredExecuteFn,
    max_concurrent: usize,
    retry_base_ms: u64,
    in_flight: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
    drain: Duration,
}

const RETRY_BASE_MS: u64 = 30_000;
const RETRY_CAP_MS: u64 = 3_600_000;

/// Backoff before retry `attempt` (1-based): base * 2^(n-1), capped at 1h.
fn backoff_ms(attempt: u32, base_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exp = (attempt - 1).min(20);
    base_ms.checked_shl(exp).unwrap_or(RETRY_CAP_MS).min(RETRY_CAP_MS)
}

impl DeferredScheduler {
    pub fn new(store: Arc<DeferredStore>, config: &SchedulerConfig, execute: DeferredExecuteFn) -> Self {
        Self {
            store,
            execute,
            max_concurrent: config.max_concurrent.max(1),
            retry_base_ms: RETRY_BASE_MS,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            drain: Duration::from_secs(config.shutdown_drain_secs),
        }
    }

    /// Shrink the retry base (tests).
    #[cfg(test)]
    fn with_retry_base_ms(mut self, base_ms: u64) -> Self {
        self.retry_base_ms = base_ms;
        self
    }

    /// Spawn the scheduler loop: an immediate poll, then a single armed
    /// timer at the earliest due task.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tracing::info!("deferred scheduler started");
            this.poll().await;
            loop {
                if this.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                let wait_ms = match this.store.next_due().await {
                    Some(due) => {
                        let delta = (due - Utc::now()).num_milliseconds().max(0) as u64;
                        clamp_timer_delay_ms(delta)
                    }
                    None => MAX_TIMER_DELAY_MS,
                };
                let rearm = this.store.tasks.rearm.clone();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {
                        this.poll().await;
                    }
                    _ = rearm.notified() => {
                        // Mutation happened; loop to re-arm at the new minimum.
                    }
                }
            }
            tracing::info!("deferred scheduler stopped");
        })
    }

    /// Run every due task, respecting `max_concurrent`.
    pub async fn poll(self: &Arc<Self>) {
        let now = Utc::now();
        for task in self.store.due(now).await {
            if self.in_flight.load(Ordering::Acquire) >= self.max_concurrent {
                tracing::debug!("deferred scheduler at max_concurrent, deferring remainder");
                break;
            }
            self.spawn_execution(task).await;
        }
    }

    async fn spawn_execution(self: &Arc<Self>, task: DeferredTask) {
        let id = task.id;
        let attempt = task.attempts + 1;
        let updated = self
            .store
            .tasks
            .update(&id, |t| {
                t.status = DeferredStatus::Running;
                t.attempts = attempt;
                t.updated_at = Utc::now();
            })
            .await;
        let Some(task) = updated else { return };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let this = self.clone();
        tokio::spawn(async move {
            tracing::info!(task_id = %id, attempt, "executing deferred task");
            let result = (this.execute)(task).await;
            let now = Utc::now();
            match result {
                Ok(_) => {
                    this.store
                        .tasks
                        .update(&id, |t| {
                            t.status = DeferredStatus::Completed;
                            t.updated_at = now;
                        })
                        .await;
                }
                Err(e) => {
                    let err = e.to_string();
                    let retry_base = this.retry_base_ms;
                    this.store
                        .tasks
                        .update(&id, |t| {
                            t.last_error = Some(err.clone());
                            t.updated_at = now;
                            if t.attempts >= t.max_attempts {
                                t.status = DeferredStatus::Expired;
                            } else {
                                t.status = DeferredStatus::Pending;
                                let delay = backoff_ms(t.attempts, retry_base);
                                t.scheduled_for = now + chrono::Duration::milliseconds(delay as i64);
                            }
                        })
                        .await;
                    tracing::warn!(task_id = %id, attempt, error = %err, "deferred task attempt failed");
                }
            }
            this.in_flight.fetch_sub(1, Ordering::AcqRel);
            // Completion is a mutation: the store already poked the re-arm
            // notify, so the timer reflects the new minimum.
        });
    }

    pub async fn schedule(&self, task: DeferredTask) -> Uuid {
        let id = task.id;
        tracing::info!(task_id = %id, scheduled_for = %task.scheduled_for, "deferred task scheduled");
        self.store.tasks.insert(id, task).await;
        id
    }

    /// Cancel a non-terminal task.
    pub async fn cancel(&self, id: &Uuid) -> bool {
        let mut cancelled = false;
        self.store
            .tasks
            .update(id, |t| {
                if !t.status.is_terminal() {
                    t.status = DeferredStatus::Cancelled;
                    t.updated_at = Utc::now();
                    cancelled = true;
                }
            })
            .await;
        cancelled
    }

    pub async fn stats(&self) -> DeferredStats {
        DeferredStats {
            counts: self.store.counts_by_status().await,
            next_due: self.store.next_due().await,
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    /// Stop accepting work and drain in-flight executions for up to the
    /// configured drain window.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.store.tasks.rearm.notify_one();
        let deadline = tokio::time::Instant::now() + self.drain;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_flight = self.in_flight.load(Ordering::Acquire),
                    "shutdown drain window elapsed with executions still running"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
