//! Recurring scheduler.
//!
//! Same timer-wheel shape as the deferred scheduler: one armed timer at the
//! earliest `next_run_at`, re-armed on every mutation and poll. Each
//! execution recomputes the next occurrence in the task's IANA timezone;
//! consecutive failures at the cap cancel the task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use uuid::Uuid;

use hb_domain::config::SchedulerConfig;

use super::model::{clamp_timer_delay_ms, RecurringStatus, RecurringTask, MAX_TIMER_DELAY_MS};
use super::store::RecurringStore;

pub type RecurringExecuteFn =
    Arc<dyn Fn(RecurringTask) -> BoxFuture<'static, hb_domain::Result<String>> + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct RecurringStats {
    pub counts: HashMap<String, usize>,
    pub next_due: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

pub struct RecurringScheduler {
    pub store: Arc<RecurringStore>,
    execute: RecurringExecuteFn,
    in_flight: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
    drain: Duration,
}

impl RecurringScheduler {
    pub fn new(store: Arc<RecurringStore>, config: &SchedulerConfig, execute: RecurringExecuteFn) -> Self {
        Self {
            store,
            execute,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            drain: Duration::from_secs(config.shutdown_drain_secs),
        }
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tracing::info!("recurring scheduler started");
            this.poll().await;
            loop {
                if this.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                let wait_ms = match this.store.next_due().await {
                    Some(due) => {
                        let delta = (due - Utc::now()).num_milliseconds().max(0) as u64;
                        // Long waits are clamped; the loop re-arms on wakeup.
                        clamp_timer_delay_ms(delta)
                    }
                    None => MAX_TIMER_DELAY_MS,
                };
                let rearm = this.store.tasks.rearm.clone();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {
                        this.poll().await;
                    }
                    _ = rearm.notified() => {}
                }
            }
            tracing::info!("recurring scheduler stopped");
        })
    }

    pub async fn poll(self: &Arc<Self>) {
        let now = Utc::now();
        for task in self.store.due(now).await {
            self.fire(task, now).await;
        }
    }

    async fn fire(self: &Arc<Self>, task: RecurringTask, now: DateTime<Utc>) {
        let id = task.id;
        // Recompute the next occurrence before executing so a long run
        // doesn't stall the wheel.
        let updated = self
            .store
            .tasks
            .update(&id, |t| {
                t.last_run_at = Some(now);
                t.next_run_at = t.compute_next_run(now);
                t.updated_at = now;
            })
            .await;
        let Some(task) = updated else { return };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let this = self.clone();
        tokio::spawn(async move {
            tracing::info!(task_id = %id, name = %task.name, "running recurring task");
            let result = (this.execute)(task).await;
            let now = Utc::now();
            match result {
                Ok(_) => {
                    this.store
                        .tasks
                        .update(&id, |t| {
                            t.consecutive_failures = 0;
                            t.updated_at = now;
                        })
                        .await;
                }
                Err(e) => {
                    let err = e.to_string();
                    let mut cancelled = false;
                    this.store
                        .tasks
                        .update(&id, |t| {
                            t.consecutive_failures += 1;
                            t.updated_at = now;
                            if t.consecutive_failures >= t.max_failures {
                                t.status = RecurringStatus::Cancelled;
                                cancelled = true;
                            }
                        })
                        .await;
                    if cancelled {
                        tracing::warn!(task_id = %id, error = %err, "recurring task cancelled after repeated failures");
                    } else {
                        tracing::warn!(task_id = %id, error = %err, "recurring task run failed");
                    }
                }
            }
            this.in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    pub async fn create(&self, task: RecurringTask) -> Uuid {
        let id = task.id;
        tracing::info!(task_id = %id, name = %task.name, next_run = ?task.next_run_at, "recurring task created");
        self.store.tasks.insert(id, task).await;
        id
    }

    pub async fn pause(&self, id: &Uuid) -> bool {
        self.transition(id, |t| {
            if t.status == RecurringStatus::Active {
                t.status = RecurringStatus::Paused;
                true
            } else {
                false
            }
        })
        .await
    }

    pub async fn resume(&self, id: &Uuid) -> bool {
        self.transition(id, |t| {
            if t.status == RecurringStatus::Paused {
                t.status = RecurringStatus::Active;
                t.consecutive_failures = 0;
                t.next_run_at = t.compute_next_run(Utc::now());
                true
            } else {
                false
            }
        })
        .await
    }

    pub async fn cancel(&self, id: &Uuid) -> bool {
        self.transition(id, |t| {
            if t.status != RecurringStatus::Cancelled {
                t.status = RecurringStatus::Cancelled;
                true
            } else {
                false
            }
        })
        .await
    }

    async fn transition(&self, id: &Uuid, f: impl FnOnce(&mut RecurringTask) -> bool) -> bool {
        let mut changed = false;
        self.store
            .tasks
            .update(id, |t| {
                changed = f(t);
                if changed {
                    t.updated_at = Utc::now();
                }
            })
            .await;
        changed
    }

    pub async fn stats(&self) -> RecurringStats {
        let mut counts = HashMap::new();
        for task in self.store.tasks.list().await {
            *counts
                .entry(format!("{:?}", task.status).to_lowercase())
                .or_insert(0) += 1;
        }
        RecurringStats {
            counts,
            next_due: self.store.next_due().await,
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.store.tasks.rearm.notify_one();
        let deadline = tokio::time::Instant::now() + self.drain;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::model::ScheduleSpec;
    use parking_lot::Mutex;

    fn scheduler_with(
        dir: &std::path::Path,
        always_fail: bool,
    ) -> (Arc<RecurringScheduler>, Arc<Mutex<usize>>) {
        let store = Arc::new(RecurringStore::new(dir));
        let calls = Arc::new(Mutex::new(0usize));
        let calls_clone = calls.clone();
        let execute: RecurringExecuteFn = Arc::new(move |_task| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                *calls.lock() += 1;
                if always_fail {
                    Err(hb_domain::Error::Other("induced".into()))
                } else {
                    Ok("ok".to_string())
                }
            })
        });
        let config = SchedulerConfig::default();
        (
            Arc::new(RecurringScheduler::new(store, &config, execute)),
            calls,
        )
    }

    fn due_now_task(max_failures: u32) -> RecurringTask {
        let mut task = RecurringTask::new(
            "u1",
            "digest",
            "summarize",
            ScheduleSpec::Hourly { minute: 0 },
            "UTC",
            max_failures,
        );
        task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        task
    }

    #[tokio::test]
    async fn execution_advances_next_run_and_resets_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (sched, calls) = scheduler_with(dir.path(), false);
        let handle = sched.start();

        let mut task = due_now_task(5);
        task.consecutive_failures = 2;
        let id = sched.create(task).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let t = sched.store.tasks.get(&id).await.unwrap();
            if t.last_run_at.is_some() && t.consecutive_failures == 0 {
                assert!(t.next_run_at.unwrap() > Utc::now());
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*calls.lock(), 1);

        sched.shutdown().await;
        handle.abort();
    }

    #[tokio::test]
    async fn repeated_failures_cancel_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let (sched, _calls) = scheduler_with(dir.path(), true);
        let handle = sched.start();

        let task = due_now_task(1);
        let id = sched.create(task).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let t = sched.store.tasks.get(&id).await.unwrap();
            if t.status == RecurringStatus::Cancelled {
                assert_eq!(t.consecutive_failures, 1);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never cancelled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Timer re-arms without the cancelled task.
        assert!(sched.store.next_due().await.is_none());

        sched.shutdown().await;
        handle.abort();
    }

    #[tokio::test]
    async fn pause_resume_cancel_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (sched, calls) = scheduler_with(dir.path(), false);

        let mut task = due_now_task(5);
        task.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        let id = sched.create(task).await;

        assert!(sched.pause(&id).await);
        assert!(!sched.pause(&id).await, "pause is idempotent-false");
        assert_eq!(
            sched.store.tasks.get(&id).await.unwrap().status,
            RecurringStatus::Paused
        );
        // Paused tasks never count toward the armed timer.
        assert!(sched.store.next_due().await.is_none());

        assert!(sched.resume(&id).await);
        let resumed = sched.store.tasks.get(&id).await.unwrap();
        assert_eq!(resumed.status, RecurringStatus::Active);
        assert!(resumed.next_run_at.is_some());

        assert!(sched.cancel(&id).await);
        assert!(!sched.cancel(&id).await);
        assert_eq!(*calls.lock(), 0);
    }

    #[tokio::test]
    async fn stats_report_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (sched, _) = scheduler_with(dir.path(), false);
        let mut a = due_now_task(5);
        a.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        let b_id;
        {
            let mut b = due_now_task(5);
            b.next_run_at = Some(Utc::now() + chrono::Duration::hours(2));
            b_id = b.id;
            sched.create(a).await;
            sched.create(b).await;
        }
        sched.pause(&b_id).await;

        let stats = sched.stats().await;
        assert_eq!(stats.counts.get("active"), Some(&1));
        assert_eq!(stats.counts.get("paused"), Some(&1));
        assert!(stats.next_due.is_some());
    }
}
