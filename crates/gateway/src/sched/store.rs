//! Persistent task stores for the schedulers.
//!
//! JSON files under the state dir, single-process writer. Every mutation
//! persists and pokes the scheduler's re-arm `Notify` so the armed timer
//! always reflects the earliest due task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use super::model::{DeferredStatus, DeferredTask, RecurringStatus, RecurringTask};

/// Shared persistence shape for both schedulers.
pub struct JsonStore<T> {
    inner: RwLock<HashMap<Uuid, T>>,
    persist_path: PathBuf,
    /// Poked on every mutation so the scheduler loop re-arms its timer.
    pub rearm: Arc<Notify>,
}

impl<T> JsonStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(state_dir: &std::path::Path, file_name: &str) -> Self {
        let persist_path = state_dir.join(file_name);
        let mut map = HashMap::new();
        if let Ok(raw) = std::fs::read_to_string(&persist_path) {
            match serde_json::from_str::<Vec<(Uuid, T)>>(&raw) {
                Ok(entries) => {
                    map = entries.into_iter().collect();
                    tracing::info!(count = map.len(), file = file_name, "loaded scheduler tasks");
                }
                Err(e) => {
                    tracing::warn!(error = %e, file = file_name, "scheduler store unreadable, starting empty");
                }
            }
        }
        Self {
            inner: RwLock::new(map),
            persist_path,
            rearm: Arc::new(Notify::new()),
        }
    }

    async fn persist(&self) {
        let entries: Vec<(Uuid, T)> = {
            let map = self.inner.read().await;
            map.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        if let Ok(json) = serde_json::to_string_pretty(&entries) {
            let path = self.persist_path.clone();
            let _ = tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(error = %e, "failed to persist scheduler store");
                }
            })
            .await;
        }
    }

    pub async fn list(&self) -> Vec<T> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &Uuid) -> Option<T> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn insert(&self, id: Uuid, task: T) {
        self.inner.write().await.insert(id, task);
        self.persist().await;
        self.rearm.notify_one();
    }

    /// Mutate in place; persists and re-arms when the id was found.
    pub async fn update(&self, id: &Uuid, f: impl FnOnce(&mut T)) -> Option<T> {
        let updated = {
            let mut map = self.inner.write().await;
            match map.get_mut(id) {
                Some(task) => {
                    f(task);
                    Some(task.clone())
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.persist().await;
            self.rearm.notify_one();
        }
        updated
    }

    pub async fn delete(&self, id: &Uuid) -> bool {
        let removed = self.inner.write().await.remove(id).is_some();
        if removed {
            self.persist().await;
            self.rearm.notify_one();
        }
        removed
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deferred store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DeferredStore {
    pub tasks: JsonStore<DeferredTask>,
}

impl DeferredStore {
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            tasks: JsonStore::new(state_dir, "deferred-tasks.json"),
        }
    }

    /// Tasks ready to run: pending with `scheduled_for <= now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<DeferredTask> {
        let mut due: Vec<DeferredTask> = self
            .tasks
            .list()
            .await
            .into_iter()
            .filter(|t| t.status == DeferredStatus::Pending && t.scheduled_for <= now)
            .collect();
        due.sort_by_key(|t| t.scheduled_for);
        due
    }

    /// Earliest pending fire time, for timer arming.
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .list()
            .await
            .into_iter()
            .filter(|t| t.status == DeferredStatus::Pending)
            .map(|t| t.scheduled_for)
            .min()
    }

    pub async fn counts_by_status(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.list().await {
            *counts
                .entry(format!("{:?}", task.status).to_lowercase())
                .or_insert(0) += 1;
        }
        counts
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recurring store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RecurringStore {
    pub tasks: JsonStore<RecurringTask>,
}

impl RecurringStore {
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            tasks: JsonStore::new(state_dir, "recurring-tasks.json"),
        }
    }

    pub async fn due(&self, now: DateTime<Utc>) -> Vec<RecurringTask> {
        self.tasks
            .list()
            .await
            .into_iter()
            .filter(|t| {
                t.status == RecurringStatus::Active
                    && t.next_run_at.is_some_and(|next| next <= now)
            })
            .collect()
    }

    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .list()
            .await
            .into_iter()
            .filter(|t| t.status == RecurringStatus::Active)
            .filter_map(|t| t.next_run_at)
            .min()
    }

    pub async fn for_user(&self, user_id: &str) -> Vec<RecurringTask> {
        self.tasks
            .list()
            .await
            .into_iter()
            .filter(|t| t.user_id == user_id)
            .collect()
    }
}
