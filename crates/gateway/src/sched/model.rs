//! Scheduler data model: deferred (one-shot) and recurring tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cron;

/// Timer delays are clamped to this (2^31 - 1 ms); longer waits re-arm on
/// wakeup.
pub const MAX_TIMER_DELAY_MS: u64 = 2_147_483_647;

/// Clamp a wait to the maximum armable timer delay.
pub fn clamp_timer_delay_ms(delay_ms: u64) -> u64 {
    delay_ms.min(MAX_TIMER_DELAY_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::P2
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deferred tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl DeferredStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Expired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredTask {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub original_prompt: String,
    pub deferred_by: String,
    pub defer_reason: String,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    pub status: DeferredStatus,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub thread_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeferredTask {
    pub fn new(
        user_id: impl Into<String>,
        prompt: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            session_id: Uuid::new_v4().to_string(),
            original_prompt: prompt.into(),
            deferred_by: "pipeline".into(),
            defer_reason: String::new(),
            scheduled_for,
            priority: Priority::default(),
            status: DeferredStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            context: serde_json::Value::Null,
            thread_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_CAP_SECS: u64 = 3600;

/// Exponential backoff before retry `attempt` (1-based): base * 2^(n-1),
/// capped at one hour.
pub fn backoff_delay_secs(attempt: u32) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exp = (attempt - 1).min(20);
    BACKOFF_BASE_SECS
        .checked_shl(exp)
        .unwrap_or(BACKOFF_CAP_SECS)
        .min(BACKOFF_CAP_SECS)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recurring tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringStatus {
    Active,
    Paused,
    Cancelled,
}

/// How a recurring task repeats. Daily/weekly/hourly are sugar over cron;
/// interval is wall-clock arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Daily { at: String },
    Weekly { weekday: u8, at: String },
    Hourly { minute: u8 },
    Interval { every_minutes: u64 },
    Cron { expr: String },
}

impl ScheduleSpec {
    /// The equivalent cron expression, when one exists.
    fn to_cron(&self) -> Option<String> {
        match self {
            ScheduleSpec::Daily { at } => {
                let (h, m) = parse_hhmm(at)?;
                Some(format!("{m} {h} * * *"))
            }
            ScheduleSpec::Weekly { weekday, at } => {
                let (h, m) = parse_hhmm(at)?;
                Some(format!("{m} {h} * * {}", weekday % 7))
            }
            ScheduleSpec::Hourly { minute } => Some(format!("{} * * * *", minute % 60)),
            ScheduleSpec::Cron { expr } => Some(expr.clone()),
            ScheduleSpec::Interval { .. } => None,
        }
    }
}

fn parse_hhmm(at: &str) -> Option<(u32, u32)> {
    let (h, m) = at.split_once(':')?;
    let h: u32 = h.trim().parse().ok()?;
    let m: u32 = m.trim().parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTask {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub prompt: String,
    pub schedule: ScheduleSpec,
    pub timezone: String,
    #[serde(default)]
    pub priority: Priority,
    pub status: RecurringStatus,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub max_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringTask {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        prompt: impl Into<String>,
        schedule: ScheduleSpec,
        timezone: impl Into<String>,
        max_failures: u32,
    ) -> Self {
        let now = Utc::now();
        let mut task = Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: name.into(),
            prompt: prompt.into(),
            schedule,
            timezone: timezone.into(),
            priority: Priority::default(),
            status: RecurringStatus::Active,
            next_run_at: None,
            last_run_at: None,
            consecutive_failures: 0,
            max_failures,
            created_at: now,
            updated_at: now,
        };
        task.next_run_at = task.compute_next_run(now);
        task
    }

    /// Next fire time after `after`, evaluated in the task's IANA timezone.
    pub fn compute_next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.schedule {
            ScheduleSpec::Interval { every_minutes } => {
                let anchor = self.last_run_at.unwrap_or(after);
                let mut next = anchor + chrono::Duration::minutes(*every_minutes as i64);
                if next <= after {
                    next = after + chrono::Duration::minutes(*every_minutes as i64);
                }
                Some(next)
            }
            spec => {
                let cron = spec.to_cron()?;
                let tz = cron::parse_tz(&self.timezone);
                cron::next_after_tz(&cron, &after, tz)
            }
        }
    }
}
