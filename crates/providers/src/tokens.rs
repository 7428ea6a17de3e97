//! Per-device token accounting.
//!
//! Every LLM call records one usage row. Writes are best-effort and may be
//! reordered; nothing in the pipeline waits on them.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hb_domain::error::Result;

/// One recorded LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    pub device_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub role: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Per-device token totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

/// Append-only JSONL ledger of token usage.
pub struct TokenTracker {
    path: PathBuf,
}

impl TokenTracker {
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            path: state_dir.join("token-usage.jsonl"),
        }
    }

    /// Fire-and-forget record. Failures are logged, never surfaced.
    pub fn record(self: &Arc<Self>, row: UsageRow) {
        let tracker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tracker.append(&row).await {
                tracing::warn!(error = %e, "token usage write failed");
            }
        });
    }

    /// Append one row. Exposed for tests and synchronous callers.
    pub async fn append(&self, row: &UsageRow) -> Result<()> {
        let line = serde_json::to_string(row)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{line}")?;
            Ok(())
        })
        .await
        .map_err(|e| hb_domain::Error::Other(format!("join: {e}")))?
    }

    /// Sum usage for one device (or all devices when `device_id` is None).
    pub fn totals(&self, device_id: Option<&str>) -> UsageTotals {
        let mut totals = UsageTotals::default();
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return totals;
        };
        for line in raw.lines() {
            let Ok(row) = serde_json::from_str::<UsageRow>(line) else {
                continue;
            };
            if let Some(want) = device_id {
                if row.device_id.as_deref() != Some(want) {
                    continue;
                }
            }
            totals.input_tokens += row.input_tokens as u64;
            totals.output_tokens += row.output_tokens as u64;
            totals.calls += 1;
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(device: &str, input: u32, output: u32) -> UsageRow {
        UsageRow {
            device_id: Some(device.into()),
            timestamp: Utc::now(),
            model: "claude-sonnet-4-20250514".into(),
            role: "workhorse".into(),
            input_tokens: input,
            output_tokens: output,
            agent_id: None,
        }
    }

    #[tokio::test]
    async fn append_and_totals_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = TokenTracker::new(dir.path());

        tracker.append(&row("dev-a", 100, 20)).await.unwrap();
        tracker.append(&row("dev-a", 50, 10)).await.unwrap();
        tracker.append(&row("dev-b", 7, 3)).await.unwrap();

        let a = tracker.totals(Some("dev-a"));
        assert_eq!(a.input_tokens, 150);
        assert_eq!(a.output_tokens, 30);
        assert_eq!(a.calls, 2);

        let all = tracker.totals(None);
        assert_eq!(all.calls, 3);
    }

    #[tokio::test]
    async fn totals_on_missing_file_are_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = TokenTracker::new(dir.path());
        let totals = tracker.totals(None);
        assert_eq!(totals.calls, 0);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = TokenTracker::new(dir.path());
        tracker.append(&row("dev-a", 1, 1)).await.unwrap();
        std::fs::write(
            dir.path().join("token-usage.jsonl"),
            "not json\n{\"device_id\":\"dev-a\",\"timestamp\":\"2026-01-01T00:00:00Z\",\"model\":\"m\",\"role\":\"intake\",\"input_tokens\":5,\"output_tokens\":5}\n",
        )
        .unwrap();
        let totals = tracker.totals(Some("dev-a"));
        assert_eq!(totals.calls, 1);
    }
}
