use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_ms;

/// Recent-duration window used by the health score.
const RECENT_WINDOW_MS: u64 = 300_000;

/// Average duration above which the health score starts losing points.
const SLOW_DURATION_MS: f64 = 5_000.0;

#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    pub max_records: usize,
    pub retention: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub execution_id: Uuid,
    pub user_id: String,
    pub agent_name: String,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub success: Option<bool>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStats {
    pub user_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub active_runs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub active_runs: usize,
    pub active_users: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub score: f64,
    pub status: String,
}

/// Process-wide read path over historical execution records, for monitoring
/// dashboards. Never consulted by the hot execution path. The window is
/// bounded; a background sweep trims old records.
pub struct ExecutionStateStore {
    config: StateStoreConfig,
    records: DashMap<Uuid, ExecutionEntry>,
}

impl ExecutionStateStore {
    pub fn new(config: StateStoreConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            records: DashMap::new(),
        })
    }

    pub fn record_start(&self, execution_id: Uuid, user_id: &str, agent_name: &str) {
        self.records.insert(
            execution_id,
            ExecutionEntry {
                execution_id,
                user_id: user_id.to_string(),
                agent_name: agent_name.to_string(),
                started_at_ms: now_ms(),
                finished_at_ms: None,
                success: None,
                duration_ms: None,
            },
        );
    }

    pub fn record_complete(&self, execution_id: Uuid, success: bool, duration_ms: u64) {
        if let Some(mut entry) = self.records.get_mut(&execution_id) {
            entry.finished_at_ms = Some(now_ms());
            entry.success = Some(success);
            entry.duration_ms = Some(duration_ms);
        }
    }

    pub fn user_stats(&self, user_id: &str) -> UserStats {
        let entries: Vec<ExecutionEntry> = self
            .records
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        let (total, succeeded, failed, active, avg) = summarize(&entries);
        UserStats {
            user_id: user_id.to_string(),
            total,
            succeeded,
            failed,
            success_rate: rate(succeeded, succeeded + failed),
            avg_duration_ms: avg,
            active_runs: active,
        }
    }

    pub fn global_stats(&self) -> GlobalStats {
        let entries: Vec<ExecutionEntry> =
            self.records.iter().map(|e| e.value().clone()).collect();
        let (total, succeeded, failed, active, avg) = summarize(&entries);
        let active_users: HashSet<&str> = entries
            .iter()
            .filter(|e| e.finished_at_ms.is_none())
            .map(|e| e.user_id.as_str())
            .collect();
        GlobalStats {
            total,
            succeeded,
            failed,
            success_rate: rate(succeeded, succeeded + failed),
            avg_duration_ms: avg,
            active_runs: active,
            active_users: active_users.len(),
        }
    }

    /// 0–100 score from success rate plus a penalty for slow recent runs.
    /// ≥90 healthy, ≥70 degraded_warning, ≥50 degraded, else critical.
    pub fn system_health(&self) -> SystemHealth {
        let entries: Vec<ExecutionEntry> =
            self.records.iter().map(|e| e.value().clone()).collect();
        let finished: Vec<&ExecutionEntry> =
            entries.iter().filter(|e| e.success.is_some()).collect();

        if finished.is_empty() {
            return SystemHealth {
                score: 100.0,
                status: "healthy".to_string(),
            };
        }

        let succeeded = finished.iter().filter(|e| e.success == Some(true)).count();
        let mut score = 100.0 * succeeded as f64 / finished.len() as f64;

        let cutoff = now_ms().saturating_sub(RECENT_WINDOW_MS);
        let recent: Vec<f64> = finished
            .iter()
            .filter(|e| e.finished_at_ms.unwrap_or(0) >= cutoff)
            .filter_map(|e| e.duration_ms.map(|d| d as f64))
            .collect();
        if !recent.is_empty() {
            let avg = recent.iter().sum::<f64>() / recent.len() as f64;
            if avg > SLOW_DURATION_MS {
                let penalty = ((avg / SLOW_DURATION_MS) - 1.0) * 10.0;
                score -= penalty.min(20.0);
            }
        }

        let score = score.clamp(0.0, 100.0);
        let status = if score >= 90.0 {
            "healthy"
        } else if score >= 70.0 {
            "degraded_warning"
        } else if score >= 50.0 {
            "degraded"
        } else {
            "critical"
        };
        SystemHealth {
            score,
            status: status.to_string(),
        }
    }

    /// Trim finished records past retention, then oldest-first down to the
    /// record cap. Returns how many records were dropped.
    pub fn prune(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.config.retention.as_millis() as u64);
        let aged: Vec<Uuid> = self
            .records
            .iter()
            .filter(|e| {
                e.value()
                    .finished_at_ms
                    .map(|t| t < cutoff)
                    .unwrap_or(false)
            })
            .map(|e| *e.key())
            .collect();
        let mut dropped = aged.len();
        for id in aged {
            self.records.remove(&id);
        }

        if self.records.len() > self.config.max_records {
            let mut finished: Vec<(u64, Uuid)> = self
                .records
                .iter()
                .filter_map(|e| e.value().finished_at_ms.map(|t| (t, *e.key())))
                .collect();
            finished.sort_unstable();
            let excess = self.records.len().saturating_sub(self.config.max_records);
            for (_, id) in finished.into_iter().take(excess) {
                self.records.remove(&id);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn summarize(entries: &[ExecutionEntry]) -> (usize, usize, usize, usize, f64) {
    let total = entries.len();
    let succeeded = entries.iter().filter(|e| e.success == Some(true)).count();
    let failed = entries.iter().filter(|e| e.success == Some(false)).count();
    let active = entries.iter().filter(|e| e.finished_at_ms.is_none()).count();
    let durations: Vec<f64> = entries
        .iter()
        .filter_map(|e| e.duration_ms.map(|d| d as f64))
        .collect();
    let avg = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };
    (total, succeeded, failed, active, avg)
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 1.0;
    }
    part as f64 / whole as f64
}

/// Background sweep keeping the store's window bounded.
pub async fn prune_loop(store: Arc<ExecutionStateStore>, interval: Duration) {
    tracing::info!(interval_secs = interval.as_secs(), "state store prune loop started");
    loop {
        tokio::time::sleep(interval).await;
        let dropped = store.prune();
        if dropped > 0 {
            tracing::info!(dropped, remaining = store.len(), "state store pruned");
        }
    }
}
