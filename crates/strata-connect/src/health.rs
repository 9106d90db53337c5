use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::manager::LoadBalancedConnectionManager;
use crate::now_ms;
use crate::pool::ConnectionPool;

/// Health records retained per pool.
const HISTORY_LIMIT: usize = 120;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Overloaded,
    Critical,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthRecord {
    pub at_ms: u64,
    pub score: f64,
    pub status: HealthStatus,
    pub current_connections: usize,
    pub utilization: f64,
}

/// Scores every pool on a fixed interval and publishes the result to the
/// manager, which excludes CRITICAL/UNAVAILABLE pools from selection.
pub struct PoolHealthMonitor {
    manager: Arc<LoadBalancedConnectionManager>,
    interval: Duration,
    history: DashMap<String, VecDeque<PoolHealthRecord>>,
    checks_total: AtomicU64,
}

impl PoolHealthMonitor {
    pub fn new(manager: Arc<LoadBalancedConnectionManager>) -> Arc<Self> {
        let interval_secs = std::env::var("STRATA_HEALTH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        Arc::new(Self {
            manager,
            interval: Duration::from_secs(interval_secs),
            history: DashMap::new(),
            checks_total: AtomicU64::new(0),
        })
    }

    /// Weighted blend of headroom terms, each clamped to ≥ 0. Higher is
    /// better, range [0, 1].
    pub fn health_score(pool: &ConnectionPool) -> f64 {
        let util_headroom = (1.0 - pool.utilization()).max(0.0);
        let cpu_headroom = (1.0 - pool.cpu_usage()).max(0.0);
        let mem_headroom = (1.0 - pool.memory_norm()).max(0.0);
        let resp_headroom = (1.0 - pool.response_norm()).max(0.0);
        0.3 * util_headroom + 0.25 * cpu_headroom + 0.25 * mem_headroom + 0.2 * resp_headroom
    }

    pub fn classify(score: f64) -> HealthStatus {
        if score >= 0.8 {
            HealthStatus::Healthy
        } else if score >= 0.6 {
            HealthStatus::Degraded
        } else if score >= 0.4 {
            HealthStatus::Overloaded
        } else if score >= 0.2 {
            HealthStatus::Critical
        } else {
            HealthStatus::Unavailable
        }
    }

    pub fn check_once(&self) {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        for pool in self.manager.pools() {
            let score = Self::health_score(pool);
            let status = Self::classify(score);
            let previous = self.manager.pool_health(pool.pool_id());
            if previous != status {
                tracing::info!(
                    pool_id = %pool.pool_id(),
                    score,
                    previous = ?previous,
                    status = ?status,
                    "pool health changed"
                );
            }
            self.manager.set_pool_health(pool.pool_id(), status);

            let mut history = self.history.entry(pool.pool_id().to_string()).or_default();
            history.push_back(PoolHealthRecord {
                at_ms: now_ms(),
                score,
                status,
                current_connections: pool.current_connections(),
                utilization: pool.utilization(),
            });
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    pub fn history_for(&self, pool_id: &str) -> Vec<PoolHealthRecord> {
        self.history
            .get(pool_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn checks_total(&self) -> u64 {
        self.checks_total.load(Ordering::Relaxed)
    }

    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "pool health monitor started"
        );
        loop {
            self.check_once();
            tokio::time::sleep(self.interval).await;
        }
    }
}
