use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_ms;
use crate::operation::CoordinationTiming;

/// Stored events/alerts cap; trimmed to half when exceeded.
const STORE_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationHealth {
    Healthy,
    Warning,
    Critical,
}

/// Named gap thresholds (milliseconds) between coordination layers.
#[derive(Debug, Clone)]
pub struct GapThresholds {
    pub websocket_db_gap_ms: u64,
    pub agent_state_sync_ms: u64,
    pub transaction_boundary_ms: u64,
    pub cache_db_sync_ms: u64,
    pub user_context_isolation_ms: u64,
    pub rollback_notification_ms: u64,
}

impl Default for GapThresholds {
    fn default() -> Self {
        Self {
            websocket_db_gap_ms: 100,
            agent_state_sync_ms: 50,
            transaction_boundary_ms: 5,
            cache_db_sync_ms: 25,
            user_context_isolation_ms: 1,
            rollback_notification_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapViolation {
    pub name: String,
    pub gap_ms: u64,
    pub threshold_ms: u64,
    /// Gap exceeded twice its threshold.
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub id: Uuid,
    pub event_type: String,
    pub user_id: String,
    pub success: bool,
    pub at_ms: u64,
    pub overall_span_ms: Option<u64>,
    pub violations: Vec<GapViolation>,
    pub health: CoordinationHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAlert {
    pub id: Uuid,
    pub severity: CoordinationHealth,
    pub event_type: String,
    pub user_id: String,
    pub violations: Vec<GapViolation>,
    /// Human-readable assessment of what the affected user experiences.
    pub user_impact: String,
    pub at_ms: u64,
}

pub type AlertCallback = Box<dyn Fn(&HealthAlert) + Send + Sync>;

/// Measures inter-layer timing drift on every coordinated operation and
/// raises alerts when the named thresholds are violated. Fed by timing
/// snapshots from any layer; independent of the coordination service's own
/// control flow.
pub struct CoordinationHealthMonitor {
    thresholds: GapThresholds,
    events: Mutex<VecDeque<CoordinationEvent>>,
    alerts: Mutex<VecDeque<HealthAlert>>,
    callbacks: Mutex<Vec<AlertCallback>>,
    events_total: AtomicU64,
    warning_alerts_total: AtomicU64,
    critical_alerts_total: AtomicU64,
}

impl CoordinationHealthMonitor {
    pub fn new(thresholds: GapThresholds) -> Arc<Self> {
        Arc::new(Self {
            thresholds,
            events: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            events_total: AtomicU64::new(0),
            warning_alerts_total: AtomicU64::new(0),
            critical_alerts_total: AtomicU64::new(0),
        })
    }

    pub fn register_alert_callback(&self, cb: AlertCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cb);
    }

    /// Evaluate one operation's timing snapshot. Gaps are computed only for
    /// layer pairs that were actually stamped. Classification: CRITICAL when
    /// any gap exceeds 2x its threshold or at least two gaps are violated,
    /// WARNING on a single violation, HEALTHY otherwise.
    pub fn track_event(
        &self,
        event_type: &str,
        user_id: &str,
        timing: &CoordinationTiming,
        success: bool,
    ) -> CoordinationHealth {
        let violations = self.evaluate(timing);
        let critical_count = violations.iter().filter(|v| v.critical).count();
        let health = if critical_count > 0 || violations.len() >= 2 {
            CoordinationHealth::Critical
        } else if !violations.is_empty() {
            CoordinationHealth::Warning
        } else {
            CoordinationHealth::Healthy
        };

        let event = CoordinationEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            success,
            at_ms: now_ms(),
            overall_span_ms: timing.overall_span_ms(),
            violations: violations.clone(),
            health,
        };

        self.events_total.fetch_add(1, Ordering::Relaxed);
        push_bounded(&self.events, event);

        if health != CoordinationHealth::Healthy {
            let alert = HealthAlert {
                id: Uuid::new_v4(),
                severity: health,
                event_type: event_type.to_string(),
                user_id: user_id.to_string(),
                user_impact: user_impact(health, &violations),
                violations,
                at_ms: now_ms(),
            };
            match health {
                CoordinationHealth::Critical => {
                    self.critical_alerts_total.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        event_type,
                        user_id,
                        impact = %alert.user_impact,
                        "critical coordination drift"
                    );
                }
                _ => {
                    self.warning_alerts_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(event_type, user_id, impact = %alert.user_impact, "coordination drift");
                }
            }
            self.notify(&alert);
            push_bounded(&self.alerts, alert);
        }

        health
    }

    fn evaluate(&self, timing: &CoordinationTiming) -> Vec<GapViolation> {
        let mut violations = Vec::new();
        let mut check = |name: &str, gap_ms: u64, threshold_ms: u64| {
            if gap_ms > threshold_ms {
                violations.push(GapViolation {
                    name: name.to_string(),
                    gap_ms,
                    threshold_ms,
                    critical: gap_ms > 2 * threshold_ms,
                });
            }
        };

        if let (Some(db), Some(ws)) = (timing.database_ms, timing.websocket_ms) {
            check(
                "websocket_db_gap",
                ws.saturating_sub(db),
                self.thresholds.websocket_db_gap_ms,
            );
        }
        if let (Some(db), Some(agent)) = (timing.database_ms, timing.agent_ms) {
            check(
                "agent_state_sync",
                agent.abs_diff(db),
                self.thresholds.agent_state_sync_ms,
            );
        }
        if let (Some(db), Some(cache)) = (timing.database_ms, timing.cache_ms) {
            check(
                "cache_db_sync",
                cache.abs_diff(db),
                self.thresholds.cache_db_sync_ms,
            );
        }
        if let (Some(open), Some(db)) = (timing.transaction_open_ms, timing.database_ms) {
            check(
                "transaction_boundary",
                db.saturating_sub(open),
                self.thresholds.transaction_boundary_ms,
            );
        }
        if let Some(user_ctx) = timing.user_context_ms {
            // Max spread of every stamped layer against the user-context stamp.
            let spread = [
                timing.database_ms,
                timing.agent_ms,
                timing.cache_ms,
                timing.websocket_ms,
            ]
            .into_iter()
            .flatten()
            .map(|t| t.abs_diff(user_ctx))
            .max();
            if let Some(spread) = spread {
                check(
                    "user_context_isolation",
                    spread,
                    self.thresholds.user_context_isolation_ms,
                );
            }
        }
        if let (Some(failed), Some(notified)) = (timing.failure_ms, timing.rollback_notified_ms) {
            check(
                "rollback_notification",
                notified.saturating_sub(failed),
                self.thresholds.rollback_notification_ms,
            );
        }

        violations
    }

    fn notify(&self, alert: &HealthAlert) {
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for cb in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| cb(alert))).is_err() {
                tracing::warn!(alert_id = %alert.id, "alert callback panicked");
            }
        }
    }

    /// `100 - 50*critical_ratio - 20*warning_ratio` over the last `window`
    /// events, clamped to [0, 100]. An empty window scores 100.
    pub fn health_score(&self, window: usize) -> f64 {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let recent: Vec<&CoordinationEvent> = events.iter().rev().take(window).collect();
        if recent.is_empty() {
            return 100.0;
        }
        let n = recent.len() as f64;
        let critical = recent
            .iter()
            .filter(|e| e.health == CoordinationHealth::Critical)
            .count() as f64;
        let warning = recent
            .iter()
            .filter(|e| e.health == CoordinationHealth::Warning)
            .count() as f64;
        (100.0 - 50.0 * (critical / n) - 20.0 * (warning / n)).clamp(0.0, 100.0)
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<HealthAlert> {
        let alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn stored_events(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn push_bounded<T>(store: &Mutex<VecDeque<T>>, item: T) {
    let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
    store.push_back(item);
    if store.len() > STORE_LIMIT {
        let keep_from = store.len() - STORE_LIMIT / 2;
        store.drain(..keep_from);
    }
}

fn user_impact(health: CoordinationHealth, violations: &[GapViolation]) -> String {
    let worst = violations
        .iter()
        .max_by_key(|v| v.gap_ms.saturating_sub(v.threshold_ms))
        .map(|v| v.name.as_str())
        .unwrap_or("unknown");
    match health {
        CoordinationHealth::Critical => format!(
            "Users may see stale or out-of-order updates ({worst} drift); immediate attention required"
        ),
        CoordinationHealth::Warning => {
            format!("Users may notice slightly delayed updates ({worst} drift)")
        }
        CoordinationHealth::Healthy => "No user impact".to_string(),
    }
}
