use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::health::HealthStatus;
use crate::now_ms;
use crate::pool::{ConnectError, ConnectionPool, PoolStats};
use crate::strategy::{Adaptive, BalanceStrategy, PoolCandidate};

/// Sticky-routing record binding a session id to a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSession {
    pub pool_id: String,
    pub last_activity_ms: u64,
}

/// Routes inbound connections across pools using a pluggable strategy, with
/// sticky sessions and failover. Pools marked CRITICAL or UNAVAILABLE by the
/// health monitor are excluded from selection.
pub struct LoadBalancedConnectionManager {
    pools: Vec<Arc<ConnectionPool>>,
    strategy: Box<dyn BalanceStrategy>,
    sticky_enabled: bool,
    session_timeout_ms: u64,
    sessions: DashMap<String, ConnectionSession>,
    pool_health: DashMap<String, HealthStatus>,
    routed_total: AtomicU64,
    session_affinity_hits_total: AtomicU64,
    failovers_total: AtomicU64,
    route_failures_total: AtomicU64,
    sessions_expired_total: AtomicU64,
}

impl LoadBalancedConnectionManager {
    pub fn new(pools: Vec<Arc<ConnectionPool>>) -> Arc<Self> {
        Self::with_strategy(pools, Box::new(Adaptive))
    }

    pub fn with_strategy(
        pools: Vec<Arc<ConnectionPool>>,
        strategy: Box<dyn BalanceStrategy>,
    ) -> Arc<Self> {
        tracing::info!(
            strategy = strategy.name(),
            pools = pools.len(),
            "connection manager initialized"
        );
        let session_timeout_ms = std::env::var("STRATA_SESSION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s * 1000)
            .unwrap_or(3_600_000);
        let sticky_enabled = std::env::var("STRATA_STICKY_SESSIONS")
            .ok()
            .map(|v| v != "0" && v != "false")
            .unwrap_or(true);
        Arc::new(Self {
            pools,
            strategy,
            sticky_enabled,
            session_timeout_ms,
            sessions: DashMap::new(),
            pool_health: DashMap::new(),
            routed_total: AtomicU64::new(0),
            session_affinity_hits_total: AtomicU64::new(0),
            failovers_total: AtomicU64::new(0),
            route_failures_total: AtomicU64::new(0),
            sessions_expired_total: AtomicU64::new(0),
        })
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn pools(&self) -> &[Arc<ConnectionPool>] {
        &self.pools
    }

    pub fn pool_by_id(&self, pool_id: &str) -> Option<&Arc<ConnectionPool>> {
        self.pools.iter().find(|p| p.pool_id() == pool_id)
    }

    pub fn set_pool_health(&self, pool_id: &str, status: HealthStatus) {
        self.pool_health.insert(pool_id.to_string(), status);
    }

    pub fn pool_health(&self, pool_id: &str) -> HealthStatus {
        self.pool_health
            .get(pool_id)
            .map(|s| *s.value())
            .unwrap_or(HealthStatus::Healthy)
    }

    fn is_pool_available(&self, pool_id: &str) -> bool {
        !matches!(
            self.pool_health(pool_id),
            HealthStatus::Critical | HealthStatus::Unavailable
        )
    }

    /// Route a new connection to a pool. Order: sticky session, then the
    /// configured strategy, then failover across the remaining available
    /// pools.
    pub fn route_connection(
        &self,
        conn: Arc<dyn Connection>,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Arc<ConnectionPool>, ConnectError> {
        // Sticky session check
        if self.sticky_enabled {
            if let Some(sid) = session_id {
                if let Some(pool) = self.fresh_session_pool(sid) {
                    if pool.add_connection(conn.clone(), user_id).is_ok() {
                        self.session_affinity_hits_total
                            .fetch_add(1, Ordering::Relaxed);
                        self.touch_session(sid, pool.pool_id());
                        self.routed_total.fetch_add(1, Ordering::Relaxed);
                        return Ok(pool);
                    }
                    // Sticky pool rejected the add; fall through to selection.
                }
            }
        }

        let available: Vec<&Arc<ConnectionPool>> = self
            .pools
            .iter()
            .filter(|p| self.is_pool_available(p.pool_id()))
            .collect();

        if available.is_empty() {
            self.route_failures_total.fetch_add(1, Ordering::Relaxed);
            return Err(ConnectError::NoAvailablePools);
        }

        let candidates: Vec<PoolCandidate> = available
            .iter()
            .map(|p| PoolCandidate {
                pool_id: p.pool_id().to_string(),
                current_connections: p.current_connections(),
                utilization: p.utilization(),
                cpu_usage: p.cpu_usage(),
                memory_norm: p.memory_norm(),
                load_score: p.load_score(),
                weight: p.weight(),
            })
            .collect();

        let selected_idx = self.strategy.select(&candidates).unwrap_or(0);

        // Selected pool first, then failover over the rest in iteration order.
        let mut order: Vec<&Arc<ConnectionPool>> = Vec::with_capacity(available.len());
        order.push(available[selected_idx]);
        for (i, pool) in available.iter().enumerate() {
            if i != selected_idx {
                order.push(pool);
            }
        }

        for (attempt, pool) in order.iter().enumerate() {
            match pool.add_connection(conn.clone(), user_id) {
                Ok(()) => {
                    if attempt > 0 {
                        self.failovers_total.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            from = %candidates[selected_idx].pool_id,
                            to = %pool.pool_id(),
                            user_id,
                            "failover routed connection to alternate pool"
                        );
                    }
                    if let Some(sid) = session_id {
                        self.touch_session(sid, pool.pool_id());
                    }
                    self.routed_total.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(pool));
                }
                Err(e) => {
                    tracing::debug!(pool_id = %pool.pool_id(), error = %e, "pool rejected connection");
                }
            }
        }

        self.route_failures_total.fetch_add(1, Ordering::Relaxed);
        Err(ConnectError::NoAvailablePools)
    }

    fn fresh_session_pool(&self, session_id: &str) -> Option<Arc<ConnectionPool>> {
        let session = self.sessions.get(session_id)?;
        let age = now_ms().saturating_sub(session.last_activity_ms);
        if age > self.session_timeout_ms {
            let pool_id = session.pool_id.clone();
            drop(session);
            self.sessions.remove(session_id);
            self.sessions_expired_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session_id, pool_id = %pool_id, "sticky session expired");
            return None;
        }
        if !self.is_pool_available(&session.pool_id) {
            return None;
        }
        self.pool_by_id(&session.pool_id).cloned()
    }

    fn touch_session(&self, session_id: &str, pool_id: &str) {
        self.sessions.insert(
            session_id.to_string(),
            ConnectionSession {
                pool_id: pool_id.to_string(),
                last_activity_ms: now_ms(),
            },
        );
    }

    /// Non-expired session record, if one exists.
    pub fn session_for(&self, session_id: &str) -> Option<ConnectionSession> {
        let session = self.sessions.get(session_id)?;
        let age = now_ms().saturating_sub(session.last_activity_ms);
        if age > self.session_timeout_ms {
            return None;
        }
        Some(session.clone())
    }

    /// Current live connection for the user, searched across all pools.
    pub fn connection_for_user(&self, user_id: &str) -> Option<Arc<dyn Connection>> {
        self.pools
            .iter()
            .find_map(|p| p.connection_for_user(user_id))
    }

    /// Remove a connection from whichever pool holds it.
    pub fn remove_connection(&self, conn_id: &str) -> Option<Arc<dyn Connection>> {
        self.pools.iter().find_map(|p| p.remove_connection(conn_id))
    }

    /// Send one payload to the user's current connection, recording the
    /// outcome against the owning pool.
    pub async fn send_to_user(
        &self,
        user_id: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        for pool in &self.pools {
            if let Some(conn) = pool.connection_for_user(user_id) {
                let result = conn.send_json(payload).await;
                pool.record_send(conn.id(), result.is_ok());
                return result;
            }
        }
        Err(ConnectError::UserNotConnected {
            user_id: user_id.to_string(),
        }
        .into())
    }

    /// Evict sticky sessions past the timeout. Returns how many were removed.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| now.saturating_sub(e.value().last_activity_ms) > self.session_timeout_ms)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for sid in expired {
            self.sessions.remove(&sid);
            self.sessions_expired_total.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            strategy: self.strategy.name().to_string(),
            pools: self.pools.iter().map(|p| p.stats()).collect(),
            active_sessions: self.sessions.len(),
            routed_total: self.routed_total.load(Ordering::Relaxed),
            session_affinity_hits_total: self.session_affinity_hits_total.load(Ordering::Relaxed),
            failovers_total: self.failovers_total.load(Ordering::Relaxed),
            route_failures_total: self.route_failures_total.load(Ordering::Relaxed),
            sessions_expired_total: self.sessions_expired_total.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn backdate_session(&self, session_id: &str, age_ms: u64) {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.last_activity_ms = now_ms().saturating_sub(age_ms);
        }
    }
}

/// Periodic sweep for expired sticky sessions and dead connections.
pub async fn session_sweep_loop(manager: Arc<LoadBalancedConnectionManager>, interval: Duration) {
    tracing::info!(interval_secs = interval.as_secs(), "session sweep loop started");
    loop {
        tokio::time::sleep(interval).await;
        let expired = manager.cleanup_expired_sessions();
        let mut dropped = 0usize;
        for pool in manager.pools() {
            dropped += pool.sweep_disconnected();
        }
        if expired > 0 || dropped > 0 {
            tracing::info!(expired, dropped, "session sweep evicted stale state");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub strategy: String,
    pub pools: Vec<PoolStats>,
    pub active_sessions: usize,
    pub routed_total: u64,
    pub session_affinity_hits_total: u64,
    pub failovers_total: u64,
    pub route_failures_total: u64,
    pub sessions_expired_total: u64,
}
