use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::now_ms;

/// Gigabyte and second scales used to normalize the load-score inputs.
const MEMORY_NORM_BYTES: f64 = 1_073_741_824.0;
const RESPONSE_NORM_MS: f64 = 1_000.0;

/// Response-time smoothing factor for the exponential moving average.
const RESPONSE_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub enum ConnectError {
    /// The selected pool is at `max_connections`.
    PoolAtCapacity { pool_id: String, max: usize },
    /// Every available pool rejected the connection.
    NoAvailablePools,
    /// No live connection exists for the user.
    UserNotConnected { user_id: String },
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::PoolAtCapacity { pool_id, max } => {
                write!(f, "pool '{pool_id}' at capacity ({max})")
            }
            ConnectError::NoAvailablePools => write!(f, "no available pools"),
            ConnectError::UserNotConnected { user_id } => {
                write!(f, "no live connection for user '{user_id}'")
            }
        }
    }
}

impl std::error::Error for ConnectError {}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Relative capacity weight, consumed by the weighted_round_robin
    /// strategy. Equal-capacity pools keep the default.
    pub weight: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            weight: 1.0,
        }
    }
}

struct PoolEntry {
    conn: Arc<dyn Connection>,
    user_id: String,
    connected_at_ms: u64,
    last_activity_ms: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Default)]
struct Gauges {
    cpu_usage: f64,
    memory_bytes: u64,
    avg_response_ms: f64,
}

/// Bounded set of live connections with a per-user index and derived load
/// metrics. A connection belongs to at most one pool.
pub struct ConnectionPool {
    pool_id: String,
    config: PoolConfig,
    connections: DashMap<String, PoolEntry>,
    user_index: DashMap<String, Vec<String>>,
    gauges: RwLock<Gauges>,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("pool_id", &self.pool_id)
            .field("config", &self.config)
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(pool_id: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            pool_id: pool_id.into(),
            config,
            connections: DashMap::new(),
            user_index: DashMap::new(),
            gauges: RwLock::new(Gauges::default()),
            messages_sent_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        })
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn weight(&self) -> f64 {
        self.config.weight
    }

    pub fn add_connection(
        &self,
        conn: Arc<dyn Connection>,
        user_id: &str,
    ) -> Result<(), ConnectError> {
        if self.connections.len() >= self.config.max_connections {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return Err(ConnectError::PoolAtCapacity {
                pool_id: self.pool_id.clone(),
                max: self.config.max_connections,
            });
        }

        let conn_id = conn.id().to_string();
        let now = now_ms();
        self.connections.insert(
            conn_id.clone(),
            PoolEntry {
                conn,
                user_id: user_id.to_string(),
                connected_at_ms: now,
                last_activity_ms: AtomicU64::new(now),
                messages_sent: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            },
        );
        self.user_index
            .entry(user_id.to_string())
            .or_default()
            .push(conn_id);
        Ok(())
    }

    /// Exact inverse of [`add_connection`](Self::add_connection): removes the
    /// connection and leaves the user index without dangling entries.
    pub fn remove_connection(&self, conn_id: &str) -> Option<Arc<dyn Connection>> {
        let (_, entry) = self.connections.remove(conn_id)?;
        if let Some(mut ids) = self.user_index.get_mut(&entry.user_id) {
            ids.retain(|id| id != conn_id);
            let emptied = ids.is_empty();
            drop(ids);
            if emptied {
                self.user_index.remove(&entry.user_id);
            }
        }
        Some(entry.conn)
    }

    /// Most recently active live connection for the user, if any.
    pub fn connection_for_user(&self, user_id: &str) -> Option<Arc<dyn Connection>> {
        let ids = self.user_index.get(user_id)?.clone();
        let mut best: Option<(u64, Arc<dyn Connection>)> = None;
        for id in ids {
            if let Some(entry) = self.connections.get(&id) {
                if !entry.conn.is_connected() {
                    continue;
                }
                let activity = entry.last_activity_ms.load(Ordering::Relaxed);
                if best.as_ref().map(|(a, _)| activity >= *a).unwrap_or(true) {
                    best = Some((activity, entry.conn.clone()));
                }
            }
        }
        best.map(|(_, conn)| conn)
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.user_index.contains_key(user_id)
    }

    pub fn record_send(&self, conn_id: &str, ok: bool) {
        if let Some(entry) = self.connections.get(conn_id) {
            entry.last_activity_ms.store(now_ms(), Ordering::Relaxed);
            if ok {
                entry.messages_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                entry.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        if ok {
            self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn current_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn utilization(&self) -> f64 {
        if self.config.max_connections == 0 {
            return 1.0;
        }
        self.connections.len() as f64 / self.config.max_connections as f64
    }

    // Host-fed resource gauges.

    pub fn set_cpu_usage(&self, fraction: f64) {
        let mut g = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        g.cpu_usage = fraction.clamp(0.0, 1.0);
    }

    pub fn set_memory_usage(&self, bytes: u64) {
        let mut g = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        g.memory_bytes = bytes;
    }

    pub fn record_response_time(&self, ms: f64) {
        let mut g = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        if g.avg_response_ms == 0.0 {
            g.avg_response_ms = ms;
        } else {
            g.avg_response_ms = RESPONSE_EMA_ALPHA * ms + (1.0 - RESPONSE_EMA_ALPHA) * g.avg_response_ms;
        }
    }

    pub fn cpu_usage(&self) -> f64 {
        self.gauges.read().unwrap_or_else(|e| e.into_inner()).cpu_usage
    }

    /// Memory gauge normalized against 1 GiB, clamped to [0, 1].
    pub fn memory_norm(&self) -> f64 {
        let bytes = self.gauges.read().unwrap_or_else(|e| e.into_inner()).memory_bytes;
        (bytes as f64 / MEMORY_NORM_BYTES).clamp(0.0, 1.0)
    }

    /// Response-time gauge normalized against 1 s, clamped to [0, 1].
    pub fn response_norm(&self) -> f64 {
        let ms = self.gauges.read().unwrap_or_else(|e| e.into_inner()).avg_response_ms;
        (ms / RESPONSE_NORM_MS).clamp(0.0, 1.0)
    }

    /// Weighted blend of utilization, CPU, memory and response time.
    /// Lower is better.
    pub fn load_score(&self) -> f64 {
        0.4 * self.utilization()
            + 0.3 * self.cpu_usage()
            + 0.2 * self.memory_norm()
            + 0.1 * self.response_norm()
    }

    pub fn stats(&self) -> PoolStats {
        let g = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        PoolStats {
            pool_id: self.pool_id.clone(),
            current_connections: self.connections.len(),
            max_connections: self.config.max_connections,
            utilization: self.utilization(),
            cpu_usage: g.cpu_usage,
            memory_bytes: g.memory_bytes,
            avg_response_ms: g.avg_response_ms,
            load_score: 0.4 * self.utilization()
                + 0.3 * g.cpu_usage
                + 0.2 * (g.memory_bytes as f64 / MEMORY_NORM_BYTES).clamp(0.0, 1.0)
                + 0.1 * (g.avg_response_ms / RESPONSE_NORM_MS).clamp(0.0, 1.0),
            messages_sent_total: self.messages_sent_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }

    /// Drop connections whose transport reports disconnected. Returns how
    /// many were removed.
    pub fn sweep_disconnected(&self) -> usize {
        let dead: Vec<String> = self
            .connections
            .iter()
            .filter(|e| !e.value().conn.is_connected())
            .map(|e| e.key().clone())
            .collect();
        let count = dead.len();
        for id in dead {
            self.remove_connection(&id);
        }
        count
    }

    /// Age of the oldest connection, for diagnostics.
    pub fn oldest_connection_age_ms(&self) -> Option<u64> {
        let now = now_ms();
        self.connections
            .iter()
            .map(|e| now.saturating_sub(e.value().connected_at_ms))
            .max()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_id: String,
    pub current_connections: usize,
    pub max_connections: usize,
    pub utilization: f64,
    pub cpu_usage: f64,
    pub memory_bytes: u64,
    pub avg_response_ms: f64,
    pub load_score: f64,
    pub messages_sent_total: u64,
    pub errors_total: u64,
    pub rejected_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;

    fn make_pool(id: &str, max: usize) -> Arc<ConnectionPool> {
        ConnectionPool::new(
            id,
            PoolConfig {
                max_connections: max,
                weight: 1.0,
            },
        )
    }

    #[test]
    fn test_add_remove_keeps_indexes_consistent() {
        let pool = make_pool("p1", 10);
        let (c1, _rx1) = ChannelConnection::pair("c1");
        let (c2, _rx2) = ChannelConnection::pair("c2");
        pool.add_connection(c1, "u1").expect("add c1");
        pool.add_connection(c2, "u1").expect("add c2");
        assert_eq!(pool.current_connections(), 2);

        pool.remove_connection("c1");
        assert_eq!(pool.current_connections(), 1);
        assert!(pool.has_user("u1"));

        pool.remove_connection("c2");
        assert_eq!(pool.current_connections(), 0);
        assert!(!pool.has_user("u1"));
    }

    #[test]
    fn test_rejects_at_capacity() {
        let pool = make_pool("p1", 1);
        let (c1, _rx1) = ChannelConnection::pair("c1");
        let (c2, _rx2) = ChannelConnection::pair("c2");
        pool.add_connection(c1, "u1").expect("add c1");
        let err = pool.add_connection(c2, "u2").expect_err("should reject");
        assert!(matches!(err, ConnectError::PoolAtCapacity { .. }));
        assert_eq!(pool.stats().rejected_total, 1);
    }

    #[test]
    fn test_connection_for_user_skips_dead() {
        let pool = make_pool("p1", 10);
        let (c1, _rx1) = ChannelConnection::pair("c1");
        let (c2, _rx2) = ChannelConnection::pair("c2");
        pool.add_connection(c1.clone(), "u1").expect("add c1");
        pool.add_connection(c2, "u1").expect("add c2");

        c1.disconnect();
        let picked = pool.connection_for_user("u1").expect("live connection");
        assert_eq!(picked.id(), "c2");
    }

    #[test]
    fn test_load_score_blend() {
        let pool = make_pool("p1", 10);
        let (c1, _rx1) = ChannelConnection::pair("c1");
        pool.add_connection(c1, "u1").expect("add");
        pool.set_cpu_usage(0.5);
        pool.set_memory_usage(MEMORY_NORM_BYTES as u64 / 2);
        pool.record_response_time(500.0);

        // 0.4*0.1 + 0.3*0.5 + 0.2*0.5 + 0.1*0.5 = 0.34
        let score = pool.load_score();
        assert!((score - 0.34).abs() < 1e-9, "score={score}");
    }

    #[test]
    fn test_sweep_disconnected() {
        let pool = make_pool("p1", 10);
        let (c1, _rx1) = ChannelConnection::pair("c1");
        let (c2, _rx2) = ChannelConnection::pair("c2");
        pool.add_connection(c1.clone(), "u1").expect("add c1");
        pool.add_connection(c2, "u2").expect("add c2");

        c1.disconnect();
        assert_eq!(pool.sweep_disconnected(), 1);
        assert_eq!(pool.current_connections(), 1);
        assert!(!pool.has_user("u1"));
    }
}
