use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod connection;
pub mod emitter;
pub mod health;
pub mod manager;
pub mod pool;
pub mod strategy;
pub mod ws;

pub use connection::{ChannelConnection, Connection};
pub use emitter::{EmitterFactory, EmitterStats, EventEmitter, RetryPolicy};
pub use health::{HealthStatus, PoolHealthMonitor, PoolHealthRecord};
pub use manager::{ConnectionSession, LoadBalancedConnectionManager, ManagerStats};
pub use pool::{ConnectError, ConnectionPool, PoolConfig, PoolStats};
pub use strategy::{parse_strategy, Adaptive, BalanceStrategy, PoolCandidate};
pub use ws::WsConnection;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
