pub mod cache;
pub mod health;
pub mod operation;
pub mod service;

pub use cache::{CacheStore, MemoryCache};
pub use health::{
    CoordinationHealth, CoordinationHealthMonitor, GapThresholds, GapViolation, HealthAlert,
};
pub use operation::{
    AgentStateUpdate, CacheOp, CoordinatedOperation, CoordinationTiming, OperationStatus,
};
pub use service::{
    CoordinationConfig, CoordinationMetrics, MultiLayerCoordinationService, OperationRequest,
    OperationResult,
};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
