pub mod agent;
pub mod engine;
pub mod factory;
pub mod state_store;

pub use agent::{AgentFactory, AgentHandle, AgentSignal, AgentState, AgentStateTracker};
pub use engine::{EngineConfig, EngineStats, ExecutionEngine, ExecutionOutcome, ExecutionRequest};
pub use factory::{ExecutionEngineFactory, FactoryConfig, FactoryStats};
pub use state_store::{ExecutionStateStore, GlobalStats, StateStoreConfig, SystemHealth, UserStats};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
