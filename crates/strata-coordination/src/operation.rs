use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use strata_engine::AgentState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Started,
    Database,
    AgentState,
    Cache,
    Websocket,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

/// One agent-state transition carried by a coordinated operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateUpdate {
    pub execution_id: Uuid,
    pub state: AgentState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum CacheOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

impl CacheOp {
    pub fn key(&self) -> &str {
        match self {
            CacheOp::Put { key, .. } => key,
            CacheOp::Delete { key } => key,
        }
    }
}

/// Wall-clock stamps taken as a coordinated operation crosses each layer.
/// Absent stamps mean the layer was not reached (or not part of the
/// operation).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CoordinationTiming {
    pub coordination_start_ms: u64,
    /// User context association validated.
    pub user_context_ms: Option<u64>,
    /// Storage session handed to the database operation.
    pub transaction_open_ms: Option<u64>,
    /// Database commit returned.
    pub database_ms: Option<u64>,
    pub agent_ms: Option<u64>,
    pub cache_ms: Option<u64>,
    pub websocket_ms: Option<u64>,
    /// First failure observed, if any.
    pub failure_ms: Option<u64>,
    /// Rollback notification delivered to the user.
    pub rollback_notified_ms: Option<u64>,
}

impl CoordinationTiming {
    pub fn started(now_ms: u64) -> Self {
        Self {
            coordination_start_ms: now_ms,
            ..Self::default()
        }
    }

    /// Total span across all stamped layers.
    pub fn overall_span_ms(&self) -> Option<u64> {
        let stamps: Vec<u64> = [
            Some(self.coordination_start_ms),
            self.user_context_ms,
            self.transaction_open_ms,
            self.database_ms,
            self.agent_ms,
            self.cache_ms,
            self.websocket_ms,
        ]
        .into_iter()
        .flatten()
        .collect();
        let max = stamps.iter().max()?;
        let min = stamps.iter().min()?;
        Some(max - min)
    }
}

/// One cross-layer unit of work. Created at operation start, mutated only by
/// the owning coordination call, discarded after completion or rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatedOperation {
    pub operation_id: Uuid,
    pub name: String,
    pub operation_type: String,
    pub user_id: String,
    pub thread_id: String,
    pub status: OperationStatus,
    pub created_at_ms: u64,
    pub metadata: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_span() {
        let mut timing = CoordinationTiming::started(1_000);
        timing.database_ms = Some(1_040);
        timing.websocket_ms = Some(1_100);
        assert_eq!(timing.overall_span_ms(), Some(100));
    }

    #[test]
    fn test_cache_op_serializes_tagged() {
        let op = CacheOp::Put {
            key: "k".to_string(),
            value: serde_json::json!(1),
        };
        let v = serde_json::to_value(&op).expect("serialize");
        assert_eq!(v["op"], "put");
        assert_eq!(v["key"], "k");
    }
}
