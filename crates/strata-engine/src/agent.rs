use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use strata_common::ExecutionContext;

/// Lifecycle state of one agent execution, as tracked by the agent layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Progress reported by a running agent. The engine forwards each signal to
/// the user's emitter in arrival order.
#[derive(Debug, Clone)]
pub enum AgentSignal {
    Thinking { content: String },
    ToolStarted { tool: String },
    ToolCompleted { tool: String, result: Value },
}

/// One running agent. The engine owns the handle for the duration of a
/// single execution.
#[async_trait]
pub trait AgentHandle: Send {
    /// Run to completion, reporting progress through `signals`. The result
    /// payload becomes the `agent_completed` event data.
    async fn run(
        &mut self,
        input: Value,
        signals: mpsc::UnboundedSender<AgentSignal>,
    ) -> Result<Value>;
}

/// Creates agent handles by name. The reasoning layer behind this seam is
/// out of scope for the core.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, agent_name: &str, ctx: &ExecutionContext) -> Result<Box<dyn AgentHandle>>;
}

/// Agent-state bookkeeping owned by the agent layer; the coordination
/// service drives it during coordinated operations.
#[async_trait]
pub trait AgentStateTracker: Send + Sync {
    async fn update_execution_state(&self, execution_id: Uuid, state: AgentState) -> Result<()>;
}
