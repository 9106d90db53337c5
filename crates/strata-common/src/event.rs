use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The five lifecycle events with guaranteed ordered, retried delivery.
pub const CRITICAL_EVENTS: [&str; 5] = [
    "agent_started",
    "agent_thinking",
    "tool_executing",
    "tool_completed",
    "agent_completed",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    AgentStarted,
    AgentThinking,
    ToolExecuting,
    ToolCompleted,
    AgentCompleted,
    AgentError,
    OperationRollback,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::AgentStarted => "agent_started",
            EventType::AgentThinking => "agent_thinking",
            EventType::ToolExecuting => "tool_executing",
            EventType::ToolCompleted => "tool_completed",
            EventType::AgentCompleted => "agent_completed",
            EventType::AgentError => "agent_error",
            EventType::OperationRollback => "operation_rollback",
            EventType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> EventType {
        match s {
            "agent_started" => EventType::AgentStarted,
            "agent_thinking" => EventType::AgentThinking,
            "tool_executing" => EventType::ToolExecuting,
            "tool_completed" => EventType::ToolCompleted,
            "agent_completed" => EventType::AgentCompleted,
            "agent_error" => EventType::AgentError,
            "operation_rollback" => EventType::OperationRollback,
            other => EventType::Other(other.to_string()),
        }
    }

    pub fn is_critical(&self) -> bool {
        CRITICAL_EVENTS.contains(&self.as_str())
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope for every outbound event. The payload is JSON all the way
/// down; the core never assumes more of the transport than that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_context: Option<Value>,
}

impl EventEnvelope {
    pub fn new(event_type: &EventType, data: Value) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            data,
            timestamp: Utc::now(),
            critical: event_type.is_critical(),
            user_context: None,
        }
    }

    pub fn with_user_context(mut self, user_context: Value) -> Self {
        self.user_context = Some(user_context);
        self
    }
}

/// Payload of the `operation_rollback` notification sent to the affected
/// user when a coordinated operation is rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackNotice {
    pub operation_id: Uuid,
    pub operation_name: String,
    pub operation_type: String,
    /// Technical cause, for client-side logging.
    pub error_message: String,
    /// User-facing description of what happened.
    pub user_message: String,
    pub timestamp: DateTime<Utc>,
    pub thread_id: String,
}

impl RollbackNotice {
    pub fn into_envelope(self) -> EventEnvelope {
        let data = serde_json::to_value(&self).unwrap_or(Value::Null);
        EventEnvelope::new(&EventType::OperationRollback, data)
    }
}
