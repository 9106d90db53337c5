use thiserror::Error;

/// Typed failure taxonomy for the coordination core.
///
/// Lower layers raise these directly; the coordination service is the only
/// place that converts a failure into compensating action (rollback) and a
/// user-facing notification. Nothing above it re-interprets raw causes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Context/user mismatch on a cross-boundary call. Fatal to the single
    /// call, never retried.
    #[error("user context mismatch: expected '{expected}', got '{actual}'")]
    Validation { expected: String, actual: String },

    /// A per-user or per-pool cap was hit. Surfaced to the caller, not
    /// retried internally.
    #[error("resource limit exceeded: {resource} at {limit}")]
    ResourceLimit { resource: String, limit: usize },

    /// Engine concurrency limit reached. The caller retries or queues; the
    /// engine never queues internally.
    #[error("capacity exceeded: {active} active runs at limit {limit}")]
    Capacity { active: usize, limit: usize },

    /// A phase of a coordinated operation failed. Rollback has already run
    /// by the time this is returned. Carries the original cause.
    #[error("coordinated operation '{operation}' failed in {phase} phase: {source}")]
    Coordination {
        operation: String,
        phase: &'static str,
        source: anyhow::Error,
    },

    /// Rollback itself failed. Logged as a system-integrity incident; the
    /// process continues.
    #[error("rollback of operation '{operation}' failed: {source}")]
    Rollback {
        operation: String,
        source: anyhow::Error,
    },

    /// A critical event exhausted its delivery retries.
    #[error("delivery of '{event_type}' to user '{user_id}' failed after {attempts} attempts")]
    Delivery {
        event_type: String,
        user_id: String,
        attempts: u32,
    },

    /// The execution context was already cleaned up.
    #[error("execution context is closed")]
    ContextClosed,
}

impl CoreError {
    pub fn validation(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::Validation {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
