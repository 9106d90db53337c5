use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::now_ms;
use crate::session::StorageSession;

/// Teardown work registered against a context, run exactly once on cleanup.
pub type CleanupCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveRun {
    pub execution_id: Uuid,
    pub agent_name: String,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub execution_id: Uuid,
    pub agent_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub finished_at_ms: u64,
}

#[derive(Default)]
struct ContextState {
    closed: bool,
    active_runs: HashMap<Uuid, ActiveRun>,
    run_history: Vec<RunRecord>,
    execution_metrics: HashMap<String, f64>,
    cleanup_callbacks: Vec<CleanupCallback>,
}

/// Per-request bundle of identifiers plus mutable per-request state.
///
/// Every collection is allocated fresh in [`ExecutionContext::new`] — two
/// contexts never share a mutable map instance, so state written through one
/// context is unreachable from any other. After [`cleanup`](Self::cleanup)
/// the context is terminal and every accessor returns
/// [`CoreError::ContextClosed`].
pub struct ExecutionContext {
    pub user_id: String,
    pub thread_id: String,
    pub run_id: String,
    pub request_id: Uuid,
    /// Optional sticky connection id, used in the isolation key when present.
    pub connection_id: Option<String>,
    pub session: Arc<dyn StorageSession>,
    state: Mutex<ContextState>,
}

impl ExecutionContext {
    pub fn new(
        user_id: impl Into<String>,
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        request_id: Uuid,
        session: Arc<dyn StorageSession>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            request_id,
            connection_id: None,
            session,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Registry key for engines and sessions: `user:connection`, falling
    /// back to `user:request` when no connection is attached.
    pub fn isolation_key(&self) -> String {
        match &self.connection_id {
            Some(conn) => format!("{}:{}", self.user_id, conn),
            None => format!("{}:{}", self.user_id, self.request_id),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ContextState> {
        // A poisoned lock means a callback panicked mid-cleanup; the state
        // itself is still consistent enough to read.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_state(&self) -> Result<std::sync::MutexGuard<'_, ContextState>, CoreError> {
        let guard = self.state();
        if guard.closed {
            return Err(CoreError::ContextClosed);
        }
        Ok(guard)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn add_cleanup_callback(&self, cb: CleanupCallback) -> Result<(), CoreError> {
        self.open_state()?.cleanup_callbacks.push(cb);
        Ok(())
    }

    pub fn record_run_start(&self, execution_id: Uuid, agent_name: &str) -> Result<(), CoreError> {
        self.open_state()?.active_runs.insert(
            execution_id,
            ActiveRun {
                execution_id,
                agent_name: agent_name.to_string(),
                started_at_ms: now_ms(),
            },
        );
        Ok(())
    }

    pub fn record_run_end(&self, record: RunRecord) -> Result<(), CoreError> {
        let mut state = self.open_state()?;
        state.active_runs.remove(&record.execution_id);
        state.run_history.push(record);
        Ok(())
    }

    pub fn set_metric(&self, name: &str, value: f64) -> Result<(), CoreError> {
        self.open_state()?
            .execution_metrics
            .insert(name.to_string(), value);
        Ok(())
    }

    pub fn active_run_count(&self) -> Result<usize, CoreError> {
        Ok(self.open_state()?.active_runs.len())
    }

    pub fn run_history(&self) -> Result<Vec<RunRecord>, CoreError> {
        Ok(self.open_state()?.run_history.clone())
    }

    pub fn metrics_snapshot(&self) -> Result<HashMap<String, f64>, CoreError> {
        Ok(self.open_state()?.execution_metrics.clone())
    }

    /// Run all cleanup callbacks exactly once, clear the per-request state
    /// and mark the context terminal. Idempotent: a second call is a no-op.
    /// Returns the number of callbacks that ran.
    pub fn cleanup(&self) -> usize {
        let callbacks = {
            let mut state = self.state();
            if state.closed {
                return 0;
            }
            state.closed = true;
            state.active_runs.clear();
            state.run_history.clear();
            state.execution_metrics.clear();
            std::mem::take(&mut state.cleanup_callbacks)
        };

        let count = callbacks.len();
        for cb in callbacks {
            if catch_unwind(AssertUnwindSafe(cb)).is_err() {
                tracing::warn!(
                    user_id = %self.user_id,
                    request_id = %self.request_id,
                    "cleanup callback panicked"
                );
            }
        }
        count
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("user_id", &self.user_id)
            .field("thread_id", &self.thread_id)
            .field("run_id", &self.run_id)
            .field("request_id", &self.request_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
