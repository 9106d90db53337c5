use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use strata_common::{ActiveRun, CoreError, ExecutionContext, RunRecord};
use strata_connect::EventEmitter;

use crate::agent::{AgentFactory, AgentSignal};
use crate::now_ms;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Simultaneous runs allowed on one engine.
    pub concurrency_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
        }
    }
}

/// One unit of work submitted to an engine. The identifiers must match the
/// engine's own context; a mismatch is a validation failure, never silently
/// skipped.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub agent_name: String,
    pub user_id: String,
    pub thread_id: String,
    pub run_id: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub record: RunRecord,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub executions_total: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub avg_duration_ms: f64,
    pub active_runs: usize,
}

/// Per-user execution engine: runs agents against exactly one context,
/// emitting the lifecycle events through the user's emitter. Errors are
/// per-run; the engine stays usable after a failed or panicked agent.
pub struct ExecutionEngine {
    context: Arc<ExecutionContext>,
    agent_factory: Arc<dyn AgentFactory>,
    emitter: Arc<EventEmitter>,
    concurrency_limit: usize,
    active: AtomicBool,
    last_activity_ms: AtomicU64,
    active_runs: Mutex<HashMap<Uuid, ActiveRun>>,
    run_history: Mutex<Vec<RunRecord>>,
    executions_total: AtomicU64,
    succeeded_total: AtomicU64,
    failed_total: AtomicU64,
    avg_duration_ms: Mutex<f64>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("concurrency_limit", &self.concurrency_limit)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    pub fn new(
        context: Arc<ExecutionContext>,
        agent_factory: Arc<dyn AgentFactory>,
        emitter: Arc<EventEmitter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            context,
            agent_factory,
            emitter,
            concurrency_limit: config.concurrency_limit,
            active: AtomicBool::new(true),
            last_activity_ms: AtomicU64::new(now_ms()),
            active_runs: Mutex::new(HashMap::new()),
            run_history: Mutex::new(Vec::new()),
            executions_total: AtomicU64::new(0),
            succeeded_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            avg_duration_ms: Mutex::new(0.0),
        }
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, CoreError> {
        if !self.is_active() || self.context.is_closed() {
            return Err(CoreError::ContextClosed);
        }
        self.validate(&request)?;
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);

        let execution_id = Uuid::new_v4();
        {
            let mut active = self.active_runs.lock().unwrap_or_else(|e| e.into_inner());
            if active.len() >= self.concurrency_limit {
                return Err(CoreError::Capacity {
                    active: active.len(),
                    limit: self.concurrency_limit,
                });
            }
            active.insert(
                execution_id,
                ActiveRun {
                    execution_id,
                    agent_name: request.agent_name.clone(),
                    started_at_ms: now_ms(),
                },
            );
        }

        if let Err(e) = self.context.record_run_start(execution_id, &request.agent_name) {
            self.release_slot(execution_id);
            return Err(e);
        }

        let started = Instant::now();
        let result = self.run_agent(execution_id, &request).await;
        Ok(self.finish(execution_id, &request, started, result).await)
    }

    /// Every incoming execution must carry the identifiers of this engine's
    /// context. Checked before any side effect.
    fn validate(&self, request: &ExecutionRequest) -> Result<(), CoreError> {
        if request.user_id != self.context.user_id {
            return Err(CoreError::validation(
                self.context.user_id.clone(),
                request.user_id.clone(),
            ));
        }
        if request.thread_id != self.context.thread_id {
            return Err(CoreError::validation(
                self.context.thread_id.clone(),
                request.thread_id.clone(),
            ));
        }
        if request.run_id != self.context.run_id {
            return Err(CoreError::validation(
                self.context.run_id.clone(),
                request.run_id.clone(),
            ));
        }
        Ok(())
    }

    async fn run_agent(
        &self,
        execution_id: Uuid,
        request: &ExecutionRequest,
    ) -> Result<Value, String> {
        self.emit_lossy(
            self.emitter.agent_started(json!({
                "execution_id": execution_id,
                "agent": request.agent_name,
                "run_id": request.run_id,
            }))
            .await,
        );

        let mut handle = self
            .agent_factory
            .create(&request.agent_name, &self.context)
            .await
            .map_err(|e| format!("agent '{}' creation failed: {e}", request.agent_name))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<AgentSignal>();
        let input = request.input.clone();
        let agent_task = tokio::spawn(async move { handle.run(input, tx).await });

        // Forward progress in arrival order; the channel closes when the
        // agent finishes and drops its sender.
        while let Some(signal) = rx.recv().await {
            let sent = match signal {
                AgentSignal::Thinking { content } => {
                    self.emitter
                        .agent_thinking(json!({
                            "execution_id": execution_id,
                            "content": content,
                        }))
                        .await
                }
                AgentSignal::ToolStarted { tool } => {
                    self.emitter
                        .tool_executing(json!({
                            "execution_id": execution_id,
                            "tool": tool,
                        }))
                        .await
                }
                AgentSignal::ToolCompleted { tool, result } => {
                    self.emitter
                        .tool_completed(json!({
                            "execution_id": execution_id,
                            "tool": tool,
                            "result": result,
                        }))
                        .await
                }
            };
            self.emit_lossy(sent);
        }

        match agent_task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(join_err) if join_err.is_panic() => Err("agent panicked".to_string()),
            Err(_) => Err("agent task cancelled".to_string()),
        }
    }

    async fn finish(
        &self,
        execution_id: Uuid,
        request: &ExecutionRequest,
        started: Instant,
        result: Result<Value, String>,
    ) -> ExecutionOutcome {
        self.release_slot(execution_id);
        let duration_ms = started.elapsed().as_millis() as u64;

        let (success, error, payload) = match result {
            Ok(value) => {
                self.emit_lossy(
                    self.emitter
                        .agent_completed(json!({
                            "execution_id": execution_id,
                            "duration_ms": duration_ms,
                            "result": value,
                        }))
                        .await,
                );
                (true, None, Some(value))
            }
            Err(message) => {
                let _ = self
                    .emitter
                    .emit(
                        "agent_error",
                        json!({
                            "execution_id": execution_id,
                            "agent": request.agent_name,
                            "error": message,
                            "duration_ms": duration_ms,
                        }),
                    )
                    .await;
                (false, Some(message), None)
            }
        };

        let record = RunRecord {
            execution_id,
            agent_name: request.agent_name.clone(),
            success,
            duration_ms,
            error,
            finished_at_ms: now_ms(),
        };

        self.run_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        if let Err(e) = self.context.record_run_end(record.clone()) {
            tracing::warn!(
                user_id = %self.context.user_id,
                execution_id = %execution_id,
                error = %e,
                "context closed before run record landed"
            );
        }

        self.executions_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_total.fetch_add(1, Ordering::Relaxed);
        }
        {
            let n = self.executions_total.load(Ordering::Relaxed) as f64;
            let mut avg = self.avg_duration_ms.lock().unwrap_or_else(|e| e.into_inner());
            *avg += (duration_ms as f64 - *avg) / n;
        }

        ExecutionOutcome {
            execution_id,
            record,
            result: payload,
        }
    }

    fn release_slot(&self, execution_id: Uuid) {
        self.active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&execution_id);
    }

    /// Delivery failures of lifecycle events are recorded by the emitter;
    /// they do not abort the run itself.
    fn emit_lossy(&self, result: Result<(), CoreError>) {
        if let Err(e) = result {
            tracing::warn!(user_id = %self.context.user_id, error = %e, "lifecycle event not delivered");
        }
    }

    pub fn active_run_count(&self) -> usize {
        self.active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn run_history(&self) -> Vec<RunRecord> {
        self.run_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            executions_total: self.executions_total.load(Ordering::Relaxed),
            succeeded_total: self.succeeded_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            avg_duration_ms: *self.avg_duration_ms.lock().unwrap_or_else(|e| e.into_inner()),
            active_runs: self.active_run_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentFactory, AgentHandle, AgentState};
    use async_trait::async_trait;
    use std::time::Duration;
    use strata_connect::{ChannelConnection, ConnectionPool, EmitterFactory, LoadBalancedConnectionManager, PoolConfig};
    use strata_store::MemoryStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct ScriptedAgent {
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl AgentHandle for ScriptedAgent {
        async fn run(
            &mut self,
            _input: Value,
            signals: mpsc::UnboundedSender<AgentSignal>,
        ) -> anyhow::Result<Value> {
            let _ = signals.send(AgentSignal::Thinking {
                content: "planning".to_string(),
            });
            let _ = signals.send(AgentSignal::ToolStarted {
                tool: "search".to_string(),
            });
            let _ = signals.send(AgentSignal::ToolCompleted {
                tool: "search".to_string(),
                result: json!({"hits": 3}),
            });
            if self.panic {
                panic!("scripted panic");
            }
            if self.fail {
                anyhow::bail!("scripted failure");
            }
            Ok(json!({"answer": 42}))
        }
    }

    struct ScriptedFactory {
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl AgentFactory for ScriptedFactory {
        async fn create(
            &self,
            _agent_name: &str,
            _ctx: &ExecutionContext,
        ) -> anyhow::Result<Box<dyn AgentHandle>> {
            Ok(Box::new(ScriptedAgent {
                fail: self.fail,
                panic: self.panic,
            }))
        }
    }

    /// A long-running agent used to pin the engine at its concurrency limit.
    struct SlowAgent;

    #[async_trait]
    impl AgentHandle for SlowAgent {
        async fn run(
            &mut self,
            _input: Value,
            _signals: mpsc::UnboundedSender<AgentSignal>,
        ) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    struct SlowFactory;

    #[async_trait]
    impl AgentFactory for SlowFactory {
        async fn create(
            &self,
            _agent_name: &str,
            _ctx: &ExecutionContext,
        ) -> anyhow::Result<Box<dyn AgentHandle>> {
            Ok(Box::new(SlowAgent))
        }
    }

    fn make_engine(
        factory: Arc<dyn AgentFactory>,
    ) -> (Arc<ExecutionEngine>, UnboundedReceiver<Value>) {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(ExecutionContext::new(
            "u1",
            "t1",
            "r1",
            Uuid::new_v4(),
            store.session() as Arc<dyn strata_common::StorageSession>,
        ));
        let pool = ConnectionPool::new("p0", PoolConfig::default());
        let manager = LoadBalancedConnectionManager::new(vec![pool]);
        let (conn, rx) = ChannelConnection::pair("c0");
        manager.route_connection(conn, "u1", None).expect("route");
        let emitter = EmitterFactory::new(manager).emitter_for("u1");
        (
            Arc::new(ExecutionEngine::new(
                ctx,
                factory,
                emitter,
                EngineConfig::default(),
            )),
            rx,
        )
    }

    fn make_request() -> ExecutionRequest {
        ExecutionRequest {
            agent_name: "planner".to_string(),
            user_id: "u1".to_string(),
            thread_id: "t1".to_string(),
            run_id: "r1".to_string(),
            input: json!({"question": "hi"}),
        }
    }

    #[tokio::test]
    async fn test_successful_run_emits_ordered_lifecycle() {
        let (engine, mut rx) = make_engine(Arc::new(ScriptedFactory {
            fail: false,
            panic: false,
        }));

        let outcome = engine.execute(make_request()).await.expect("execute");
        assert!(outcome.record.success);
        assert_eq!(outcome.result, Some(json!({"answer": 42})));

        let types: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|v| v["type"].as_str().expect("type").to_string())
            .collect();
        assert_eq!(
            types,
            vec![
                "agent_started",
                "agent_thinking",
                "tool_executing",
                "tool_completed",
                "agent_completed"
            ]
        );

        let stats = engine.stats();
        assert_eq!(stats.executions_total, 1);
        assert_eq!(stats.succeeded_total, 1);
        assert_eq!(engine.active_run_count(), 0);
    }

    #[tokio::test]
    async fn test_user_mismatch_is_fatal_before_side_effects() {
        let (engine, mut rx) = make_engine(Arc::new(ScriptedFactory {
            fail: false,
            panic: false,
        }));

        let mut request = make_request();
        request.user_id = "intruder".to_string();
        let err = engine.execute(request).await.expect_err("must fail");
        assert!(matches!(err, CoreError::Validation { .. }));

        // No event was emitted and nothing was recorded.
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.stats().executions_total, 0);
        assert!(engine.context().run_history().expect("history").is_empty());
    }

    #[tokio::test]
    async fn test_agent_error_keeps_engine_usable() {
        let (engine, mut rx) = make_engine(Arc::new(ScriptedFactory {
            fail: true,
            panic: false,
        }));

        let outcome = engine.execute(make_request()).await.expect("execute");
        assert!(!outcome.record.success);
        assert_eq!(
            outcome.record.error.as_deref(),
            Some("scripted failure")
        );

        let types: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|v| v["type"].as_str().expect("type").to_string())
            .collect();
        assert_eq!(types.last().map(String::as_str), Some("agent_error"));

        // Engine is still active and accepts new work.
        assert!(engine.is_active());
        assert_eq!(engine.active_run_count(), 0);
    }

    #[tokio::test]
    async fn test_agent_panic_becomes_failed_record() {
        let (engine, mut rx) = make_engine(Arc::new(ScriptedFactory {
            fail: false,
            panic: true,
        }));

        let outcome = engine.execute(make_request()).await.expect("execute");
        assert!(!outcome.record.success);
        assert_eq!(outcome.record.error.as_deref(), Some("agent panicked"));

        let types: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|v| v["type"].as_str().expect("type").to_string())
            .collect();
        assert!(types.contains(&"agent_error".to_string()));
        assert_eq!(engine.stats().failed_total, 1);
    }

    #[tokio::test]
    async fn test_capacity_limit_rejects_fourth_run() {
        let (engine, _rx) = make_engine(Arc::new(SlowFactory));

        let mut pinned = Vec::new();
        for _ in 0..3 {
            let engine = engine.clone();
            pinned.push(tokio::spawn(async move {
                let _ = engine.execute(make_request()).await;
            }));
        }
        // Let the three slow runs claim their slots.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.active_run_count(), 3);

        let err = engine.execute(make_request()).await.expect_err("at capacity");
        assert!(matches!(err, CoreError::Capacity { active: 3, limit: 3 }));

        for task in pinned {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_deactivated_engine_rejects_work() {
        let (engine, _rx) = make_engine(Arc::new(ScriptedFactory {
            fail: false,
            panic: false,
        }));
        engine.deactivate();
        let err = engine.execute(make_request()).await.expect_err("inactive");
        assert!(matches!(err, CoreError::ContextClosed));
    }

    #[test]
    fn test_agent_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(AgentState::Running).expect("serialize"),
            json!("running")
        );
    }
}
