use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use strata_common::{CoreError, DbOp, EventEnvelope, RollbackNotice, StorageSession};
use strata_connect::EmitterFactory;
use strata_engine::{AgentState, AgentStateTracker};

use crate::cache::CacheStore;
use crate::health::CoordinationHealthMonitor;
use crate::now_ms;
use crate::operation::{
    AgentStateUpdate, CacheOp, CoordinatedOperation, CoordinationTiming, OperationStatus,
};

#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// Operations older than this are evicted by the stale sweep.
    pub max_operation_age: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_operation_age: Duration::from_secs(300),
        }
    }
}

/// One coordinated unit of work, as submitted by a caller. The database
/// closure and session are consumed by the execution.
pub struct OperationRequest {
    pub name: String,
    pub operation_type: String,
    pub user_id: String,
    pub thread_id: String,
    pub session: Option<Arc<dyn StorageSession>>,
    pub db_op: Option<DbOp>,
    pub events: Vec<EventEnvelope>,
    pub agent_updates: Vec<AgentStateUpdate>,
    pub cache_ops: Vec<CacheOp>,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug)]
pub struct OperationResult {
    pub operation_id: Uuid,
    pub db_result: Option<Value>,
    pub timing: CoordinationTiming,
}

pub type StartHook = Box<dyn Fn(&CoordinatedOperation) + Send + Sync>;

/// Ties a database operation, a batch of WebSocket events, agent-state
/// transitions and cache writes into one logical unit with rollback.
///
/// Phase order: Started → Database → AgentState → Cache → Websocket →
/// Completed. With a coordinated session, outbound events are bound to the
/// commit and delivered strictly after it; the immediate-send fallback for
/// plain sessions is a degraded mode counted in
/// `deferred_send_unsupported_total`.
pub struct MultiLayerCoordinationService {
    emitters: Arc<EmitterFactory>,
    agent_tracker: Arc<dyn AgentStateTracker>,
    cache: Arc<dyn CacheStore>,
    health: Arc<CoordinationHealthMonitor>,
    config: CoordinationConfig,
    operations: DashMap<Uuid, CoordinatedOperation>,
    start_hooks: Mutex<Vec<StartHook>>,
    started_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    rollbacks_handled_total: AtomicU64,
    rollback_failures_total: AtomicU64,
    deferred_send_unsupported_total: AtomicU64,
    stale_evicted_total: AtomicU64,
    total_time_ms: AtomicU64,
}

impl MultiLayerCoordinationService {
    pub fn new(
        emitters: Arc<EmitterFactory>,
        agent_tracker: Arc<dyn AgentStateTracker>,
        cache: Arc<dyn CacheStore>,
        health: Arc<CoordinationHealthMonitor>,
        config: CoordinationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            emitters,
            agent_tracker,
            cache,
            health,
            config,
            operations: DashMap::new(),
            start_hooks: Mutex::new(Vec::new()),
            started_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            rollbacks_handled_total: AtomicU64::new(0),
            rollback_failures_total: AtomicU64::new(0),
            deferred_send_unsupported_total: AtomicU64::new(0),
            stale_evicted_total: AtomicU64::new(0),
            total_time_ms: AtomicU64::new(0),
        })
    }

    /// Hook invoked when an operation is registered, before any phase runs.
    pub fn register_start_hook(&self, hook: StartHook) {
        self.start_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub async fn execute(&self, request: OperationRequest) -> Result<OperationResult, CoreError> {
        let operation_id = Uuid::new_v4();
        let mut timing = CoordinationTiming::started(now_ms());

        let operation = CoordinatedOperation {
            operation_id,
            name: request.name.clone(),
            operation_type: request.operation_type.clone(),
            user_id: request.user_id.clone(),
            thread_id: request.thread_id.clone(),
            status: OperationStatus::Started,
            created_at_ms: timing.coordination_start_ms,
            metadata: request.metadata.clone(),
        };
        self.operations.insert(operation_id, operation.clone());
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.notify_start(&operation);

        let OperationRequest {
            name,
            user_id,
            thread_id,
            session,
            db_op,
            events,
            agent_updates,
            cache_ops,
            ..
        } = request;

        let mut applied_agents: Vec<Uuid> = Vec::new();
        let mut applied_cache: Vec<(CacheOp, Option<Value>)> = Vec::new();

        let outcome = self
            .run_phases(
                operation_id,
                &user_id,
                session.clone(),
                db_op,
                events,
                &agent_updates,
                &cache_ops,
                &mut timing,
                &mut applied_agents,
                &mut applied_cache,
            )
            .await;

        match outcome {
            Ok(db_result) => {
                self.set_status(operation_id, OperationStatus::Completed);
                self.health.track_event(&name, &user_id, &timing, true);
                self.completed_total.fetch_add(1, Ordering::Relaxed);
                self.total_time_ms.fetch_add(
                    timing.overall_span_ms().unwrap_or(0),
                    Ordering::Relaxed,
                );
                self.operations.remove(&operation_id);
                tracing::debug!(operation_id = %operation_id, name = %name, "coordinated operation completed");
                Ok(OperationResult {
                    operation_id,
                    db_result,
                    timing,
                })
            }
            Err((phase, cause)) => {
                self.handle_failure(
                    operation_id,
                    &name,
                    &user_id,
                    &thread_id,
                    phase,
                    &cause,
                    session,
                    &applied_agents,
                    &applied_cache,
                    &mut timing,
                )
                .await;
                Err(CoreError::Coordination {
                    operation: name,
                    phase,
                    source: cause,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        operation_id: Uuid,
        user_id: &str,
        session: Option<Arc<dyn StorageSession>>,
        db_op: Option<DbOp>,
        events: Vec<EventEnvelope>,
        agent_updates: &[AgentStateUpdate],
        cache_ops: &[CacheOp],
        timing: &mut CoordinationTiming,
        applied_agents: &mut Vec<Uuid>,
        applied_cache: &mut Vec<(CacheOp, Option<Value>)>,
    ) -> Result<Option<Value>, (&'static str, anyhow::Error)> {
        // Database phase. A coordinated session takes custody of the events
        // here so they cannot be observed before the commit.
        let mut events_deferred = false;
        let mut db_result = None;
        if let Some(session) = session.clone() {
            self.set_status(operation_id, OperationStatus::Database);
            if let Some(coordinated) = session.as_coordinated() {
                for event in &events {
                    coordinated.defer_event(user_id, event.clone());
                }
                events_deferred = true;
            } else if !events.is_empty() {
                self.deferred_send_unsupported_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    operation_id = %operation_id,
                    "session cannot defer events; falling back to immediate send"
                );
            }

            timing.transaction_open_ms = Some(now_ms());
            if let Some(op) = db_op {
                db_result = Some(op(session.clone()).await.map_err(|e| ("database", e))?);
            }
            session.commit().await.map_err(|e| ("database", e))?;
            timing.database_ms = Some(now_ms());
        }

        // Agent-state phase, sequential against the tracker.
        if !agent_updates.is_empty() {
            self.set_status(operation_id, OperationStatus::AgentState);
            for update in agent_updates {
                self.agent_tracker
                    .update_execution_state(update.execution_id, update.state)
                    .await
                    .map_err(|e| ("agent_state", e))?;
                applied_agents.push(update.execution_id);
            }
            timing.agent_ms = Some(now_ms());
        }

        // Cache phase. Prior values are captured for best-effort reversal.
        if !cache_ops.is_empty() {
            self.set_status(operation_id, OperationStatus::Cache);
            for op in cache_ops {
                let prior = self
                    .cache
                    .get(op.key())
                    .await
                    .map_err(|e| ("cache", e))?;
                match op {
                    CacheOp::Put { key, value } => {
                        self.cache
                            .put(key, value.clone())
                            .await
                            .map_err(|e| ("cache", e))?;
                    }
                    CacheOp::Delete { key } => {
                        self.cache.delete(key).await.map_err(|e| ("cache", e))?;
                    }
                }
                applied_cache.push((op.clone(), prior));
            }
            timing.cache_ms = Some(now_ms());
        }

        // WebSocket phase. Deferred events drain from the committed session;
        // anything else goes out now. Delivery failures are recorded by the
        // emitter and never fail the operation.
        self.set_status(operation_id, OperationStatus::Websocket);
        if events_deferred {
            if let Some(session) = &session {
                if let Some(coordinated) = session.as_coordinated() {
                    for (target_user, event) in coordinated.take_committed() {
                        let emitter = self.emitters.emitter_for(&target_user);
                        if let Err(e) = emitter.send_envelope(event).await {
                            tracing::warn!(user_id = %target_user, error = %e, "deferred event dropped");
                        }
                    }
                }
            }
        } else {
            let emitter = self.emitters.emitter_for(user_id);
            for event in events {
                if let Err(e) = emitter.send_envelope(event).await {
                    tracing::warn!(user_id, error = %e, "coordinated event dropped");
                }
            }
        }
        timing.websocket_ms = Some(now_ms());

        Ok(db_result)
    }

    /// Coordinated rollback: the session's own rollback semantics for the
    /// database, best-effort reversal for agent state and cache, and an
    /// `operation_rollback` notification to the affected user. A rollback
    /// step that itself fails is logged as a system-integrity event; the
    /// service keeps running.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        operation_id: Uuid,
        name: &str,
        user_id: &str,
        thread_id: &str,
        phase: &'static str,
        cause: &anyhow::Error,
        session: Option<Arc<dyn StorageSession>>,
        applied_agents: &[Uuid],
        applied_cache: &[(CacheOp, Option<Value>)],
        timing: &mut CoordinationTiming,
    ) {
        timing.failure_ms = Some(now_ms());
        self.set_status(operation_id, OperationStatus::Failed);
        tracing::warn!(
            operation_id = %operation_id,
            name,
            phase,
            error = %cause,
            "coordinated operation failed, rolling back"
        );
        self.set_status(operation_id, OperationStatus::RollingBack);

        let mut rollback_error: Option<anyhow::Error> = None;

        if let Some(session) = session {
            if let Err(e) = session.rollback().await {
                rollback_error.get_or_insert(e);
            }
        }

        for execution_id in applied_agents {
            if let Err(e) = self
                .agent_tracker
                .update_execution_state(*execution_id, AgentState::Failed)
                .await
            {
                tracing::warn!(execution_id = %execution_id, error = %e, "agent-state reversal failed");
                rollback_error.get_or_insert(e);
            }
        }

        for (op, prior) in applied_cache.iter().rev() {
            let restore = match (op, prior) {
                (CacheOp::Put { key, .. }, Some(prior)) => {
                    self.cache.put(key, prior.clone()).await
                }
                (CacheOp::Put { key, .. }, None) => self.cache.delete(key).await,
                (CacheOp::Delete { key }, Some(prior)) => {
                    self.cache.put(key, prior.clone()).await
                }
                (CacheOp::Delete { .. }, None) => Ok(()),
            };
            if let Err(e) = restore {
                tracing::warn!(key = op.key(), error = %e, "cache reversal failed");
                rollback_error.get_or_insert(e);
            }
        }

        let notice = RollbackNotice {
            operation_id,
            operation_name: name.to_string(),
            operation_type: self
                .operations
                .get(&operation_id)
                .map(|o| o.operation_type.clone())
                .unwrap_or_default(),
            error_message: cause.to_string(),
            user_message: format!(
                "We couldn't complete '{name}'. Your changes were not applied."
            ),
            timestamp: Utc::now(),
            thread_id: thread_id.to_string(),
        };
        match self
            .emitters
            .emitter_for(user_id)
            .send_envelope(notice.into_envelope())
            .await
        {
            Ok(()) => {
                timing.rollback_notified_ms = Some(now_ms());
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "rollback notification not delivered");
            }
        }

        self.health.track_event(name, user_id, timing, false);
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        self.rollbacks_handled_total.fetch_add(1, Ordering::Relaxed);

        match rollback_error {
            Some(e) => {
                self.rollback_failures_total.fetch_add(1, Ordering::Relaxed);
                self.set_status(operation_id, OperationStatus::RollbackFailed);
                let integrity = CoreError::Rollback {
                    operation: name.to_string(),
                    source: e,
                };
                tracing::error!(
                    operation_id = %operation_id,
                    error = %integrity,
                    "rollback failed; manual intervention required"
                );
            }
            None => {
                self.set_status(operation_id, OperationStatus::RolledBack);
            }
        }
        self.operations.remove(&operation_id);
    }

    fn set_status(&self, operation_id: Uuid, status: OperationStatus) {
        if let Some(mut op) = self.operations.get_mut(&operation_id) {
            op.status = status;
        }
    }

    fn notify_start(&self, operation: &CoordinatedOperation) {
        let hooks = self.start_hooks.lock().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            hook(operation);
        }
    }

    /// Evict operations older than `max_operation_age`. Completed and rolled
    /// back operations are already gone; anything left this long is leaked
    /// or hung.
    pub fn cleanup_stale_operations(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.config.max_operation_age.as_millis() as u64);
        let stale: Vec<Uuid> = self
            .operations
            .iter()
            .filter(|e| e.value().created_at_ms <= cutoff)
            .map(|e| *e.key())
            .collect();
        let count = stale.len();
        for id in stale {
            if let Some((_, op)) = self.operations.remove(&id) {
                self.stale_evicted_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    operation_id = %op.operation_id,
                    name = %op.name,
                    status = ?op.status,
                    age_ms = now_ms().saturating_sub(op.created_at_ms),
                    "stale coordinated operation evicted"
                );
            }
        }
        count
    }

    pub fn in_flight(&self) -> usize {
        self.operations.len()
    }

    pub fn metrics(&self) -> CoordinationMetrics {
        let completed = self.completed_total.load(Ordering::Relaxed);
        let total_time = self.total_time_ms.load(Ordering::Relaxed);
        CoordinationMetrics {
            started_total: self.started_total.load(Ordering::Relaxed),
            completed_total: completed,
            failed_total: self.failed_total.load(Ordering::Relaxed),
            rollbacks_handled_total: self.rollbacks_handled_total.load(Ordering::Relaxed),
            rollback_failures_total: self.rollback_failures_total.load(Ordering::Relaxed),
            deferred_send_unsupported_total: self
                .deferred_send_unsupported_total
                .load(Ordering::Relaxed),
            stale_evicted_total: self.stale_evicted_total.load(Ordering::Relaxed),
            in_flight: self.operations.len(),
            avg_operation_ms: if completed == 0 {
                0.0
            } else {
                total_time as f64 / completed as f64
            },
        }
    }
}

/// Background sweep evicting stale operations.
pub async fn cleanup_stale_loop(service: Arc<MultiLayerCoordinationService>, interval: Duration) {
    tracing::info!(interval_secs = interval.as_secs(), "stale operation sweep started");
    loop {
        tokio::time::sleep(interval).await;
        let evicted = service.cleanup_stale_operations();
        if evicted > 0 {
            tracing::warn!(evicted, "stale coordinated operations evicted");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationMetrics {
    pub started_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub rollbacks_handled_total: u64,
    pub rollback_failures_total: u64,
    pub deferred_send_unsupported_total: u64,
    pub stale_evicted_total: u64,
    pub in_flight: usize,
    pub avg_operation_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::health::GapThresholds;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use strata_common::EventType;
    use strata_connect::{ChannelConnection, ConnectionPool, LoadBalancedConnectionManager, PoolConfig};
    use strata_store::{MemorySession, MemoryStore};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Tracker recording every transition per execution id.
    #[derive(Default)]
    struct RecordingTracker {
        states: DashMap<Uuid, Vec<AgentState>>,
    }

    #[async_trait]
    impl AgentStateTracker for RecordingTracker {
        async fn update_execution_state(
            &self,
            execution_id: Uuid,
            state: AgentState,
        ) -> anyhow::Result<()> {
            self.states.entry(execution_id).or_default().push(state);
            Ok(())
        }
    }

    /// Cache that refuses writes to the key "boom".
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCache,
    }

    #[async_trait]
    impl CacheStore for FlakyCache {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
            if key == "boom" {
                anyhow::bail!("cache backend unavailable");
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.inner.delete(key).await
        }
    }

    struct Harness {
        service: Arc<MultiLayerCoordinationService>,
        tracker: Arc<RecordingTracker>,
        cache: Arc<FlakyCache>,
        store: Arc<MemoryStore>,
        rx: UnboundedReceiver<Value>,
    }

    fn make_harness(config: CoordinationConfig) -> Harness {
        let pool = ConnectionPool::new("p0", PoolConfig::default());
        let manager = LoadBalancedConnectionManager::new(vec![pool]);
        let (conn, rx) = ChannelConnection::pair("c0");
        manager.route_connection(conn, "u1", None).expect("route");

        let tracker = Arc::new(RecordingTracker::default());
        let cache = Arc::new(FlakyCache::default());
        let service = MultiLayerCoordinationService::new(
            EmitterFactory::new(manager),
            tracker.clone(),
            cache.clone(),
            CoordinationHealthMonitor::new(GapThresholds::default()),
            config,
        );
        Harness {
            service,
            tracker,
            cache,
            store: Arc::new(MemoryStore::new()),
            rx,
        }
    }

    fn make_request(
        session: Option<Arc<MemorySession>>,
        db_op: Option<DbOp>,
        events: Vec<EventEnvelope>,
        agent_updates: Vec<AgentStateUpdate>,
        cache_ops: Vec<CacheOp>,
    ) -> OperationRequest {
        OperationRequest {
            name: "save_message".to_string(),
            operation_type: "user_request".to_string(),
            user_id: "u1".to_string(),
            thread_id: "t1".to_string(),
            session: session.map(|s| s as Arc<dyn StorageSession>),
            db_op,
            events,
            agent_updates,
            cache_ops,
            metadata: HashMap::new(),
        }
    }

    fn make_event(name: &str) -> EventEnvelope {
        EventEnvelope::new(&EventType::Other(name.to_string()), json!({"seq": 1}))
    }

    fn write_db_op(session: Arc<MemorySession>, key: &str, value: Value) -> DbOp {
        let key = key.to_string();
        Box::new(move |_s| {
            Box::pin(async move {
                session.put(&key, value);
                Ok(json!({"rows": 1}))
            })
        })
    }

    #[tokio::test]
    async fn test_success_delivers_events_after_commit() {
        let mut h = make_harness(CoordinationConfig::default());
        let session = h.store.coordinated_session();

        let exec_id = Uuid::new_v4();
        let result = h
            .service
            .execute(make_request(
                Some(session.clone()),
                Some(write_db_op(session.clone(), "msg:1", json!("hello"))),
                vec![make_event("message_saved")],
                vec![AgentStateUpdate {
                    execution_id: exec_id,
                    state: AgentState::Completed,
                }],
                vec![CacheOp::Put {
                    key: "thread:t1".to_string(),
                    value: json!({"last": "hello"}),
                }],
            ))
            .await
            .expect("execute");

        assert_eq!(result.db_result, Some(json!({"rows": 1})));
        assert!(session.is_committed());
        assert_eq!(h.store.get("msg:1"), Some(json!("hello")));
        assert_eq!(
            h.cache.get("thread:t1").await.expect("get"),
            Some(json!({"last": "hello"}))
        );
        assert_eq!(
            h.tracker.states.get(&exec_id).expect("tracked").clone(),
            vec![AgentState::Completed]
        );

        // The event arrives, and only after the commit happened.
        let event = h.rx.recv().await.expect("event");
        assert_eq!(event["type"], "message_saved");
        assert!(session.commit_at_ms() > 0);
        let delivered = result.timing.websocket_ms.expect("ws stamp");
        assert!(delivered >= session.commit_at_ms());

        let metrics = h.service.metrics();
        assert_eq!(metrics.completed_total, 1);
        assert_eq!(metrics.failed_total, 0);
        assert_eq!(metrics.in_flight, 0);
    }

    #[tokio::test]
    async fn test_db_failure_drops_deferred_events() {
        let mut h = make_harness(CoordinationConfig::default());
        let session = h.store.coordinated_session();

        let db_op: DbOp =
            Box::new(|_s| Box::pin(async { anyhow::bail!("unique constraint violated") }));
        let err = h
            .service
            .execute(make_request(
                Some(session.clone()),
                Some(db_op),
                vec![make_event("message_saved")],
                vec![],
                vec![],
            ))
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            CoreError::Coordination { phase: "database", .. }
        ));

        // Nothing was committed; the only event the user sees is the
        // rollback notification.
        assert_eq!(h.store.revision(), 0);
        let event = h.rx.recv().await.expect("notification");
        assert_eq!(event["type"], "operation_rollback");
        assert_eq!(event["data"]["operation_name"], "save_message");
        assert!(h.rx.try_recv().is_err());

        assert_eq!(h.service.metrics().rollbacks_handled_total, 1);
    }

    #[tokio::test]
    async fn test_cache_failure_rolls_back_applied_layers() {
        let mut h = make_harness(CoordinationConfig::default());
        let session = h.store.coordinated_session();

        // Pre-existing cache state that must survive the rollback.
        h.cache
            .put("warm", json!("original"))
            .await
            .expect("seed cache");

        let exec_id = Uuid::new_v4();
        let err = h
            .service
            .execute(make_request(
                Some(session.clone()),
                Some(write_db_op(session.clone(), "msg:1", json!("hello"))),
                vec![make_event("message_saved")],
                vec![AgentStateUpdate {
                    execution_id: exec_id,
                    state: AgentState::Running,
                }],
                vec![
                    CacheOp::Put {
                        key: "warm".to_string(),
                        value: json!("dirty"),
                    },
                    CacheOp::Put {
                        key: "boom".to_string(),
                        value: json!(1),
                    },
                ],
            ))
            .await
            .expect_err("cache phase fails");
        assert!(matches!(err, CoreError::Coordination { phase: "cache", .. }));

        // Applied cache write reverted to the pre-operation value.
        assert_eq!(
            h.cache.get("warm").await.expect("get"),
            Some(json!("original"))
        );
        // Applied agent update reverted to Failed.
        assert_eq!(
            h.tracker.states.get(&exec_id).expect("tracked").clone(),
            vec![AgentState::Running, AgentState::Failed]
        );

        // Deferred events died with the operation; the user got exactly one
        // rollback notification.
        let event = h.rx.recv().await.expect("notification");
        assert_eq!(event["type"], "operation_rollback");
        assert!(h.rx.try_recv().is_err());

        let metrics = h.service.metrics();
        assert_eq!(metrics.rollbacks_handled_total, 1);
        assert_eq!(metrics.failed_total, 1);
        assert_eq!(metrics.in_flight, 0);
    }

    #[tokio::test]
    async fn test_plain_session_counts_degraded_mode() {
        let mut h = make_harness(CoordinationConfig::default());
        let session = h.store.session();

        h.service
            .execute(make_request(
                Some(session.clone()),
                Some(write_db_op(session.clone(), "msg:1", json!("hi"))),
                vec![make_event("message_saved")],
                vec![],
                vec![],
            ))
            .await
            .expect("execute");

        // Events still go out (after the commit in phase order), but the
        // degraded mode is visible in metrics.
        assert_eq!(h.rx.recv().await.expect("event")["type"], "message_saved");
        assert_eq!(h.service.metrics().deferred_send_unsupported_total, 1);
    }

    #[tokio::test]
    async fn test_stale_operations_evicted() {
        let h = make_harness(CoordinationConfig {
            max_operation_age: Duration::from_millis(0),
        });

        let (_hold, gate) = tokio::sync::oneshot::channel::<()>();
        let db_op: DbOp = Box::new(move |_s| {
            Box::pin(async move {
                let _ = gate.await;
                Ok(Value::Null)
            })
        });
        let session = h.store.coordinated_session();
        let service = h.service.clone();
        let pending = tokio::spawn(async move {
            let _ = service
                .execute(make_request(Some(session), Some(db_op), vec![], vec![], vec![]))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.service.in_flight(), 1);
        assert_eq!(h.service.cleanup_stale_operations(), 1);
        assert_eq!(h.service.in_flight(), 0);
        assert_eq!(h.service.metrics().stale_evicted_total, 1);
        pending.abort();
    }

    #[tokio::test]
    async fn test_start_hooks_notified() {
        let h = make_harness(CoordinationConfig::default());
        let seen = Arc::new(AtomicU32::new(0));
        let seen_hook = seen.clone();
        h.service.register_start_hook(Box::new(move |op| {
            assert_eq!(op.name, "save_message");
            assert_eq!(op.status, OperationStatus::Started);
            seen_hook.fetch_add(1, Ordering::SeqCst);
        }));

        h.service
            .execute(make_request(None, None, vec![], vec![], vec![]))
            .await
            .expect("execute");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
