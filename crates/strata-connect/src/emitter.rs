use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_common::{CoreError, EventEnvelope, EventType};

use crate::manager::LoadBalancedConnectionManager;

/// Delivery retry parameters. Exponential backoff, capped attempts and delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Faster, fewer-retry variant for latency-sensitive emitters.
    pub fn performance() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        exp.min(self.max_delay)
    }
}

/// The single event emitter (SSOT). Every event a user receives goes through
/// an instance of this type; there is deliberately no second implementation.
/// Instances are handed out per user by [`EmitterFactory`].
pub struct EventEmitter {
    user_id: String,
    manager: Arc<LoadBalancedConnectionManager>,
    retry: RetryPolicy,
    user_context: Option<Value>,
    emitted_total: AtomicU64,
    critical_emitted_total: AtomicU64,
    retries_total: AtomicU64,
    delivery_failures_total: AtomicU64,
}

impl EventEmitter {
    fn new(
        user_id: impl Into<String>,
        manager: Arc<LoadBalancedConnectionManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            manager,
            retry,
            user_context: None,
            emitted_total: AtomicU64::new(0),
            critical_emitted_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            delivery_failures_total: AtomicU64::new(0),
        }
    }

    /// Attach auth/user metadata carried on every envelope this emitter sends.
    pub fn set_user_context(&mut self, user_context: Value) {
        self.user_context = Some(user_context);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    // The five critical lifecycle events. Delivery is retried; failure after
    // the last attempt surfaces to the caller.

    pub async fn agent_started(&self, data: Value) -> Result<(), CoreError> {
        self.send_critical(EventType::AgentStarted, data).await
    }

    pub async fn agent_thinking(&self, data: Value) -> Result<(), CoreError> {
        self.send_critical(EventType::AgentThinking, data).await
    }

    pub async fn tool_executing(&self, data: Value) -> Result<(), CoreError> {
        self.send_critical(EventType::ToolExecuting, data).await
    }

    pub async fn tool_completed(&self, data: Value) -> Result<(), CoreError> {
        self.send_critical(EventType::ToolCompleted, data).await
    }

    pub async fn agent_completed(&self, data: Value) -> Result<(), CoreError> {
        self.send_critical(EventType::AgentCompleted, data).await
    }

    /// Generic dispatch: critical event names route to the matching critical
    /// method, everything else takes the fire-and-forget path.
    pub async fn emit(&self, event_type: &str, data: Value) -> Result<(), CoreError> {
        let parsed = EventType::parse(event_type);
        match parsed {
            EventType::AgentStarted => self.agent_started(data).await,
            EventType::AgentThinking => self.agent_thinking(data).await,
            EventType::ToolExecuting => self.tool_executing(data).await,
            EventType::ToolCompleted => self.tool_completed(data).await,
            EventType::AgentCompleted => self.agent_completed(data).await,
            other => {
                self.send_non_critical(&other, data).await;
                Ok(())
            }
        }
    }

    /// Deliver a pre-built envelope with the retry policy. Used by the
    /// coordination layer for rollback notifications and deferred events.
    pub async fn send_envelope(&self, envelope: EventEnvelope) -> Result<(), CoreError> {
        self.send_with_retry(envelope).await
    }

    async fn send_critical(&self, event_type: EventType, data: Value) -> Result<(), CoreError> {
        let mut envelope = EventEnvelope::new(&event_type, data);
        if let Some(ctx) = &self.user_context {
            envelope.user_context = Some(ctx.clone());
        }
        self.send_with_retry(envelope).await
    }

    async fn send_non_critical(&self, event_type: &EventType, data: Value) {
        let mut envelope = EventEnvelope::new(event_type, data);
        if let Some(ctx) = &self.user_context {
            envelope.user_context = Some(ctx.clone());
        }
        let payload = match serde_json::to_value(&envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, event_type = %event_type, "unserializable event dropped");
                return;
            }
        };
        match self.manager.send_to_user(&self.user_id, payload).await {
            Ok(()) => {
                self.emitted_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.delivery_failures_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    user_id = %self.user_id,
                    event_type = %event_type,
                    error = %e,
                    "non-critical event dropped"
                );
            }
        }
    }

    async fn send_with_retry(&self, envelope: EventEnvelope) -> Result<(), CoreError> {
        let critical = envelope.critical;
        let event_type = envelope.event_type.clone();
        let payload = serde_json::to_value(&envelope).map_err(|_| CoreError::Delivery {
            event_type: event_type.clone(),
            user_id: self.user_id.clone(),
            attempts: 0,
        })?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .manager
                .send_to_user(&self.user_id, payload.clone())
                .await
            {
                Ok(()) => {
                    self.emitted_total.fetch_add(1, Ordering::Relaxed);
                    if critical {
                        self.critical_emitted_total.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    self.retries_total.fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(
                        user_id = %self.user_id,
                        event_type = %event_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "event delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.delivery_failures_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        user_id = %self.user_id,
                        event_type = %event_type,
                        attempts = attempt,
                        error = %e,
                        "event delivery failed, retries exhausted"
                    );
                    return Err(CoreError::Delivery {
                        event_type,
                        user_id: self.user_id.clone(),
                        attempts: attempt,
                    });
                }
            }
        }
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            user_id: self.user_id.clone(),
            emitted_total: self.emitted_total.load(Ordering::Relaxed),
            critical_emitted_total: self.critical_emitted_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            delivery_failures_total: self.delivery_failures_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterStats {
    pub user_id: String,
    pub emitted_total: u64,
    pub critical_emitted_total: u64,
    pub retries_total: u64,
    pub delivery_failures_total: u64,
}

/// Hands out the per-user [`EventEmitter`] instances. One emitter per user;
/// repeated lookups return the same instance.
pub struct EmitterFactory {
    manager: Arc<LoadBalancedConnectionManager>,
    retry: RetryPolicy,
    emitters: DashMap<String, Arc<EventEmitter>>,
}

impl EmitterFactory {
    pub fn new(manager: Arc<LoadBalancedConnectionManager>) -> Arc<Self> {
        Self::with_policy(manager, RetryPolicy::standard())
    }

    /// Factory whose emitters use the faster, fewer-retry policy.
    pub fn performance_mode(manager: Arc<LoadBalancedConnectionManager>) -> Arc<Self> {
        Self::with_policy(manager, RetryPolicy::performance())
    }

    pub fn with_policy(
        manager: Arc<LoadBalancedConnectionManager>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            retry,
            emitters: DashMap::new(),
        })
    }

    pub fn emitter_for(&self, user_id: &str) -> Arc<EventEmitter> {
        self.emitters
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Arc::new(EventEmitter::new(
                    user_id,
                    self.manager.clone(),
                    self.retry.clone(),
                ))
            })
            .clone()
    }

    pub fn drop_emitter(&self, user_id: &str) {
        self.emitters.remove(user_id);
    }

    pub fn all_stats(&self) -> Vec<EmitterStats> {
        self.emitters.iter().map(|e| e.value().stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;
    use crate::pool::{ConnectionPool, PoolConfig};
    use serde_json::json;

    fn make_setup(user: &str) -> (
        Arc<LoadBalancedConnectionManager>,
        Arc<ChannelConnection>,
        tokio::sync::mpsc::UnboundedReceiver<Value>,
    ) {
        let pool = ConnectionPool::new("p0", PoolConfig::default());
        let manager = LoadBalancedConnectionManager::new(vec![pool]);
        let (conn, rx) = ChannelConnection::pair("c0");
        manager
            .route_connection(conn.clone(), user, None)
            .expect("route");
        (manager, conn, rx)
    }

    #[tokio::test]
    async fn test_critical_events_delivered_in_order() {
        let (manager, _conn, mut rx) = make_setup("u1");
        let factory = EmitterFactory::new(manager);
        let emitter = factory.emitter_for("u1");

        emitter.agent_started(json!({"agent": "planner"})).await.expect("started");
        emitter.agent_thinking(json!({"step": 1})).await.expect("thinking");
        emitter.tool_executing(json!({"tool": "search"})).await.expect("executing");
        emitter.tool_completed(json!({"tool": "search"})).await.expect("completed");
        emitter.agent_completed(json!({"ok": true})).await.expect("done");

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
        assert_eq!(emitter.stats().critical_emitted_total, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_reconnect() {
        let (manager, conn, mut rx) = make_setup("u1");
        let factory = EmitterFactory::new(manager);
        let emitter = factory.emitter_for("u1");

        conn.disconnect();
        let conn_clone = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            conn_clone.reconnect();
        });

        emitter.agent_started(json!({})).await.expect("delivered after retry");
        assert!(emitter.stats().retries_total >= 1);
        assert_eq!(rx.recv().await.expect("payload")["type"], "agent_started");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_failure() {
        let (manager, conn, _rx) = make_setup("u1");
        let factory = EmitterFactory::new(manager);
        let emitter = factory.emitter_for("u1");

        conn.disconnect();
        let err = emitter.agent_completed(json!({})).await.expect_err("no delivery");
        assert!(matches!(err, CoreError::Delivery { attempts: 4, .. }));
        assert_eq!(emitter.stats().delivery_failures_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_performance_mode_uses_fewer_attempts() {
        let (manager, conn, _rx) = make_setup("u1");
        let factory = EmitterFactory::performance_mode(manager);
        let emitter = factory.emitter_for("u1");

        conn.disconnect();
        let err = emitter.agent_started(json!({})).await.expect_err("no delivery");
        assert!(matches!(err, CoreError::Delivery { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_emit_dispatches_by_name() {
        let (manager, _conn, mut rx) = make_setup("u1");
        let factory = EmitterFactory::new(manager);
        let emitter = factory.emitter_for("u1");

        emitter.emit("tool_executing", json!({"tool": "calc"})).await.expect("critical");
        emitter.emit("progress_tick", json!({"pct": 50})).await.expect("non-critical");

        let first = rx.recv().await.expect("first");
        assert_eq!(first["type"], "tool_executing");
        assert_eq!(first["critical"], true);
        let second = rx.recv().await.expect("second");
        assert_eq!(second["type"], "progress_tick");
        assert_eq!(second["critical"], false);
    }

    #[tokio::test]
    async fn test_non_critical_failure_does_not_raise() {
        let (manager, conn, _rx) = make_setup("u1");
        let factory = EmitterFactory::new(manager);
        let emitter = factory.emitter_for("u1");

        conn.disconnect();
        emitter.emit("progress_tick", json!({})).await.expect("fire and forget");
        assert_eq!(emitter.stats().delivery_failures_total, 1);
    }

    #[tokio::test]
    async fn test_factory_returns_same_instance_per_user() {
        let (manager, _conn, _rx) = make_setup("u1");
        let factory = EmitterFactory::new(manager);
        let a = factory.emitter_for("u1");
        let b = factory.emitter_for("u1");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
