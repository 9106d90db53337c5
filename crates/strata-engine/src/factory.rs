use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use strata_common::{CoreError, ExecutionContext};
use strata_connect::EmitterFactory;

use crate::agent::AgentFactory;
use crate::engine::{EngineConfig, ExecutionEngine};
use crate::now_ms;

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub max_engines_per_user: usize,
    pub engine: EngineConfig,
    /// Engines idle past this age are reclaimed by the background sweep.
    pub engine_idle_timeout: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_engines_per_user: 5,
            engine: EngineConfig::default(),
            engine_idle_timeout: Duration::from_secs(1800),
        }
    }
}

/// Process-scoped engine registry, keyed by isolation key. Created by the
/// embedding process and passed down — never a package-level singleton, so
/// tests instantiate isolated copies. Registry mutations go through the
/// per-key map entry; unrelated users never contend on one global lock.
pub struct ExecutionEngineFactory {
    registry: DashMap<String, Arc<ExecutionEngine>>,
    per_user: DashMap<String, usize>,
    agent_factory: Arc<dyn AgentFactory>,
    emitters: Arc<EmitterFactory>,
    config: FactoryConfig,
    engines_created_total: AtomicU64,
    engines_cleaned_total: AtomicU64,
    resource_limit_hits_total: AtomicU64,
}

impl ExecutionEngineFactory {
    pub fn new(
        agent_factory: Arc<dyn AgentFactory>,
        emitters: Arc<EmitterFactory>,
        config: FactoryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: DashMap::new(),
            per_user: DashMap::new(),
            agent_factory,
            emitters,
            config,
            engines_created_total: AtomicU64::new(0),
            engines_cleaned_total: AtomicU64::new(0),
            resource_limit_hits_total: AtomicU64::new(0),
        })
    }

    /// Get or create the engine for the context's isolation key. Creation is
    /// idempotent: concurrent calls for the same key observe one engine, and
    /// reuse does not move the creation metrics. A user at
    /// `max_engines_per_user` gets `ResourceLimit`, never a queue.
    pub fn create_for_user(
        &self,
        ctx: Arc<ExecutionContext>,
    ) -> Result<Arc<ExecutionEngine>, CoreError> {
        if ctx.is_closed() {
            return Err(CoreError::ContextClosed);
        }
        let key = ctx.isolation_key();
        match self.registry.entry(key) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let user_engines = self.per_user.get(&ctx.user_id).map(|c| *c).unwrap_or(0);
                if user_engines >= self.config.max_engines_per_user {
                    self.resource_limit_hits_total.fetch_add(1, Ordering::Relaxed);
                    return Err(CoreError::ResourceLimit {
                        resource: format!("execution engines for user '{}'", ctx.user_id),
                        limit: self.config.max_engines_per_user,
                    });
                }

                let emitter = self.emitters.emitter_for(&ctx.user_id);
                let engine = Arc::new(ExecutionEngine::new(
                    ctx.clone(),
                    self.agent_factory.clone(),
                    emitter,
                    self.config.engine.clone(),
                ));
                slot.insert(engine.clone());
                *self.per_user.entry(ctx.user_id.clone()).or_insert(0) += 1;
                self.engines_created_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    user_id = %ctx.user_id,
                    isolation_key = %engine.context().isolation_key(),
                    "execution engine created"
                );
                Ok(engine)
            }
        }
    }

    /// Deactivate and deregister the engine for `key`, firing the context's
    /// cleanup callbacks. Returns whether an engine was removed.
    pub fn cleanup_engine(&self, key: &str) -> bool {
        let Some((_, engine)) = self.registry.remove(key) else {
            return false;
        };
        engine.deactivate();

        let user_id = engine.context().user_id.clone();
        if let Some(mut count) = self.per_user.get_mut(&user_id) {
            *count = count.saturating_sub(1);
        }
        self.per_user.remove_if(&user_id, |_, count| *count == 0);

        let callbacks = engine.context().cleanup();
        self.engines_cleaned_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(user_id = %user_id, key, callbacks, "execution engine cleaned up");
        true
    }

    /// Scoped acquisition: create (or reuse) the engine for `ctx`, run `f`
    /// with it, and clean the engine up on every exit path — return, error
    /// and panic alike.
    pub async fn with_user_scope<F, Fut, T>(
        &self,
        ctx: Arc<ExecutionContext>,
        f: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce(Arc<ExecutionEngine>) -> Fut,
        Fut: Future<Output = T>,
    {
        let engine = self.create_for_user(ctx)?;
        let key = engine.context().isolation_key();
        let guard = ScopeGuard { factory: self, key };
        let out = f(engine).await;
        drop(guard);
        Ok(out)
    }

    /// Reclaim engines idle past the configured timeout. Returns how many
    /// were cleaned.
    pub fn cleanup_idle_engines(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.config.engine_idle_timeout.as_millis() as u64);
        let idle: Vec<String> = self
            .registry
            .iter()
            .filter(|e| {
                e.value().last_activity_ms() < cutoff && e.value().active_run_count() == 0
            })
            .map(|e| e.key().clone())
            .collect();
        let mut cleaned = 0;
        for key in idle {
            if self.cleanup_engine(&key) {
                tracing::info!(key, "idle execution engine reclaimed");
                cleaned += 1;
            }
        }
        cleaned
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn engines_for_user(&self, user_id: &str) -> usize {
        self.per_user.get(user_id).map(|c| *c).unwrap_or(0)
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            engines_created_total: self.engines_created_total.load(Ordering::Relaxed),
            engines_cleaned_total: self.engines_cleaned_total.load(Ordering::Relaxed),
            resource_limit_hits_total: self.resource_limit_hits_total.load(Ordering::Relaxed),
            active_count: self.registry.len(),
            active_users: self.per_user.len(),
        }
    }
}

struct ScopeGuard<'a> {
    factory: &'a ExecutionEngineFactory,
    key: String,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.factory.cleanup_engine(&self.key);
    }
}

/// Background sweep reclaiming idle engines.
pub async fn idle_sweep_loop(factory: Arc<ExecutionEngineFactory>, interval: Duration) {
    tracing::info!(interval_secs = interval.as_secs(), "engine idle sweep started");
    loop {
        tokio::time::sleep(interval).await;
        let cleaned = factory.cleanup_idle_engines();
        if cleaned > 0 {
            tracing::info!(cleaned, "idle engines reclaimed");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryStats {
    pub engines_created_total: u64,
    pub engines_cleaned_total: u64,
    pub resource_limit_hits_total: u64,
    pub active_count: usize,
    pub active_users: usize,
}
