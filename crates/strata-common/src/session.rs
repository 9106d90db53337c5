use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::event::EventEnvelope;

/// One database operation executed inside a coordinated unit. The closure
/// receives the session it must write through and resolves to the
/// operation's result payload.
pub type DbOp = Box<
    dyn FnOnce(Arc<dyn StorageSession>) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send,
>;

/// Storage-layer boundary. The core owns commit/rollback sequencing but
/// never the schema or the engine behind it.
#[async_trait]
pub trait StorageSession: Send + Sync {
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    /// Coordinated capability, when the backing session supports deferring
    /// outbound events until after commit. Plain sessions return `None` and
    /// the caller falls back to the degraded immediate-send path.
    fn as_coordinated(&self) -> Option<&dyn CoordinatedSession> {
        None
    }
}

/// A session that can hold WebSocket events back until its transaction has
/// committed. Events deferred through a session that never commits are
/// dropped with the transaction.
pub trait CoordinatedSession: Send + Sync {
    /// Queue an event for delivery after commit.
    fn defer_event(&self, user_id: &str, event: EventEnvelope);

    /// Drain the deferred events. Returns an empty list before commit.
    fn take_committed(&self) -> Vec<(String, EventEnvelope)>;
}
