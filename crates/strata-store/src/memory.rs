use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use serde_json::Value;

use strata_common::{now_ms, CoordinatedSession, EventEnvelope, StorageSession};

/// In-memory storage backend. One `MemoryStore` is the committed state;
/// sessions stage writes against it and apply them atomically on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Value, u64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a plain session: commit/rollback only, no event deferral.
    pub fn session(self: &Arc<Self>) -> Arc<MemorySession> {
        Arc::new(MemorySession::new(self.clone(), false))
    }

    /// Open a coordinated session that holds outbound events until commit.
    pub fn coordinated_session(self: &Arc<Self>) -> Arc<MemorySession> {
        Arc::new(MemorySession::new(self.clone(), true))
    }

    /// Read committed state.
    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.kv.get(key).map(|(v, _)| v.clone())
    }

    pub fn revision(&self) -> u64 {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.revision
    }

    fn apply(&self, staged: BTreeMap<String, Option<Value>>) -> u64 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.revision = inner.revision.saturating_add(1);
        let rev = inner.revision;
        for (key, value) in staged {
            match value {
                Some(v) => {
                    inner.kv.insert(key, (v, rev));
                }
                None => {
                    inner.kv.remove(&key);
                }
            }
        }
        rev
    }
}

/// One transaction against a [`MemoryStore`]. Writes are staged locally and
/// invisible to other sessions until [`StorageSession::commit`] applies them.
pub struct MemorySession {
    store: Arc<MemoryStore>,
    staged: Mutex<BTreeMap<String, Option<Value>>>,
    committed: AtomicBool,
    finished: AtomicBool,
    commit_at_ms: AtomicU64,
    coordinated: bool,
    deferred: Mutex<Vec<(String, EventEnvelope)>>,
}

impl MemorySession {
    fn new(store: Arc<MemoryStore>, coordinated: bool) -> Self {
        Self {
            store,
            staged: Mutex::new(BTreeMap::new()),
            committed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            commit_at_ms: AtomicU64::new(0),
            coordinated,
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn put(&self, key: &str, value: Value) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        staged.insert(key.to_string(), Some(value));
    }

    pub fn delete(&self, key: &str) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        staged.insert(key.to_string(), None);
    }

    /// Read-your-writes: staged value if present, committed store otherwise.
    pub fn get(&self, key: &str) -> Option<Value> {
        let staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        match staged.get(key) {
            Some(v) => v.clone(),
            None => self.store.get(key),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Wall-clock stamp of the commit, 0 if not committed.
    pub fn commit_at_ms(&self) -> u64 {
        self.commit_at_ms.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StorageSession for MemorySession {
    async fn commit(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            anyhow::bail!("session already finished");
        }
        let staged = {
            let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *staged)
        };
        self.store.apply(staged);
        self.commit_at_ms.store(now_ms(), Ordering::SeqCst);
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            // Rolling back a finished session is a no-op, not an error.
            return Ok(());
        }
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.deferred
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn as_coordinated(&self) -> Option<&dyn CoordinatedSession> {
        if self.coordinated {
            Some(self)
        } else {
            None
        }
    }
}

impl CoordinatedSession for MemorySession {
    fn defer_event(&self, user_id: &str, event: EventEnvelope) {
        self.deferred
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((user_id.to_string(), event));
    }

    fn take_committed(&self) -> Vec<(String, EventEnvelope)> {
        if !self.is_committed() {
            return Vec::new();
        }
        let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_common::EventType;

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let store = Arc::new(MemoryStore::new());
        let session = store.session();
        session.put("a", json!(1));

        assert_eq!(store.get("a"), None);
        assert_eq!(session.get("a"), Some(json!(1)));

        session.commit().await.expect("commit");
        assert_eq!(store.get("a"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let store = Arc::new(MemoryStore::new());
        let session = store.session();
        session.put("a", json!(1));
        session.rollback().await.expect("rollback");

        assert_eq!(store.get("a"), None);
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn test_deferred_events_held_until_commit() {
        let store = Arc::new(MemoryStore::new());
        let session = store.coordinated_session();
        let coordinated = session.as_coordinated().expect("coordinated");

        coordinated.defer_event(
            "u1",
            EventEnvelope::new(&EventType::AgentCompleted, json!({})),
        );
        assert!(coordinated.take_committed().is_empty());

        session.commit().await.expect("commit");
        let drained = session
            .as_coordinated()
            .expect("coordinated")
            .take_committed();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "u1");
    }

    #[tokio::test]
    async fn test_plain_session_has_no_coordinated_capability() {
        let store = Arc::new(MemoryStore::new());
        let session = store.session();
        assert!(session.as_coordinated().is_none());
    }

    #[tokio::test]
    async fn test_double_commit_rejected() {
        let store = Arc::new(MemoryStore::new());
        let session = store.session();
        session.commit().await.expect("commit");
        assert!(session.commit().await.is_err());
    }
}
