use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// Cache-layer boundary for coordinated operations. The concrete cache
/// (process-local, redis, …) lives with the embedding process.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local cache backend.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Value>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete() {
        let cache = MemoryCache::new();
        cache.put("k", json!({"v": 1})).await.expect("put");
        assert_eq!(cache.get("k").await.expect("get"), Some(json!({"v": 1})));
        cache.delete("k").await.expect("delete");
        assert_eq!(cache.get("k").await.expect("get"), None);
    }
}
