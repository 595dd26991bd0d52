use crate::error::{PearlError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Content store key of one physical chunk slot.
pub fn chunk_key(file_identifier: &str, physical_index: u64) -> String {
    format!("{}:{}", file_identifier, physical_index)
}

/// Short-lived payload storage, kept out of the entity database.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Writes every entry or none of them.
    async fn batch_set(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

pub struct RedisContentStore {
    namespace: String,
    conn: ConnectionManager,
}

impl RedisContentStore {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            PearlError::Config(format!("redis connection config error: {}", error))
        })?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            namespace: namespace.to_string(),
            conn,
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl ContentStore for RedisContentStore {
    async fn batch_set(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let ttl_secs = ttl.as_secs().max(1);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in &entries {
            pipe.set_ex(self.namespaced(key), value.as_ref(), ttl_secs)
                .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(self.namespaced(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.namespaced(key)).await?)
    }
}

/// Process-local content store. Also used by tests, which can make writes fail.
#[derive(Default)]
pub struct MemoryContentStore {
    entries: RwLock<HashMap<String, (Bytes, Instant)>>,
    fail_writes: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[cfg(test)]
    async fn stored(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn batch_set(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PearlError::Internal(
                "content store rejected the batch".to_string(),
            ));
        }

        let now = Instant::now();
        let expires_at = now + ttl;
        let mut guard = self.entries.write().await;
        guard.retain(|_, (_, entry_expires_at)| *entry_expires_at > now);
        for (key, value) in entries {
            guard.insert(key, (value, expires_at));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        {
            let guard = self.entries.read().await;
            match guard.get(key) {
                None => return Ok(None),
                Some((value, expires_at)) if *expires_at > now => {
                    return Ok(Some(value.clone()));
                }
                Some(_) => {}
            }
        }

        let mut guard = self.entries.write().await;
        if guard
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= now)
        {
            guard.remove(key);
        }
        Ok(None)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContentStoreBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    redis_url: Option<String>,
}

impl ContentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(PearlError::Config(
                "content store backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<Arc<dyn ContentStore>> {
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "redis" => {
                let namespace = self.namespace.as_deref().unwrap_or_default().trim();
                if namespace.is_empty() {
                    return Err(PearlError::Config(
                        "content store namespace cannot be empty".to_string(),
                    ));
                }

                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(PearlError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let store = RedisContentStore::new(url, namespace).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryContentStore::new())),
            other => Err(PearlError::Config(format!(
                "unsupported content store backend: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_batch_and_expiry() {
        let store = MemoryContentStore::new();
        store
            .batch_set(
                vec![
                    (chunk_key("genesis", 0), Bytes::from_static(b"zero")),
                    (chunk_key("genesis", 1), Bytes::from_static(b"one")),
                ],
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(
            store.get(&chunk_key("genesis", 1)).await.unwrap(),
            Some(Bytes::from_static(b"one"))
        );
        assert!(store.exists(&chunk_key("genesis", 0)).await.unwrap());
        assert!(!store.exists(&chunk_key("genesis", 2)).await.unwrap());

        store
            .batch_set(
                vec![("short".to_string(), Bytes::from_static(b"x"))],
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert!(!store.exists("short").await.unwrap());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_memory_store_evicts_expired_entries() {
        let store = MemoryContentStore::new();
        store
            .batch_set(
                vec![
                    ("a".to_string(), Bytes::from_static(b"a")),
                    ("b".to_string(), Bytes::from_static(b"b")),
                ],
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(store.stored().await, 2);

        // a read of an expired key drops it
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.stored().await, 1);

        // a write sweeps whatever else has expired
        store
            .batch_set(
                vec![("c".to_string(), Bytes::from_static(b"c"))],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(store.stored().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_fault_injection() {
        let store = MemoryContentStore::new();
        store.set_fail_writes(true);
        let result = store
            .batch_set(
                vec![("k".to_string(), Bytes::from_static(b"v"))],
                Duration::from_secs(1),
            )
            .await;
        assert!(result.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_builder_validation() {
        assert!(ContentStoreBuilder::new().build().await.is_err());
        assert!(
            ContentStoreBuilder::new()
                .backend("redis")
                .namespace("pearl")
                .build()
                .await
                .is_err()
        );
        assert!(
            ContentStoreBuilder::new()
                .backend("tape")
                .build()
                .await
                .is_err()
        );
        assert!(
            ContentStoreBuilder::new()
                .backend(" Memory ")
                .build()
                .await
                .is_ok()
        );
    }
}
