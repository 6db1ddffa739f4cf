pub mod migrations;
pub mod sqlite;

use futures::future::{self, BoxFuture};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_sqlite::PoolError),

    #[error("pool setup error: {0}")]
    CreatePool(#[from] deadpool_sqlite::CreatePoolError),

    #[error("interact error: {0}")]
    Interact(String),

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<deadpool_sqlite::InteractError> for StoreError {
    fn from(e: deadpool_sqlite::InteractError) -> Self {
        StoreError::Interact(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable string key-value port backing the second cache tier.
///
/// Futures are `'static` so implementations can move work onto blocking
/// threads without borrowing the caller.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'static, StoreResult<Option<String>>>;

    fn set(&self, key: &str, value: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Delete every listed key. Returns how many existed.
    fn delete(&self, keys: Vec<String>) -> BoxFuture<'static, StoreResult<usize>>;

    /// All `(key, value)` pairs whose key starts with `prefix`, ordered by key.
    fn scan(&self, prefix: &str) -> BoxFuture<'static, StoreResult<Vec<(String, String)>>>;
}

/// Process-local store. Used in tests and when no database path is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_map<T>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> T) -> StoreResult<T> {
        let mut map = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut map))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'static, StoreResult<Option<String>>> {
        Box::pin(future::ready(self.with_map(|map| map.get(key).cloned())))
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'static, StoreResult<()>> {
        let result = self.with_map(|map| {
            map.insert(key.to_string(), value.to_string());
        });
        Box::pin(future::ready(result))
    }

    fn delete(&self, keys: Vec<String>) -> BoxFuture<'static, StoreResult<usize>> {
        let result = self.with_map(|map| keys.iter().filter(|k| map.remove(*k).is_some()).count());
        Box::pin(future::ready(result))
    }

    fn scan(&self, prefix: &str) -> BoxFuture<'static, StoreResult<Vec<(String, String)>>> {
        let result = self.with_map(|map| {
            map.range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        });
        Box::pin(future::ready(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.set("cache_a", "1").await.unwrap();
        store.set("cache_b", "2").await.unwrap();
        store.set("cache_a", "3").await.unwrap();
        store.set("session", "x").await.unwrap();
        assert_eq!(store.get("cache_a").await.unwrap().as_deref(), Some("3"));

        let scanned = store.scan("cache_").await.unwrap();
        assert_eq!(
            scanned,
            vec![
                ("cache_a".to_string(), "3".to_string()),
                ("cache_b".to_string(), "2".to_string())
            ]
        );

        let removed = store
            .delete(vec!["cache_a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.scan("").await.unwrap().len(), 2);
    }
}
