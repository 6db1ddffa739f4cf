use crate::storage::{KeyValueStore, StoreError, StoreResult};
use deadpool_sqlite::{Config, Pool, Runtime};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Apply PRAGMAs to the cache database connection.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA temp_store = MEMORY;
        ",
    )
}

/// Create a deadpool-sqlite connection pool for the cache database.
pub fn create_pool(path: &Path) -> Result<Pool, deadpool_sqlite::CreatePoolError> {
    // Set restrictive file permissions on the database file (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(error = %e, "failed to set database file permissions");
            }
        }
    }

    Config::new(path).create_pool(Runtime::Tokio1)
}

/// Get a connection, apply pragmas and run migrations.
pub async fn init_pool(pool: &Pool) -> StoreResult<()> {
    let conn = pool.get().await?;
    conn.interact(|conn| {
        apply_pragmas(conn)?;
        crate::storage::migrations::run_migrations(conn)?;
        Ok::<_, rusqlite::Error>(())
    })
    .await??;
    Ok(())
}

/// SQLite-backed durable tier. Statements run on the pool's blocking
/// threads through `interact`, never on the async workers.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let pool = create_pool(path)?;
        init_pool(&pool).await?;

        // The file only exists after the first connection on a fresh path
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(error = %e, "failed to set database file permissions");
            }
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn run<T, F>(&self, f: F) -> BoxFuture<'static, StoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        Box::pin(async move {
            let conn = pool.get().await?;
            let value = conn.interact(f).await??;
            Ok::<_, StoreError>(value)
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> BoxFuture<'static, StoreResult<Option<String>>> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'static, StoreResult<()>> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, chrono::Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
    }

    fn delete(&self, keys: Vec<String>) -> BoxFuture<'static, StoreResult<usize>> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM kv_store WHERE key = ?1")?;
                for key in &keys {
                    removed += stmt.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    fn scan(&self, prefix: &str) -> BoxFuture<'static, StoreResult<Vec<(String, String)>>> {
        let prefix = prefix.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv_store
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![prefix], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_store_upsert_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("cache.db")).await.unwrap();
        store.set("cache_u_1", "{}").await.unwrap();
        store.set("cache_u_1", "{\"v\":2}").await.unwrap();
        store.set("cache_u_2", "{}").await.unwrap();
        store.set("session_token", "abc").await.unwrap();

        assert_eq!(
            store.get("cache_u_1").await.unwrap().as_deref(),
            Some("{\"v\":2}")
        );
        assert_eq!(store.scan("cache_").await.unwrap().len(), 2);

        let removed = store
            .delete(vec!["cache_u_1".to_string(), "cache_u_9".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get("cache_u_1").await.unwrap(), None);
        assert_eq!(store.get("session_token").await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_scan_prefix_is_literal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("cache.db")).await.unwrap();
        store.set("cache_a", "1").await.unwrap();
        store.set("cacheXa", "2").await.unwrap();

        let keys: Vec<String> = store
            .scan("cache_")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["cache_a".to_string()]);
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.set("cache_u_abc", "payload").await.unwrap();
            store.pool().close();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(
            store.get("cache_u_abc").await.unwrap().as_deref(),
            Some("payload")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_database_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let _store = SqliteStore::open(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
