pub mod fts;
pub mod pool;
pub mod tool_results;

use std::path::{Path, PathBuf};

use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::StoreError;

pub use fts::FtsIndex;
pub use pool::{ConnectionPool, PooledConnection};
pub use tool_results::{ChunkRow, ToolResultRow, ToolResultStore};

/// Default ceiling for the embedding cache.
pub const DEFAULT_CACHE_LIMIT: usize = 10_000;
/// Default handle cap for the connection pool.
pub const DEFAULT_POOL_SIZE: usize = 3;

/// 32-hex-char SHA-256 prefix over a canonicalized string. The fingerprint
/// key used by the embedding cache, tool-result dedup, and fact hashing.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Epoch millis, the timestamp unit for every table.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// f32 slice -> little-endian blob.
pub fn serialize_vector(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Little-endian blob -> f32 vector. Trailing partial floats are dropped.
pub fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Default database location under the user config directory.
pub fn default_db_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("context-sieve")
        .join("index.db")
}

/// Row counts for observability.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub embeddings: usize,
    pub tool_results: usize,
    pub tool_result_chunks: usize,
}

/// The embedding cache and shared database handle pool. Other stores
/// (facts, FTS, tool results) ride the same pool and own their own tables.
#[derive(Clone)]
pub struct IndexStore {
    pool: ConnectionPool,
    cache_limit: usize,
}

impl IndexStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let pool = ConnectionPool::open(path, DEFAULT_POOL_SIZE)?;
        let store = Self {
            pool,
            cache_limit: DEFAULT_CACHE_LIMIT,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "opened index store");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = ConnectionPool::in_memory()?;
        let store = Self {
            pool,
            cache_limit: DEFAULT_CACHE_LIMIT,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn with_cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = limit.max(1);
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Idempotent schema creation for the embedding cache.
    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.acquire().await?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                content_hash TEXT PRIMARY KEY,
                vector BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_accessed
                ON embeddings(accessed_at);
            CREATE INDEX IF NOT EXISTS idx_embeddings_accessed_hash
                ON embeddings(accessed_at, content_hash);
            "#,
        )?;
        Ok(())
    }

    /// Cache read. Touches `accessed_at`; misses return None.
    pub async fn get_embedding(&self, content: &str) -> Result<Option<Vec<f32>>, StoreError> {
        let hash = content_hash(content);
        let conn = self.pool.acquire().await?;
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embeddings WHERE content_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(blob) = row {
            conn.execute(
                "UPDATE embeddings SET accessed_at = ?1 WHERE content_hash = ?2",
                params![now_millis(), hash],
            )?;
            Ok(Some(deserialize_vector(&blob)))
        } else {
            Ok(None)
        }
    }

    /// Cache write. Upserts by hash and stamps both timestamps.
    pub async fn set_embedding(&self, content: &str, vector: &[f32]) -> Result<(), StoreError> {
        let hash = content_hash(content);
        let now = now_millis();
        let conn = self.pool.acquire().await?;
        conn.execute(
            r#"
            INSERT INTO embeddings (content_hash, vector, created_at, accessed_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(content_hash)
            DO UPDATE SET vector = excluded.vector, accessed_at = excluded.accessed_at
            "#,
            params![hash, serialize_vector(vector), now],
        )?;
        Ok(())
    }

    /// Store a vector under a precomputed hash (fact values hash their own
    /// content; the caller already knows the key).
    pub async fn set_embedding_by_hash(
        &self,
        hash: &str,
        vector: &[f32],
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let conn = self.pool.acquire().await?;
        conn.execute(
            r#"
            INSERT INTO embeddings (content_hash, vector, created_at, accessed_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(content_hash)
            DO UPDATE SET vector = excluded.vector, accessed_at = excluded.accessed_at
            "#,
            params![hash, serialize_vector(vector), now],
        )?;
        Ok(())
    }

    pub async fn get_embedding_by_hash(&self, hash: &str) -> Result<Option<Vec<f32>>, StoreError> {
        let conn = self.pool.acquire().await?;
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embeddings WHERE content_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        if row.is_some() {
            conn.execute(
                "UPDATE embeddings SET accessed_at = ?1 WHERE content_hash = ?2",
                params![now_millis(), hash],
            )?;
        }
        Ok(row.map(|blob| deserialize_vector(&blob)))
    }

    /// LRU eviction: keep only the top `cache_limit` rows by `accessed_at`.
    pub async fn evict_lru(&self) -> Result<usize, StoreError> {
        let conn = self.pool.acquire().await?;
        let deleted = conn.execute(
            r#"
            DELETE FROM embeddings WHERE content_hash NOT IN (
                SELECT content_hash FROM embeddings
                ORDER BY accessed_at DESC
                LIMIT ?1
            )
            "#,
            params![self.cache_limit as i64],
        )?;
        if deleted > 0 {
            debug!(deleted, limit = self.cache_limit, "evicted LRU embeddings");
        }
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.pool.acquire().await?;
        let count = |table: &str| -> Result<usize, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
        };
        Ok(StoreStats {
            embeddings: count("embeddings")?,
            tool_results: count("tool_results").unwrap_or(0),
            tool_result_chunks: count("tool_result_chunks").unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_32_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 32);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello "));
    }

    #[test]
    fn vector_blob_roundtrip() {
        let v = vec![0.0f32, -1.5, 3.25, f32::MAX, f32::MIN_POSITIVE];
        assert_eq!(deserialize_vector(&serialize_vector(&v)), v);
    }

    #[tokio::test]
    async fn set_then_get_returns_vector() {
        let store = IndexStore::in_memory().await.unwrap();
        let v = vec![1.0f32, 2.0, 3.0];
        store.set_embedding("some content", &v).await.unwrap();
        assert_eq!(store.get_embedding("some content").await.unwrap(), Some(v));
        assert_eq!(store.get_embedding("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn accessed_at_never_precedes_created_at() {
        let store = IndexStore::in_memory().await.unwrap();
        store.set_embedding("c", &[1.0]).await.unwrap();
        store.get_embedding("c").await.unwrap();

        let conn = store.pool.acquire().await.unwrap();
        let (created, accessed): (i64, i64) = conn
            .query_row(
                "SELECT created_at, accessed_at FROM embeddings",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(accessed >= created);
    }

    #[tokio::test]
    async fn lru_eviction_keeps_recently_read() {
        let store = IndexStore::in_memory().await.unwrap().with_cache_limit(2);
        store.set_embedding("a", &[1.0]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.set_embedding("b", &[2.0]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.set_embedding("c", &[3.0]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Read "a" so it is fresher than "b".
        store.get_embedding("a").await.unwrap();

        let evicted = store.evict_lru().await.unwrap();
        assert_eq!(evicted, 1);
        assert!(store.get_embedding("a").await.unwrap().is_some());
        assert!(store.get_embedding("b").await.unwrap().is_none());
        assert!(store.get_embedding("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_counts_rows() {
        let store = IndexStore::in_memory().await.unwrap();
        store.set_embedding("one", &[1.0]).await.unwrap();
        store.set_embedding("two", &[2.0]).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.embeddings, 2);
    }
}
