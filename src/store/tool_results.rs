use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::error::{StoreError, ToolStoreError};
use crate::tokenize::estimate_tokens;

use super::{content_hash, deserialize_vector, now_millis, serialize_vector, ConnectionPool};

/// Default ceiling on stored results before LRU eviction.
pub const DEFAULT_RESULT_LIMIT: usize = 1_000;
/// Default TTL for stored results.
pub const DEFAULT_TTL_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// A stored tool result row.
#[derive(Debug, Clone)]
pub struct ToolResultRow {
    pub result_id: String,
    pub content_hash: String,
    pub session_id: Option<String>,
    pub tool_use_id: Option<String>,
    pub tool_name: String,
    pub full_text: String,
    pub preview_text: String,
    pub token_count: usize,
    pub metadata: Option<String>,
    pub created_at: i64,
    pub accessed_at: i64,
    pub expires_at: i64,
}

/// A chunk of a stored result, optionally embedded.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: i64,
    pub result_id: String,
    pub chunk_idx: usize,
    pub text: String,
    pub token_count: usize,
    pub vector: Option<Vec<f32>>,
    pub start_offset: usize,
    pub end_offset: usize,
}

/// A chunk joined with its parent result's routing metadata.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk: ChunkRow,
    pub tool_name: String,
    pub session_id: Option<String>,
}

/// Pending chunk produced by `chunk_text`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub token_count: usize,
}

/// What a store call needs besides the text itself.
#[derive(Debug, Clone, Default)]
pub struct NewToolResult {
    pub session_id: Option<String>,
    pub tool_use_id: Option<String>,
    pub tool_name: String,
    pub preview_text: String,
    pub metadata: Option<String>,
    pub ttl_millis: Option<i64>,
}

/// Persistent store for externalized tool results and their chunks.
#[derive(Clone)]
pub struct ToolResultStore {
    pool: ConnectionPool,
    result_limit: usize,
}

impl ToolResultStore {
    pub async fn new(pool: ConnectionPool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            result_limit: DEFAULT_RESULT_LIMIT,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn with_result_limit(mut self, limit: usize) -> Self {
        self.result_limit = limit.max(1);
        self
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.acquire().await?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tool_results (
                result_id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL UNIQUE,
                session_id TEXT,
                tool_use_id TEXT,
                tool_name TEXT NOT NULL,
                full_text TEXT NOT NULL,
                preview_text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                metadata TEXT,
                created_at INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tool_result_chunks (
                chunk_id INTEGER PRIMARY KEY,
                result_id TEXT NOT NULL
                    REFERENCES tool_results(result_id) ON DELETE CASCADE,
                chunk_idx INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                vector BLOB,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(result_id, chunk_idx)
            );

            CREATE INDEX IF NOT EXISTS idx_tool_results_tool
                ON tool_results(tool_name);
            CREATE INDEX IF NOT EXISTS idx_tool_results_session_time
                ON tool_results(session_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_tool_results_created
                ON tool_results(created_at);
            CREATE INDEX IF NOT EXISTS idx_chunks_result
                ON tool_result_chunks(result_id, chunk_idx);
            "#,
        )?;
        Ok(())
    }

    /// Store a result. Idempotent on content hash: storing text that is
    /// already present touches and returns the existing row.
    pub async fn store(
        &self,
        full_text: &str,
        meta: NewToolResult,
    ) -> Result<(ToolResultRow, bool), StoreError> {
        let hash = content_hash(full_text);
        let now = now_millis();

        let conn = self.pool.acquire().await?;
        if let Some(existing) = Self::row_by_hash(&conn, &hash)? {
            conn.execute(
                "UPDATE tool_results SET accessed_at = ?1 WHERE result_id = ?2",
                params![now, existing.result_id],
            )?;
            return Ok((existing, false));
        }

        let result_id = format!("tr_{}", &hash[..8]);
        let token_count = estimate_tokens(full_text);
        let expires_at = now + meta.ttl_millis.unwrap_or(DEFAULT_TTL_MILLIS);
        conn.execute(
            r#"
            INSERT INTO tool_results
                (result_id, content_hash, session_id, tool_use_id, tool_name,
                 full_text, preview_text, token_count, metadata,
                 created_at, accessed_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)
            "#,
            params![
                result_id,
                hash,
                meta.session_id,
                meta.tool_use_id,
                meta.tool_name,
                full_text,
                meta.preview_text,
                token_count as i64,
                meta.metadata,
                now,
                expires_at,
            ],
        )?;
        debug!(result_id = %result_id, tool = %meta.tool_name, tokens = token_count, "stored tool result");

        let row = Self::row_by_hash(&conn, &hash)?
            .ok_or_else(|| StoreError::Unavailable("row vanished after insert".into()))?;
        Ok((row, true))
    }

    /// Fetch by id, touching `accessed_at`. The typed error carries the
    /// id-shape hint for the model.
    pub async fn get(&self, result_id: &str) -> Result<ToolResultRow, ToolStoreError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(ToolStoreError::Store)?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM tool_results WHERE result_id = ?1"),
                params![result_id],
                Self::map_row,
            )
            .optional()?;

        match row {
            Some(row) => {
                conn.execute(
                    "UPDATE tool_results SET accessed_at = ?1 WHERE result_id = ?2",
                    params![now_millis(), result_id],
                )?;
                Ok(row)
            }
            None => Err(ToolStoreError::NotFound(result_id.to_string())),
        }
    }

    /// Persist chunks for a result. Existing chunks for the id are replaced.
    pub async fn insert_chunks(
        &self,
        result_id: &str,
        chunks: &[PendingChunk],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        let now = now_millis();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM tool_result_chunks WHERE result_id = ?1",
            params![result_id],
        )?;
        {
            let mut insert = tx.prepare(
                r#"
                INSERT INTO tool_result_chunks
                    (result_id, chunk_idx, text, token_count, vector,
                     start_offset, end_offset, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for (idx, chunk) in chunks.iter().enumerate() {
                let blob = vectors
                    .and_then(|vs| vs.get(idx))
                    .map(|v| serialize_vector(v));
                insert.execute(params![
                    result_id,
                    idx as i64,
                    chunk.text,
                    chunk.token_count as i64,
                    blob,
                    chunk.start_offset as i64,
                    chunk.end_offset as i64,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn chunks_for(&self, result_id: &str) -> Result<Vec<ChunkRow>, StoreError> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT chunk_id, result_id, chunk_idx, text, token_count, vector, \
             start_offset, end_offset \
             FROM tool_result_chunks WHERE result_id = ?1 ORDER BY chunk_idx",
        )?;
        let rows = stmt
            .query_map(params![result_id], Self::map_chunk)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every embedded chunk joined with its parent's routing metadata, for
    /// global semantic search.
    pub async fn all_embedded_chunks(&self) -> Result<Vec<ChunkHit>, StoreError> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT c.chunk_id, c.result_id, c.chunk_idx, c.text, c.token_count, \
             c.vector, c.start_offset, c.end_offset, r.tool_name, r.session_id \
             FROM tool_result_chunks c \
             JOIN tool_results r ON r.result_id = c.result_id \
             WHERE c.vector IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ChunkHit {
                    chunk: Self::map_chunk(row)?,
                    tool_name: row.get(8)?,
                    session_id: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop expired rows, then LRU-evict past the ceiling. Chunks cascade.
    pub async fn evict(&self) -> Result<usize, StoreError> {
        let conn = self.pool.acquire().await?;
        let now = now_millis();
        let expired = conn.execute(
            "DELETE FROM tool_results WHERE expires_at < ?1",
            params![now],
        )?;
        let over_limit = conn.execute(
            r#"
            DELETE FROM tool_results WHERE result_id NOT IN (
                SELECT result_id FROM tool_results
                ORDER BY accessed_at DESC
                LIMIT ?1
            )
            "#,
            params![self.result_limit as i64],
        )?;
        let total = expired + over_limit;
        if total > 0 {
            debug!(expired, over_limit, "evicted tool results");
        }
        Ok(total)
    }

    fn row_by_hash(
        conn: &rusqlite::Connection,
        hash: &str,
    ) -> Result<Option<ToolResultRow>, rusqlite::Error> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM tool_results WHERE content_hash = ?1"),
            params![hash],
            Self::map_row,
        )
        .optional()
    }

    fn map_row(row: &rusqlite::Row<'_>) -> Result<ToolResultRow, rusqlite::Error> {
        Ok(ToolResultRow {
            result_id: row.get(0)?,
            content_hash: row.get(1)?,
            session_id: row.get(2)?,
            tool_use_id: row.get(3)?,
            tool_name: row.get(4)?,
            full_text: row.get(5)?,
            preview_text: row.get(6)?,
            token_count: row.get::<_, i64>(7)? as usize,
            metadata: row.get(8)?,
            created_at: row.get(9)?,
            accessed_at: row.get(10)?,
            expires_at: row.get(11)?,
        })
    }

    fn map_chunk(row: &rusqlite::Row<'_>) -> Result<ChunkRow, rusqlite::Error> {
        Ok(ChunkRow {
            chunk_id: row.get(0)?,
            result_id: row.get(1)?,
            chunk_idx: row.get::<_, i64>(2)? as usize,
            text: row.get(3)?,
            token_count: row.get::<_, i64>(4)? as usize,
            vector: row
                .get::<_, Option<Vec<u8>>>(5)?
                .map(|blob| deserialize_vector(&blob)),
            start_offset: row.get::<_, i64>(6)? as usize,
            end_offset: row.get::<_, i64>(7)? as usize,
        })
    }
}

const COLUMNS: &str = "result_id, content_hash, session_id, tool_use_id, tool_name, \
     full_text, preview_text, token_count, metadata, created_at, accessed_at, expires_at";

/// Split text into ~`chunk_size`-token chunks with `overlap` tokens of
/// overlap, preferring paragraph and sentence boundaries. Offsets are byte
/// offsets into the original text, snapped to char boundaries.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<PendingChunk> {
    if text.is_empty() {
        return Vec::new();
    }
    let target_bytes = chunk_size.max(1) * 4;
    let overlap_bytes = overlap * 4;
    let len = text.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < len {
        let mut end = (start + target_bytes).min(len);
        while end < len && !text.is_char_boundary(end) {
            end += 1;
        }
        if end < len {
            end = snap_to_boundary(text, start, end);
        }

        let slice = &text[start..end];
        chunks.push(PendingChunk {
            text: slice.to_string(),
            start_offset: start,
            end_offset: end,
            token_count: estimate_tokens(slice),
        });

        if end >= len {
            break;
        }
        let mut next = end.saturating_sub(overlap_bytes).max(start + 1);
        while next < len && !text.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }
    chunks
}

/// Find the best split point in the back half of `[start, end)`: paragraph
/// break, then sentence end, then newline. Falls back to `end`.
fn snap_to_boundary(text: &str, start: usize, end: usize) -> usize {
    let window_start = start + (end - start) / 2;
    let window = &text[window_start..end];
    for pattern in ["\n\n", ". ", "\n"] {
        if let Some(pos) = window.rfind(pattern) {
            return window_start + pos + pattern.len();
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ToolResultStore {
        ToolResultStore::new(ConnectionPool::in_memory().unwrap())
            .await
            .unwrap()
    }

    fn meta(tool: &str) -> NewToolResult {
        NewToolResult {
            tool_name: tool.into(),
            preview_text: "preview".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn result_id_is_tr_plus_8_hex() {
        let s = store().await;
        let (row, created) = s.store("big output", meta("exec")).await.unwrap();
        assert!(created);
        assert!(row.result_id.starts_with("tr_"));
        assert_eq!(row.result_id.len(), 11);
        assert!(row.result_id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn same_content_returns_same_id() {
        let s = store().await;
        let (first, created1) = s.store("identical", meta("exec")).await.unwrap();
        let (second, created2) = s.store("identical", meta("browser")).await.unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(first.result_id, second.result_id);
        // Original row (and its tool name) survives.
        assert_eq!(second.tool_name, "exec");
    }

    #[tokio::test]
    async fn get_unknown_id_is_typed_not_found() {
        let s = store().await;
        let err = s.get("tr_deadbeef").await.unwrap_err();
        assert!(matches!(err, ToolStoreError::NotFound(_)));
        assert!(err.to_string().contains("tr_XXXXXXXX"));
    }

    #[tokio::test]
    async fn chunks_roundtrip_with_vectors() {
        let s = store().await;
        let (row, _) = s.store("content to chunk", meta("file_read")).await.unwrap();
        let chunks = vec![
            PendingChunk {
                text: "content to".into(),
                start_offset: 0,
                end_offset: 10,
                token_count: 2,
            },
            PendingChunk {
                text: "to chunk".into(),
                start_offset: 8,
                end_offset: 16,
                token_count: 2,
            },
        ];
        let vectors = vec![vec![1.0f32, 0.0], vec![0.0f32, 1.0]];
        s.insert_chunks(&row.result_id, &chunks, Some(&vectors))
            .await
            .unwrap();

        let loaded = s.chunks_for(&row.result_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].chunk_idx, 0);
        assert_eq!(loaded[1].chunk_idx, 1);
        assert_eq!(loaded[0].vector.as_deref(), Some(&[1.0f32, 0.0][..]));

        let hits = s.all_embedded_chunks().await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].tool_name, "file_read");
    }

    #[tokio::test]
    async fn eviction_cascades_to_chunks() {
        let s = store().await.with_result_limit(1);
        let (old, _) = s.store("first result", meta("exec")).await.unwrap();
        s.insert_chunks(
            &old.result_id,
            &[PendingChunk {
                text: "first result".into(),
                start_offset: 0,
                end_offset: 12,
                token_count: 3,
            }],
            None,
        )
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        s.store("second result", meta("exec")).await.unwrap();
        s.evict().await.unwrap();

        assert!(matches!(
            s.get(&old.result_id).await,
            Err(ToolStoreError::NotFound(_))
        ));
        assert!(s.chunks_for(&old.result_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ttl_eviction() {
        let s = store().await;
        let mut m = meta("exec");
        m.ttl_millis = Some(-1); // already expired
        s.store("stale", m).await.unwrap();
        let evicted = s.evict().await.unwrap();
        assert_eq!(evicted, 1);
    }

    #[test]
    fn chunking_covers_whole_text_with_overlap() {
        let text = "Sentence one. Sentence two is a bit longer. Sentence three here.\n\n\
                    A new paragraph starts with more content to split across chunks. "
            .repeat(20);
        let chunks = chunk_text(&text, 50, 5);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks.last().unwrap().end_offset, text.len());
        for pair in chunks.windows(2) {
            // Overlapping, ordered, dense.
            assert!(pair[1].start_offset < pair[0].end_offset);
            assert!(pair[1].end_offset > pair[0].end_offset);
        }
    }

    #[test]
    fn chunking_prefers_paragraph_boundaries() {
        let para = format!("{}\n\n{}", "alpha beta gamma. ".repeat(10), "x".repeat(400));
        let chunks = chunk_text(&para, 60, 0);
        // First chunk should end at the paragraph break, not mid-word.
        assert!(chunks[0].text.ends_with("\n\n") || chunks[0].text.ends_with(". "));
    }

    #[test]
    fn empty_text_no_chunks() {
        assert!(chunk_text("", 500, 50).is_empty());
    }
}
