use rusqlite::params;
use tracing::debug;

use crate::error::StoreError;

use super::{now_millis, ConnectionPool};

/// Full-text message index over FTS5. Strictly a latency optimization:
/// callers treat every failure as "no pre-filtering" and move on.
#[derive(Clone)]
pub struct FtsIndex {
    pool: ConnectionPool,
}

impl FtsIndex {
    pub async fn new(pool: ConnectionPool) -> Result<Self, StoreError> {
        let index = Self { pool };
        index.init_schema().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.acquire().await?;
        conn.execute_batch(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                message_id UNINDEXED,
                content,
                tokenize = 'unicode61'
            );
            "#,
        )?;
        Ok(())
    }

    /// Bulk-index messages inside one transaction. Ids already present are
    /// skipped, so re-indexing the same transcript is idempotent.
    pub async fn index_messages(&self, entries: &[(String, String)]) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut exists = tx.prepare(
                "SELECT COUNT(*) FROM messages_fts WHERE message_id = ?1",
            )?;
            let mut insert =
                tx.prepare("INSERT INTO messages_fts (message_id, content) VALUES (?1, ?2)")?;
            for (id, content) in entries {
                let present: i64 = exists.query_row(params![id], |row| row.get(0))?;
                if present == 0 {
                    insert.execute(params![id, content])?;
                    inserted += 1;
                }
            }
        }
        tx.commit()?;
        debug!(inserted, total = entries.len(), "indexed messages for FTS");
        Ok(inserted)
    }

    /// MATCH query. Returns `(message_id, rank)` with the best match first
    /// (FTS5 rank is more negative for better matches, so ascending order).
    pub async fn search(
        &self,
        match_expr: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT message_id, rank FROM messages_fts WHERE messages_fts MATCH ?1 \
             ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![match_expr, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Synthetic id for messages the host did not label. Carries a
    /// timestamp, so id-less messages do not deduplicate across runs.
    pub fn synthetic_id(index: usize) -> String {
        format!("msg_{}_{}", now_millis(), index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn index() -> FtsIndex {
        FtsIndex::new(ConnectionPool::in_memory().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn match_returns_ranked_ids() {
        let fts = index().await;
        fts.index_messages(&[
            ("m1".into(), "the database connection pool is configured".into()),
            ("m2".into(), "weather is sunny today".into()),
            ("m3".into(), "database migrations and the connection settings".into()),
        ])
        .await
        .unwrap();

        let hits = fts.search("database AND connection", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"m1"));
        assert!(ids.contains(&"m3"));
        assert!(!ids.contains(&"m2"));
    }

    #[tokio::test]
    async fn reindexing_same_ids_is_idempotent() {
        let fts = index().await;
        let entries = vec![("m1".to_string(), "hello world".to_string())];
        assert_eq!(fts.index_messages(&entries).await.unwrap(), 1);
        assert_eq!(fts.index_messages(&entries).await.unwrap(), 0);

        let hits = fts.search("hello", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn prefix_queries_work() {
        let fts = index().await;
        fts.index_messages(&[("m1".into(), "configuring the tokenizer".into())])
            .await
            .unwrap();
        let hits = fts.search("config*", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn synthetic_ids_are_unique_per_index() {
        assert_ne!(FtsIndex::synthetic_id(0), FtsIndex::synthetic_id(1));
    }
}
