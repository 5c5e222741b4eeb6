use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};

use crate::embed::cosine;
use crate::error::MemoryError;
use crate::scoring::bm25_single;
use crate::store::{content_hash, now_millis, IndexStore};

use super::types::{
    Fact, FactCategory, FactQuery, InteractionKind, NewFact, Pattern, Scope, ScoredFact,
    StoreFactOutcome, Summary,
};

/// Hybrid weights for fact retrieval.
const FACT_COSINE_WEIGHT: f32 = 0.6;
const FACT_BM25_WEIGHT: f32 = 0.4;
/// Weight applied to BM25 when no embedding is available on either side.
const BM25_ONLY_WEIGHT: f32 = 0.8;
/// Facts whose BM25 alone clears this bar are kept regardless of min_score.
const BM25_KEEP_FLOOR: f32 = 0.5;

/// Pattern confidence: starting point, per-reinforcement increment, cap.
const PATTERN_BASE_CONFIDENCE: f32 = 0.5;
const PATTERN_CONFIDENCE_STEP: f32 = 0.1;
const PATTERN_CONFIDENCE_CAP: f32 = 0.95;

/// Multi-scope persistent fact store with summaries, patterns, and an
/// append-only interaction audit. Rides the shared database pool; uses the
/// embedding cache for vectors keyed by value hash.
#[derive(Clone)]
pub struct FactStore {
    index: IndexStore,
    user_limit: usize,
    agent_limit: usize,
}

impl FactStore {
    pub async fn new(index: IndexStore) -> Result<Self, MemoryError> {
        let store = Self {
            index,
            user_limit: 1_000,
            agent_limit: 500,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn with_limits(mut self, user_limit: usize, agent_limit: usize) -> Self {
        self.user_limit = user_limit.max(1);
        self.agent_limit = agent_limit.max(1);
        self
    }

    async fn init_schema(&self) -> Result<(), MemoryError> {
        let conn = self.index.pool().acquire().await?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS facts (
                id INTEGER PRIMARY KEY,
                scope TEXT NOT NULL,
                user_id TEXT NOT NULL,
                agent_id TEXT,
                session_id TEXT,
                key TEXT,
                value TEXT NOT NULL,
                category TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                metadata TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_facts_upsert_key
                ON facts(user_id, scope, key) WHERE key IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_facts_user_scope
                ON facts(user_id, scope);
            CREATE INDEX IF NOT EXISTS idx_facts_accessed
                ON facts(last_accessed_at);

            CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                content TEXT NOT NULL,
                entities TEXT NOT NULL,
                projects TEXT NOT NULL,
                source_messages INTEGER NOT NULL,
                vector_content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_summaries_user
                ON summaries(user_id, updated_at);

            CREATE TABLE IF NOT EXISTS patterns (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                observation_count INTEGER NOT NULL,
                confidence REAL NOT NULL,
                description TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(user_id, agent_id, pattern_type)
            );

            CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY,
                fact_id INTEGER NOT NULL
                    REFERENCES facts(id) ON DELETE CASCADE,
                type TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_interactions_fact
                ON interactions(fact_id);

            CREATE TABLE IF NOT EXISTS deferred_conflicts (
                id INTEGER PRIMARY KEY,
                fact_id INTEGER NOT NULL
                    REFERENCES facts(id) ON DELETE CASCADE,
                proposed_value TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn validate(new: &NewFact) -> Result<(), MemoryError> {
        if new.user_id.is_empty() {
            return Err(MemoryError::MissingUserId);
        }
        match new.scope {
            Scope::User => {}
            Scope::Agent => {
                if new.agent_id.is_none() {
                    return Err(MemoryError::MissingAgentId(Scope::Agent));
                }
            }
            Scope::Session => {
                if new.agent_id.is_none() {
                    return Err(MemoryError::MissingAgentId(Scope::Session));
                }
                if new.session_id.is_none() {
                    return Err(MemoryError::MissingSessionId);
                }
            }
        }
        Ok(())
    }

    /// Store or upsert a fact. Keyed facts update in place (`reinforced`);
    /// unkeyed facts insert (`extracted`). A supplied embedding is persisted
    /// under the value's content hash.
    pub async fn store_fact(&self, new: NewFact) -> Result<StoreFactOutcome, MemoryError> {
        Self::validate(&new)?;
        let hash = content_hash(&new.value);
        let now = now_millis();

        let (fact_id, created) = {
            let conn = self.index.pool().acquire().await?;

            let existing: Option<i64> = match &new.key {
                Some(key) => conn
                    .query_row(
                        "SELECT id FROM facts \
                         WHERE user_id = ?1 AND scope = ?2 AND key = ?3",
                        params![new.user_id, new.scope.as_str(), key],
                        |row| row.get(0),
                    )
                    .optional()?,
                None => None,
            };

            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE facts SET value = ?1, category = ?2, content_hash = ?3, \
                         updated_at = ?4, last_accessed_at = ?4, metadata = ?5 \
                         WHERE id = ?6",
                        params![
                            new.value,
                            new.category.as_str(),
                            hash,
                            now,
                            new.metadata,
                            id
                        ],
                    )?;
                    Self::log_interaction(&conn, id, InteractionKind::Reinforced)?;
                    (id, false)
                }
                None => {
                    conn.execute(
                        r#"
                        INSERT INTO facts
                            (scope, user_id, agent_id, session_id, key, value, category,
                             content_hash, created_at, updated_at, last_accessed_at, metadata)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?9, ?10)
                        "#,
                        params![
                            new.scope.as_str(),
                            new.user_id,
                            new.agent_id,
                            new.session_id,
                            new.key,
                            new.value,
                            new.category.as_str(),
                            hash,
                            now,
                            new.metadata,
                        ],
                    )?;
                    let id = conn.last_insert_rowid();
                    Self::log_interaction(&conn, id, InteractionKind::Extracted)?;
                    (id, true)
                }
            }
        };

        let embedding_stored = match &new.embedding {
            Some(vector) => {
                self.index.set_embedding_by_hash(&hash, vector).await?;
                true
            }
            None => false,
        };

        debug!(fact_id, created, category = new.category.as_str(), "stored fact");
        Ok(StoreFactOutcome {
            fact_id,
            created,
            embedding_stored,
        })
    }

    /// Retrieve facts visible to the caller, ranked by hybrid score.
    ///
    /// Visibility: user-scope rows are visible to every agent of the user;
    /// agent-scope rows only to the same agent; session-scope rows require
    /// the same agent and session.
    pub async fn retrieve_facts(&self, q: FactQuery) -> Result<Vec<ScoredFact>, MemoryError> {
        if q.user_id.is_empty() {
            return Err(MemoryError::MissingUserId);
        }

        let rows = self.visible_facts(&q).await?;
        let mut scored = Vec::with_capacity(rows.len());
        for (fact, vector) in rows {
            let bm25 = bm25_single(&q.query, &fact.value);
            let score = match (&q.query_embedding, &vector) {
                (Some(qv), Some(fv)) => {
                    FACT_COSINE_WEIGHT * cosine(qv, fv) + FACT_BM25_WEIGHT * bm25
                }
                _ => BM25_ONLY_WEIGHT * bm25,
            };
            if score >= q.min_score || bm25 > BM25_KEEP_FLOOR {
                scored.push((ScoredFact { fact, score }, bm25));
            }
        }

        scored.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Top-K by score, but BM25-floor survivors always ride along.
        let mut out: Vec<ScoredFact> = Vec::new();
        for (sf, bm25) in scored {
            if out.len() < q.top_k || bm25 > BM25_KEEP_FLOOR {
                out.push(sf);
            }
        }

        if !out.is_empty() {
            let conn = self.index.pool().acquire().await?;
            let now = now_millis();
            for sf in &out {
                conn.execute(
                    "UPDATE facts SET last_accessed_at = ?1 WHERE id = ?2",
                    params![now, sf.fact.id],
                )?;
                Self::log_interaction(&conn, sf.fact.id, InteractionKind::Retrieved)?;
            }
        }

        Ok(out)
    }

    /// SQL-filtered candidate rows joined with their value embeddings.
    async fn visible_facts(
        &self,
        q: &FactQuery,
    ) -> Result<Vec<(Fact, Option<Vec<f32>>)>, MemoryError> {
        let mut sql = String::from(
            "SELECT f.id, f.scope, f.user_id, f.agent_id, f.session_id, f.key, f.value, \
             f.category, f.content_hash, f.created_at, f.updated_at, f.last_accessed_at, \
             f.metadata, e.vector \
             FROM facts f \
             LEFT JOIN embeddings e ON e.content_hash = f.content_hash \
             WHERE f.user_id = ?1 AND (f.scope = 'user'",
        );
        let agent = q.agent_id.clone().unwrap_or_default();
        let session = q.session_id.clone().unwrap_or_default();
        sql.push_str(" OR (f.scope = 'agent' AND f.agent_id = ?2)");
        sql.push_str(" OR (f.scope = 'session' AND f.agent_id = ?2 AND f.session_id = ?3))");

        if let Some(scopes) = &q.scopes {
            let list: Vec<String> = scopes
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect();
            sql.push_str(&format!(" AND f.scope IN ({})", list.join(",")));
        }
        if let Some(categories) = &q.categories {
            let list: Vec<String> = categories
                .iter()
                .map(|c| format!("'{}'", c.as_str()))
                .collect();
            sql.push_str(&format!(" AND f.category IN ({})", list.join(",")));
        }

        let conn = self.index.pool().acquire().await?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MemoryError::RetrievalFailed(e.to_string()))?;
        let rows = stmt
            .query_map(params![q.user_id, agent, session], |row| {
                let fact = Self::map_fact(row)?;
                let vector: Option<Vec<u8>> = row.get(13)?;
                Ok((fact, vector.map(|b| crate::store::deserialize_vector(&b))))
            })
            .map_err(|e| MemoryError::RetrievalFailed(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MemoryError::RetrievalFailed(e.to_string()))?;
        Ok(rows)
    }

    pub async fn get_fact(&self, fact_id: i64) -> Result<Option<Fact>, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let fact = conn
            .query_row(
                "SELECT id, scope, user_id, agent_id, session_id, key, value, category, \
                 content_hash, created_at, updated_at, last_accessed_at, metadata \
                 FROM facts WHERE id = ?1",
                params![fact_id],
                Self::map_fact,
            )
            .optional()?;
        Ok(fact)
    }

    /// Replace a fact's value in place, logging a `corrected` interaction.
    pub async fn correct_fact(&self, fact_id: i64, new_value: &str) -> Result<(), MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let now = now_millis();
        let changed = conn.execute(
            "UPDATE facts SET value = ?1, content_hash = ?2, updated_at = ?3 WHERE id = ?4",
            params![new_value, content_hash(new_value), now, fact_id],
        )?;
        if changed == 0 {
            return Err(MemoryError::StorageFailed(format!(
                "no fact with id {fact_id}"
            )));
        }
        Self::log_interaction(&conn, fact_id, InteractionKind::Corrected)?;
        Ok(())
    }

    /// Delete one fact. Interactions cascade.
    pub async fn delete_fact(&self, fact_id: i64) -> Result<(), MemoryError> {
        let conn = self.index.pool().acquire().await?;
        Self::log_interaction(&conn, fact_id, InteractionKind::Deleted)?;
        conn.execute("DELETE FROM facts WHERE id = ?1", params![fact_id])?;
        Ok(())
    }

    // --- Patterns ---

    /// Upsert on `(user, agent, pattern_type)`. Repeat observations bump
    /// the count and grow confidence by a fixed step, capped.
    pub async fn store_pattern(
        &self,
        user_id: &str,
        agent_id: &str,
        pattern_type: &str,
        description: &str,
    ) -> Result<Pattern, MemoryError> {
        if user_id.is_empty() {
            return Err(MemoryError::MissingUserId);
        }
        let conn = self.index.pool().acquire().await?;
        let now = now_millis();
        conn.execute(
            r#"
            INSERT INTO patterns
                (user_id, agent_id, pattern_type, observation_count, confidence,
                 description, created_at, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?6)
            ON CONFLICT(user_id, agent_id, pattern_type) DO UPDATE SET
                observation_count = observation_count + 1,
                confidence = MIN(confidence + ?7, ?8),
                description = excluded.description,
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                agent_id,
                pattern_type,
                PATTERN_BASE_CONFIDENCE as f64,
                description,
                now,
                PATTERN_CONFIDENCE_STEP as f64,
                PATTERN_CONFIDENCE_CAP as f64,
            ],
        )?;

        let pattern = conn.query_row(
            "SELECT id, user_id, agent_id, pattern_type, observation_count, confidence, \
             description, created_at, updated_at \
             FROM patterns WHERE user_id = ?1 AND agent_id = ?2 AND pattern_type = ?3",
            params![user_id, agent_id, pattern_type],
            Self::map_pattern,
        )?;
        Ok(pattern)
    }

    pub async fn retrieve_patterns(
        &self,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Vec<Pattern>, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, agent_id, pattern_type, observation_count, confidence, \
             description, created_at, updated_at \
             FROM patterns WHERE user_id = ?1 AND agent_id = ?2 \
             ORDER BY confidence DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id, agent_id], Self::map_pattern)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Summaries ---

    /// Insert a summary, or merge into an existing one whose topic embeds
    /// within `dedup_threshold`. Merging extends content, unions entities
    /// and projects, and accumulates the source-message count.
    pub async fn store_summary(
        &self,
        user_id: &str,
        topic: &str,
        content: &str,
        entities: &[String],
        projects: &[String],
        source_messages: usize,
        topic_embedding: Option<&[f32]>,
        dedup_threshold: f32,
    ) -> Result<(i64, bool), MemoryError> {
        if user_id.is_empty() {
            return Err(MemoryError::MissingUserId);
        }
        let topic_hash = content_hash(topic);
        if let Some(vector) = topic_embedding {
            self.index.set_embedding_by_hash(&topic_hash, vector).await?;
        }

        // Dedup pass: compare against stored topic embeddings.
        if let Some(new_vec) = topic_embedding {
            let existing = self.summaries_for(user_id).await?;
            for summary in existing {
                let Some(stored_vec) = self
                    .index
                    .get_embedding_by_hash(&summary.vector_content_hash)
                    .await?
                else {
                    continue;
                };
                if cosine(new_vec, &stored_vec) >= dedup_threshold {
                    self.merge_summary(&summary, content, entities, projects, source_messages)
                        .await?;
                    info!(summary_id = summary.id, topic = %summary.topic, "merged summary");
                    return Ok((summary.id, true));
                }
            }
        }

        let conn = self.index.pool().acquire().await?;
        let now = now_millis();
        conn.execute(
            r#"
            INSERT INTO summaries
                (user_id, topic, content, entities, projects, source_messages,
                 vector_content_hash, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
            params![
                user_id,
                topic,
                content,
                serde_json::to_string(entities).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(projects).unwrap_or_else(|_| "[]".into()),
                source_messages as i64,
                topic_hash,
                now,
            ],
        )?;
        Ok((conn.last_insert_rowid(), false))
    }

    async fn merge_summary(
        &self,
        existing: &Summary,
        content: &str,
        entities: &[String],
        projects: &[String],
        source_messages: usize,
    ) -> Result<(), MemoryError> {
        let mut merged_entities = existing.entities.clone();
        for e in entities {
            if !merged_entities.contains(e) {
                merged_entities.push(e.clone());
            }
        }
        let mut merged_projects = existing.projects.clone();
        for p in projects {
            if !merged_projects.contains(p) {
                merged_projects.push(p.clone());
            }
        }
        let merged_content = format!("{}\n{}", existing.content, content);

        let conn = self.index.pool().acquire().await?;
        conn.execute(
            "UPDATE summaries SET content = ?1, entities = ?2, projects = ?3, \
             source_messages = source_messages + ?4, updated_at = ?5 WHERE id = ?6",
            params![
                merged_content,
                serde_json::to_string(&merged_entities).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&merged_projects).unwrap_or_else(|_| "[]".into()),
                source_messages as i64,
                now_millis(),
                existing.id,
            ],
        )?;
        Ok(())
    }

    pub async fn summaries_for(&self, user_id: &str) -> Result<Vec<Summary>, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, topic, content, entities, projects, source_messages, \
             vector_content_hash, created_at, updated_at \
             FROM summaries WHERE user_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id], Self::map_summary)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Lifecycle ---

    /// GDPR wipe: remove every row referencing the user.
    pub async fn forget_all(&self, user_id: &str) -> Result<(), MemoryError> {
        if user_id.is_empty() {
            return Err(MemoryError::MissingUserId);
        }
        let conn = self.index.pool().acquire().await?;
        let facts = conn.execute("DELETE FROM facts WHERE user_id = ?1", params![user_id])?;
        let patterns = conn.execute("DELETE FROM patterns WHERE user_id = ?1", params![user_id])?;
        let summaries =
            conn.execute("DELETE FROM summaries WHERE user_id = ?1", params![user_id])?;
        info!(user = user_id, facts, patterns, summaries, "forgot user data");
        Ok(())
    }

    /// Drop session-scoped facts when a session ends.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<usize, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let deleted = conn.execute(
            "DELETE FROM facts WHERE scope = 'session' AND session_id = ?1",
            params![session_id],
        )?;
        Ok(deleted)
    }

    /// Scope-bounded LRU: keep the `limit` most recently accessed facts in
    /// a scope, delete the rest.
    pub async fn cleanup_old_facts(
        &self,
        scope: Scope,
        limit: usize,
    ) -> Result<usize, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let deleted = conn.execute(
            r#"
            DELETE FROM facts WHERE scope = ?1 AND id NOT IN (
                SELECT id FROM facts WHERE scope = ?1
                ORDER BY last_accessed_at DESC
                LIMIT ?2
            )
            "#,
            params![scope.as_str(), limit as i64],
        )?;
        if deleted > 0 {
            warn!(scope = scope.as_str(), deleted, "evicted facts over scope limit");
        }
        Ok(deleted)
    }

    /// Apply the configured per-scope ceilings.
    pub async fn enforce_limits(&self) -> Result<(), MemoryError> {
        self.cleanup_old_facts(Scope::User, self.user_limit).await?;
        self.cleanup_old_facts(Scope::Agent, self.agent_limit).await?;
        Ok(())
    }

    /// Trim audit rows older than the cutoff.
    pub async fn cleanup_interactions(&self, older_than_millis: i64) -> Result<usize, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let deleted = conn.execute(
            "DELETE FROM interactions WHERE timestamp < ?1",
            params![older_than_millis],
        )?;
        Ok(deleted)
    }

    /// Audit rows for a fact, oldest first. Test and debugging surface.
    pub async fn interactions_for(
        &self,
        fact_id: i64,
    ) -> Result<Vec<(InteractionKind, i64)>, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT type, timestamp FROM interactions WHERE fact_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![fact_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(kind, ts)| {
                let kind = match kind.as_str() {
                    "extracted" => InteractionKind::Extracted,
                    "retrieved" => InteractionKind::Retrieved,
                    "reinforced" => InteractionKind::Reinforced,
                    "corrected" => InteractionKind::Corrected,
                    "deleted" => InteractionKind::Deleted,
                    _ => return None,
                };
                Some((kind, ts))
            })
            .collect())
    }

    /// Park a contested update without touching the live fact.
    pub async fn defer_conflict(
        &self,
        fact_id: i64,
        proposed_value: &str,
        reason: &str,
    ) -> Result<(), MemoryError> {
        let conn = self.index.pool().acquire().await?;
        conn.execute(
            "INSERT INTO deferred_conflicts (fact_id, proposed_value, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![fact_id, proposed_value, reason, now_millis()],
        )?;
        Ok(())
    }

    /// Parked conflicts for a fact, oldest first.
    pub async fn deferred_conflicts(
        &self,
        fact_id: i64,
    ) -> Result<Vec<(String, String)>, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT proposed_value, reason FROM deferred_conflicts \
             WHERE fact_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![fact_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn count_facts(&self, user_id: &str) -> Result<usize, MemoryError> {
        let conn = self.index.pool().acquire().await?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    fn log_interaction(
        conn: &rusqlite::Connection,
        fact_id: i64,
        kind: InteractionKind,
    ) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT INTO interactions (fact_id, type, timestamp) VALUES (?1, ?2, ?3)",
            params![fact_id, kind.as_str(), now_millis()],
        )?;
        Ok(())
    }

    fn map_fact(row: &rusqlite::Row<'_>) -> Result<Fact, rusqlite::Error> {
        let scope_str: String = row.get(1)?;
        let category_str: String = row.get(7)?;
        Ok(Fact {
            id: row.get(0)?,
            scope: Scope::parse(&scope_str).unwrap_or(Scope::User),
            user_id: row.get(2)?,
            agent_id: row.get(3)?,
            session_id: row.get(4)?,
            key: row.get(5)?,
            value: row.get(6)?,
            category: FactCategory::parse_lenient(&category_str)
                .unwrap_or(FactCategory::System),
            content_hash: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            last_accessed_at: row.get(11)?,
            metadata: row.get(12)?,
        })
    }

    fn map_pattern(row: &rusqlite::Row<'_>) -> Result<Pattern, rusqlite::Error> {
        Ok(Pattern {
            id: row.get(0)?,
            user_id: row.get(1)?,
            agent_id: row.get(2)?,
            pattern_type: row.get(3)?,
            observation_count: row.get::<_, i64>(4)? as u32,
            confidence: row.get::<_, f64>(5)? as f32,
            description: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn map_summary(row: &rusqlite::Row<'_>) -> Result<Summary, rusqlite::Error> {
        let entities: String = row.get(4)?;
        let projects: String = row.get(5)?;
        Ok(Summary {
            id: row.get(0)?,
            user_id: row.get(1)?,
            topic: row.get(2)?,
            content: row.get(3)?,
            entities: serde_json::from_str(&entities).unwrap_or_default(),
            projects: serde_json::from_str(&projects).unwrap_or_default(),
            source_messages: row.get::<_, i64>(6)? as usize,
            vector_content_hash: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> FactStore {
        FactStore::new(IndexStore::in_memory().await.unwrap())
            .await
            .unwrap()
    }

    fn pref(user: &str, value: &str) -> NewFact {
        NewFact::user_scoped(user, value, FactCategory::Preference)
    }

    #[tokio::test]
    async fn missing_user_id_rejected() {
        let s = store().await;
        let err = s.store_fact(pref("", "anything")).await.unwrap_err();
        assert!(matches!(err, MemoryError::MissingUserId));
    }

    #[tokio::test]
    async fn agent_scope_requires_agent_id() {
        let s = store().await;
        let mut fact = pref("u1", "v");
        fact.scope = Scope::Agent;
        assert!(matches!(
            s.store_fact(fact).await.unwrap_err(),
            MemoryError::MissingAgentId(Scope::Agent)
        ));
    }

    #[tokio::test]
    async fn session_scope_requires_session_id() {
        let s = store().await;
        let mut fact = pref("u1", "v");
        fact.scope = Scope::Session;
        fact.agent_id = Some("a1".into());
        assert!(matches!(
            s.store_fact(fact).await.unwrap_err(),
            MemoryError::MissingSessionId
        ));
    }

    #[tokio::test]
    async fn keyed_fact_upserts_in_place() {
        let s = store().await;
        let mut first = pref("u1", "prefers dark mode");
        first.key = Some("ui_theme".into());
        let out1 = s.store_fact(first.clone()).await.unwrap();
        assert!(out1.created);

        let mut second = first.clone();
        second.value = "prefers light mode".into();
        let out2 = s.store_fact(second).await.unwrap();
        assert!(!out2.created);
        assert_eq!(out1.fact_id, out2.fact_id);

        let fact = s.get_fact(out1.fact_id).await.unwrap().unwrap();
        assert_eq!(fact.value, "prefers light mode");

        let log = s.interactions_for(out1.fact_id).await.unwrap();
        let kinds: Vec<InteractionKind> = log.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![InteractionKind::Extracted, InteractionKind::Reinforced]
        );
    }

    #[tokio::test]
    async fn agent_scoped_facts_invisible_to_other_agents() {
        let s = store().await;
        let mut fact = pref("u1", "agent one owns this note");
        fact.scope = Scope::Agent;
        fact.agent_id = Some("agent-1".into());
        s.store_fact(fact).await.unwrap();

        let mut q = FactQuery::new("u1", "note");
        q.agent_id = Some("agent-2".into());
        assert!(s.retrieve_facts(q).await.unwrap().is_empty());

        let mut q = FactQuery::new("u1", "agent owns note");
        q.agent_id = Some("agent-1".into());
        assert_eq!(s.retrieve_facts(q).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn user_scope_visible_to_all_agents() {
        let s = store().await;
        s.store_fact(pref("u1", "the user prefers rust for tooling"))
            .await
            .unwrap();
        let mut q = FactQuery::new("u1", "prefers rust tooling");
        q.agent_id = Some("any-agent".into());
        assert_eq!(s.retrieve_facts(q).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retrieval_logs_and_touches() {
        let s = store().await;
        let out = s
            .store_fact(pref("u1", "database pool size is three"))
            .await
            .unwrap();
        let q = FactQuery::new("u1", "database pool size");
        let hits = s.retrieve_facts(q).await.unwrap();
        assert_eq!(hits.len(), 1);

        let log = s.interactions_for(out.fact_id).await.unwrap();
        assert!(log
            .iter()
            .any(|(k, _)| *k == InteractionKind::Retrieved));
    }

    #[tokio::test]
    async fn hybrid_score_uses_embeddings_when_present() {
        let s = store().await;
        let mut with_vec = pref("u1", "loves functional programming");
        with_vec.embedding = Some(vec![1.0, 0.0, 0.0]);
        let out = s.store_fact(with_vec).await.unwrap();
        assert!(out.embedding_stored);

        let mut q = FactQuery::new("u1", "unrelated words entirely");
        q.query_embedding = Some(vec![1.0, 0.0, 0.0]);
        q.min_score = 0.5;
        let hits = s.retrieve_facts(q).await.unwrap();
        // BM25 is ~0 but cosine is 1.0: 0.6 * 1.0 >= 0.5.
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score >= 0.5);
    }

    #[tokio::test]
    async fn pattern_confidence_grows_and_caps() {
        let s = store().await;
        let mut last = s
            .store_pattern("u1", "a1", "commit_style", "prefers small commits")
            .await
            .unwrap();
        assert_eq!(last.observation_count, 1);
        for _ in 0..10 {
            last = s
                .store_pattern("u1", "a1", "commit_style", "prefers small commits")
                .await
                .unwrap();
        }
        assert_eq!(last.observation_count, 11);
        assert!(last.confidence <= PATTERN_CONFIDENCE_CAP + 1e-6);
        assert!((last.confidence - PATTERN_CONFIDENCE_CAP).abs() < 1e-6);
    }

    #[tokio::test]
    async fn summary_dedup_merges_similar_topics() {
        let s = store().await;
        let vec_a = vec![1.0f32, 0.0];
        let (id1, merged1) = s
            .store_summary(
                "u1",
                "database configuration",
                "Discussed pool sizing.",
                &["postgres".into()],
                &["infra".into()],
                4,
                Some(&vec_a),
                0.85,
            )
            .await
            .unwrap();
        assert!(!merged1);

        let near = vec![0.99f32, 0.05];
        let (id2, merged2) = s
            .store_summary(
                "u1",
                "configuring the database",
                "Settled on three connections.",
                &["postgres".into(), "sqlite".into()],
                &[],
                2,
                Some(&near),
                0.85,
            )
            .await
            .unwrap();
        assert!(merged2);
        assert_eq!(id1, id2);

        let all = s.summaries_for("u1").await.unwrap();
        assert_eq!(all.len(), 1);
        let merged = &all[0];
        assert!(merged.content.contains("pool sizing"));
        assert!(merged.content.contains("three connections"));
        assert_eq!(merged.entities, vec!["postgres", "sqlite"]);
        assert_eq!(merged.source_messages, 6);
    }

    #[tokio::test]
    async fn forget_all_removes_everything() {
        let s = store().await;
        let out = s.store_fact(pref("u1", "something")).await.unwrap();
        s.store_pattern("u1", "a1", "t", "d").await.unwrap();
        s.store_summary("u1", "topic", "content", &[], &[], 1, None, 0.85)
            .await
            .unwrap();

        s.forget_all("u1").await.unwrap();

        assert_eq!(s.count_facts("u1").await.unwrap(), 0);
        assert!(s.retrieve_patterns("u1", "a1").await.unwrap().is_empty());
        assert!(s.summaries_for("u1").await.unwrap().is_empty());
        // Interactions cascade with the fact rows.
        assert!(s.interactions_for(out.fact_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_cleanup_scoped_only() {
        let s = store().await;
        let mut session_fact = pref("u1", "scratch note");
        session_fact.scope = Scope::Session;
        session_fact.agent_id = Some("a1".into());
        session_fact.session_id = Some("s1".into());
        s.store_fact(session_fact).await.unwrap();
        s.store_fact(pref("u1", "durable note")).await.unwrap();

        assert_eq!(s.cleanup_session("s1").await.unwrap(), 1);
        assert_eq!(s.count_facts("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scope_lru_ceiling() {
        let s = store().await;
        for i in 0..5 {
            s.store_fact(pref("u1", &format!("fact number {i}")))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }
        let deleted = s.cleanup_old_facts(Scope::User, 2).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(s.count_facts("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn correction_replaces_value_and_logs() {
        let s = store().await;
        let out = s.store_fact(pref("u1", "prefers dark mode")).await.unwrap();
        s.correct_fact(out.fact_id, "prefers light mode")
            .await
            .unwrap();
        let fact = s.get_fact(out.fact_id).await.unwrap().unwrap();
        assert_eq!(fact.value, "prefers light mode");
        let log = s.interactions_for(out.fact_id).await.unwrap();
        assert!(log.iter().any(|(k, _)| *k == InteractionKind::Corrected));
    }
}
