use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::StorageMode;
use crate::embed::Embedder;
use crate::llm::LlmClient;
use crate::store::now_millis;
use crate::types::{HookContext, Message, Role};

use super::conflict::ConflictResolver;
use super::parse::{parse_extraction, RawFact};
use super::store::FactStore;
use super::types::{FactCategory, NewFact, Scope};

/// Buffered messages below this length carry no extractable signal.
const MIN_MESSAGE_LEN: usize = 10;
/// Per-message content cap in the extraction prompt.
const PROMPT_MESSAGE_CAP: usize = 1_000;
/// Extract when the buffer is non-empty and this much time has passed.
const EXTRACTION_INTERVAL_MILLIS: i64 = 30_000;
/// Facts longer than this are truncated at validation.
const MAX_FACT_LEN: usize = 200;

const EXTRACTION_SYSTEM: &str = "You extract durable knowledge from conversation \
transcripts. Reply with JSON only, in this shape:\n\
{\"facts\": [{\"fact\": string, \"category\": \"preference\" | \"decision\" | \
\"project\" | \"system\" | \"error_pattern\" | \"personal\" | \"workflow\", \
\"confidence\": number, \"source_context\": string}], \
\"summary\": {\"topic\": string, \"content\": string, \
\"entities\": [string], \"projects\": [string]}}\n\
Extract only facts worth remembering across sessions. One summary for the batch.";

struct SessionState {
    buffer: Vec<BufferedMessage>,
    user_id: Option<String>,
    agent_id: Option<String>,
    last_extraction: i64,
    last_touched: i64,
}

struct BufferedMessage {
    role: Role,
    text: String,
}

/// What one extraction pass did. Test and logging surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractReport {
    pub admitted: usize,
    pub extracted: bool,
    pub facts_stored: usize,
    pub facts_dropped: usize,
    pub summary_stored: bool,
}

/// Settings the extractor snapshots from the engine config.
#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub batch_size: usize,
    pub min_confidence: f32,
    pub resolve_conflicts: bool,
    pub storage_mode: StorageMode,
    pub summary_dedup_threshold: f32,
    pub session_ttl_millis: i64,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            min_confidence: 0.7,
            resolve_conflicts: true,
            storage_mode: StorageMode::Hybrid,
            summary_dedup_threshold: 0.85,
            session_ttl_millis: 24 * 60 * 60 * 1000,
        }
    }
}

/// Batches turn messages per session and distills them into facts and
/// summaries via the extraction LLM. Failures clear the session buffer so a
/// poison batch cannot wedge extraction permanently.
pub struct Extractor {
    store: FactStore,
    embedder: Arc<Embedder>,
    llm: Arc<dyn LlmClient>,
    resolver: ConflictResolver,
    settings: ExtractorSettings,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl Extractor {
    pub fn new(
        store: FactStore,
        embedder: Arc<Embedder>,
        llm: Arc<dyn LlmClient>,
        settings: ExtractorSettings,
    ) -> Self {
        let resolver = ConflictResolver::new(if settings.resolve_conflicts {
            Some(llm.clone())
        } else {
            None
        });
        Self {
            store,
            embedder,
            llm,
            resolver,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a completed turn's messages and extract if the batch trigger
    /// fires. This is the after-turn entry point.
    pub async fn on_turn(&self, ctx: &HookContext, messages: &[Message]) -> ExtractReport {
        let session_id = ctx
            .session_id
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let (admitted, due) = {
            let mut sessions = self.sessions.lock().expect("extractor sessions lock");
            let now = now_millis();

            // Idle sessions past the TTL are dropped on every pass.
            let ttl = self.settings.session_ttl_millis;
            sessions.retain(|_, s| now - s.last_touched < ttl);

            let state = sessions.entry(session_id.clone()).or_insert(SessionState {
                buffer: Vec::new(),
                user_id: ctx.user_id.clone(),
                agent_id: ctx.agent_id.clone(),
                last_extraction: now,
                last_touched: now,
            });
            state.last_touched = now;
            if state.user_id.is_none() {
                state.user_id = ctx.user_id.clone();
            }

            let mut admitted = 0;
            for msg in messages {
                if !matches!(msg.role, Role::User | Role::Assistant) {
                    continue;
                }
                if msg.has_tool_blocks() {
                    continue;
                }
                let text = msg.flat_text();
                if text.len() < MIN_MESSAGE_LEN {
                    continue;
                }
                state.buffer.push(BufferedMessage {
                    role: msg.role,
                    text,
                });
                admitted += 1;
            }

            let due = !state.buffer.is_empty()
                && (state.buffer.len() >= self.settings.batch_size
                    || now - state.last_extraction >= EXTRACTION_INTERVAL_MILLIS);
            (admitted, due)
        };

        if !due {
            return ExtractReport {
                admitted,
                ..Default::default()
            };
        }

        let mut report = self.extract_session(&session_id).await;
        report.admitted = admitted;
        report
    }

    /// Drain a session's buffer and run one extraction pass over it.
    pub async fn extract_session(&self, session_id: &str) -> ExtractReport {
        let (batch, user_id, agent_id) = {
            let mut sessions = self.sessions.lock().expect("extractor sessions lock");
            let Some(state) = sessions.get_mut(session_id) else {
                return ExtractReport::default();
            };
            // Drain up front: a failing batch must not be retried forever.
            let batch = std::mem::take(&mut state.buffer);
            state.last_extraction = now_millis();
            (batch, state.user_id.clone(), state.agent_id.clone())
        };

        if batch.is_empty() {
            return ExtractReport::default();
        }
        let Some(user_id) = user_id else {
            debug!("no user_id on session, dropping extraction batch");
            return ExtractReport::default();
        };

        let prompt = build_prompt(&batch);
        let raw = match self.llm.generate(&prompt, Some(EXTRACTION_SYSTEM), 0.2, 1024).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "extraction LLM call failed, batch dropped");
                return ExtractReport {
                    extracted: true,
                    ..Default::default()
                };
            }
        };

        let parsed = parse_extraction(&raw);
        let mut report = ExtractReport {
            extracted: true,
            ..Default::default()
        };

        if self.settings.storage_mode != StorageMode::Summaries {
            for raw_fact in parsed.facts {
                match self
                    .ingest_fact(&user_id, agent_id.as_deref(), session_id, raw_fact)
                    .await
                {
                    Ok(true) => report.facts_stored += 1,
                    Ok(false) => report.facts_dropped += 1,
                    Err(e) => {
                        warn!(error = %e, "failed to store extracted fact");
                        report.facts_dropped += 1;
                    }
                }
            }
        }

        if self.settings.storage_mode != StorageMode::Facts {
            if let Some(summary) = parsed.summary {
                let vector = self.embedder.embed(&summary.topic).await;
                match self
                    .store
                    .store_summary(
                        &user_id,
                        &summary.topic,
                        &summary.content,
                        &summary.entities,
                        &summary.projects,
                        batch.len(),
                        Some(&vector),
                        self.settings.summary_dedup_threshold,
                    )
                    .await
                {
                    Ok((_, merged)) => {
                        report.summary_stored = true;
                        debug!(merged, "stored batch summary");
                    }
                    Err(e) => warn!(error = %e, "failed to store summary"),
                }
            }
        }

        info!(
            session = session_id,
            facts = report.facts_stored,
            dropped = report.facts_dropped,
            summary = report.summary_stored,
            "extraction pass complete"
        );
        report
    }

    /// Validate, embed, and store one extracted fact. Returns Ok(false)
    /// when validation drops it.
    async fn ingest_fact(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
        session_id: &str,
        raw: RawFact,
    ) -> Result<bool, crate::error::MemoryError> {
        let Some((value, category, confidence)) = validate_fact(&raw) else {
            return Ok(false);
        };
        if confidence < self.settings.min_confidence {
            return Ok(false);
        }

        let embedding = self.embedder.embed(&value).await;
        // Keyed by value hash: re-extracting the same assertion reinforces
        // the existing row instead of duplicating it.
        let key = crate::store::content_hash(&value);
        let new = NewFact {
            user_id: user_id.to_string(),
            scope: Scope::User,
            agent_id: agent_id.map(str::to_string),
            session_id: Some(session_id.to_string()),
            key: Some(key),
            value: value.clone(),
            category,
            metadata: raw
                .source_context
                .map(|ctx| serde_json::json!({ "source_context": ctx }).to_string()),
            embedding: Some(embedding),
        };

        if self.settings.resolve_conflicts {
            self.resolver
                .resolve_and_store(&self.store, new, confidence)
                .await?;
        } else {
            self.store.store_fact(new).await?;
        }

        // Recurring categories reinforce a per-agent pattern row.
        if let Some(agent) = agent_id {
            if let Err(e) = self
                .store
                .store_pattern(user_id, agent, category.as_str(), &value)
                .await
            {
                debug!(error = %e, "pattern reinforcement failed");
            }
        }
        Ok(true)
    }

    /// Buffered message count for a session. Test surface.
    pub fn buffered(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .expect("extractor sessions lock")
            .get(session_id)
            .map(|s| s.buffer.len())
            .unwrap_or(0)
    }

    /// Live session count after TTL sweeps. Test surface.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("extractor sessions lock")
            .len()
    }
}

/// Normalize a raw fact: cap length, clamp confidence, fold category
/// variants. Unknown categories and empty facts are dropped.
fn validate_fact(raw: &RawFact) -> Option<(String, FactCategory, f32)> {
    let mut value = raw.fact.trim().to_string();
    if value.is_empty() {
        return None;
    }
    if value.len() > MAX_FACT_LEN {
        let mut end = MAX_FACT_LEN;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    let category = FactCategory::parse_lenient(&raw.category)?;
    let confidence = raw.confidence.clamp(0.0, 1.0) as f32;
    Some((value, category, confidence))
}

/// USER/ASSISTANT-labeled transcript with `[n]` indexing, per-message
/// content capped.
fn build_prompt(batch: &[BufferedMessage]) -> String {
    let mut prompt = String::from("Conversation batch:\n\n");
    for (i, msg) in batch.iter().enumerate() {
        let label = match msg.role {
            Role::Assistant => "ASSISTANT",
            _ => "USER",
        };
        let mut text = msg.text.clone();
        if text.len() > PROMPT_MESSAGE_CAP {
            let mut end = PROMPT_MESSAGE_CAP;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        prompt.push_str(&format!("[{i}] {label}: {text}\n"));
    }
    prompt.push_str("\nExtract facts and one summary as JSON.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use crate::memory::types::FactQuery;
    use crate::store::IndexStore;
    use crate::types::ContentBlock;
    use serde_json::json;

    async fn extractor(llm: ScriptedLlm, settings: ExtractorSettings) -> Extractor {
        let index = IndexStore::in_memory().await.unwrap();
        let store = FactStore::new(index).await.unwrap();
        Extractor::new(
            store,
            Arc::new(Embedder::hash_only(64)),
            Arc::new(llm),
            settings,
        )
    }

    fn ctx() -> HookContext {
        HookContext {
            session_id: Some("s1".into()),
            user_id: Some("u1".into()),
            agent_id: Some("a1".into()),
            model_id: None,
        }
    }

    const GOOD_RESPONSE: &str = r#"{"facts": [{"fact": "prefers TypeScript", "category": "preference", "confidence": 0.9, "source_context": "stated directly"}], "summary": {"topic": "language choice", "content": "User prefers TypeScript.", "entities": ["TypeScript"], "projects": []}}"#;

    #[tokio::test]
    async fn buffers_until_batch_size() {
        let e = extractor(
            ScriptedLlm::new(vec![GOOD_RESPONSE]),
            ExtractorSettings {
                batch_size: 3,
                ..Default::default()
            },
        )
        .await;

        let report = e
            .on_turn(&ctx(), &[Message::user("I really prefer TypeScript")])
            .await;
        assert_eq!(report.admitted, 1);
        assert!(!report.extracted);
        assert_eq!(e.buffered("s1"), 1);

        let report = e
            .on_turn(
                &ctx(),
                &[
                    Message::assistant("Noted, TypeScript it is."),
                    Message::user("Yes, for all new services"),
                ],
            )
            .await;
        assert!(report.extracted);
        assert_eq!(report.facts_stored, 1);
        assert!(report.summary_stored);
        assert_eq!(e.buffered("s1"), 0);
    }

    #[tokio::test]
    async fn tool_messages_and_short_text_skipped() {
        let e = extractor(ScriptedLlm::failing(), ExtractorSettings::default()).await;
        let tool_msg = Message::blocks(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "exec".into(),
                input: json!({}),
            }],
        );
        let report = e
            .on_turn(
                &ctx(),
                &[
                    tool_msg,
                    Message::user("ok"),
                    Message::text(Role::System, "system preamble that is long enough"),
                ],
            )
            .await;
        assert_eq!(report.admitted, 0);
    }

    #[tokio::test]
    async fn failed_llm_clears_buffer() {
        let e = extractor(
            ScriptedLlm::failing(),
            ExtractorSettings {
                batch_size: 1,
                ..Default::default()
            },
        )
        .await;
        let report = e
            .on_turn(&ctx(), &[Message::user("this message is long enough")])
            .await;
        assert!(report.extracted);
        assert_eq!(report.facts_stored, 0);
        // Poison batch gone; next turn starts clean.
        assert_eq!(e.buffered("s1"), 0);
    }

    #[tokio::test]
    async fn low_confidence_facts_dropped() {
        let low = r#"{"facts": [{"fact": "maybe likes go", "category": "preference", "confidence": 0.4}], "summary": null}"#;
        let e = extractor(
            ScriptedLlm::new(vec![low]),
            ExtractorSettings {
                batch_size: 1,
                ..Default::default()
            },
        )
        .await;
        let report = e
            .on_turn(&ctx(), &[Message::user("I might like Go, not sure")])
            .await;
        assert_eq!(report.facts_stored, 0);
        assert_eq!(report.facts_dropped, 1);
    }

    #[tokio::test]
    async fn repeated_assertion_reinforces_single_fact() {
        // Three turns asserting the same preference end up as one fact row
        // with reinforcement visible in the audit log.
        let responses = vec![GOOD_RESPONSE, GOOD_RESPONSE, GOOD_RESPONSE];
        let e = extractor(
            ScriptedLlm::new(responses),
            ExtractorSettings {
                batch_size: 1,
                resolve_conflicts: false,
                ..Default::default()
            },
        )
        .await;

        for _ in 0..3 {
            e.on_turn(&ctx(), &[Message::user("I prefer TypeScript always")])
                .await;
        }

        assert_eq!(e.store.count_facts("u1").await.unwrap(), 1);
        let mut q = FactQuery::new("u1", "prefers TypeScript");
        q.agent_id = Some("a1".into());
        let hits = e.store.retrieve_facts(q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fact.category, FactCategory::Preference);

        let log = e.store.interactions_for(hits[0].fact.id).await.unwrap();
        let reinforced = log
            .iter()
            .filter(|(k, _)| *k == crate::memory::InteractionKind::Reinforced)
            .count();
        assert!(reinforced >= 2, "expected >= 2 reinforcements, got {reinforced}");

        // Pattern row reinforced every time.
        let patterns = e.store.retrieve_patterns("u1", "a1").await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].observation_count, 3);
    }

    #[tokio::test]
    async fn session_ttl_evicts_idle_state() {
        let e = extractor(
            ScriptedLlm::failing(),
            ExtractorSettings {
                batch_size: 100,
                session_ttl_millis: 0,
                ..Default::default()
            },
        )
        .await;
        e.on_turn(&ctx(), &[Message::user("long enough message one")])
            .await;
        // TTL of zero: the next pass (different session) sweeps s1 away.
        let mut other = ctx();
        other.session_id = Some("s2".into());
        e.on_turn(&other, &[Message::user("long enough message two")])
            .await;
        assert_eq!(e.buffered("s1"), 0);
        assert_eq!(e.session_count(), 1);
    }

    #[test]
    fn prompt_labels_and_caps() {
        let batch = vec![
            BufferedMessage {
                role: Role::User,
                text: "hello there".into(),
            },
            BufferedMessage {
                role: Role::Assistant,
                text: "x".repeat(2_000),
            },
        ];
        let prompt = build_prompt(&batch);
        assert!(prompt.contains("[0] USER: hello there"));
        assert!(prompt.contains("[1] ASSISTANT: "));
        assert!(prompt.len() < 1_500);
    }

    #[test]
    fn validation_normalizes() {
        let raw = RawFact {
            fact: "x".repeat(500),
            category: "Preferences".into(),
            confidence: 1.7,
            source_context: None,
        };
        let (value, category, confidence) = validate_fact(&raw).unwrap();
        assert_eq!(value.len(), 200);
        assert_eq!(category, FactCategory::Preference);
        assert_eq!(confidence, 1.0);

        let bad = RawFact {
            fact: "valid fact".into(),
            category: "nonsense".into(),
            confidence: 0.9,
            source_context: None,
        };
        assert!(validate_fact(&bad).is_none());
    }
}
