use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::embed::cosine;
use crate::error::MemoryError;
use crate::llm::LlmClient;

use super::parse::balanced_json;
use super::store::FactStore;
use super::types::{FactQuery, NewFact, ScoredFact, StoreFactOutcome};

/// Candidate fetch parameters (same category, hybrid score floor, cap).
const CANDIDATE_MIN_SCORE: f32 = 0.6;
const CANDIDATE_LIMIT: usize = 20;
/// Semantic relatedness above this makes a candidate a potential conflict.
const DEFAULT_RELATEDNESS_THRESHOLD: f32 = 0.8;

const CONFLICT_SYSTEM: &str = "You detect contradictions between stored facts \
and new observations about a user. Reply with JSON only: \
{\"conflicts\": bool, \"reason\": string, \"resolution\": \
\"keep_latest\" | \"keep_highest_confidence\" | \"merge\" | \"ask_user\"}";

/// How a detected conflict should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLatest,
    KeepHighestConfidence,
    Merge,
    AskUser,
}

impl Resolution {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "keep_latest" => Some(Resolution::KeepLatest),
            "keep_highest_confidence" => Some(Resolution::KeepHighestConfidence),
            "merge" => Some(Resolution::Merge),
            "ask_user" => Some(Resolution::AskUser),
            _ => None,
        }
    }
}

/// What happened to the incoming fact.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictAction {
    /// No conflicting fact found; stored normally.
    Stored(StoreFactOutcome),
    /// Conflict resolved by updating the existing fact's value.
    Corrected { fact_id: i64 },
    /// Conflict resolved by keeping the existing fact; new value dropped.
    KeptExisting { fact_id: i64 },
    /// Values merged into the existing fact.
    Merged { fact_id: i64 },
    /// Parked for the user; live facts untouched.
    Deferred { fact_id: i64 },
}

/// Detects and arbitrates contradictions between a newly extracted fact and
/// the store. LLM arbitration is optional; without it (or on its failure)
/// the resolver falls back to keep-highest-confidence.
pub struct ConflictResolver {
    llm: Option<Arc<dyn LlmClient>>,
    relatedness_threshold: f32,
}

impl ConflictResolver {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            llm,
            relatedness_threshold: DEFAULT_RELATEDNESS_THRESHOLD,
        }
    }

    pub fn with_relatedness_threshold(mut self, threshold: f32) -> Self {
        self.relatedness_threshold = threshold;
        self
    }

    /// Store `new` unless it contradicts an existing fact, in which case
    /// apply the arbitrated resolution. `confidence` is the extraction
    /// confidence of the new fact; it is persisted in fact metadata so
    /// later arbitration can compare.
    pub async fn resolve_and_store(
        &self,
        store: &FactStore,
        mut new: NewFact,
        confidence: f32,
    ) -> Result<ConflictAction, MemoryError> {
        new.metadata = Some(metadata_with_confidence(new.metadata.take(), confidence));

        let Some(conflicting) = self.find_conflict(store, &new).await? else {
            return Ok(ConflictAction::Stored(store.store_fact(new).await?));
        };

        let existing_confidence = confidence_from_metadata(&conflicting.fact.metadata);
        info!(
            existing = conflicting.fact.id,
            relatedness = conflicting.score,
            "potential fact conflict"
        );

        let (is_conflict, resolution, reason) = match &self.llm {
            Some(client) => {
                match self
                    .analyze(client.as_ref(), &conflicting.fact.value, &new.value)
                    .await
                {
                    Some(outcome) => outcome,
                    None => {
                        warn!("conflict analysis failed, keeping highest confidence");
                        (true, Resolution::KeepHighestConfidence, String::new())
                    }
                }
            }
            None => (true, Resolution::KeepHighestConfidence, String::new()),
        };

        if !is_conflict {
            return Ok(ConflictAction::Stored(store.store_fact(new).await?));
        }

        let fact_id = conflicting.fact.id;
        match resolution {
            Resolution::KeepLatest => {
                store.correct_fact(fact_id, &new.value).await?;
                Ok(ConflictAction::Corrected { fact_id })
            }
            Resolution::KeepHighestConfidence => {
                if confidence > existing_confidence {
                    store.correct_fact(fact_id, &new.value).await?;
                    Ok(ConflictAction::Corrected { fact_id })
                } else {
                    Ok(ConflictAction::KeptExisting { fact_id })
                }
            }
            Resolution::Merge => {
                let merged = format!("{}; {}", conflicting.fact.value, new.value);
                store.correct_fact(fact_id, &merged).await?;
                Ok(ConflictAction::Merged { fact_id })
            }
            Resolution::AskUser => {
                store.defer_conflict(fact_id, &new.value, &reason).await?;
                Ok(ConflictAction::Deferred { fact_id })
            }
        }
    }

    /// The most related same-category fact above the conflict threshold.
    async fn find_conflict(
        &self,
        store: &FactStore,
        new: &NewFact,
    ) -> Result<Option<ScoredFact>, MemoryError> {
        let mut query = FactQuery::new(&new.user_id, &new.value);
        query.agent_id = new.agent_id.clone();
        query.session_id = new.session_id.clone();
        query.query_embedding = new.embedding.clone();
        query.top_k = CANDIDATE_LIMIT;
        query.min_score = CANDIDATE_MIN_SCORE;
        query.categories = Some(vec![new.category]);

        let new_hash = crate::store::content_hash(&new.value);
        let candidates = store.retrieve_facts(query).await?;
        let mut best: Option<ScoredFact> = None;
        for candidate in candidates {
            // An identical value is reinforcement, not a conflict; the
            // keyed upsert handles it.
            if candidate.fact.content_hash == new_hash {
                continue;
            }
            let relatedness = match (&new.embedding, &candidate.fact.content_hash) {
                (Some(qv), hash) => match store.index().get_embedding_by_hash(hash).await? {
                    Some(fv) => cosine(qv, &fv),
                    None => candidate.score,
                },
                _ => candidate.score,
            };
            if relatedness >= self.relatedness_threshold {
                let replace = match &best {
                    Some(b) => relatedness > b.score,
                    None => true,
                };
                if replace {
                    best = Some(ScoredFact {
                        fact: candidate.fact,
                        score: relatedness,
                    });
                }
            }
        }
        Ok(best)
    }

    async fn analyze(
        &self,
        client: &dyn LlmClient,
        existing: &str,
        incoming: &str,
    ) -> Option<(bool, Resolution, String)> {
        let prompt = format!(
            "Stored fact: {existing}\nNew observation: {incoming}\n\nDo these conflict?"
        );
        let raw = client
            .generate(&prompt, Some(CONFLICT_SYSTEM), 0.0, 256)
            .await
            .map_err(|e| debug!(error = %e, "conflict LLM call failed"))
            .ok()?;

        let slice = balanced_json(&raw)?;
        let value: Value = serde_json::from_str(slice).ok()?;
        let conflicts = value.get("conflicts")?.as_bool()?;
        let reason = value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let resolution = value
            .get("resolution")
            .and_then(Value::as_str)
            .and_then(Resolution::parse)
            .unwrap_or(Resolution::KeepHighestConfidence);
        Some((conflicts, resolution, reason))
    }
}

fn metadata_with_confidence(metadata: Option<String>, confidence: f32) -> String {
    let mut value: Value = metadata
        .as_deref()
        .and_then(|m| serde_json::from_str(m).ok())
        .unwrap_or_else(|| Value::Object(Default::default()));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("confidence".into(), Value::from(confidence as f64));
    }
    value.to_string()
}

fn confidence_from_metadata(metadata: &Option<String>) -> f32 {
    metadata
        .as_deref()
        .and_then(|m| serde_json::from_str::<Value>(m).ok())
        .and_then(|v| v.get("confidence").and_then(Value::as_f64))
        .map(|c| c as f32)
        .unwrap_or(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use crate::memory::types::FactCategory;
    use crate::store::IndexStore;

    async fn store() -> FactStore {
        FactStore::new(IndexStore::in_memory().await.unwrap())
            .await
            .unwrap()
    }

    fn fact(user: &str, value: &str, embedding: Vec<f32>) -> NewFact {
        let mut f = NewFact::user_scoped(user, value, FactCategory::Preference);
        f.embedding = Some(embedding);
        f
    }

    #[tokio::test]
    async fn unrelated_fact_stores_normally() {
        let s = store().await;
        let resolver = ConflictResolver::new(None);
        let action = resolver
            .resolve_and_store(&s, fact("u1", "prefers dark mode", vec![1.0, 0.0]), 0.9)
            .await
            .unwrap();
        assert!(matches!(action, ConflictAction::Stored(_)));
    }

    #[tokio::test]
    async fn keep_latest_updates_in_place_and_logs_corrected() {
        let s = store().await;
        let resolver = ConflictResolver::new(Some(Arc::new(ScriptedLlm::new(vec![
            r#"{"conflicts": true, "reason": "mode flipped", "resolution": "keep_latest"}"#,
        ]))));

        let first = resolver
            .resolve_and_store(&s, fact("u1", "prefers dark mode", vec![1.0, 0.0]), 0.8)
            .await
            .unwrap();
        let ConflictAction::Stored(outcome) = first else {
            panic!("first store should not conflict");
        };

        let action = resolver
            .resolve_and_store(&s, fact("u1", "prefers light mode", vec![0.98, 0.05]), 0.9)
            .await
            .unwrap();
        assert_eq!(
            action,
            ConflictAction::Corrected {
                fact_id: outcome.fact_id
            }
        );

        let updated = s.get_fact(outcome.fact_id).await.unwrap().unwrap();
        assert_eq!(updated.value, "prefers light mode");

        let log = s.interactions_for(outcome.fact_id).await.unwrap();
        let corrected = log
            .iter()
            .filter(|(k, _)| *k == crate::memory::InteractionKind::Corrected)
            .count();
        assert_eq!(corrected, 1);
        assert_eq!(s.count_facts("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resolver_disabled_rows_coexist_when_unrelated_embeddings() {
        // Without embedding relatedness above threshold, both rows persist.
        let s = store().await;
        let resolver = ConflictResolver::new(None);
        resolver
            .resolve_and_store(&s, fact("u1", "prefers dark mode", vec![1.0, 0.0]), 0.8)
            .await
            .unwrap();
        resolver
            .resolve_and_store(&s, fact("u1", "enjoys hiking trips", vec![0.0, 1.0]), 0.8)
            .await
            .unwrap();
        assert_eq!(s.count_facts("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fallback_keeps_highest_confidence() {
        let s = store().await;
        // LLM scripted to fail: fallback is keep_highest_confidence.
        let resolver = ConflictResolver::new(Some(Arc::new(ScriptedLlm::failing())));

        let first = resolver
            .resolve_and_store(&s, fact("u1", "prefers tabs", vec![1.0, 0.0]), 0.9)
            .await
            .unwrap();
        let ConflictAction::Stored(outcome) = first else {
            panic!("unexpected conflict");
        };

        // Lower-confidence contradiction loses.
        let action = resolver
            .resolve_and_store(&s, fact("u1", "prefers spaces", vec![0.99, 0.02]), 0.7)
            .await
            .unwrap();
        assert_eq!(
            action,
            ConflictAction::KeptExisting {
                fact_id: outcome.fact_id
            }
        );
        let kept = s.get_fact(outcome.fact_id).await.unwrap().unwrap();
        assert_eq!(kept.value, "prefers tabs");
    }

    #[tokio::test]
    async fn merge_concatenates_values() {
        let s = store().await;
        let resolver = ConflictResolver::new(Some(Arc::new(ScriptedLlm::new(vec![
            r#"{"conflicts": true, "reason": "both hold", "resolution": "merge"}"#,
        ]))));

        let first = resolver
            .resolve_and_store(&s, fact("u1", "uses vim at home", vec![1.0, 0.0]), 0.8)
            .await
            .unwrap();
        let ConflictAction::Stored(outcome) = first else {
            panic!();
        };
        resolver
            .resolve_and_store(&s, fact("u1", "uses vscode at work", vec![0.97, 0.1]), 0.8)
            .await
            .unwrap();

        let merged = s.get_fact(outcome.fact_id).await.unwrap().unwrap();
        assert_eq!(merged.value, "uses vim at home; uses vscode at work");
    }

    #[tokio::test]
    async fn ask_user_defers_without_mutation() {
        let s = store().await;
        let resolver = ConflictResolver::new(Some(Arc::new(ScriptedLlm::new(vec![
            r#"{"conflicts": true, "reason": "ambiguous", "resolution": "ask_user"}"#,
        ]))));

        let first = resolver
            .resolve_and_store(&s, fact("u1", "lives in Berlin", vec![1.0, 0.0]), 0.9)
            .await
            .unwrap();
        let ConflictAction::Stored(outcome) = first else {
            panic!();
        };
        let action = resolver
            .resolve_and_store(&s, fact("u1", "lives in Munich", vec![0.99, 0.01]), 0.9)
            .await
            .unwrap();
        assert_eq!(
            action,
            ConflictAction::Deferred {
                fact_id: outcome.fact_id
            }
        );

        let untouched = s.get_fact(outcome.fact_id).await.unwrap().unwrap();
        assert_eq!(untouched.value, "lives in Berlin");
        let deferred = s.deferred_conflicts(outcome.fact_id).await.unwrap();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].0, "lives in Munich");
    }
}
