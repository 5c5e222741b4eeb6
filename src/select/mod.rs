pub mod cache;
pub mod groups;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, FusionMode};
use crate::embed::{cosine, Embedder};
use crate::expand::{round_robin_fuse, rrf_fuse, QueryExpander};
use crate::llm::CrossEncoder;
use crate::memory::{FactQuery, FactStore, ScoredFact};
use crate::prefilter;
use crate::scoring::HybridScorer;
use crate::store::{FtsIndex, IndexStore};
use crate::threads::ThreadDetector;
use crate::tokenize::estimate_tokens;
use crate::types::{HookContext, Message, Role};
use crate::validate::sanitize;

pub use cache::{fingerprint, SelectionCache};
pub use groups::{group_tool_chains, singleton_groups, MessageGroup};

/// Response-buffer tokens reserved when computing a dynamic window.
const RESPONSE_BUFFER_TOKENS: usize = 4_000;
/// Share of the remaining window granted to history.
const HISTORY_SHARE: f32 = 0.3;
/// Assumed average tokens per message for dynamic sizing.
const AVG_TOKENS_PER_MESSAGE: usize = 500;
/// Minimum history length before the cross-encoder is worth its latency.
const RERANK_MIN_HISTORY: usize = 50;
/// How many bi-encoder survivors the cross-encoder sees.
const RERANK_CANDIDATES: usize = 100;

/// The retrieval orchestrator. Owns no state beyond its collaborators; one
/// `select` call is one turn.
pub struct Selector {
    embedder: Arc<Embedder>,
    index: IndexStore,
    fts: Option<FtsIndex>,
    facts: Option<FactStore>,
    expander: QueryExpander,
    reranker: Option<Arc<dyn CrossEncoder>>,
    cache: SelectionCache,
}

struct Candidate {
    group: MessageGroup,
    text: String,
    pinned: bool,
}

impl Selector {
    pub fn new(embedder: Arc<Embedder>, index: IndexStore, expander: QueryExpander) -> Self {
        Self {
            embedder,
            index,
            fts: None,
            facts: None,
            expander,
            reranker: None,
            cache: SelectionCache::new(),
        }
    }

    pub fn with_fts(mut self, fts: FtsIndex) -> Self {
        self.fts = Some(fts);
        self
    }

    pub fn with_facts(mut self, facts: FactStore) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn CrossEncoder>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Filter the transcript down to a token-bounded, semantically relevant
    /// subsequence. Never fails: every internal error degrades toward
    /// returning more of the input.
    pub async fn select(
        &self,
        messages: &[Message],
        prompt: &str,
        ctx: &HookContext,
        config: &EngineConfig,
    ) -> Vec<Message> {
        // 1. Fingerprinted result cache.
        let fp = fingerprint(messages, prompt, config);
        if config.query_result_cache {
            if let Some(hit) = self.cache.get(&fp) {
                debug!("selection cache hit");
                return hit;
            }
        }

        // 2. Dynamic window.
        let top_k = if config.dynamic_window {
            dynamic_top_k(prompt, config)
        } else {
            config.top_k
        };

        // 3. Sanitize, optionally strip stale tool traffic, short-circuit
        // on short histories.
        let mut clean = sanitize(messages);
        if config.strip_old_tool_calls {
            clean = strip_old_tool_calls(clean, config.recent_n);
        }
        if clean.len() <= top_k + config.recent_n {
            if config.query_result_cache {
                self.cache.put(fp, clean.clone());
            }
            return clean;
        }

        // 5. Query = recent user messages + current prompt.
        let query = build_query(&clean, prompt, config.recent_n);

        // 6. Optional FTS pre-filter, then (4) grouping within survivors.
        let candidate_idx: Vec<usize> = match (&self.fts, config.fts5_search) {
            (Some(fts), true) => prefilter::apply(fts, &clean, &query, top_k, config.recent_n).await,
            _ => (0..clean.len()).collect(),
        };
        let survivors: Vec<Message> = candidate_idx.iter().map(|&i| clean[i].clone()).collect();

        let groups = if config.tool_chain_groups {
            group_tool_chains(&survivors)
        } else {
            singleton_groups(survivors.len())
        };

        let recent_floor = clean.len().saturating_sub(config.recent_n);
        let candidates: Vec<Candidate> = groups
            .into_iter()
            .map(|group| {
                let pinned = group.indices.iter().any(|&i| {
                    survivors[i].role.is_system() || candidate_idx[i] >= recent_floor
                });
                let text = group
                    .indices
                    .iter()
                    .map(|&i| survivors[i].flat_text())
                    .collect::<Vec<_>>()
                    .join("\n");
                Candidate {
                    group,
                    text,
                    pinned,
                }
            })
            .collect();

        // 7. Memory prefetch runs concurrently with scoring.
        let memory_task = self.spawn_memory_prefetch(ctx, &query, config);

        // 8. Batch-embed whatever candidate texts are not cached yet.
        if config.batch_embed {
            self.batch_embed(&candidates, &query, config.batch_embed_size)
                .await;
        }

        // 9. Vector fetch (bounded concurrency), then scoring.
        let vectors = self
            .candidate_vectors(&candidates, config.parallel_score, config.parallel_concurrency)
            .await;

        let scorer = config.bm25_hybrid.then(|| {
            let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
            HybridScorer::with_weights(&texts, config.bm25_weight, config.cosine_weight)
        });

        // 9/10. Single-query scoring, or multi-query with fusion.
        let scorable: Vec<usize> = (0..candidates.len())
            .filter(|&i| !candidates[i].pinned)
            .collect();
        let variants = if config.multi_query && scorable.len() > top_k {
            self.expander
                .expand(&query, config.multi_query_count)
                .await
        } else {
            vec![query.clone()]
        };

        let mut best_score = vec![0.0f32; candidates.len()];
        let mut ranked_lists: Vec<Vec<usize>> = Vec::with_capacity(variants.len());
        for variant in &variants {
            let variant_vec = self.embedding_for(variant).await;
            let mut scored: Vec<(usize, f32)> = scorable
                .iter()
                .map(|&i| {
                    let score = match &scorer {
                        Some(s) => s.hybrid(
                            variant,
                            i,
                            Some(&variant_vec),
                            vectors[i].as_deref(),
                        ),
                        None => vectors[i]
                            .as_deref()
                            .map(|v| cosine(&variant_vec, v))
                            .unwrap_or(0.0),
                    };
                    (i, score)
                })
                .collect();
            for (i, score) in &scored {
                if *score > best_score[*i] {
                    best_score[*i] = *score;
                }
            }
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            ranked_lists.push(scored.into_iter().map(|(i, _)| i).collect::<Vec<usize>>());
        }

        let mut ranked: Vec<usize> = if ranked_lists.len() > 1 {
            // Fusion operates on the top-K-per-variant prefixes.
            let prefixes: Vec<Vec<usize>> = ranked_lists
                .iter()
                .map(|list| list[..list.len().min(top_k)].to_vec())
                .collect();
            match config.multi_query_fusion {
                FusionMode::Rrf => rrf_fuse(&prefixes, config.rrf_k),
                FusionMode::Simple => round_robin_fuse(&prefixes),
            }
        } else {
            ranked_lists.pop().unwrap_or_default()
        };

        // 11. Optional cross-encoder rerank over the bi-encoder survivors.
        // Rerank scores replace bi-encoder scores for the final cut.
        if config.cross_encoder_rerank && clean.len() >= RERANK_MIN_HISTORY {
            if let Some(reranker) = &self.reranker {
                ranked = self
                    .rerank(
                        reranker.as_ref(),
                        &query,
                        &candidates,
                        ranked,
                        top_k,
                        &mut best_score,
                    )
                    .await;
            }
        }

        // 12. Assembly: pinned groups plus top-K relevant, original order.
        let mut selected: HashSet<usize> = (0..candidates.len())
            .filter(|&i| candidates[i].pinned)
            .collect();
        let mut taken = 0usize;
        for &i in &ranked {
            if taken >= top_k {
                break;
            }
            if best_score[i] >= config.min_score && selected.insert(i) {
                taken += 1;
            }
        }

        if config.thread_aware {
            selected = self.expand_threads(&candidates, &vectors, selected, config);
        }

        let mut original: Vec<usize> = selected
            .iter()
            .flat_map(|&ci| candidates[ci].group.indices.iter().map(|&gi| candidate_idx[gi]))
            .collect();
        original.sort_unstable();
        original.dedup();

        let mut output: Vec<Message> = original.iter().map(|&i| clean[i].clone()).collect();
        output = sanitize(&output);
        if output.is_empty() {
            output = clean[clean.len().saturating_sub(config.recent_n)..].to_vec();
        }

        // 13. Memory injection goes first.
        if let Some(task) = memory_task {
            match task.await {
                Ok(Some(facts)) if !facts.is_empty() => {
                    output.insert(0, Message::text(Role::System, format_memory(&facts)));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "memory prefetch task failed"),
            }
        }

        info!(
            input = messages.len(),
            output = output.len(),
            top_k,
            variants = variants.len(),
            "selection complete"
        );

        // 14. Cache the final answer.
        if config.query_result_cache {
            self.cache.put(fp, output.clone());
        }
        output
    }

    /// Cache-aware single embedding.
    async fn embedding_for(&self, text: &str) -> Vec<f32> {
        match self.index.get_embedding(text).await {
            Ok(Some(vector)) => vector,
            _ => {
                let vector = self.embedder.embed(text).await;
                if let Err(e) = self.index.set_embedding(text, &vector).await {
                    debug!(error = %e, "failed to cache embedding");
                }
                vector
            }
        }
    }

    /// One batched call for all unique uncached candidate texts.
    async fn batch_embed(&self, candidates: &[Candidate], query: &str, batch_size: usize) {
        let mut uncached: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for text in candidates
            .iter()
            .map(|c| c.text.as_str())
            .chain(std::iter::once(query))
        {
            if !seen.insert(text.to_string()) {
                continue;
            }
            if let Ok(None) = self.index.get_embedding(text).await {
                uncached.push(text.to_string());
            }
        }
        if uncached.is_empty() {
            return;
        }
        let vectors = self.embedder.embed_batch(&uncached, batch_size).await;
        for (text, vector) in uncached.iter().zip(&vectors) {
            if let Err(e) = self.index.set_embedding(text, vector).await {
                debug!(error = %e, "failed to cache batch embedding");
                break;
            }
        }
    }

    /// Fetch every candidate's vector, optionally in parallel under a
    /// bounded semaphore.
    async fn candidate_vectors(
        &self,
        candidates: &[Candidate],
        parallel: bool,
        concurrency: usize,
    ) -> Vec<Option<Vec<f32>>> {
        if !parallel {
            let mut vectors = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                vectors.push(Some(self.embedding_for(&candidate.text).await));
            }
            return vectors;
        }

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut set = JoinSet::new();
        for (i, candidate) in candidates.iter().enumerate() {
            let text = candidate.text.clone();
            let semaphore = semaphore.clone();
            let embedder = self.embedder.clone();
            let index = self.index.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire().await;
                let vector = match index.get_embedding(&text).await {
                    Ok(Some(v)) => v,
                    _ => {
                        let v = embedder.embed(&text).await;
                        let _ = index.set_embedding(&text, &v).await;
                        v
                    }
                };
                (i, vector)
            });
        }

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; candidates.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, vector)) => vectors[i] = Some(vector),
                Err(e) => warn!(error = %e, "scoring task panicked"),
            }
        }
        vectors
    }

    fn spawn_memory_prefetch(
        &self,
        ctx: &HookContext,
        query: &str,
        config: &EngineConfig,
    ) -> Option<tokio::task::JoinHandle<Option<Vec<ScoredFact>>>> {
        if !config.memory {
            return None;
        }
        let user_id = ctx.user_id.clone()?;
        let facts = self.facts.clone()?;
        let embedder = self.embedder.clone();
        let query = query.to_string();
        let agent_id = ctx.agent_id.clone();
        let session_id = ctx.session_id.clone();
        let top_k = config.memory_max_facts;
        let min_score = config.memory_min_score;

        Some(tokio::spawn(async move {
            let mut fact_query = FactQuery::new(&user_id, &query);
            fact_query.agent_id = agent_id;
            fact_query.session_id = session_id;
            fact_query.query_embedding = Some(embedder.embed(&query).await);
            fact_query.top_k = top_k;
            fact_query.min_score = min_score;
            match facts.retrieve_facts(fact_query).await {
                Ok(hits) => Some(hits),
                Err(e) => {
                    warn!(error = %e, "memory retrieval failed, skipping injection");
                    None
                }
            }
        }))
    }

    /// Replace bi-encoder scores with cross-encoder scores for the head of
    /// the ranking. Failure keeps the original order.
    async fn rerank(
        &self,
        reranker: &dyn CrossEncoder,
        query: &str,
        candidates: &[Candidate],
        ranked: Vec<usize>,
        top_k: usize,
        best_score: &mut [f32],
    ) -> Vec<usize> {
        let head: Vec<usize> = ranked.iter().copied().take(RERANK_CANDIDATES).collect();
        if head.is_empty() {
            return ranked;
        }
        let texts: Vec<String> = head.iter().map(|&i| candidates[i].text.clone()).collect();
        match reranker.rerank(query, &texts, top_k).await {
            Ok(mut scores) => {
                scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                for (slice_idx, score) in &scores {
                    if let Some(&candidate) = head.get(*slice_idx) {
                        best_score[candidate] = *score;
                    }
                }
                let reranked: Vec<usize> = scores
                    .into_iter()
                    .filter_map(|(slice_idx, _)| head.get(slice_idx).copied())
                    .collect();
                // Anything past the rerank head keeps its old order.
                let tail: Vec<usize> = ranked
                    .into_iter()
                    .filter(|i| !reranked.contains(i) && !head.contains(i))
                    .collect();
                reranked.into_iter().chain(tail).collect()
            }
            Err(e) => {
                warn!(error = %e, "cross-encoder rerank failed, keeping bi-encoder order");
                ranked
            }
        }
    }

    /// Pull thread neighbors of selected candidates into the selection.
    fn expand_threads(
        &self,
        candidates: &[Candidate],
        vectors: &[Option<Vec<f32>>],
        selected: HashSet<usize>,
        config: &EngineConfig,
    ) -> HashSet<usize> {
        if vectors.iter().any(Option::is_none) {
            return selected;
        }
        let dense: Vec<Vec<f32>> = vectors.iter().flatten().cloned().collect();
        if dense.len() != candidates.len() {
            return selected;
        }
        let detector = ThreadDetector::new(
            config.thread_similarity_threshold,
            config.thread_window_size,
            config.thread_max_gap,
        );
        let threads = detector.detect(&dense);
        detector.expand_selection(&threads, &selected, 1, 1)
    }
}

/// Drop tool-use / tool-result blocks from messages outside the recent
/// window; messages left empty disappear. Old tool traffic rarely survives
/// relevance scoring anyway, but this makes the cut explicit and cheap.
fn strip_old_tool_calls(messages: Vec<Message>, recent_n: usize) -> Vec<Message> {
    let recent_floor = messages.len().saturating_sub(recent_n);
    messages
        .into_iter()
        .enumerate()
        .filter_map(|(i, msg)| {
            if i >= recent_floor || !msg.has_tool_blocks() {
                return Some(msg);
            }
            let crate::types::MessageContent::Blocks(blocks) = msg.content else {
                return Some(msg);
            };
            let kept: Vec<crate::types::ContentBlock> = blocks
                .into_iter()
                .filter(|b| matches!(b, crate::types::ContentBlock::Text { .. }))
                .collect();
            if kept.is_empty() {
                None
            } else {
                Some(Message {
                    id: msg.id,
                    role: msg.role,
                    content: crate::types::MessageContent::Blocks(kept),
                })
            }
        })
        .collect()
}

/// Last `recent_n` user messages concatenated with the prompt.
fn build_query(messages: &[Message], prompt: &str, recent_n: usize) -> String {
    let mut recent: Vec<String> = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .take(recent_n)
        .map(Message::flat_text)
        .collect();
    recent.reverse();
    recent.push(prompt.to_string());
    recent.retain(|s| !s.trim().is_empty());
    recent.join("\n")
}

/// Window arithmetic for the dynamic top-K.
fn dynamic_top_k(prompt: &str, config: &EngineConfig) -> usize {
    let window = model_window(config.model_id.as_deref());
    let available = window.saturating_sub(estimate_tokens(prompt) + RESPONSE_BUFFER_TOKENS);
    let base = available as f32 * HISTORY_SHARE / AVG_TOKENS_PER_MESSAGE as f32;

    let questions = prompt.matches('?').count();
    let complexity = if questions > 2 {
        1.3
    } else if questions < 1 {
        0.7
    } else {
        1.0
    };

    ((base * complexity) as usize).clamp(config.min_top_k, config.max_top_k)
}

/// Declared context window by model family.
fn model_window(model_id: Option<&str>) -> usize {
    let Some(id) = model_id else {
        return 128_000;
    };
    match EngineConfig::model_family(id) {
        "anthropic" => 200_000,
        "gemini" => 1_000_000,
        "kimi" => 128_000,
        _ => 128_000,
    }
}

/// Facts grouped by category into one synthetic system block.
fn format_memory(facts: &[ScoredFact]) -> String {
    let mut by_category: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for hit in facts {
        by_category
            .entry(hit.fact.category.as_str())
            .or_default()
            .push(&hit.fact.value);
    }

    let mut out = String::from("Relevant knowledge from previous sessions:\n");
    for (category, values) in by_category {
        out.push_str(&format!("\n[{category}]\n"));
        for value in values {
            out.push_str(&format!("- {value}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExpandStrategy;

    fn selector_parts() -> (Arc<Embedder>, QueryExpander) {
        (
            Arc::new(Embedder::hash_only(64)),
            QueryExpander::new(ExpandStrategy::Rule, None),
        )
    }

    async fn basic_selector() -> Selector {
        let (embedder, expander) = selector_parts();
        Selector::new(embedder, IndexStore::in_memory().await.unwrap(), expander)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            top_k: 3,
            recent_n: 2,
            min_score: 0.1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn short_history_identity() {
        let selector = basic_selector().await;
        let messages: Vec<Message> = (0..4).map(|i| Message::user(format!("msg {i}"))).collect();
        let out = selector
            .select(&messages, "anything", &HookContext::default(), &config())
            .await;
        assert_eq!(out, messages);
    }

    #[tokio::test]
    async fn empty_input_returns_empty() {
        let selector = basic_selector().await;
        let out = selector
            .select(&[], "", &HookContext::default(), &config())
            .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn output_is_ordered_subsequence() {
        let selector = basic_selector().await;
        let messages: Vec<Message> = (0..20)
            .map(|i| Message::user(format!("unique filler text number {i}")))
            .collect();
        let out = selector
            .select(
                &messages,
                "filler text number 7",
                &HookContext::default(),
                &config(),
            )
            .await;

        // Subsequence: every output message appears in input order.
        let mut cursor = 0;
        for msg in &out {
            let pos = messages[cursor..]
                .iter()
                .position(|m| m == msg)
                .expect("output message must come from input");
            cursor += pos + 1;
        }
        // Recent messages always retained.
        assert!(out.contains(&messages[18]));
        assert!(out.contains(&messages[19]));
    }

    #[tokio::test]
    async fn system_messages_always_kept() {
        let selector = basic_selector().await;
        let mut messages: Vec<Message> = (0..20)
            .map(|i| Message::user(format!("ordinary chatter item {i}")))
            .collect();
        messages[0] = Message::system("you are a helpful assistant");
        let out = selector
            .select(
                &messages,
                "chatter item 10",
                &HookContext::default(),
                &config(),
            )
            .await;
        assert_eq!(out[0], messages[0]);
    }

    #[tokio::test]
    async fn all_below_min_score_returns_recent() {
        let (embedder, expander) = selector_parts();
        let selector =
            Selector::new(embedder, IndexStore::in_memory().await.unwrap(), expander);
        let mut cfg = config();
        cfg.min_score = 0.99;
        cfg.recent_n = 2;
        let messages: Vec<Message> = (0..20)
            .map(|i| Message::user(format!("completely unrelated topic {i}")))
            .collect();
        let out = selector
            .select(&messages, "zzz qqq xxx", &HookContext::default(), &cfg)
            .await;
        // Only the pinned recent messages survive.
        assert_eq!(out, messages[18..].to_vec());
    }

    #[tokio::test]
    async fn cached_result_reused() {
        let selector = basic_selector().await;
        let messages: Vec<Message> = (0..20)
            .map(|i| Message::user(format!("cache test message {i}")))
            .collect();
        let cfg = config();
        let first = selector
            .select(&messages, "message 5", &HookContext::default(), &cfg)
            .await;
        let second = selector
            .select(&messages, "message 5", &HookContext::default(), &cfg)
            .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cross_encoder_scores_replace_bi_encoder_order() {
        use crate::error::LlmError;
        use async_trait::async_trait;

        /// Puts anything mentioning "beta" first regardless of embeddings.
        struct BetaFirst;

        #[async_trait]
        impl crate::llm::CrossEncoder for BetaFirst {
            async fn rerank(
                &self,
                _query: &str,
                candidates: &[String],
                _top_k: usize,
            ) -> Result<Vec<(usize, f32)>, LlmError> {
                Ok(candidates
                    .iter()
                    .enumerate()
                    .map(|(i, text)| (i, if text.contains("beta") { 1.0 } else { 0.1 }))
                    .collect())
            }
        }

        let (embedder, expander) = selector_parts();
        let selector = Selector::new(embedder, IndexStore::in_memory().await.unwrap(), expander)
            .with_reranker(Arc::new(BetaFirst));

        let mut cfg = config();
        cfg.cross_encoder_rerank = true;
        cfg.top_k = 1;
        cfg.min_score = 0.0;
        cfg.recent_n = 2;

        // 60 messages so the rerank history threshold is met.
        let mut messages: Vec<Message> = (0..60)
            .map(|i| Message::user(format!("alpha topic message number {i}")))
            .collect();
        messages[10] = Message::user("beta subject sits here quietly");

        let out = selector
            .select(
                &messages,
                "alpha topic message",
                &HookContext::default(),
                &cfg,
            )
            .await;
        // The bi-encoder prefers the alpha messages, but the cross-encoder
        // promotes the beta one into the single relevant slot.
        assert!(out.contains(&messages[10]));
    }

    #[test]
    fn dynamic_top_k_arithmetic() {
        let mut cfg = EngineConfig {
            dynamic_window: true,
            min_top_k: 5,
            max_top_k: 50,
            model_id: Some("claude-sonnet-4".into()),
            ..Default::default()
        };
        // (200k - 4k) * 0.3 / 500 = 117.6 -> *0.7 (no '?') = 82 -> clamp 50.
        assert_eq!(dynamic_top_k("plain statement", &cfg), 50);

        cfg.max_top_k = 200;
        let no_question = dynamic_top_k("plain statement", &cfg);
        let one_question = dynamic_top_k("is this complex?", &cfg);
        let many_questions = dynamic_top_k("a? b? c? d?", &cfg);
        assert!(no_question < one_question);
        assert!(one_question < many_questions);
    }

    #[test]
    fn strip_old_tool_calls_spares_recent_window() {
        use crate::types::ContentBlock;
        use serde_json::json;
        let tool_msg = || {
            Message::blocks(
                Role::Assistant,
                vec![
                    ContentBlock::Text {
                        text: "running it".into(),
                    },
                    ContentBlock::ToolUse {
                        id: "t1".into(),
                        name: "exec".into(),
                        input: json!({}),
                    },
                ],
            )
        };
        let messages = vec![tool_msg(), Message::user("middle"), tool_msg()];
        let stripped = strip_old_tool_calls(messages, 1);
        assert_eq!(stripped.len(), 3);
        // Old tool message keeps only its text block.
        assert!(stripped[0].tool_use_ids().is_empty());
        assert_eq!(stripped[0].flat_text(), "running it");
        // The recent one is untouched.
        assert_eq!(stripped[2].tool_use_ids(), vec!["t1"]);
    }

    #[test]
    fn query_concatenates_recent_users_and_prompt() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
            Message::user("third"),
        ];
        let q = build_query(&messages, "the prompt", 2);
        assert_eq!(q, "second\nthird\nthe prompt");
    }

    #[test]
    fn memory_block_groups_by_category() {
        use crate::memory::{Fact, FactCategory, Scope};
        let fact = |value: &str, category: FactCategory| ScoredFact {
            fact: Fact {
                id: 1,
                scope: Scope::User,
                user_id: "u".into(),
                agent_id: None,
                session_id: None,
                key: None,
                value: value.into(),
                category,
                content_hash: String::new(),
                created_at: 0,
                updated_at: 0,
                last_accessed_at: 0,
                metadata: None,
            },
            score: 0.9,
        };
        let block = format_memory(&[
            fact("prefers rust", FactCategory::Preference),
            fact("works on billing", FactCategory::Project),
            fact("prefers tabs", FactCategory::Preference),
        ]);
        assert!(block.starts_with("Relevant knowledge"));
        assert!(block.contains("[preference]\n- prefers rust\n- prefers tabs"));
        assert!(block.contains("[project]\n- works on billing"));
    }
}
