use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::warn;

/// How extracted knowledge is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Facts,
    Summaries,
    Hybrid,
}

/// How multi-query result lists are fused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
    Rrf,
    Simple,
}

/// How query variants are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandStrategy {
    Auto,
    Llm,
    Rule,
}

/// Immutable configuration snapshot. Resolved once at engine init from
/// environment variables (`SC_*`), the host-provided config map, and
/// defaults — in that precedence order. Flags never change for the engine
/// lifetime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Selection
    pub top_k: usize,
    pub recent_n: usize,
    pub min_score: f32,
    pub strip_old_tool_calls: bool,
    pub model_id: Option<String>,
    pub profiles: HashMap<String, Map<String, Value>>,

    // Features
    pub tool_chain_groups: bool,
    pub bm25_hybrid: bool,
    pub dynamic_window: bool,
    pub query_result_cache: bool,
    pub batch_embed: bool,
    pub parallel_score: bool,
    pub tool_result_index: bool,
    pub fts5_search: bool,
    pub thread_aware: bool,
    pub cross_encoder_rerank: bool,
    pub multi_query: bool,

    // Memory
    pub memory: bool,
    pub memory_extract: bool,
    pub extract_batch_size: usize,
    pub extract_min_confidence: f32,
    pub extract_conflicts: bool,
    pub memory_max_facts: usize,
    pub memory_min_score: f32,
    pub memory_session_ttl_secs: i64,
    pub memory_agent_limit: usize,
    pub memory_user_limit: usize,
    pub storage_mode: StorageMode,
    pub summary_dedup_threshold: f32,

    // Scoring weights
    pub bm25_weight: f32,
    pub cosine_weight: f32,

    // Dynamic window bounds
    pub min_top_k: usize,
    pub max_top_k: usize,

    // Concurrency
    pub batch_embed_size: usize,
    pub parallel_concurrency: usize,

    // Multi-query
    pub multi_query_count: usize,
    pub multi_query_fusion: FusionMode,
    pub multi_query_strategy: ExpandStrategy,
    pub rrf_k: f32,

    // Tool-result indexing
    pub tool_index_chunk_size: usize,
    pub tool_index_chunk_overlap: usize,

    // Thread detection
    pub thread_similarity_threshold: f32,
    pub thread_max_gap: usize,
    pub thread_window_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            recent_n: 5,
            min_score: 0.3,
            strip_old_tool_calls: false,
            model_id: None,
            profiles: HashMap::new(),

            tool_chain_groups: true,
            bm25_hybrid: false,
            dynamic_window: false,
            query_result_cache: true,
            batch_embed: false,
            parallel_score: false,
            tool_result_index: false,
            fts5_search: false,
            thread_aware: false,
            cross_encoder_rerank: false,
            multi_query: false,

            memory: false,
            memory_extract: false,
            extract_batch_size: 5,
            extract_min_confidence: 0.7,
            extract_conflicts: true,
            memory_max_facts: 10,
            memory_min_score: 0.75,
            memory_session_ttl_secs: 24 * 60 * 60,
            memory_agent_limit: 500,
            memory_user_limit: 1000,
            storage_mode: StorageMode::Hybrid,
            summary_dedup_threshold: 0.85,

            bm25_weight: 0.4,
            cosine_weight: 0.6,

            min_top_k: 5,
            max_top_k: 50,

            batch_embed_size: 10,
            parallel_concurrency: 10,

            multi_query_count: 3,
            multi_query_fusion: FusionMode::Rrf,
            multi_query_strategy: ExpandStrategy::Auto,
            rrf_k: 60.0,

            tool_index_chunk_size: 500,
            tool_index_chunk_overlap: 50,

            thread_similarity_threshold: 0.7,
            thread_max_gap: 5,
            thread_window_size: 3,
        }
    }
}

/// One resolution source lookup: env var first, then the host map.
struct Resolver<'a> {
    overrides: &'a Map<String, Value>,
}

impl<'a> Resolver<'a> {
    fn raw(&self, key: &str) -> Option<String> {
        if let Ok(v) = std::env::var(env_name(key)) {
            return Some(v);
        }
        self.overrides.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn bool_key(&self, key: &str, default: bool) -> bool {
        match self.raw(key).as_deref() {
            None => default,
            Some("true") => true,
            Some("false") => false,
            Some(other) => {
                warn!(key, value = other, "ignoring non-boolean config value");
                default
            }
        }
    }

    fn usize_key(&self, key: &str, default: usize, min: usize, max: usize) -> usize {
        match self.raw(key) {
            None => default,
            Some(raw) => match raw.parse::<usize>() {
                Ok(v) if (min..=max).contains(&v) => v,
                Ok(v) => {
                    warn!(key, value = v, min, max, "config value out of range");
                    default
                }
                Err(_) => {
                    warn!(key, value = %raw, "ignoring non-integer config value");
                    default
                }
            },
        }
    }

    fn i64_key(&self, key: &str, default: i64) -> i64 {
        match self.raw(key) {
            None => default,
            Some(raw) => match raw.parse::<i64>() {
                Ok(v) if v > 0 => v,
                Ok(v) => {
                    warn!(key, value = v, "config value must be positive");
                    default
                }
                Err(_) => {
                    warn!(key, value = %raw, "ignoring non-integer config value");
                    default
                }
            },
        }
    }

    fn f32_key(&self, key: &str, default: f32, min: f32, max: f32) -> f32 {
        match self.raw(key) {
            None => default,
            Some(raw) => match raw.parse::<f32>() {
                Ok(v) if v >= min && v <= max => v,
                Ok(v) => {
                    warn!(key, value = v, min, max, "config value out of range");
                    default
                }
                Err(_) => {
                    warn!(key, value = %raw, "ignoring non-float config value");
                    default
                }
            },
        }
    }

    fn string_key(&self, key: &str) -> Option<String> {
        self.raw(key)
    }
}

/// `topK` -> `SC_TOP_K`, `memorySessionTTL` -> `SC_MEMORY_SESSION_TTL`.
fn env_name(key: &str) -> String {
    let mut out = String::from("SC_");
    let mut prev_upper = true;
    for c in key.chars() {
        if c.is_ascii_uppercase() && !prev_upper {
            out.push('_');
        }
        prev_upper = c.is_ascii_uppercase();
        out.push(c.to_ascii_uppercase());
    }
    out
}

impl EngineConfig {
    /// Resolve a snapshot from the host-provided config map and environment.
    pub fn resolve(overrides: &Map<String, Value>) -> Self {
        let r = Resolver { overrides };
        let defaults = Self::default();

        let mut cfg = Self {
            top_k: r.usize_key("topK", defaults.top_k, 1, 10_000),
            recent_n: r.usize_key("recentN", defaults.recent_n, 0, 1_000),
            min_score: r.f32_key("minScore", defaults.min_score, 0.0, 1.0),
            strip_old_tool_calls: r.bool_key("stripOldToolCalls", defaults.strip_old_tool_calls),
            model_id: r.string_key("modelId"),
            profiles: overrides
                .get("profiles")
                .and_then(Value::as_object)
                .map(|families| {
                    families
                        .iter()
                        .filter_map(|(family, partial)| {
                            partial
                                .as_object()
                                .map(|p| (family.clone(), p.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default(),

            tool_chain_groups: r.bool_key("toolChainGroups", defaults.tool_chain_groups),
            bm25_hybrid: r.bool_key("bm25Hybrid", defaults.bm25_hybrid),
            dynamic_window: r.bool_key("dynamicWindow", defaults.dynamic_window),
            query_result_cache: r.bool_key("queryResultCache", defaults.query_result_cache),
            batch_embed: r.bool_key("batchEmbed", defaults.batch_embed),
            parallel_score: r.bool_key("parallelScore", defaults.parallel_score),
            tool_result_index: r.bool_key("toolResultIndex", defaults.tool_result_index),
            fts5_search: r.bool_key("fts5Search", defaults.fts5_search),
            thread_aware: r.bool_key("threadAware", defaults.thread_aware),
            cross_encoder_rerank: r.bool_key("crossEncoderRerank", defaults.cross_encoder_rerank),
            multi_query: r.bool_key("multiQuery", defaults.multi_query),

            memory: r.bool_key("memory", defaults.memory),
            memory_extract: r.bool_key("memoryExtract", defaults.memory_extract),
            extract_batch_size: r.usize_key("extractBatchSize", defaults.extract_batch_size, 1, 20),
            extract_min_confidence: r.f32_key(
                "extractMinConfidence",
                defaults.extract_min_confidence,
                0.0,
                1.0,
            ),
            extract_conflicts: r.bool_key("extractConflicts", defaults.extract_conflicts),
            memory_max_facts: r.usize_key("memoryMaxFacts", defaults.memory_max_facts, 1, 100),
            memory_min_score: r.f32_key("memoryMinScore", defaults.memory_min_score, 0.0, 1.0),
            memory_session_ttl_secs: r.i64_key("memorySessionTTL", defaults.memory_session_ttl_secs),
            memory_agent_limit: r.usize_key(
                "memoryAgentLimit",
                defaults.memory_agent_limit,
                1,
                1_000_000,
            ),
            memory_user_limit: r.usize_key(
                "memoryUserLimit",
                defaults.memory_user_limit,
                1,
                1_000_000,
            ),
            storage_mode: match r.string_key("storageMode").as_deref() {
                None => defaults.storage_mode,
                Some("facts") => StorageMode::Facts,
                Some("summaries") => StorageMode::Summaries,
                Some("hybrid") => StorageMode::Hybrid,
                Some(other) => {
                    warn!(value = other, "unknown storageMode, using hybrid");
                    StorageMode::Hybrid
                }
            },
            summary_dedup_threshold: r.f32_key(
                "summaryDedupThreshold",
                defaults.summary_dedup_threshold,
                0.0,
                1.0,
            ),

            bm25_weight: r.f32_key("bm25Weight", defaults.bm25_weight, 0.0, 1.0),
            cosine_weight: r.f32_key("cosineWeight", defaults.cosine_weight, 0.0, 1.0),

            min_top_k: r.usize_key("minTopK", defaults.min_top_k, 1, 10_000),
            max_top_k: r.usize_key("maxTopK", defaults.max_top_k, 1, 10_000),

            batch_embed_size: r.usize_key("batchEmbedSize", defaults.batch_embed_size, 1, 1_000),
            parallel_concurrency: r.usize_key(
                "parallelConcurrency",
                defaults.parallel_concurrency,
                1,
                256,
            ),

            multi_query_count: r.usize_key("multiQueryCount", defaults.multi_query_count, 1, 10),
            multi_query_fusion: match r.string_key("multiQueryFusion").as_deref() {
                None => defaults.multi_query_fusion,
                Some("rrf") => FusionMode::Rrf,
                Some("simple") => FusionMode::Simple,
                Some(other) => {
                    warn!(value = other, "unknown multiQueryFusion, using rrf");
                    FusionMode::Rrf
                }
            },
            multi_query_strategy: match r.string_key("multiQueryStrategy").as_deref() {
                None => defaults.multi_query_strategy,
                Some("auto") => ExpandStrategy::Auto,
                Some("llm") => ExpandStrategy::Llm,
                Some("rule") => ExpandStrategy::Rule,
                Some(other) => {
                    warn!(value = other, "unknown multiQueryStrategy, using auto");
                    ExpandStrategy::Auto
                }
            },
            rrf_k: r.f32_key("rrfK", defaults.rrf_k, 1.0, 1_000.0),

            tool_index_chunk_size: r.usize_key(
                "toolIndexChunkSize",
                defaults.tool_index_chunk_size,
                50,
                10_000,
            ),
            tool_index_chunk_overlap: r.usize_key(
                "toolIndexChunkOverlap",
                defaults.tool_index_chunk_overlap,
                0,
                1_000,
            ),

            thread_similarity_threshold: r.f32_key(
                "threadSimilarityThreshold",
                defaults.thread_similarity_threshold,
                0.0,
                1.0,
            ),
            thread_max_gap: r.usize_key("threadMaxGap", defaults.thread_max_gap, 1, 100),
            thread_window_size: r.usize_key("threadWindowSize", defaults.thread_window_size, 1, 100),
        };

        cfg.validate();
        cfg
    }

    /// Cross-field consistency checks. Inconsistent values are repaired to
    /// defaults with a warning rather than failing init.
    fn validate(&mut self) {
        let weight_sum = self.bm25_weight + self.cosine_weight;
        if (weight_sum - 1.0).abs() > 1e-3 {
            warn!(
                bm25 = self.bm25_weight,
                cosine = self.cosine_weight,
                "bm25Weight + cosineWeight must sum to 1.0, using defaults"
            );
            self.bm25_weight = 0.4;
            self.cosine_weight = 0.6;
        }
        if self.min_top_k > self.max_top_k {
            warn!(
                min = self.min_top_k,
                max = self.max_top_k,
                "minTopK > maxTopK, using defaults"
            );
            self.min_top_k = 5;
            self.max_top_k = 50;
        }
        if self.tool_index_chunk_overlap >= self.tool_index_chunk_size {
            warn!(
                size = self.tool_index_chunk_size,
                overlap = self.tool_index_chunk_overlap,
                "chunk overlap must be smaller than chunk size, using defaults"
            );
            self.tool_index_chunk_size = 500;
            self.tool_index_chunk_overlap = 50;
        }
    }

    /// Apply a model-family profile over this snapshot. Profile keys use the
    /// same names as the host config map and win over the base values.
    pub fn with_profile(&self, family: &str) -> Self {
        let Some(partial) = self.profiles.get(family) else {
            return self.clone();
        };
        // Re-run the resolver over the current snapshot with the profile
        // keys layered on top; env still wins.
        let mut merged = self.as_map();
        for (k, v) in partial {
            merged.insert(k.clone(), v.clone());
        }
        let mut cfg = EngineConfig::resolve(&merged);
        cfg.profiles = self.profiles.clone();
        cfg
    }

    /// Snapshot back to the wire-shaped map, so profile merging can rerun
    /// the resolver with the current values as its fallback layer.
    fn as_map(&self) -> Map<String, Value> {
        let mut m = Map::new();
        let mut b = |k: &str, v: bool| {
            m.insert(k.into(), Value::String(v.to_string()));
        };
        b("stripOldToolCalls", self.strip_old_tool_calls);
        b("toolChainGroups", self.tool_chain_groups);
        b("bm25Hybrid", self.bm25_hybrid);
        b("dynamicWindow", self.dynamic_window);
        b("queryResultCache", self.query_result_cache);
        b("batchEmbed", self.batch_embed);
        b("parallelScore", self.parallel_score);
        b("toolResultIndex", self.tool_result_index);
        b("fts5Search", self.fts5_search);
        b("threadAware", self.thread_aware);
        b("crossEncoderRerank", self.cross_encoder_rerank);
        b("multiQuery", self.multi_query);
        b("memory", self.memory);
        b("memoryExtract", self.memory_extract);
        b("extractConflicts", self.extract_conflicts);

        m.insert("topK".into(), Value::from(self.top_k));
        m.insert("recentN".into(), Value::from(self.recent_n));
        m.insert("minScore".into(), Value::from(self.min_score as f64));
        if let Some(model) = &self.model_id {
            m.insert("modelId".into(), Value::String(model.clone()));
        }
        m.insert("extractBatchSize".into(), Value::from(self.extract_batch_size));
        m.insert(
            "extractMinConfidence".into(),
            Value::from(self.extract_min_confidence as f64),
        );
        m.insert("memoryMaxFacts".into(), Value::from(self.memory_max_facts));
        m.insert(
            "memoryMinScore".into(),
            Value::from(self.memory_min_score as f64),
        );
        m.insert(
            "memorySessionTTL".into(),
            Value::from(self.memory_session_ttl_secs),
        );
        m.insert("memoryAgentLimit".into(), Value::from(self.memory_agent_limit));
        m.insert("memoryUserLimit".into(), Value::from(self.memory_user_limit));
        m.insert(
            "storageMode".into(),
            Value::String(
                match self.storage_mode {
                    StorageMode::Facts => "facts",
                    StorageMode::Summaries => "summaries",
                    StorageMode::Hybrid => "hybrid",
                }
                .into(),
            ),
        );
        m.insert(
            "summaryDedupThreshold".into(),
            Value::from(self.summary_dedup_threshold as f64),
        );
        m.insert("bm25Weight".into(), Value::from(self.bm25_weight as f64));
        m.insert("cosineWeight".into(), Value::from(self.cosine_weight as f64));
        m.insert("minTopK".into(), Value::from(self.min_top_k));
        m.insert("maxTopK".into(), Value::from(self.max_top_k));
        m.insert("batchEmbedSize".into(), Value::from(self.batch_embed_size));
        m.insert(
            "parallelConcurrency".into(),
            Value::from(self.parallel_concurrency),
        );
        m.insert("multiQueryCount".into(), Value::from(self.multi_query_count));
        m.insert(
            "multiQueryFusion".into(),
            Value::String(
                match self.multi_query_fusion {
                    FusionMode::Rrf => "rrf",
                    FusionMode::Simple => "simple",
                }
                .into(),
            ),
        );
        m.insert(
            "multiQueryStrategy".into(),
            Value::String(
                match self.multi_query_strategy {
                    ExpandStrategy::Auto => "auto",
                    ExpandStrategy::Llm => "llm",
                    ExpandStrategy::Rule => "rule",
                }
                .into(),
            ),
        );
        m.insert("rrfK".into(), Value::from(self.rrf_k as f64));
        m.insert(
            "toolIndexChunkSize".into(),
            Value::from(self.tool_index_chunk_size),
        );
        m.insert(
            "toolIndexChunkOverlap".into(),
            Value::from(self.tool_index_chunk_overlap),
        );
        m.insert(
            "threadSimilarityThreshold".into(),
            Value::from(self.thread_similarity_threshold as f64),
        );
        m.insert("threadMaxGap".into(), Value::from(self.thread_max_gap));
        m.insert(
            "threadWindowSize".into(),
            Value::from(self.thread_window_size),
        );
        m
    }

    /// The model family a model id belongs to, for profile lookup.
    pub fn model_family(model_id: &str) -> &'static str {
        let id = model_id.to_lowercase();
        if id.contains("kimi") {
            "kimi"
        } else if id.contains("claude") || id.contains("anthropic") {
            "anthropic"
        } else if id.contains("gemini") {
            "gemini"
        } else {
            "default"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn documented_defaults_hold() {
        let cfg = EngineConfig::default();
        assert!(cfg.tool_chain_groups);
        assert!(cfg.query_result_cache);
        assert_eq!(cfg.extract_batch_size, 5);
        assert_eq!(cfg.memory_user_limit, 1000);
        assert_eq!(cfg.storage_mode, StorageMode::Hybrid);
        assert!((cfg.bm25_weight - 0.4).abs() < f32::EPSILON);
        assert!((cfg.cosine_weight - 0.6).abs() < f32::EPSILON);
        assert_eq!(cfg.rrf_k, 60.0);
    }

    #[test]
    fn map_overrides_defaults() {
        let cfg = EngineConfig::resolve(&map(&[
            ("topK", json!(25)),
            ("fts5Search", json!("true")),
            ("minScore", json!(0.65)),
        ]));
        assert_eq!(cfg.top_k, 25);
        assert!(cfg.fts5_search);
        assert!((cfg.min_score - 0.65).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_falls_back_with_default() {
        let cfg = EngineConfig::resolve(&map(&[
            ("extractBatchSize", json!(50)),
            ("extractMinConfidence", json!(1.5)),
        ]));
        assert_eq!(cfg.extract_batch_size, 5);
        assert!((cfg.extract_min_confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn inconsistent_weights_repaired() {
        let cfg = EngineConfig::resolve(&map(&[
            ("bm25Weight", json!(0.9)),
            ("cosineWeight", json!(0.9)),
        ]));
        assert!((cfg.bm25_weight - 0.4).abs() < 1e-6);
        assert!((cfg.cosine_weight - 0.6).abs() < 1e-6);
    }

    #[test]
    fn min_over_max_window_repaired() {
        let cfg = EngineConfig::resolve(&map(&[("minTopK", json!(80)), ("maxTopK", json!(40))]));
        assert_eq!(cfg.min_top_k, 5);
        assert_eq!(cfg.max_top_k, 50);
    }

    #[test]
    fn env_name_mapping() {
        assert_eq!(env_name("topK"), "SC_TOP_K");
        assert_eq!(env_name("memorySessionTTL"), "SC_MEMORY_SESSION_TTL");
        assert_eq!(env_name("memory"), "SC_MEMORY");
    }

    #[test]
    fn profile_overrides_selection_keys() {
        let cfg = EngineConfig::resolve(&map(&[
            ("topK", json!(10)),
            (
                "profiles",
                json!({"gemini": {"topK": 30, "multiQuery": "true"}}),
            ),
        ]));
        let gemini = cfg.with_profile("gemini");
        assert_eq!(gemini.top_k, 30);
        assert!(gemini.multi_query);
        // Unprofiled keys carried over from base.
        assert_eq!(gemini.recent_n, cfg.recent_n);
        let unknown = cfg.with_profile("nonexistent");
        assert_eq!(unknown.top_k, 10);
    }

    #[test]
    fn model_family_detection() {
        assert_eq!(EngineConfig::model_family("claude-sonnet-4"), "anthropic");
        assert_eq!(EngineConfig::model_family("gemini-2.0-flash"), "gemini");
        assert_eq!(EngineConfig::model_family("kimi-k2"), "kimi");
        assert_eq!(EngineConfig::model_family("gpt-4o"), "default");
    }

    #[test]
    fn string_mode_enums_parse() {
        let cfg = EngineConfig::resolve(&map(&[
            ("storageMode", json!("facts")),
            ("multiQueryFusion", json!("simple")),
            ("multiQueryStrategy", json!("rule")),
        ]));
        assert_eq!(cfg.storage_mode, StorageMode::Facts);
        assert_eq!(cfg.multi_query_fusion, FusionMode::Simple);
        assert_eq!(cfg.multi_query_strategy, ExpandStrategy::Rule);
    }
}
