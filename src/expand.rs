use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use crate::config::ExpandStrategy;
use crate::llm::LlmClient;
use crate::tokenize::tokenize_keywords;

/// Bounded cache: this many entries, this long.
const CACHE_CAPACITY: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(300);

const EXPANSION_SYSTEM: &str = "You rewrite search queries. Reply with one \
alternative phrasing per line, no numbering, no commentary.";

/// A small technical synonym table for rule-based expansion.
fn synonyms(term: &str) -> &'static [&'static str] {
    match term {
        "error" => &["exception", "failure"],
        "bug" => &["error", "defect"],
        "config" => &["configuration", "settings"],
        "configure" => &["set up", "configuration"],
        "db" => &["database"],
        "database" => &["db", "storage"],
        "auth" => &["authentication", "login"],
        "fn" => &["function"],
        "function" => &["method"],
        "install" => &["set up", "add"],
        "delete" => &["remove", "drop"],
        "fast" => &["performance", "speed"],
        "slow" => &["performance", "latency"],
        "crash" => &["panic", "failure"],
        "test" => &["testing", "unit test"],
        "deploy" => &["deployment", "release"],
        _ => &[],
    }
}

const QUESTION_PREFIXES: &[&str] = &[
    "how do i ",
    "how do you ",
    "how to ",
    "how can i ",
    "what is the ",
    "what is ",
    "what are ",
    "why does ",
    "why is ",
    "where is ",
    "where can i ",
    "can you ",
    "could you ",
];

struct CacheEntry {
    variants: Vec<String>,
    created: Instant,
}

/// Generates query variants for multi-query retrieval. Rule-based expansion
/// is deterministic; the LLM strategy defers to a wired client. Results are
/// cached in a bounded LRU with a short TTL.
pub struct QueryExpander {
    strategy: ExpandStrategy,
    llm: Option<Arc<dyn LlmClient>>,
    cache: Mutex<(HashMap<String, CacheEntry>, VecDeque<String>)>,
}

impl QueryExpander {
    pub fn new(strategy: ExpandStrategy, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            strategy,
            llm,
            cache: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }

    /// Produce up to `count` query variants. The original query is always
    /// the first element.
    pub async fn expand(&self, query: &str, count: usize) -> Vec<String> {
        if count <= 1 || query.trim().is_empty() {
            return vec![query.to_string()];
        }

        if let Some(hit) = self.cache_get(query) {
            return truncate_variants(hit, count);
        }

        let use_llm = match self.strategy {
            ExpandStrategy::Llm => true,
            ExpandStrategy::Rule => false,
            ExpandStrategy::Auto => self.llm.is_some(),
        };

        let variants = if use_llm {
            match &self.llm {
                Some(client) => match self.expand_llm(client.as_ref(), query, count - 1).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "llm expansion failed, using rule expansion");
                        expand_rule(query)
                    }
                },
                None => {
                    warn!("llm expansion requested but no client wired, using rules");
                    expand_rule(query)
                }
            }
        } else {
            expand_rule(query)
        };

        let mut out = vec![query.to_string()];
        let lower_seen: HashSet<String> = [query.to_lowercase()].into();
        let mut seen = lower_seen;
        for v in variants {
            let key = v.to_lowercase();
            if !v.trim().is_empty() && seen.insert(key) {
                out.push(v);
            }
        }

        self.cache_put(query, out.clone());
        truncate_variants(out, count)
    }

    async fn expand_llm(
        &self,
        client: &dyn LlmClient,
        query: &str,
        count: usize,
    ) -> Result<Vec<String>, crate::error::LlmError> {
        let prompt = format!(
            "Generate {count} alternative phrasings of this search query:\n\n{query}"
        );
        let raw = client
            .generate(&prompt, Some(EXPANSION_SYSTEM), 0.7, 256)
            .await?;
        Ok(strip_listing(&raw))
    }

    fn cache_get(&self, query: &str) -> Option<Vec<String>> {
        let mut guard = self.cache.lock().expect("expander cache lock");
        let (map, _) = &mut *guard;
        match map.get(query) {
            Some(entry) if entry.created.elapsed() < CACHE_TTL => Some(entry.variants.clone()),
            Some(_) => {
                map.remove(query);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, query: &str, variants: Vec<String>) {
        let mut guard = self.cache.lock().expect("expander cache lock");
        let (map, order) = &mut *guard;
        if !map.contains_key(query) {
            order.push_back(query.to_string());
        }
        map.insert(
            query.to_string(),
            CacheEntry {
                variants,
                created: Instant::now(),
            },
        );
        while map.len() > CACHE_CAPACITY {
            match order.pop_front() {
                Some(oldest) => {
                    map.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

fn truncate_variants(mut variants: Vec<String>, count: usize) -> Vec<String> {
    variants.truncate(count.max(1));
    variants
}

/// Deterministic rule expansion: synonym substitutions, question-word
/// simplification, and a bare key-term variant.
fn expand_rule(query: &str) -> Vec<String> {
    let mut variants = Vec::new();
    let lower = query.to_lowercase();

    // Synonym substitution, one variant per (term, synonym) pair.
    for token in tokenize_keywords(&lower) {
        for syn in synonyms(&token) {
            let replaced = replace_word(&lower, &token, syn);
            if replaced != lower {
                variants.push(replaced);
            }
        }
    }

    // Question-word simplification.
    for prefix in QUESTION_PREFIXES {
        if let Some(rest) = lower.strip_prefix(prefix) {
            let simplified = rest.trim_end_matches('?').trim().to_string();
            if !simplified.is_empty() {
                variants.push(simplified);
            }
            break;
        }
    }

    // Key terms only.
    let keywords = tokenize_keywords(&lower)
        .into_iter()
        .filter(|t| !crate::prefilter::is_stop_word(t))
        .collect::<Vec<_>>()
        .join(" ");
    if !keywords.is_empty() && keywords != lower {
        variants.push(keywords);
    }

    debug!(count = variants.len(), "rule expansion produced variants");
    variants
}

/// Whole-word replacement.
fn replace_word(text: &str, word: &str, replacement: &str) -> String {
    let pattern = format!(r"\b{}\b", regex::escape(word));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, replacement).into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Strip numbering and bullets from LLM listing output.
fn strip_listing(raw: &str) -> Vec<String> {
    let marker = Regex::new(r"^\s*(?:\d+[.)]\s*|[-*•]\s*)").expect("static pattern");
    raw.lines()
        .map(|line| marker.replace(line, "").trim().trim_matches('"').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

// --- Fusion ---

/// Reciprocal Rank Fusion over ranked lists of document keys:
/// `score(d) = Σ 1/(k + rank(d))` with 1-based ranks. Ties break on first
/// appearance for determinism.
pub fn rrf_fuse(lists: &[Vec<usize>], k: f32) -> Vec<usize> {
    let mut scores: HashMap<usize, f32> = HashMap::new();
    let mut first_seen: HashMap<usize, usize> = HashMap::new();
    let mut order = 0usize;

    for list in lists {
        for (rank, doc) in list.iter().enumerate() {
            *scores.entry(*doc).or_insert(0.0) += 1.0 / (k + (rank + 1) as f32);
            first_seen.entry(*doc).or_insert_with(|| {
                order += 1;
                order
            });
        }
    }

    let mut fused: Vec<(usize, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| first_seen[&a.0].cmp(&first_seen[&b.0]))
    });
    fused.into_iter().map(|(doc, _)| doc).collect()
}

/// Round-robin interleave with dedup: first item of each list, then second,
/// and so on.
pub fn round_robin_fuse(lists: &[Vec<usize>]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let longest = lists.iter().map(Vec::len).max().unwrap_or(0);
    for i in 0..longest {
        for list in lists {
            if let Some(doc) = list.get(i) {
                if seen.insert(*doc) {
                    out.push(*doc);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;

    #[tokio::test]
    async fn original_query_always_first() {
        let expander = QueryExpander::new(ExpandStrategy::Rule, None);
        let variants = expander.expand("how do I configure the database?", 4).await;
        assert_eq!(variants[0], "how do I configure the database?");
        assert!(variants.len() > 1);
        assert!(variants.len() <= 4);
    }

    #[tokio::test]
    async fn rule_expansion_is_deterministic() {
        let expander = QueryExpander::new(ExpandStrategy::Rule, None);
        let a = expander.expand("db error in auth", 4).await;
        let b = expander.expand("db error in auth", 4).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn question_prefix_simplified() {
        let expander = QueryExpander::new(ExpandStrategy::Rule, None);
        let variants = expander.expand("how do i configure the pool?", 6).await;
        assert!(variants.iter().any(|v| v == "configure the pool"));
    }

    #[tokio::test]
    async fn llm_variants_stripped_and_deduped() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            "1. tuning the connection pool\n- pool size settings\npool size settings\nHow to size the pool?",
        ]));
        let expander = QueryExpander::new(ExpandStrategy::Llm, Some(llm));
        let variants = expander.expand("pool sizing", 5).await;
        assert_eq!(variants[0], "pool sizing");
        assert!(variants.contains(&"tuning the connection pool".to_string()));
        assert!(variants.contains(&"pool size settings".to_string()));
        // Duplicate line deduped.
        assert_eq!(
            variants
                .iter()
                .filter(|v| *v == "pool size settings")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_rules() {
        let llm = Arc::new(ScriptedLlm::failing());
        let expander = QueryExpander::new(ExpandStrategy::Llm, Some(llm));
        let variants = expander.expand("database error", 3).await;
        assert_eq!(variants[0], "database error");
        assert!(variants.len() > 1);
    }

    #[tokio::test]
    async fn auto_uses_rules_without_client() {
        let expander = QueryExpander::new(ExpandStrategy::Auto, None);
        let variants = expander.expand("config error", 3).await;
        assert!(variants.len() > 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_llm() {
        let llm = Arc::new(ScriptedLlm::new(vec!["variant one\nvariant two"]));
        let expander = QueryExpander::new(ExpandStrategy::Llm, Some(llm.clone()));
        let first = expander.expand("cached query", 3).await;
        let second = expander.expand("cached query", 3).await;
        assert_eq!(first, second);
        assert_eq!(llm.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn rrf_scores_accumulate_across_lists() {
        // doc 7 is mid-ranked in both lists; doc 1 tops one list only.
        let lists = vec![vec![1, 7, 3], vec![7, 4, 1]];
        let fused = rrf_fuse(&lists, 60.0);
        assert_eq!(fused[0], 7);
    }

    #[test]
    fn rrf_monotonicity_new_first_place_never_hurts() {
        let base = vec![vec![1, 2, 3], vec![2, 1, 3]];
        let fused_before = rrf_fuse(&base, 60.0);
        let pos_before = fused_before.iter().position(|&d| d == 3).unwrap();

        let mut extended = base.clone();
        extended.push(vec![3, 1, 2]);
        let fused_after = rrf_fuse(&extended, 60.0);
        let pos_after = fused_after.iter().position(|&d| d == 3).unwrap();

        assert!(pos_after <= pos_before);
    }

    #[test]
    fn round_robin_interleaves_and_dedups() {
        let lists = vec![vec![1, 2, 3], vec![4, 2, 5]];
        assert_eq!(round_robin_fuse(&lists), vec![1, 4, 2, 3, 5]);
    }
}
