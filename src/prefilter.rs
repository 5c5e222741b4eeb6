use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::store::FtsIndex;
use crate::tokenize::tokenize_keywords;
use crate::types::Message;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "you", "your", "with", "what", "when", "where", "which",
    "who", "why", "how", "can", "could", "should", "would", "does", "did", "has", "have", "had",
    "this", "that", "these", "those", "from", "into", "about", "there", "their", "them", "then",
    "but", "not", "all", "any", "out", "use", "using", "get", "got", "one", "two", "its",
];

pub(crate) fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

fn heuristics() -> &'static [Regex; 6] {
    static RES: OnceLock<[Regex; 6]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            // Quoted phrase
            Regex::new(r#""[^"]+""#).expect("static"),
            // Error-like tokens: FooError, SomeException, panicked
            Regex::new(r"\b\w+(?:Error|Exception|Panic)\b|\berror\b|\bpanic\b").expect("static"),
            // Function-like identifiers: foo(), foo_bar, fooBar
            Regex::new(r"\b\w+\(\)|\b[a-z]+_[a-z_]+\b|\b[a-z]+[A-Z]\w+\b").expect("static"),
            // Paths
            Regex::new(r"[/\\][\w.-]+[/\\]?|\b\w+\.(?:rs|py|ts|js|toml|json|yaml|sql)\b")
                .expect("static"),
            // Technical acronyms and SHOUTY_IDENTIFIERS
            Regex::new(r"[A-Z]{2,}").expect("static"),
            // 3-4 digit numbers (ports, status codes)
            Regex::new(r"\b\d{3,4}\b").expect("static"),
        ]
    })
}

/// Whether the query looks specific enough for keyword pre-filtering to
/// beat brute-force scoring.
pub fn should_prefilter(query: &str) -> bool {
    heuristics().iter().any(|re| re.is_match(query))
}

/// Extract search keywords: quoted phrases and uppercase identifiers stay
/// verbatim, everything else is tokenized with stop words removed.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    let mut seen = HashSet::new();

    let quoted = Regex::new(r#""([^"]+)""#).expect("static");
    let mut remainder = query.to_string();
    for cap in quoted.captures_iter(query) {
        let phrase = cap[1].to_string();
        if seen.insert(phrase.to_lowercase()) {
            keywords.push(format!("\"{phrase}\""));
        }
        remainder = remainder.replace(&cap[0], " ");
    }

    let upper = Regex::new(r"\b[A-Z][A-Za-z0-9_]*[A-Z]\w*\b|\b[A-Z]{2,}\b").expect("static");
    let snapshot = remainder.clone();
    for m in upper.find_iter(&snapshot) {
        let ident = m.as_str().to_string();
        if seen.insert(ident.to_lowercase()) {
            keywords.push(ident.clone());
            remainder = remainder.replace(m.as_str(), " ");
        }
    }

    for token in tokenize_keywords(&remainder) {
        if !is_stop_word(&token) && seen.insert(token.clone()) {
            keywords.push(token);
        }
    }

    keywords
}

/// Build an FTS5 MATCH expression: terms OR-joined, with a prefix wildcard
/// for terms of four or more characters. Quoted phrases pass through.
pub fn build_match_expr(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|kw| {
            if kw.starts_with('"') {
                kw.clone()
            } else if kw.len() >= 4 {
                format!("\"{kw}\"*")
            } else {
                format!("\"{kw}\"")
            }
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Shrink a candidate transcript to FTS survivors plus the last `recent_n`
/// messages. Any failure — indexing, querying, empty keyword set — returns
/// every index unchanged; keyword search is an optimization, never a gate.
pub async fn apply(
    fts: &FtsIndex,
    messages: &[Message],
    query: &str,
    candidate_budget: usize,
    recent_n: usize,
) -> Vec<usize> {
    let all: Vec<usize> = (0..messages.len()).collect();
    if !should_prefilter(query) {
        return all;
    }

    let keywords = extract_keywords(query);
    if keywords.is_empty() {
        return all;
    }

    // Index under host ids where present, synthetic ids otherwise.
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let entries: Vec<(String, String)> = messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let id = msg
                .id
                .clone()
                .unwrap_or_else(|| FtsIndex::synthetic_id(i));
            by_id.insert(id.clone(), i);
            (id, msg.flat_text())
        })
        .collect();

    if let Err(e) = fts.index_messages(&entries).await {
        warn!(error = %e, "FTS indexing failed, skipping pre-filter");
        return all;
    }

    let expr = build_match_expr(&keywords);
    let hits = match fts.search(&expr, candidate_budget * 2).await {
        Ok(hits) => hits,
        Err(e) => {
            warn!(error = %e, expr = %expr, "FTS query failed, skipping pre-filter");
            return all;
        }
    };

    let mut keep: HashSet<usize> = hits
        .iter()
        .filter_map(|(id, _)| by_id.get(id).copied())
        .collect();
    // The tail of the conversation always survives.
    let tail_start = messages.len().saturating_sub(recent_n);
    keep.extend(tail_start..messages.len());

    if keep.is_empty() {
        return all;
    }

    let mut survivors: Vec<usize> = keep.into_iter().collect();
    survivors.sort_unstable();
    debug!(
        survivors = survivors.len(),
        total = messages.len(),
        "FTS pre-filter reduced candidates"
    );
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConnectionPool;

    #[test]
    fn plain_prose_not_prefiltered() {
        assert!(!should_prefilter("tell me about the weather"));
    }

    #[test]
    fn technical_queries_trigger() {
        assert!(should_prefilter("what causes NullPointerException here"));
        assert!(should_prefilter("why does connect_timeout fire"));
        assert!(should_prefilter("look at src/main.rs"));
        assert!(should_prefilter("HTTP 404 from the API"));
        assert!(should_prefilter("search for \"exact phrase\""));
        assert!(should_prefilter("port 8080 conflict"));
    }

    #[test]
    fn keywords_preserve_quoted_and_uppercase() {
        let kws = extract_keywords("find \"connection refused\" in the SQLITE logs");
        assert!(kws.contains(&"\"connection refused\"".to_string()));
        assert!(kws.contains(&"SQLITE".to_string()));
        assert!(kws.iter().any(|k| k == "logs"));
        assert!(!kws.iter().any(|k| k == "the"));
    }

    #[test]
    fn match_expr_wildcards_long_terms() {
        let expr = build_match_expr(&[
            "\"exact phrase\"".to_string(),
            "database".to_string(),
            "db".to_string(),
        ]);
        assert_eq!(expr, "\"exact phrase\" OR \"database\"* OR \"db\"");
    }

    #[tokio::test]
    async fn survivors_include_matches_and_tail() {
        let fts = FtsIndex::new(ConnectionPool::in_memory().unwrap())
            .await
            .unwrap();
        let mut messages: Vec<Message> = (0..20)
            .map(|i| {
                let mut m = Message::user(format!("filler chatter number {i}"));
                m.id = Some(format!("m{i}"));
                m
            })
            .collect();
        messages[4] = {
            let mut m = Message::user("the SC_CONN_POOL variable controls pooling");
            m.id = Some("m4".into());
            m
        };

        let survivors = apply(&fts, &messages, "what is SC_CONN_POOL set to", 10, 3).await;
        assert!(survivors.contains(&4));
        assert!(survivors.contains(&17));
        assert!(survivors.contains(&18));
        assert!(survivors.contains(&19));
        assert!(survivors.len() < 20);
    }

    #[tokio::test]
    async fn non_technical_query_passes_through() {
        let fts = FtsIndex::new(ConnectionPool::in_memory().unwrap())
            .await
            .unwrap();
        let messages = vec![Message::user("a"), Message::user("b")];
        let survivors = apply(&fts, &messages, "tell me more please", 10, 1).await;
        assert_eq!(survivors, vec![0, 1]);
    }
}
