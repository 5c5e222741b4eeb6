use std::collections::HashMap;

/// Minimum token length for scoring. Keyword extraction uses a stricter
/// cutoff (`MIN_KEYWORD_LEN`).
const MIN_TOKEN_LEN: usize = 2;
pub(crate) const MIN_KEYWORD_LEN: usize = 3;

/// Lowercase, strip punctuation, split on whitespace. Pure-numeric tokens
/// survive regardless of length; everything else must be at least two chars.
pub fn tokenize(text: &str) -> Vec<String> {
    split_tokens(text, MIN_TOKEN_LEN)
}

/// Tokenization for keyword extraction: same normalization, length >= 3.
pub fn tokenize_keywords(text: &str) -> Vec<String> {
    split_tokens(text, MIN_KEYWORD_LEN)
}

fn split_tokens(text: &str, min_len: usize) -> Vec<String> {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();

    normalized
        .split_whitespace()
        .filter(|t| t.len() >= min_len || t.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Term frequency table for a text.
pub fn term_frequency(text: &str) -> HashMap<String, usize> {
    let mut freq = HashMap::new();
    for token in tokenize(text) {
        *freq.entry(token).or_insert(0) += 1;
    }
    freq
}

/// Tokens plus the two numbers every scorer wants alongside them.
#[derive(Debug, Clone)]
pub struct TokenStats {
    pub tokens: Vec<String>,
    pub unique_count: usize,
    pub length: usize,
}

pub fn token_stats(text: &str) -> TokenStats {
    let tokens = tokenize(text);
    let unique_count = tokens
        .iter()
        .collect::<std::collections::HashSet<_>>()
        .len();
    let length = tokens.len();
    TokenStats {
        tokens,
        unique_count,
        length,
    }
}

/// Token-count estimate from raw text. chars/4 heuristic — good enough for
/// threshold checks, and cheap enough to run on every tool result.
pub fn estimate_tokens(s: &str) -> usize {
    s.len() / 4
}
