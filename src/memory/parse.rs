use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

/// A fact as the extraction model produced it, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFact {
    pub fact: String,
    pub category: String,
    pub confidence: f64,
    pub source_context: Option<String>,
}

/// A summary as the extraction model produced it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawSummary {
    pub topic: String,
    pub content: String,
    pub entities: Vec<String>,
    pub projects: Vec<String>,
}

/// Parse result. Exhausted recovery yields empty facts and no summary —
/// never an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedExtraction {
    pub facts: Vec<RawFact>,
    pub summary: Option<RawSummary>,
}

/// Staged recovery ladder for model output. Each stage is strictly more
/// permissive than the previous one; no stage lets an error escape.
///
/// 1. Normalize (escaped newlines, markdown fences, leading prose).
/// 2. Direct parse.
/// 3. Balanced object / array extraction.
/// 4. Repair: complete fact objects, then incomplete fact field triples,
///    then a balanced summary sub-object.
pub fn parse_extraction(raw: &str) -> ParsedExtraction {
    let text = normalize(raw);

    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        return from_value(&value);
    }

    if let Some(slice) = balanced_json(&text) {
        if let Ok(value) = serde_json::from_str::<Value>(slice) {
            return from_value(&value);
        }
    }

    debug!("extraction output malformed, entering repair mode");
    repair(&text)
}

/// Stage 1: make the text look like JSON if it plausibly contains some.
fn normalize(raw: &str) -> String {
    let mut text = raw.trim().to_string();

    // Escaped-only newlines: the model emitted literal backslash-n.
    if !text.contains('\n') && text.contains("\\n") {
        text = text.replace("\\n", "\n");
    }

    // Markdown fences, closed or unclosed.
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        text = match body.find("```") {
            Some(end) => body[..end].to_string(),
            None => body.to_string(),
        };
    }

    // Leading prose before the first JSON bracket.
    if let Some(start) = text.find(['{', '[']) {
        if start > 0 {
            text = text[start..].to_string();
        }
    }

    text.trim().to_string()
}

/// Extract the first balanced `{...}` or `[...]` from the text, honoring
/// string literals and escapes.
pub(crate) fn balanced_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find(['{', '['])?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Stage 4: regex-level salvage of whatever fact material survives.
fn repair(text: &str) -> ParsedExtraction {
    let mut facts = salvage_complete_objects(text);
    if facts.is_empty() {
        facts = salvage_field_triples(text);
    }
    let summary = salvage_summary(text);
    ParsedExtraction { facts, summary }
}

/// Any `{...}` without nesting that parses and carries the required fields.
fn salvage_complete_objects(text: &str) -> Vec<RawFact> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\{[^{}]*\}").expect("static pattern"));

    let mut facts = Vec::new();
    for m in re.find_iter(text) {
        if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
            if let Some(fact) = fact_from_value(&value) {
                facts.push(fact);
            }
        }
    }
    facts
}

/// Truncation cut a fact object open: match the field triple directly.
fn salvage_field_triples(text: &str) -> Vec<RawFact> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r#"(?s)"fact"\s*:\s*"((?:[^"\\]|\\.)*)"\s*,\s*"category"\s*:\s*"((?:[^"\\]|\\.)*)"\s*,\s*"confidence"\s*:\s*([0-9]*\.?[0-9]+)"#,
        )
        .expect("static pattern")
    });

    re.captures_iter(text)
        .filter_map(|cap| {
            Some(RawFact {
                fact: unescape(cap.get(1)?.as_str()),
                category: unescape(cap.get(2)?.as_str()),
                confidence: cap.get(3)?.as_str().parse().ok()?,
                source_context: None,
            })
        })
        .collect()
}

/// A balanced `"summary": {...}` sub-object, if one survived.
fn salvage_summary(text: &str) -> Option<RawSummary> {
    let key_pos = text.find("\"summary\"")?;
    let tail = &text[key_pos..];
    let slice = balanced_json(tail)?;
    let value = serde_json::from_str::<Value>(slice).ok()?;
    summary_from_value(&value)
}

fn from_value(value: &Value) -> ParsedExtraction {
    // A bare array is treated as the facts list.
    let facts_value = if value.is_array() {
        Some(value)
    } else {
        value.get("facts")
    };

    let facts = facts_value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(fact_from_value).collect())
        .unwrap_or_default();

    let summary = value.get("summary").and_then(summary_from_value);

    ParsedExtraction { facts, summary }
}

fn fact_from_value(value: &Value) -> Option<RawFact> {
    let fact = value.get("fact")?.as_str()?.to_string();
    let category = value.get("category")?.as_str()?.to_string();
    let confidence = value.get("confidence")?.as_f64()?;
    Some(RawFact {
        fact,
        category,
        confidence,
        source_context: value
            .get("source_context")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn summary_from_value(value: &Value) -> Option<RawSummary> {
    let topic = value.get("topic")?.as_str()?.to_string();
    let content = value.get("content")?.as_str()?.to_string();
    let strings = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    Some(RawSummary {
        topic,
        content,
        entities: strings("entities"),
        projects: strings("projects"),
    })
}

fn unescape(s: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{s}\"")).unwrap_or_else(|_| s.to_string())
}
