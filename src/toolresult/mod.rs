use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::embed::{cosine, Embedder};
use crate::error::ToolStoreError;
use crate::llm::LlmClient;
use crate::store::tool_results::{chunk_text, ChunkHit, NewToolResult, ToolResultStore};
use crate::tokenize::estimate_tokens;
use crate::types::{ToolReturnEvent, ToolReturnOutcome};

/// Character budget for truncation previews inside placeholders.
const PREVIEW_BUDGET: usize = 500;
/// Summary length bounds.
const SUMMARY_MIN_CHARS: usize = 150;
const SUMMARY_TARGET_CHARS: usize = 300;
const SUMMARY_MAX_CHARS: usize = 500;
/// Summarization call timeout; one retry against the fallback model.
const SUMMARY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// The tool families this subsystem knows how to threshold and truncate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Browser,
    Exec,
    FileRead,
    WebFetch,
    Process,
    Other,
}

impl ToolKind {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("browser") {
            ToolKind::Browser
        } else if lower.contains("exec") || lower.contains("bash") || lower.contains("shell") {
            ToolKind::Exec
        } else if lower.contains("read") || lower.contains("file") {
            ToolKind::FileRead
        } else if lower.contains("fetch") || lower.contains("http") {
            ToolKind::WebFetch
        } else if lower.contains("process") {
            ToolKind::Process
        } else {
            ToolKind::Other
        }
    }

    /// Token threshold above which a result is externalized.
    pub fn threshold(self) -> usize {
        match self {
            ToolKind::Browser => 500,
            ToolKind::Exec => 1_500,
            ToolKind::FileRead => 2_500,
            ToolKind::WebFetch => 2_500,
            ToolKind::Process => 1_500,
            ToolKind::Other => 2_000,
        }
    }

    /// Command output has meaningful heads and tails; prose does not.
    fn head_tail(self) -> bool {
        matches!(self, ToolKind::Exec | ToolKind::Process)
    }

    fn summary_instruction(self) -> &'static str {
        match self {
            ToolKind::Browser => "Summarize this page content: main topic, key facts, links worth following.",
            ToolKind::Exec => "Summarize this command output: what ran, whether it succeeded, notable errors or warnings.",
            ToolKind::FileRead => "Summarize this file: what it contains, its structure, notable definitions.",
            ToolKind::WebFetch => "Summarize this fetched document: main topic and key facts.",
            ToolKind::Process => "Summarize this process output: state, progress, errors.",
            ToolKind::Other => "Summarize this tool output: what it shows and why it matters.",
        }
    }
}

/// How to read back a stored result.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrieveMode {
    Full,
    Search { query: String, context_lines: usize },
    Lines { start: usize, end: usize },
    Around { line: usize, context: usize },
}

/// A semantic hit over stored result chunks.
#[derive(Debug, Clone)]
pub struct ChunkSearchHit {
    pub result_id: String,
    pub chunk_idx: usize,
    pub tool_name: String,
    pub session_id: Option<String>,
    pub score: f32,
    pub text: String,
}

/// Externalizes oversize tool results: stores them out-of-band, replaces
/// the transcript block with a compact reference, and serves structured
/// retrieval by id.
#[derive(Clone)]
pub struct ToolResultService {
    store: ToolResultStore,
    embedder: Arc<Embedder>,
    llm: Option<Arc<dyn LlmClient>>,
    fallback_llm: Option<Arc<dyn LlmClient>>,
    chunk_size: usize,
    chunk_overlap: usize,
    index_chunks: bool,
}

impl ToolResultService {
    pub fn new(store: ToolResultStore, embedder: Arc<Embedder>) -> Self {
        Self {
            store,
            embedder,
            llm: None,
            fallback_llm: None,
            chunk_size: 500,
            chunk_overlap: 50,
            index_chunks: false,
        }
    }

    pub fn with_summarizer(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Smaller model tried once when the primary summarizer fails.
    pub fn with_fallback_summarizer(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.fallback_llm = Some(llm);
        self
    }

    pub fn with_chunking(mut self, size: usize, overlap: usize) -> Self {
        self.chunk_size = size.max(1);
        self.chunk_overlap = overlap;
        self.index_chunks = true;
        self
    }

    pub fn store(&self) -> &ToolResultStore {
        &self.store
    }

    /// The tool-call-return entry point. Oversize results come back as a
    /// placeholder block; everything else passes through.
    pub async fn intercept(&self, event: &ToolReturnEvent) -> ToolReturnOutcome {
        let kind = ToolKind::from_name(&event.tool_name);
        let tokens = estimate_tokens(&event.result);
        if tokens <= kind.threshold() {
            return ToolReturnOutcome::Passthrough;
        }

        match self.externalize(event, kind, tokens).await {
            Ok(placeholder) => ToolReturnOutcome::Result(placeholder),
            Err(e) => {
                warn!(error = %e, tool = %event.tool_name, "externalization failed, passing through");
                ToolReturnOutcome::Passthrough
            }
        }
    }

    async fn externalize(
        &self,
        event: &ToolReturnEvent,
        kind: ToolKind,
        tokens: usize,
    ) -> Result<String, ToolStoreError> {
        let preview = truncate_for_kind(kind, &event.result, PREVIEW_BUDGET);
        let (row, created) = self
            .store
            .store(
                &event.result,
                NewToolResult {
                    session_id: event.ctx.session_id.clone(),
                    tool_use_id: event.tool_use_id.clone(),
                    tool_name: event.tool_name.clone(),
                    preview_text: preview.clone(),
                    metadata: None,
                    ttl_millis: None,
                },
            )
            .await
            .map_err(ToolStoreError::Store)?;

        if created && self.index_chunks {
            let chunks = chunk_text(&event.result, self.chunk_size, self.chunk_overlap);
            if !chunks.is_empty() {
                let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                let vectors = self.embedder.embed_batch(&texts, 10).await;
                self.store
                    .insert_chunks(&row.result_id, &chunks, Some(&vectors))
                    .await
                    .map_err(ToolStoreError::Store)?;
                debug!(result_id = %row.result_id, chunks = chunks.len(), "indexed result chunks");
            }
        }

        let body = match self.summarize(kind, &event.result).await {
            Some(summary) => summary,
            None => preview,
        };

        info!(result_id = %row.result_id, tool = %event.tool_name, tokens, "externalized tool result");
        Ok(build_placeholder(
            &row.result_id,
            &event.tool_name,
            tokens,
            row.created_at,
            &body,
        ))
    }

    /// Model summary bounded to the configured lengths. Falls back to the
    /// secondary model once, then to None (caller uses the preview).
    async fn summarize(&self, kind: ToolKind, text: &str) -> Option<String> {
        let primary = self.llm.as_ref()?;
        let prompt = format!(
            "{}\nKeep it between {SUMMARY_MIN_CHARS} and {SUMMARY_MAX_CHARS} characters, \
             around {SUMMARY_TARGET_CHARS}.\n\n{}",
            kind.summary_instruction(),
            &text[..floor_char_boundary(text, 6_000)]
        );

        for (attempt, client) in [Some(primary), self.fallback_llm.as_ref()]
            .into_iter()
            .flatten()
            .enumerate()
        {
            let call = client.generate(&prompt, None, 0.3, 300);
            match tokio::time::timeout(SUMMARY_TIMEOUT, call).await {
                Ok(Ok(summary)) => {
                    let trimmed = summary.trim();
                    if !trimmed.is_empty() {
                        return Some(clip_chars(trimmed, SUMMARY_MAX_CHARS));
                    }
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "summarization failed"),
                Err(_) => warn!(attempt, "summarization timed out"),
            }
        }
        None
    }

    /// Read back a stored result with a metadata header. `max_tokens`
    /// further truncates the content with a visible marker.
    pub async fn retrieve(
        &self,
        result_id: &str,
        mode: RetrieveMode,
        max_tokens: Option<usize>,
    ) -> Result<String, ToolStoreError> {
        let row = self.store.get(result_id).await?;

        let content = match mode {
            RetrieveMode::Full => row.full_text.clone(),
            RetrieveMode::Search {
                query,
                context_lines,
            } => search_lines(&row.full_text, &query, context_lines),
            RetrieveMode::Lines { start, end } => slice_lines(&row.full_text, start, end),
            RetrieveMode::Around { line, context } => slice_lines(
                &row.full_text,
                line.saturating_sub(context).max(1),
                line + context,
            ),
        };

        let header = format!(
            "=== {} | tool: {} | {} tokens | stored {} ===\n",
            row.result_id,
            row.tool_name,
            row.token_count,
            format_millis(row.created_at),
        );

        let budget_chars = max_tokens.map(|t| t * 4);
        let content = match budget_chars {
            Some(budget) if content.len() > budget => {
                let clipped = clip_chars(&content, budget);
                format!("{clipped}\n... [truncated to fit token budget] ...")
            }
            _ => content,
        };

        Ok(format!("{header}{content}"))
    }

    /// Semantic search across all embedded chunks, optionally filtered by
    /// tool and session.
    pub async fn search_results(
        &self,
        query: &str,
        tool_filter: Option<&str>,
        session_filter: Option<&str>,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ChunkSearchHit>, ToolStoreError> {
        let query_vec = self.embedder.embed(query).await;
        let chunks = self
            .store
            .all_embedded_chunks()
            .await
            .map_err(ToolStoreError::Store)?;

        let mut hits: Vec<ChunkSearchHit> = chunks
            .into_iter()
            .filter(|hit| {
                tool_filter.map_or(true, |t| hit.tool_name == t)
                    && session_filter.map_or(true, |s| hit.session_id.as_deref() == Some(s))
            })
            .filter_map(|hit: ChunkHit| {
                let vector = hit.chunk.vector.as_ref()?;
                let score = cosine(&query_vec, vector);
                if score < min_score {
                    return None;
                }
                Some(ChunkSearchHit {
                    result_id: hit.chunk.result_id,
                    chunk_idx: hit.chunk.chunk_idx,
                    tool_name: hit.tool_name,
                    session_id: hit.session_id,
                    score,
                    text: hit.chunk.text,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// TTL + LRU eviction pass, fire-and-forget from the engine's deferred
    /// cleanup.
    pub async fn evict(&self) -> usize {
        match self.store.evict().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "tool result eviction failed");
                0
            }
        }
    }
}

/// The compact transcript replacement for a stored result.
fn build_placeholder(
    result_id: &str,
    tool_name: &str,
    tokens: usize,
    created_at: i64,
    body: &str,
) -> String {
    format!(
        "[STORED: {result_id}]\n\
         🔧 Tool: {tool_name}\n\
         📏 Size: ~{tokens} tokens\n\
         🕐 Stored: {}\n\
         📝 Summary:\n{body}\n\
         💡 Retrieve with id {result_id} (modes: full, search, lines, around)",
        format_millis(created_at),
    )
}

/// Head/tail truncation for command-like output, head-only for the rest.
pub fn truncate_for_kind(kind: ToolKind, text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }

    if kind.head_tail() {
        let head_budget = budget * 6 / 10;
        let tail_budget = budget - head_budget;
        let head = clip_chars(text, head_budget);
        let tail_start = floor_char_boundary(text, text.len() - tail_budget);
        let tail = &text[tail_start..];
        let omitted = text[head.len()..tail_start].lines().count();
        format!("{head}\n... [{omitted} lines omitted] ...\n{tail}")
    } else {
        // Head-only, snapped to the last newline in the front 80%.
        let hard = clip_chars(text, budget);
        let snap_floor = budget * 8 / 10;
        let cut = match hard.rfind('\n') {
            Some(pos) if pos >= snap_floor => pos,
            _ => hard.len(),
        };
        format!("{}\n... [truncated] ...", &hard[..cut])
    }
}

fn clip_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let end = floor_char_boundary(text, max);
    text[..end].to_string()
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    i = i.min(text.len());
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Matching lines with context, blocks separated by `---`.
fn search_lines(text: &str, query: &str, context: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let needle = query.to_lowercase();
    let mut blocks: Vec<String> = Vec::new();
    let mut last_end = 0usize;

    for (i, line) in lines.iter().enumerate() {
        if !line.to_lowercase().contains(&needle) {
            continue;
        }
        let start = i.saturating_sub(context).max(last_end);
        let end = (i + context + 1).min(lines.len());
        let block: Vec<String> = (start..end)
            .map(|n| format!("{:>5}: {}", n + 1, lines[n]))
            .collect();
        blocks.push(block.join("\n"));
        last_end = end;
    }

    if blocks.is_empty() {
        format!("no lines matching {query:?}")
    } else {
        blocks.join("\n---\n")
    }
}

/// 1-based inclusive line slice with line numbers.
fn slice_lines(text: &str, start: usize, end: usize) -> String {
    let start = start.max(1);
    text.lines()
        .enumerate()
        .filter(|(i, _)| (start - 1..end).contains(i))
        .map(|(i, line)| format!("{:>5}: {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| millis.to_string())
}
