pub mod config;
pub mod embed;
pub mod error;
pub mod expand;
pub mod hooks;
pub mod llm;
pub mod memory;
pub mod prefilter;
pub mod scoring;
pub mod select;
pub mod store;
pub mod threads;
pub mod tokenize;
pub mod toolresult;
pub mod types;
pub mod validate;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::{EngineConfig, ExpandStrategy, FusionMode, StorageMode};
pub use embed::{Embedder, EmbedderInfo, HashEmbedder, RemoteEmbedder, TextEncoder, Tier};
pub use error::{
    EmbedError, EngineError, LlmError, MemoryError, StoreError, ToolStoreError, ValidationError,
};
pub use hooks::Pipeline;
pub use llm::{AnthropicClient, CrossEncoder, LlmClient};
pub use memory::{
    ConflictAction, ConflictResolver, Extractor, ExtractorSettings, Fact, FactCategory, FactQuery,
    FactStore, NewFact, Scope, ScoredFact,
};
pub use select::Selector;
pub use store::{FtsIndex, IndexStore};
pub use toolresult::{RetrieveMode, ToolKind, ToolResultService};
pub use types::{
    ContentBlock, HookContext, HookOutcome, Message, MessageContent, Role, ToolReturnEvent,
    ToolReturnOutcome, TurnEvent,
};

use expand::QueryExpander;
use memory::extract::ExtractReport;
use store::tool_results::ToolResultStore;

/// Recommended embedding dimension.
pub const DEFAULT_DIMENSION: usize = 384;
/// Deferred cleanup runs this long after first database contact.
const DEFERRED_CLEANUP_DELAY: Duration = Duration::from_secs(5);
/// Interval between maintenance passes after the deferred one.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

/// Wires up an [`Engine`]. Cloneable so the lazy pipeline can retry a
/// failed build only by explicit re-registration, never implicitly.
#[derive(Clone)]
pub struct EngineBuilder {
    config: Map<String, Value>,
    db_path: Option<PathBuf>,
    in_memory: bool,
    dimension: usize,
    encoder: Option<Arc<dyn TextEncoder>>,
    remote: Option<RemoteEmbedder>,
    llm: Option<Arc<dyn LlmClient>>,
    fallback_llm: Option<Arc<dyn LlmClient>>,
    reranker: Option<Arc<dyn CrossEncoder>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: Map::new(),
            db_path: None,
            in_memory: false,
            dimension: DEFAULT_DIMENSION,
            encoder: None,
            remote: None,
            llm: None,
            fallback_llm: None,
            reranker: None,
        }
    }

    /// Host-provided config map (camelCase keys per the config surface).
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// In-memory database; state dies with the engine. Test default.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Local embedding tier (in-process model).
    pub fn with_encoder(mut self, encoder: impl TextEncoder + 'static) -> Self {
        self.encoder = Some(Arc::new(encoder));
        self
    }

    /// Remote embedding tier.
    pub fn with_remote_embedder(mut self, remote: RemoteEmbedder) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Chat LLM for extraction, expansion, conflicts, and summarization.
    pub fn with_llm(mut self, llm: impl LlmClient + 'static) -> Self {
        self.llm = Some(Arc::new(llm));
        self
    }

    /// Smaller model for the summarization retry.
    pub fn with_fallback_llm(mut self, llm: impl LlmClient + 'static) -> Self {
        self.fallback_llm = Some(Arc::new(llm));
        self
    }

    pub fn with_reranker(mut self, reranker: impl CrossEncoder + 'static) -> Self {
        self.reranker = Some(Arc::new(reranker));
        self
    }

    /// Build the engine: open storage, assemble the tiered embedder, wire
    /// the selector, extractor, and tool-result service, and start the
    /// background tasks.
    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = EngineConfig::resolve(&self.config);

        let index = if self.in_memory {
            IndexStore::in_memory().await?
        } else {
            let path = self
                .db_path
                .clone()
                .unwrap_or_else(store::default_db_path);
            IndexStore::open(&path).await?
        };

        let mut embedder = Embedder::hash_only(self.dimension);
        if let Some(encoder) = self.encoder {
            embedder = embedder.with_local(encoder);
        }
        if let Some(remote) = self.remote {
            embedder = embedder.with_remote(remote);
        }
        let embedder = Arc::new(embedder);

        let facts = if config.memory {
            Some(
                FactStore::new(index.clone())
                    .await?
                    .with_limits(config.memory_user_limit, config.memory_agent_limit),
            )
        } else {
            None
        };

        let expander = QueryExpander::new(config.multi_query_strategy, self.llm.clone());
        let mut selector = Selector::new(embedder.clone(), index.clone(), expander);
        if config.fts5_search {
            // Keyword search is a latency optimization; a database built
            // without the FTS5 module must not take the engine down.
            match FtsIndex::new(index.pool().clone()).await {
                Ok(fts) => selector = selector.with_fts(fts),
                Err(e) => warn!(error = %e, "FTS index unavailable, pre-filtering disabled"),
            }
        }
        if let Some(facts) = &facts {
            selector = selector.with_facts(facts.clone());
        }
        if let Some(reranker) = self.reranker {
            selector = selector.with_reranker(reranker);
        }

        let tool_store = ToolResultStore::new(index.pool().clone()).await?;
        let mut tool_results = ToolResultService::new(tool_store, embedder.clone());
        if config.tool_result_index {
            tool_results = tool_results
                .with_chunking(config.tool_index_chunk_size, config.tool_index_chunk_overlap);
        }
        if let Some(llm) = &self.llm {
            tool_results = tool_results.with_summarizer(llm.clone());
        }
        if let Some(fallback) = &self.fallback_llm {
            tool_results = tool_results.with_fallback_summarizer(fallback.clone());
        }

        let extractor = match (&facts, &self.llm) {
            (Some(facts), Some(llm)) if config.memory_extract => Some(Extractor::new(
                facts.clone(),
                embedder.clone(),
                llm.clone(),
                ExtractorSettings {
                    batch_size: config.extract_batch_size,
                    min_confidence: config.extract_min_confidence,
                    resolve_conflicts: config.extract_conflicts,
                    storage_mode: config.storage_mode,
                    summary_dedup_threshold: config.summary_dedup_threshold,
                    session_ttl_millis: config.memory_session_ttl_secs * 1_000,
                },
            )),
            _ => None,
        };

        let cancel = CancellationToken::new();
        let mut tasks = vec![index.pool().spawn_idle_sweeper(cancel.clone())];
        tasks.push(spawn_deferred_cleanup(
            index.clone(),
            tool_results.clone(),
            facts.clone(),
            cancel.clone(),
        ));

        info!(
            dimension = self.dimension,
            memory = config.memory,
            fts = config.fts5_search,
            "engine built"
        );

        Ok(Engine {
            config,
            index,
            embedder,
            selector,
            facts,
            tool_results,
            extractor,
            cancel,
            background: Mutex::new(tasks),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Maintenance task: one deferred pass a few seconds after first database
/// contact, then periodic sweeps. Each pass runs the embedding LRU, tool
/// result TTL/LRU, and fact scope ceilings.
fn spawn_deferred_cleanup(
    index: IndexStore,
    tool_results: ToolResultService,
    facts: Option<FactStore>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = DEFERRED_CLEANUP_DELAY;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = MAINTENANCE_INTERVAL;

            if let Err(e) = index.evict_lru().await {
                warn!(error = %e, "embedding eviction failed");
            }
            tool_results.evict().await;
            if let Some(facts) = &facts {
                if let Err(e) = facts.enforce_limits().await {
                    warn!(error = %e, "fact cleanup failed");
                }
            }
            debug!("maintenance pass complete");
        }
    })
}

/// Process-wide owner of every subsystem: the tiered embedder, the index
/// store, the fact store, the selector, the extractor, and the tool-result
/// service — with explicit initialization and teardown ordering.
pub struct Engine {
    config: EngineConfig,
    index: IndexStore,
    embedder: Arc<Embedder>,
    selector: Selector,
    facts: Option<FactStore>,
    tool_results: ToolResultService,
    extractor: Option<Extractor>,
    cancel: CancellationToken,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn embedder_info(&self) -> EmbedderInfo {
        self.embedder.info()
    }

    pub fn facts(&self) -> Option<&FactStore> {
        self.facts.as_ref()
    }

    pub fn tool_results(&self) -> &ToolResultService {
        &self.tool_results
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Config effective for this event: the base snapshot overlaid with
    /// the model-family profile, model id pinned from the event context.
    pub fn effective_config(&self, ctx: &HookContext) -> EngineConfig {
        let model_id = ctx
            .model_id
            .clone()
            .or_else(|| self.config.model_id.clone());
        let mut effective = match &model_id {
            Some(id) => self.config.with_profile(EngineConfig::model_family(id)),
            None => self.config.clone(),
        };
        effective.model_id = model_id;
        effective
    }

    /// Before-turn: run the selector over the event transcript.
    pub async fn before_turn(&self, event: &TurnEvent) -> HookOutcome {
        let config = self.effective_config(&event.ctx);
        let prompt = event.prompt.as_deref().unwrap_or("");
        let selected = self
            .selector
            .select(&event.messages, prompt, &event.ctx, &config)
            .await;
        HookOutcome::Messages(selected)
    }

    /// After-turn: feed the completed turn to the extractor. Errors are
    /// logged inside; this never fails the host.
    pub async fn after_turn(&self, event: &TurnEvent) -> ExtractReport {
        match &self.extractor {
            Some(extractor) => extractor.on_turn(&event.ctx, &event.messages).await,
            None => ExtractReport::default(),
        }
    }

    /// Tool-call-return: externalize oversize results.
    pub async fn tool_call_return(&self, event: &ToolReturnEvent) -> ToolReturnOutcome {
        self.tool_results.intercept(event).await
    }

    /// Abort background tasks without awaiting them.
    pub fn cancel_background(&self) {
        self.cancel.cancel();
    }

    /// Orderly teardown: cancel background tasks, wait for them, stop the
    /// pool from serving new waiters.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = {
            let mut guard = self.background.lock().expect("background task lock");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.index.pool().shutdown();
        info!("engine shut down");
    }
}
