use crate::memory::Scope;

/// Top-level engine error. Hooks trap this and degrade to passthrough;
/// it only reaches callers of the direct APIs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("embedding error: {0}")]
    Embed(#[from] EmbedError),
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("engine is disabled after a fatal initialization failure")]
    Disabled,
}

/// Structural problems in tool-use / tool-result blocks. Only surfaced in
/// strict validation; sanitization repairs them silently.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid tool use id: {0:?}")]
    InvalidToolUseId(String),
    #[error("invalid tool result block referencing {0:?}")]
    InvalidToolResultBlock(String),
}

/// Embedding tier failures. The hash tier cannot fail, so these never
/// escape the tiered embedder itself.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("wrong dimension: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
}

/// Chat / extraction LLM failures.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
}

/// Database and pool failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Memory API failures. Raised to memory API callers; the selector traps
/// them and omits context injection.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("user_id is required")]
    MissingUserId,
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    #[error("agent_id is required for {0:?}-scoped facts")]
    MissingAgentId(Scope),
    #[error("session_id is required for session-scoped facts")]
    MissingSessionId,
    #[error("storage failed: {0}")]
    StorageFailed(String),
    #[error("retrieval failed: {0}")]
    RetrievalFailed(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Store(StoreError::Db(e))
    }
}

/// Tool-result subsystem failures.
#[derive(Debug, thiserror::Error)]
pub enum ToolStoreError {
    #[error("no stored result with id {0:?} (ids look like tr_XXXXXXXX)")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for ToolStoreError {
    fn from(e: rusqlite::Error) -> Self {
        ToolStoreError::Store(StoreError::Db(e))
    }
}
