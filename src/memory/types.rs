use serde::{Deserialize, Serialize};

/// Visibility / lifetime tier of a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    User,
    Agent,
    Session,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Agent => "agent",
            Scope::Session => "session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Scope::User),
            "agent" => Some(Scope::Agent),
            "session" => Some(Scope::Session),
            _ => None,
        }
    }
}

/// What kind of knowledge a fact captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    Preference,
    Decision,
    Project,
    System,
    ErrorPattern,
    Personal,
    Workflow,
}

impl FactCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FactCategory::Preference => "preference",
            FactCategory::Decision => "decision",
            FactCategory::Project => "project",
            FactCategory::System => "system",
            FactCategory::ErrorPattern => "error_pattern",
            FactCategory::Personal => "personal",
            FactCategory::Workflow => "workflow",
        }
    }

    /// Parse a category name, folding the variants extraction models
    /// actually produce onto the canonical set.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "preference" | "preferences" | "pref" => Some(FactCategory::Preference),
            "decision" | "decisions" | "choice" => Some(FactCategory::Decision),
            "project" | "projects" | "task" => Some(FactCategory::Project),
            "system" | "environment" | "config" | "configuration" => Some(FactCategory::System),
            "error_pattern" | "error" | "errors" | "bug" => Some(FactCategory::ErrorPattern),
            "personal" | "identity" | "bio" => Some(FactCategory::Personal),
            "workflow" | "process" | "habit" => Some(FactCategory::Workflow),
            _ => None,
        }
    }
}

/// A persistent fact row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub scope: Scope,
    pub user_id: String,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub key: Option<String>,
    pub value: String,
    pub category: FactCategory,
    pub content_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_accessed_at: i64,
    pub metadata: Option<String>,
}

/// A retrieved fact with its relevance score.
#[derive(Debug, Clone)]
pub struct ScoredFact {
    pub fact: Fact,
    pub score: f32,
}

/// A conversation summary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub user_id: String,
    pub topic: String,
    pub content: String,
    pub entities: Vec<String>,
    pub projects: Vec<String>,
    pub source_messages: usize,
    pub vector_content_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A reinforced behavioral pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: i64,
    pub user_id: String,
    pub agent_id: String,
    pub pattern_type: String,
    pub observation_count: u32,
    pub confidence: f32,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Audit event types for the append-only interactions log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Extracted,
    Retrieved,
    Reinforced,
    Corrected,
    Deleted,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionKind::Extracted => "extracted",
            InteractionKind::Retrieved => "retrieved",
            InteractionKind::Reinforced => "reinforced",
            InteractionKind::Corrected => "corrected",
            InteractionKind::Deleted => "deleted",
        }
    }
}

/// Input for `store_fact`.
#[derive(Debug, Clone)]
pub struct NewFact {
    pub user_id: String,
    pub scope: Scope,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub key: Option<String>,
    pub value: String,
    pub category: FactCategory,
    pub metadata: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

impl NewFact {
    pub fn user_scoped(user_id: &str, value: &str, category: FactCategory) -> Self {
        Self {
            user_id: user_id.into(),
            scope: Scope::User,
            agent_id: None,
            session_id: None,
            key: None,
            value: value.into(),
            category,
            metadata: None,
            embedding: None,
        }
    }
}

/// What `store_fact` reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreFactOutcome {
    pub fact_id: i64,
    pub created: bool,
    pub embedding_stored: bool,
}

/// Query for `retrieve_facts`.
#[derive(Debug, Clone)]
pub struct FactQuery {
    pub user_id: String,
    pub query: String,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub query_embedding: Option<Vec<f32>>,
    pub top_k: usize,
    pub min_score: f32,
    pub scopes: Option<Vec<Scope>>,
    pub categories: Option<Vec<FactCategory>>,
}

impl FactQuery {
    pub fn new(user_id: &str, query: &str) -> Self {
        Self {
            user_id: user_id.into(),
            query: query.into(),
            agent_id: None,
            session_id: None,
            query_embedding: None,
            top_k: 10,
            min_score: 0.0,
            scopes: None,
            categories: None,
        }
    }
}
