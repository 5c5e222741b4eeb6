pub mod conflict;
pub mod extract;
pub mod parse;
pub mod store;
pub mod types;

pub use conflict::{ConflictAction, ConflictResolver, Resolution};
pub use extract::{ExtractReport, Extractor, ExtractorSettings};
pub use parse::{parse_extraction, ParsedExtraction, RawFact, RawSummary};
pub use store::FactStore;
pub use types::{
    Fact, FactCategory, FactQuery, InteractionKind, NewFact, Pattern, Scope, ScoredFact,
    StoreFactOutcome, Summary,
};
