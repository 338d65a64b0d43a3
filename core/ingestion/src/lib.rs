pub mod database;
pub mod extractor;
pub mod identity;
pub mod organizer;
pub mod pipeline;

pub use database::Database;
pub use extractor::{ExtractorError, FactExtractor, LlmConfig, LlmExtractor, LlmProvider};
pub use identity::{
    content_checksum, derive_memory_id, derive_source_id, fact_fingerprint, fuzzy_checksum,
};
pub use organizer::{AliasOutcome, MemoryOrganizer, OrganizerOutcome};
pub use pipeline::IngestionPipeline;
