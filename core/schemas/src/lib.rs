use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Source & Version Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: SourceId,
    pub filename: String,
    pub path: Option<String>,
    pub kind: String,
    pub deleted: bool,
    pub first_seen_at: String, // RFC3339
    pub last_seen_at: String,  // RFC3339
    pub last_checksum: String,
    pub metadata: serde_json::Value,
}

/// One immutable content snapshot of a source. A new version is created only
/// when the exact-content checksum differs from the current latest version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVersion {
    pub source_id: SourceId,
    pub version: u32,
    pub checksum: String,
    pub fuzzy_checksum: String,
    pub content: String,
    pub byte_len: u64,
    pub created_at: String, // RFC3339
    pub metadata: serde_json::Value,
}

/// Outcome of the "did the content actually change" decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDecision {
    pub changed: bool,
    pub version: u32,
}

// ============================================================================
// Memory Schema
// ============================================================================

/// Memory lifecycle marker for rows written by the extraction pipeline.
pub const MEMORY_KIND_ATOMIC: &str = "extracted_atomic_memory";

/// Deprecated one-row-per-document representation. Rows carrying this kind
/// (their id equals their source id) are deleted whenever the owning source
/// goes through the atomic extraction path.
pub const MEMORY_KIND_DOCUMENT: &str = "document";

/// One atomic, user-facing fact derived from a source version.
///
/// Manual fields belong to the user and are never written by automation;
/// auto fields belong to the pipeline. The effective value of a field is the
/// manual override when present, otherwise the auto value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub source_id: SourceId,
    pub source_version: u32,
    pub memory_kind: String,
    pub extracted_kind: String,
    pub fingerprint: String,
    pub statement: String,
    pub manual_title: Option<String>,
    pub manual_notes: Option<String>,
    pub pinned_tags: Vec<String>,
    pub auto_title: Option<String>,
    pub auto_summary: Option<String>,
    pub auto_tags: Vec<String>,
    pub confidence: Option<f32>,
    pub project: Option<String>,
    pub source_url: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

impl MemoryRecord {
    pub fn effective_title(&self) -> Option<&str> {
        self.manual_title.as_deref().or(self.auto_title.as_deref())
    }

    pub fn effective_summary(&self) -> &str {
        self.auto_summary.as_deref().unwrap_or(&self.statement)
    }

    pub fn effective_tags(&self) -> &[String] {
        if self.pinned_tags.is_empty() {
            &self.auto_tags
        } else {
            &self.pinned_tags
        }
    }
}

// ============================================================================
// Categories
// ============================================================================

/// Fixed category buckets for extracted facts. Unrecognized kinds land in
/// `Inbox` rather than failing the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryCategory {
    #[serde(rename = "preferences")]
    Preferences,
    #[serde(rename = "people")]
    People,
    #[serde(rename = "commitments")]
    Commitments,
    #[serde(rename = "decisions")]
    Decisions,
    #[serde(rename = "knowledge")]
    Knowledge,
    #[serde(rename = "resources")]
    Resources,
    #[serde(rename = "events")]
    Events,
    #[serde(rename = "inbox")]
    Inbox,
}

impl MemoryCategory {
    /// Map an extractor-reported kind to a bucket, case-insensitively.
    pub fn from_kind(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "preference" | "preferences" => MemoryCategory::Preferences,
            "person" | "people" => MemoryCategory::People,
            "commitment" | "commitments" => MemoryCategory::Commitments,
            "decision" | "decisions" => MemoryCategory::Decisions,
            "knowledge" | "fact" | "facts" => MemoryCategory::Knowledge,
            "resource" | "resources" => MemoryCategory::Resources,
            "event" | "events" => MemoryCategory::Events,
            _ => MemoryCategory::Inbox,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Preferences => "preferences",
            MemoryCategory::People => "people",
            MemoryCategory::Commitments => "commitments",
            MemoryCategory::Decisions => "decisions",
            MemoryCategory::Knowledge => "knowledge",
            MemoryCategory::Resources => "resources",
            MemoryCategory::Events => "events",
            MemoryCategory::Inbox => "inbox",
        }
    }

    /// Stable row id for the category table (`cat_preferences`, ...).
    pub fn category_id(&self) -> String {
        format!("cat_{}", self.as_str())
    }
}

/// Which process wrote a category assignment. Assignments from different
/// sources coexist on the same memory and never overwrite each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentSource {
    #[serde(rename = "extractor_agent")]
    ExtractorAgent,
    #[serde(rename = "organizer_agent")]
    OrganizerAgent,
}

impl AssignmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentSource::ExtractorAgent => "extractor_agent",
            AssignmentSource::OrganizerAgent => "organizer_agent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryAssignment {
    pub memory_id: MemoryId,
    pub category_id: String,
    pub assignment_source: AssignmentSource,
    pub created_at: String, // RFC3339
}

// ============================================================================
// Evidence, Links, Aliases
// ============================================================================

/// Citation from a memory back into a span of a specific source version.
/// Offsets are best-effort provenance: absent when the excerpt could not be
/// located as a literal substring of the version's markdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub memory_id: MemoryId,
    pub source_id: SourceId,
    pub source_version: u32,
    pub start_offset: Option<u32>,
    pub end_offset: Option<u32>,
    pub excerpt: String,
    pub created_at: String, // RFC3339
}

/// Directed edge between two memories. Callers create both directions for a
/// symmetric relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedMemoryLink {
    pub memory_id: MemoryId,
    pub related_memory_id: MemoryId,
    pub relation_type: String,
    pub confidence: Option<f32>,
    pub reason: Option<String>,
    pub created_at: String, // RFC3339
}

/// Proposed duplicate mapping between two sources. Stays inactive until a
/// human or a trusted process promotes it; never auto-applied to memory data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAlias {
    pub alias_source_id: SourceId,
    pub canonical_source_id: SourceId,
    pub confidence: Option<f32>,
    pub reason: Option<String>,
    pub proposal_source: String,
    pub is_active: bool,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

// ============================================================================
// Audit Runs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// Append-only audit row for one extraction attempt. Mutated exactly once,
/// to transition from `running` to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRun {
    pub id: RunId,
    pub source_id: SourceId,
    pub source_version: u32,
    pub model: String,
    pub status: RunStatus,
    pub memory_count: u32,
    pub error: Option<String>,
    pub started_at: String,           // RFC3339
    pub finished_at: Option<String>,  // RFC3339
}

/// Audit row for organizer/consolidator passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: RunId,
    pub job_kind: String,
    pub status: RunStatus,
    pub item_count: u32,
    pub error: Option<String>,
    pub started_at: String,          // RFC3339
    pub finished_at: Option<String>, // RFC3339
}

// ============================================================================
// Extractor Collaborator Shapes
// ============================================================================

/// One candidate atomic fact returned by the extractor collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFact {
    pub kind: String,
    pub statement: String,
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: Option<f32>,
    pub evidence_text: Option<String>,
}

/// Full extractor output for one source version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub memories: Vec<CandidateFact>,
    pub summary: Option<String>,
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub filename: String,
    pub markdown: String,
    pub source_path: Option<String>,
    pub external_source_id: Option<String>,
    pub agentfs_uri: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub source: SourceRecord,
    pub extracted_memories: Vec<MemoryRecord>,
    pub extracted_count: usize,
    pub extraction_run_id: Option<RunId>,
    pub version: u32,
    pub changed: bool,
    pub extraction_skipped: bool,
}

/// One ranked search hit, 1-based so `[N1]` in answer text lines up with
/// the first element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCitation {
    pub rank: usize,
    pub score: f64,
    pub memory: MemoryRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerMode {
    #[serde(rename = "model")]
    Model,
    #[serde(rename = "heuristic")]
    Heuristic,
    #[serde(rename = "fallback")]
    Fallback,
    #[serde(rename = "empty")]
    Empty,
}

impl AnswerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerMode::Model => "model",
            AnswerMode::Heuristic => "heuristic",
            AnswerMode::Fallback => "fallback",
            AnswerMode::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundedAnswer {
    pub answer_text: String,
    pub citations: Vec<RankedCitation>,
    pub mode: AnswerMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBrief {
    pub context_text: String,
    pub citations: Vec<RankedCitation>,
    pub mode: AnswerMode,
}

// ============================================================================
// Organizer / Consolidator Proposals
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryDecision {
    pub memory_id: MemoryId,
    pub bucket: String,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedLinkProposal {
    pub memory_id: MemoryId,
    pub related_memory_id: MemoryId,
    pub relation_type: Option<String>,
    pub confidence: Option<f32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasProposal {
    pub memory_id: MemoryId,
    pub duplicate_memory_id: MemoryId,
    pub confidence: Option<f32>,
    pub reason: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_run_id() -> RunId {
    RunId(format!("run_{}", ulid::Ulid::new()))
}

pub fn generate_job_id() -> RunId {
    RunId(format!("job_{}", ulid::Ulid::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_generation() {
        let run_id = generate_run_id();
        assert!(run_id.0.starts_with("run_"));
        assert_eq!(run_id.0.len(), 30); // "run_" + 26 chars

        let job_id = generate_job_id();
        assert!(job_id.0.starts_with("job_"));
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            MemoryCategory::from_kind("Preferences"),
            MemoryCategory::Preferences
        );
        assert_eq!(MemoryCategory::from_kind("PEOPLE"), MemoryCategory::People);
        assert_eq!(
            MemoryCategory::from_kind("decision"),
            MemoryCategory::Decisions
        );
        assert_eq!(
            MemoryCategory::from_kind("something-new"),
            MemoryCategory::Inbox
        );
        assert_eq!(
            MemoryCategory::Preferences.category_id(),
            "cat_preferences"
        );
    }

    #[test]
    fn test_effective_field_resolution() {
        let mut memory = MemoryRecord {
            id: MemoryId("mem".into()),
            source_id: SourceId("src".into()),
            source_version: 1,
            memory_kind: MEMORY_KIND_ATOMIC.to_string(),
            extracted_kind: "preferences".into(),
            fingerprint: "fp".into(),
            statement: "Prefers soccer on weekends.".into(),
            manual_title: None,
            manual_notes: None,
            pinned_tags: vec![],
            auto_title: Some("Soccer preference".into()),
            auto_summary: None,
            auto_tags: vec!["sports".into()],
            confidence: Some(0.9),
            project: None,
            source_url: None,
            embedding: None,
            created_at: "2025-01-01T00:00:00Z".into(),
            updated_at: "2025-01-01T00:00:00Z".into(),
        };

        assert_eq!(memory.effective_title(), Some("Soccer preference"));
        assert_eq!(memory.effective_summary(), "Prefers soccer on weekends.");
        assert_eq!(memory.effective_tags(), ["sports".to_string()].as_slice());

        memory.manual_title = Some("My title".into());
        memory.pinned_tags = vec!["pinned".into()];
        assert_eq!(memory.effective_title(), Some("My title"));
        assert_eq!(memory.effective_tags(), ["pinned".to_string()].as_slice());
    }

    #[test]
    fn test_ingest_request_serialization() {
        let request = IngestRequest {
            filename: "notes.md".into(),
            markdown: "I like soccer on weekends.".into(),
            source_path: Some("/vault/notes.md".into()),
            external_source_id: None,
            agentfs_uri: None,
            metadata: Some(serde_json::json!({ "project": "personal" })),
        };

        let json = serde_json::to_string(&request).unwrap();
        let restored: IngestRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.filename, request.filename);
        assert_eq!(restored.markdown, request.markdown);
    }

    #[test]
    fn test_candidate_fact_defaults() {
        let json = r#"{ "kind": "preferences", "statement": "Likes tea." }"#;
        let fact: CandidateFact = serde_json::from_str(json).unwrap();
        assert!(fact.tags.is_empty());
        assert!(fact.confidence.is_none());
        assert!(fact.evidence_text.is_none());
    }
}
