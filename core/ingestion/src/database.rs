use anyhow::Result;
use chrono::Utc;
use memory_engine_schemas::{
    generate_run_id, AssignmentSource, CandidateFact, CategoryAssignment, EvidenceSpan,
    ExtractionRun, MemoryCategory, MemoryId, MemoryRecord, RelatedMemoryLink, RunId, RunStatus,
    SourceAlias, SourceId, SourceRecord, SourceVersion, VersionDecision, MEMORY_KIND_ATOMIC,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::identity::{
    content_checksum, derive_memory_id, fact_fingerprint, fuzzy_checksum, normalize_statement,
};

/// Shortest statement accepted from the extractor, after normalization.
const MIN_STATEMENT_LEN: usize = 10;

/// Statements are capped here before fingerprinting so an extractor that
/// rambles cannot fork identity on trailing noise.
const MAX_STATEMENT_LEN: usize = 600;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the store and apply the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        let db = Self { conn };
        db.init_schema()?;

        info!("Database initialized");
        Ok(db)
    }

    /// Create all tables and indexes.
    fn init_schema(&self) -> Result<()> {
        // Sources (one row per canonical input identity; soft-delete only)
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                path TEXT,
                kind TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                last_checksum TEXT NOT NULL,
                metadata TEXT NOT NULL
            )",
            [],
        )?;

        // Source versions (append-only content snapshots)
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS source_versions (
                source_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                fuzzy_checksum TEXT NOT NULL,
                content TEXT NOT NULL,
                byte_len INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                metadata TEXT NOT NULL,
                PRIMARY KEY (source_id, version),
                UNIQUE (source_id, checksum)
            )",
            [],
        )?;

        // Memories (atomic facts; ids are content-derived, never random)
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                source_version INTEGER NOT NULL,
                memory_kind TEXT NOT NULL,
                extracted_kind TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                statement TEXT NOT NULL,
                manual_title TEXT,
                manual_notes TEXT,
                pinned_tags TEXT NOT NULL DEFAULT '[]',
                auto_title TEXT,
                auto_summary TEXT,
                auto_tags TEXT NOT NULL DEFAULT '[]',
                confidence REAL,
                project TEXT,
                source_url TEXT,
                embedding TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Category assignments; one row per (memory, category, writer)
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS memory_categories (
                memory_id TEXT NOT NULL,
                category_id TEXT NOT NULL,
                assignment_source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (memory_id, category_id, assignment_source)
            )",
            [],
        )?;

        // Directed related-memory edges
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS related_memories (
                memory_id TEXT NOT NULL,
                related_memory_id TEXT NOT NULL,
                relation_type TEXT NOT NULL,
                confidence REAL,
                reason TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (memory_id, related_memory_id, relation_type)
            )",
            [],
        )?;

        // Evidence citations; the set for a memory is replaced wholesale
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS evidence (
                memory_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                source_version INTEGER NOT NULL,
                start_offset INTEGER,
                end_offset INTEGER,
                excerpt TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Review-first duplicate-source proposals
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS source_aliases (
                alias_source_id TEXT NOT NULL,
                canonical_source_id TEXT NOT NULL,
                confidence REAL,
                reason TEXT,
                proposal_source TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (alias_source_id, canonical_source_id)
            )",
            [],
        )?;

        // Extraction audit trail
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS extraction_runs (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                source_version INTEGER NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                memory_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )",
            [],
        )?;

        // Organizer/consolidator audit trail
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                job_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                item_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )",
            [],
        )?;

        // Indexes for performance
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_versions_source ON source_versions(source_id, version DESC)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_source ON memories(source_id)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_updated ON memories(updated_at DESC)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_categories_memory ON memory_categories(memory_id)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_evidence_memory ON evidence(memory_id)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_related_memory ON related_memories(memory_id)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_source ON extraction_runs(source_id, started_at DESC)",
            [],
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========== SOURCES & VERSIONS ==========

    /// Insert or update the source row. Touching a source always clears the
    /// soft-delete flag and refreshes last-seen bookkeeping.
    pub fn upsert_source(
        &self,
        source_id: &str,
        filename: &str,
        path: Option<&str>,
        kind: &str,
        checksum: &str,
        metadata: &serde_json::Value,
    ) -> Result<SourceRecord> {
        let now = Utc::now().to_rfc3339();
        let metadata_json = serde_json::to_string(metadata)?;

        self.conn.execute(
            "INSERT INTO sources (id, filename, path, kind, deleted, first_seen_at,
                                  last_seen_at, last_checksum, metadata)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                path = excluded.path,
                kind = excluded.kind,
                deleted = 0,
                last_seen_at = excluded.last_seen_at,
                last_checksum = excluded.last_checksum,
                metadata = excluded.metadata",
            params![source_id, filename, path, kind, now, checksum, metadata_json],
        )?;

        debug!("Upserted source: {}", source_id);

        self.get_source(source_id)?
            .ok_or_else(|| anyhow::anyhow!("source {} missing after upsert", source_id))
    }

    pub fn get_source(&self, source_id: &str) -> Result<Option<SourceRecord>> {
        let source = self
            .conn
            .query_row(
                "SELECT id, filename, path, kind, deleted, first_seen_at,
                        last_seen_at, last_checksum, metadata
                 FROM sources WHERE id = ?1",
                params![source_id],
                |row| {
                    Ok(SourceRecord {
                        id: SourceId(row.get(0)?),
                        filename: row.get(1)?,
                        path: row.get(2)?,
                        kind: row.get(3)?,
                        deleted: row.get::<_, i64>(4)? != 0,
                        first_seen_at: row.get(5)?,
                        last_seen_at: row.get(6)?,
                        last_checksum: row.get(7)?,
                        metadata: serde_json::from_str(&row.get::<_, String>(8)?)
                            .unwrap_or(serde_json::Value::Null),
                    })
                },
            )
            .optional()?;

        Ok(source)
    }

    /// Soft-delete (or restore) a source. Rows are never hard-deleted.
    pub fn set_source_deleted(&self, source_id: &str, deleted: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE sources SET deleted = ?1 WHERE id = ?2",
            params![deleted as i64, source_id],
        )?;
        Ok(())
    }

    fn latest_version(&self, source_id: &str) -> Result<Option<(u32, String)>> {
        let latest = self
            .conn
            .query_row(
                "SELECT version, checksum FROM source_versions
                 WHERE source_id = ?1
                 ORDER BY version DESC
                 LIMIT 1",
                params![source_id],
                |row| Ok((row.get::<_, i64>(0)? as u32, row.get::<_, String>(1)?)),
            )
            .optional()?;

        Ok(latest)
    }

    /// The single authority for "did the content actually change".
    ///
    /// Returns the existing latest version untouched when its checksum
    /// matches; otherwise appends a new immutable snapshot at latest + 1.
    pub fn create_version_if_changed(
        &self,
        source_id: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<VersionDecision> {
        let checksum = content_checksum(content);

        if let Some((version, latest_checksum)) = self.latest_version(source_id)? {
            if latest_checksum == checksum {
                debug!("Source {} unchanged at version {}", source_id, version);
                return Ok(VersionDecision {
                    changed: false,
                    version,
                });
            }
        }

        let next_version = self
            .latest_version(source_id)?
            .map(|(version, _)| version + 1)
            .unwrap_or(1);
        let now = Utc::now().to_rfc3339();
        let metadata_json = serde_json::to_string(metadata)?;

        self.conn.execute(
            "INSERT INTO source_versions (source_id, version, checksum, fuzzy_checksum,
                                          content, byte_len, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                source_id,
                next_version as i64,
                checksum,
                fuzzy_checksum(content),
                content,
                content.len() as i64,
                now,
                metadata_json
            ],
        )?;

        info!("Created version {} for source {}", next_version, source_id);
        Ok(VersionDecision {
            changed: true,
            version: next_version,
        })
    }

    pub fn get_version(&self, source_id: &str, version: u32) -> Result<Option<SourceVersion>> {
        let row = self
            .conn
            .query_row(
                "SELECT source_id, version, checksum, fuzzy_checksum, content,
                        byte_len, created_at, metadata
                 FROM source_versions
                 WHERE source_id = ?1 AND version = ?2",
                params![source_id, version as i64],
                |row| {
                    Ok(SourceVersion {
                        source_id: SourceId(row.get(0)?),
                        version: row.get::<_, i64>(1)? as u32,
                        checksum: row.get(2)?,
                        fuzzy_checksum: row.get(3)?,
                        content: row.get(4)?,
                        byte_len: row.get::<_, i64>(5)? as u64,
                        created_at: row.get(6)?,
                        metadata: serde_json::from_str(&row.get::<_, String>(7)?)
                            .unwrap_or(serde_json::Value::Null),
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    // ========== ATOMIC MEMORY PERSISTENCE ==========

    /// Persist one extraction pass for a source version as a unit.
    ///
    /// Candidates are filtered and fingerprinted, surviving facts are
    /// upserted (manual overrides and created_at preserved), their
    /// extractor-side category and evidence rows are replaced, stale
    /// extracted rows for the source are pruned, and any legacy document
    /// memory is removed. With zero survivors and `allow_empty` unset the
    /// call fails before any deletion, so a degenerate extraction cannot
    /// wipe prior knowledge.
    pub fn apply_extracted_memories(
        &self,
        source_id: &str,
        source_version: u32,
        candidates: &[CandidateFact],
        allow_empty: bool,
    ) -> Result<Vec<MemoryRecord>> {
        let surviving = self.filter_candidates(candidates);

        if surviving.is_empty() && !allow_empty {
            anyhow::bail!(
                "extraction for source {} produced no usable facts; refusing to prune existing memories",
                source_id
            );
        }

        let source = self.get_source(source_id)?;
        let (project, source_url) = source
            .as_ref()
            .map(|s| {
                (
                    s.metadata
                        .get("project")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    s.metadata
                        .get("agentfs_uri")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                )
            })
            .unwrap_or((None, None));

        let version_content = self
            .get_version(source_id, source_version)?
            .map(|v| v.content)
            .unwrap_or_default();

        let now = Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        let mut kept_ids: Vec<String> = Vec::new();

        for (statement, fact) in &surviving {
            let fingerprint = fact_fingerprint(&fact.kind, statement);
            let memory_id = derive_memory_id(source_id, &fingerprint);
            let category = MemoryCategory::from_kind(&fact.kind);
            let auto_tags_json = serde_json::to_string(&fact.tags)?;

            tx.execute(
                "INSERT INTO memories (id, source_id, source_version, memory_kind,
                                       extracted_kind, fingerprint, statement,
                                       pinned_tags, auto_title, auto_summary, auto_tags,
                                       confidence, project, source_url,
                                       created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '[]', ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    source_version = excluded.source_version,
                    memory_kind = excluded.memory_kind,
                    extracted_kind = excluded.extracted_kind,
                    statement = excluded.statement,
                    auto_title = excluded.auto_title,
                    auto_summary = excluded.auto_summary,
                    auto_tags = excluded.auto_tags,
                    confidence = excluded.confidence,
                    project = excluded.project,
                    source_url = excluded.source_url,
                    updated_at = excluded.updated_at",
                params![
                    memory_id,
                    source_id,
                    source_version as i64,
                    MEMORY_KIND_ATOMIC,
                    fact.kind.trim().to_lowercase(),
                    fingerprint,
                    statement,
                    fact.title,
                    statement,
                    auto_tags_json,
                    fact.confidence,
                    project,
                    source_url,
                    now
                ],
            )?;

            // Replace the extractor-owned category assignment only; other
            // writers' rows for this memory stay untouched.
            tx.execute(
                "DELETE FROM memory_categories
                 WHERE memory_id = ?1 AND assignment_source = ?2",
                params![memory_id, AssignmentSource::ExtractorAgent.as_str()],
            )?;
            tx.execute(
                "INSERT INTO memory_categories (memory_id, category_id, assignment_source, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    memory_id,
                    category.category_id(),
                    AssignmentSource::ExtractorAgent.as_str(),
                    now
                ],
            )?;

            // Evidence is replaced wholesale so stale citations never pile up.
            let needle = fact.evidence_text.as_deref().unwrap_or(statement.as_str());
            let span = locate_excerpt(&version_content, needle);
            tx.execute(
                "DELETE FROM evidence WHERE memory_id = ?1",
                params![memory_id],
            )?;
            tx.execute(
                "INSERT INTO evidence (memory_id, source_id, source_version,
                                       start_offset, end_offset, excerpt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    memory_id,
                    source_id,
                    source_version as i64,
                    span.map(|(s, _)| s as i64),
                    span.map(|(_, e)| e as i64),
                    needle,
                    now
                ],
            )?;

            kept_ids.push(memory_id);
        }

        // Prune extracted rows this pass did not produce. Rows owned by
        // other lifecycles are out of bounds here.
        let kept: HashSet<&str> = kept_ids.iter().map(String::as_str).collect();
        let existing: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM memories WHERE source_id = ?1 AND memory_kind = ?2",
            )?;
            let ids = stmt
                .query_map(params![source_id, MEMORY_KIND_ATOMIC], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        for stale_id in existing.iter().filter(|id| !kept.contains(id.as_str())) {
            Self::delete_memory_row(&tx, stale_id)?;
            debug!("Pruned stale memory {}", stale_id);
        }

        // The deprecated one-row-per-document representation must not
        // survive an atomic extraction pass.
        Self::delete_memory_row(&tx, source_id)?;

        tx.commit()?;

        info!(
            "Applied {} extracted memories for source {} v{}",
            kept_ids.len(),
            source_id,
            source_version
        );

        self.memories_for_source(source_id)
    }

    /// Normalize candidates and drop the unusable ones: blank kinds, blank
    /// or sub-minimum statements, and in-batch fingerprint duplicates
    /// (first occurrence wins).
    fn filter_candidates<'a>(
        &self,
        candidates: &'a [CandidateFact],
    ) -> Vec<(String, &'a CandidateFact)> {
        let mut seen_fingerprints = HashSet::new();
        let mut surviving = Vec::new();

        for fact in candidates {
            if fact.kind.trim().is_empty() {
                continue;
            }
            let statement = normalize_statement(&fact.statement, MAX_STATEMENT_LEN);
            if statement.len() < MIN_STATEMENT_LEN {
                continue;
            }
            let fingerprint = fact_fingerprint(&fact.kind, &statement);
            if !seen_fingerprints.insert(fingerprint) {
                continue;
            }
            surviving.push((statement, fact));
        }

        surviving
    }

    /// Delete a memory row together with its dependents, inside the caller's
    /// transaction.
    fn delete_memory_row(tx: &rusqlite::Transaction, memory_id: &str) -> Result<()> {
        tx.execute("DELETE FROM evidence WHERE memory_id = ?1", params![memory_id])?;
        tx.execute(
            "DELETE FROM memory_categories WHERE memory_id = ?1",
            params![memory_id],
        )?;
        tx.execute(
            "DELETE FROM related_memories WHERE memory_id = ?1 OR related_memory_id = ?1",
            params![memory_id],
        )?;
        tx.execute("DELETE FROM memories WHERE id = ?1", params![memory_id])?;
        Ok(())
    }

    fn row_to_memory(row: &Row) -> rusqlite::Result<MemoryRecord> {
        let pinned_json: String = row.get(9)?;
        let auto_tags_json: String = row.get(12)?;
        let embedding_json: Option<String> = row.get(16)?;

        Ok(MemoryRecord {
            id: MemoryId(row.get(0)?),
            source_id: SourceId(row.get(1)?),
            source_version: row.get::<_, i64>(2)? as u32,
            memory_kind: row.get(3)?,
            extracted_kind: row.get(4)?,
            fingerprint: row.get(5)?,
            statement: row.get(6)?,
            manual_title: row.get(7)?,
            manual_notes: row.get(8)?,
            pinned_tags: serde_json::from_str(&pinned_json).unwrap_or_default(),
            auto_title: row.get(10)?,
            auto_summary: row.get(11)?,
            auto_tags: serde_json::from_str(&auto_tags_json).unwrap_or_default(),
            confidence: row.get(13)?,
            project: row.get(14)?,
            source_url: row.get(15)?,
            embedding: embedding_json.and_then(|json| serde_json::from_str(&json).ok()),
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    const MEMORY_COLUMNS: &'static str = "id, source_id, source_version, memory_kind, \
         extracted_kind, fingerprint, statement, manual_title, manual_notes, pinned_tags, \
         auto_title, auto_summary, auto_tags, confidence, project, source_url, embedding, \
         created_at, updated_at";

    pub fn get_memory(&self, memory_id: &str) -> Result<Option<MemoryRecord>> {
        let query = format!(
            "SELECT {} FROM memories WHERE id = ?1",
            Self::MEMORY_COLUMNS
        );
        let memory = self
            .conn
            .query_row(&query, params![memory_id], Self::row_to_memory)
            .optional()?;

        Ok(memory)
    }

    pub fn memories_for_source(&self, source_id: &str) -> Result<Vec<MemoryRecord>> {
        let query = format!(
            "SELECT {} FROM memories
             WHERE source_id = ?1 AND memory_kind = ?2
             ORDER BY created_at ASC, id ASC",
            Self::MEMORY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;

        let memories = stmt
            .query_map(params![source_id, MEMORY_KIND_ATOMIC], Self::row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(memories)
    }

    /// Most-recently-updated records first.
    pub fn list_memory_records(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let query = format!(
            "SELECT {} FROM memories
             ORDER BY updated_at DESC
             LIMIT ?1",
            Self::MEMORY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;

        let memories = stmt
            .query_map(params![limit as i64], Self::row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(memories)
    }

    pub fn has_extracted_memories(&self, source_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE source_id = ?1 AND memory_kind = ?2",
            params![source_id, MEMORY_KIND_ATOMIC],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// A legacy document memory is a row whose id equals its source id.
    pub fn has_legacy_document_memory(&self, source_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE id = ?1",
            params![source_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn evidence_for_memory(&self, memory_id: &str) -> Result<Vec<EvidenceSpan>> {
        let mut stmt = self.conn.prepare(
            "SELECT memory_id, source_id, source_version, start_offset, end_offset,
                    excerpt, created_at
             FROM evidence WHERE memory_id = ?1",
        )?;

        let spans = stmt
            .query_map(params![memory_id], |row| {
                Ok(EvidenceSpan {
                    memory_id: MemoryId(row.get(0)?),
                    source_id: SourceId(row.get(1)?),
                    source_version: row.get::<_, i64>(2)? as u32,
                    start_offset: row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
                    end_offset: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
                    excerpt: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(spans)
    }

    pub fn category_assignments(&self, memory_id: &str) -> Result<Vec<CategoryAssignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT memory_id, category_id, assignment_source, created_at
             FROM memory_categories WHERE memory_id = ?1
             ORDER BY assignment_source, category_id",
        )?;

        let assignments = stmt
            .query_map(params![memory_id], |row| {
                let source_raw: String = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    source_raw,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(assignments
            .into_iter()
            .map(|(memory_id, category_id, source_raw, created_at)| CategoryAssignment {
                memory_id: MemoryId(memory_id),
                category_id,
                assignment_source: match source_raw.as_str() {
                    "organizer_agent" => AssignmentSource::OrganizerAgent,
                    _ => AssignmentSource::ExtractorAgent,
                },
                created_at,
            })
            .collect())
    }

    // ========== RELATIONSHIP & CONSOLIDATION ==========

    /// Replace one memory's categories under a single assignment source,
    /// leaving every other source's rows in place.
    pub fn replace_category_assignments(
        &self,
        memory_id: &str,
        category_ids: &[String],
        assignment_source: AssignmentSource,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "DELETE FROM memory_categories
             WHERE memory_id = ?1 AND assignment_source = ?2",
            params![memory_id, assignment_source.as_str()],
        )?;

        for category_id in category_ids {
            tx.execute(
                "INSERT OR IGNORE INTO memory_categories
                     (memory_id, category_id, assignment_source, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![memory_id, category_id, assignment_source.as_str(), now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Idempotent edge upsert keyed on (memory, related memory, relation).
    pub fn upsert_related_link(
        &self,
        memory_id: &str,
        related_memory_id: &str,
        relation_type: &str,
        confidence: Option<f32>,
        reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO related_memories
                 (memory_id, related_memory_id, relation_type, confidence, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(memory_id, related_memory_id, relation_type) DO UPDATE SET
                confidence = excluded.confidence,
                reason = excluded.reason",
            params![memory_id, related_memory_id, relation_type, confidence, reason, now],
        )?;

        Ok(())
    }

    pub fn related_links(&self, memory_id: &str) -> Result<Vec<RelatedMemoryLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT memory_id, related_memory_id, relation_type, confidence, reason, created_at
             FROM related_memories WHERE memory_id = ?1",
        )?;

        let links = stmt
            .query_map(params![memory_id], |row| {
                Ok(RelatedMemoryLink {
                    memory_id: MemoryId(row.get(0)?),
                    related_memory_id: MemoryId(row.get(1)?),
                    relation_type: row.get(2)?,
                    confidence: row.get(3)?,
                    reason: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(links)
    }

    pub fn source_id_for_memory(&self, memory_id: &str) -> Result<Option<String>> {
        let source_id = self
            .conn
            .query_row(
                "SELECT source_id FROM memories WHERE id = ?1",
                params![memory_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(source_id)
    }

    pub fn upsert_source_alias(
        &self,
        alias_source_id: &str,
        canonical_source_id: &str,
        confidence: Option<f32>,
        reason: Option<&str>,
        proposal_source: &str,
        is_active: bool,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO source_aliases
                 (alias_source_id, canonical_source_id, confidence, reason,
                  proposal_source, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(alias_source_id, canonical_source_id) DO UPDATE SET
                confidence = excluded.confidence,
                reason = excluded.reason,
                proposal_source = excluded.proposal_source,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
            params![
                alias_source_id,
                canonical_source_id,
                confidence,
                reason,
                proposal_source,
                is_active as i64,
                now
            ],
        )?;

        Ok(())
    }

    pub fn get_source_alias(
        &self,
        alias_source_id: &str,
        canonical_source_id: &str,
    ) -> Result<Option<SourceAlias>> {
        let alias = self
            .conn
            .query_row(
                "SELECT alias_source_id, canonical_source_id, confidence, reason,
                        proposal_source, is_active, created_at, updated_at
                 FROM source_aliases
                 WHERE alias_source_id = ?1 AND canonical_source_id = ?2",
                params![alias_source_id, canonical_source_id],
                |row| {
                    Ok(SourceAlias {
                        alias_source_id: SourceId(row.get(0)?),
                        canonical_source_id: SourceId(row.get(1)?),
                        confidence: row.get(2)?,
                        reason: row.get(3)?,
                        proposal_source: row.get(4)?,
                        is_active: row.get::<_, i64>(5)? != 0,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()?;

        Ok(alias)
    }

    // ========== AUDIT RUNS ==========

    pub fn begin_extraction_run(
        &self,
        source_id: &str,
        source_version: u32,
        model: &str,
    ) -> Result<RunId> {
        let run_id = generate_run_id();
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO extraction_runs
                 (id, source_id, source_version, model, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id.0,
                source_id,
                source_version as i64,
                model,
                RunStatus::Running.as_str(),
                now
            ],
        )?;

        debug!("Opened extraction run {} for {}", run_id, source_id);
        Ok(run_id)
    }

    /// Transition a run from `running` to a terminal state, exactly once.
    pub fn finish_extraction_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        memory_count: u32,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        let updated = self.conn.execute(
            "UPDATE extraction_runs
             SET status = ?1, memory_count = ?2, error = ?3, finished_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                memory_count as i64,
                error,
                now,
                run_id.0,
                RunStatus::Running.as_str()
            ],
        )?;

        if updated == 0 {
            warn!("Extraction run {} was not in running state", run_id);
        }

        Ok(())
    }

    pub fn extraction_runs_for_source(&self, source_id: &str) -> Result<Vec<ExtractionRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source_id, source_version, model, status, memory_count,
                    error, started_at, finished_at
             FROM extraction_runs
             WHERE source_id = ?1
             ORDER BY started_at DESC",
        )?;

        let runs = stmt
            .query_map(params![source_id], |row| {
                let status_raw: String = row.get(4)?;
                Ok(ExtractionRun {
                    id: RunId(row.get(0)?),
                    source_id: SourceId(row.get(1)?),
                    source_version: row.get::<_, i64>(2)? as u32,
                    model: row.get(3)?,
                    status: parse_run_status(&status_raw),
                    memory_count: row.get::<_, i64>(5)? as u32,
                    error: row.get(6)?,
                    started_at: row.get(7)?,
                    finished_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    pub fn begin_job_run(&self, job_kind: &str) -> Result<RunId> {
        let run_id = memory_engine_schemas::generate_job_id();
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO job_runs (id, job_kind, status, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id.0, job_kind, RunStatus::Running.as_str(), now],
        )?;

        Ok(run_id)
    }

    pub fn finish_job_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        item_count: u32,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        let updated = self.conn.execute(
            "UPDATE job_runs
             SET status = ?1, item_count = ?2, error = ?3, finished_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                item_count as i64,
                error,
                now,
                run_id.0,
                RunStatus::Running.as_str()
            ],
        )?;

        if updated == 0 {
            warn!("Job run {} was not in running state", run_id);
        }

        Ok(())
    }

    pub fn count_extraction_runs(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM extraction_runs", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn parse_run_status(raw: &str) -> RunStatus {
    match raw {
        "success" => RunStatus::Success,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Running,
    }
}

/// Locate `needle` inside `haystack` case-insensitively and return its byte
/// span in the original text. Absence of a match is not an error: offsets
/// are best-effort provenance, the excerpt itself is always stored.
fn locate_excerpt(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    let needle = needle.trim();
    if needle.is_empty() || haystack.is_empty() {
        return None;
    }

    let haystack_lower = haystack.to_lowercase();
    let needle_lower = needle.to_lowercase();

    // Case folding can shift byte positions for non-ASCII text; only report
    // offsets that still land on valid boundaries of the original.
    let start = haystack_lower.find(&needle_lower)?;
    let end = start + needle_lower.len();
    if haystack.is_char_boundary(start) && end <= haystack.len() && haystack.is_char_boundary(end) {
        Some((start, end))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_engine_schemas::CandidateFact;
    use tempfile::NamedTempFile;

    fn test_db() -> (Database, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let db = Database::new(file.path()).unwrap();
        (db, file)
    }

    fn fact(kind: &str, statement: &str) -> CandidateFact {
        CandidateFact {
            kind: kind.to_string(),
            statement: statement.to_string(),
            title: None,
            tags: vec![],
            confidence: Some(0.8),
            evidence_text: None,
        }
    }

    fn seed_source(db: &Database, source_id: &str, content: &str) -> u32 {
        db.upsert_source(
            source_id,
            "a.txt",
            None,
            "note",
            &content_checksum(content),
            &serde_json::json!({}),
        )
        .unwrap();
        db.create_version_if_changed(source_id, content, &serde_json::json!({}))
            .unwrap()
            .version
    }

    #[test]
    fn test_version_monotonicity() {
        let (db, _file) = test_db();
        seed_source(&db, "src-1", "first body");

        let unchanged = db
            .create_version_if_changed("src-1", "first body", &serde_json::json!({}))
            .unwrap();
        assert!(!unchanged.changed);
        assert_eq!(unchanged.version, 1);

        let second = db
            .create_version_if_changed("src-1", "second body", &serde_json::json!({}))
            .unwrap();
        assert!(second.changed);
        assert_eq!(second.version, 2);

        let third = db
            .create_version_if_changed("src-1", "third body", &serde_json::json!({}))
            .unwrap();
        assert_eq!(third.version, 3);
    }

    #[test]
    fn test_upsert_source_clears_soft_delete() {
        let (db, _file) = test_db();
        seed_source(&db, "src-1", "body");

        db.set_source_deleted("src-1", true).unwrap();
        assert!(db.get_source("src-1").unwrap().unwrap().deleted);

        db.upsert_source("src-1", "a.txt", None, "note", "sum", &serde_json::json!({}))
            .unwrap();
        assert!(!db.get_source("src-1").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_apply_upserts_categories_and_evidence() {
        let (db, _file) = test_db();
        let version = seed_source(&db, "src-1", "I like soccer on weekends.");

        let memories = db
            .apply_extracted_memories(
                "src-1",
                version,
                &[fact("preferences", "I like soccer on weekends.")],
                false,
            )
            .unwrap();

        assert_eq!(memories.len(), 1);
        let memory = &memories[0];
        assert_eq!(memory.memory_kind, MEMORY_KIND_ATOMIC);
        assert_eq!(memory.extracted_kind, "preferences");

        let assignments = db.category_assignments(&memory.id.0).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].category_id, "cat_preferences");
        assert_eq!(
            assignments[0].assignment_source,
            AssignmentSource::ExtractorAgent
        );

        let evidence = db.evidence_for_memory(&memory.id.0).unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].start_offset, Some(0));
        assert_eq!(
            evidence[0].end_offset,
            Some("I like soccer on weekends.".len() as u32)
        );
    }

    #[test]
    fn test_fingerprint_stability_across_passes() {
        let (db, _file) = test_db();
        let version = seed_source(&db, "src-1", "I like soccer on weekends.");

        let first = db
            .apply_extracted_memories(
                "src-1",
                version,
                &[fact("preferences", "I like soccer on weekends.")],
                false,
            )
            .unwrap();

        let mut richer = fact("preferences", "I like soccer on weekends.");
        richer.title = Some("Soccer".into());
        richer.tags = vec!["sports".into()];
        richer.confidence = Some(0.99);

        let second = db
            .apply_extracted_memories("src-1", version, &[richer], false)
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].created_at, second[0].created_at);
        assert_eq!(second[0].auto_title.as_deref(), Some("Soccer"));
    }

    #[test]
    fn test_manual_overrides_survive_reapply() {
        let (db, _file) = test_db();
        let version = seed_source(&db, "src-1", "I like soccer on weekends.");

        let memories = db
            .apply_extracted_memories(
                "src-1",
                version,
                &[fact("preferences", "I like soccer on weekends.")],
                false,
            )
            .unwrap();

        db.conn
            .execute(
                "UPDATE memories SET manual_title = 'Kept', pinned_tags = '[\"mine\"]' WHERE id = ?1",
                params![memories[0].id.0],
            )
            .unwrap();

        let reapplied = db
            .apply_extracted_memories(
                "src-1",
                version,
                &[fact("preferences", "I like soccer on weekends.")],
                false,
            )
            .unwrap();

        assert_eq!(reapplied[0].manual_title.as_deref(), Some("Kept"));
        assert_eq!(reapplied[0].pinned_tags, vec!["mine".to_string()]);
    }

    #[test]
    fn test_stale_pruning_preserves_other_assignment_sources() {
        let (db, _file) = test_db();
        let version = seed_source(&db, "src-1", "Fact one. Fact two stays.");

        let memories = db
            .apply_extracted_memories(
                "src-1",
                version,
                &[
                    fact("knowledge", "Fact one about something."),
                    fact("knowledge", "Fact two stays around."),
                ],
                false,
            )
            .unwrap();
        assert_eq!(memories.len(), 2);

        let kept_id = memories
            .iter()
            .find(|m| m.statement.contains("stays"))
            .unwrap()
            .id
            .0
            .clone();
        let pruned_id = memories
            .iter()
            .find(|m| m.statement.contains("one"))
            .unwrap()
            .id
            .0
            .clone();

        // An organizer assignment on the surviving memory must outlive the
        // extractor's replacement pass.
        db.replace_category_assignments(
            &kept_id,
            &["cat_decisions".to_string()],
            AssignmentSource::OrganizerAgent,
        )
        .unwrap();

        let second = db
            .apply_extracted_memories(
                "src-1",
                version,
                &[fact("knowledge", "Fact two stays around.")],
                false,
            )
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id.0, kept_id);

        assert!(db.get_memory(&pruned_id).unwrap().is_none());
        assert!(db.evidence_for_memory(&pruned_id).unwrap().is_empty());
        assert!(db.category_assignments(&pruned_id).unwrap().is_empty());

        let kept_assignments = db.category_assignments(&kept_id).unwrap();
        assert!(kept_assignments
            .iter()
            .any(|a| a.assignment_source == AssignmentSource::OrganizerAgent
                && a.category_id == "cat_decisions"));
        assert!(kept_assignments
            .iter()
            .any(|a| a.assignment_source == AssignmentSource::ExtractorAgent));
    }

    #[test]
    fn test_legacy_document_memory_removed() {
        let (db, _file) = test_db();
        let version = seed_source(&db, "src-1", "I like soccer on weekends.");

        // Simulate a deprecated one-row-per-document record.
        let now = Utc::now().to_rfc3339();
        db.conn
            .execute(
                "INSERT INTO memories (id, source_id, source_version, memory_kind,
                                       extracted_kind, fingerprint, statement,
                                       created_at, updated_at)
                 VALUES ('src-1', 'src-1', 1, 'document', 'document', 'legacy',
                         'whole document body', ?1, ?1)",
                params![now],
            )
            .unwrap();
        assert!(db.has_legacy_document_memory("src-1").unwrap());

        db.apply_extracted_memories(
            "src-1",
            version,
            &[fact("preferences", "I like soccer on weekends.")],
            false,
        )
        .unwrap();

        assert!(!db.has_legacy_document_memory("src-1").unwrap());
    }

    #[test]
    fn test_empty_result_guard() {
        let (db, _file) = test_db();
        let version = seed_source(&db, "src-1", "I like soccer on weekends.");

        db.apply_extracted_memories(
            "src-1",
            version,
            &[fact("preferences", "I like soccer on weekends.")],
            false,
        )
        .unwrap();

        // Too-short and blank-kind candidates are filtered, leaving zero.
        let garbage = vec![
            fact("preferences", "short"),
            fact("", "long enough statement here"),
        ];
        let err = db
            .apply_extracted_memories("src-1", version, &garbage, false)
            .unwrap_err();
        assert!(err.to_string().contains("no usable facts"));

        // Prior knowledge is untouched.
        assert_eq!(db.memories_for_source("src-1").unwrap().len(), 1);

        // Explicit allow_empty wipes deliberately.
        db.apply_extracted_memories("src-1", version, &[], true)
            .unwrap();
        assert!(db.memories_for_source("src-1").unwrap().is_empty());
    }

    #[test]
    fn test_in_batch_dedup_keeps_first() {
        let (db, _file) = test_db();
        let version = seed_source(&db, "src-1", "body text here");

        let mut first = fact("knowledge", "The same exact statement.");
        first.title = Some("first".into());
        let mut dup = fact("knowledge", "The  same   exact statement.");
        dup.title = Some("second".into());

        let memories = db
            .apply_extracted_memories("src-1", version, &[first, dup], false)
            .unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].auto_title.as_deref(), Some("first"));
    }

    #[test]
    fn test_evidence_offsets_null_when_paraphrased() {
        let (db, _file) = test_db();
        let version = seed_source(&db, "src-1", "The user enjoys weekend soccer.");

        let mut paraphrased = fact("preferences", "Plays soccer every weekend with friends.");
        paraphrased.evidence_text = Some("a sentence that is not in the source".into());

        let memories = db
            .apply_extracted_memories("src-1", version, &[paraphrased], false)
            .unwrap();
        let evidence = db.evidence_for_memory(&memories[0].id.0).unwrap();
        assert_eq!(evidence.len(), 1);
        assert!(evidence[0].start_offset.is_none());
        assert!(evidence[0].end_offset.is_none());
    }

    #[test]
    fn test_extraction_run_single_transition() {
        let (db, _file) = test_db();
        seed_source(&db, "src-1", "body");

        let run_id = db.begin_extraction_run("src-1", 1, "test-model").unwrap();
        db.finish_extraction_run(&run_id, RunStatus::Success, 3, None)
            .unwrap();
        // Second transition is a no-op.
        db.finish_extraction_run(&run_id, RunStatus::Failed, 0, Some("late error"))
            .unwrap();

        let runs = db.extraction_runs_for_source("src-1").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].memory_count, 3);
        assert!(runs[0].error.is_none());
    }

    #[test]
    fn test_related_link_upsert_idempotent() {
        let (db, _file) = test_db();
        db.upsert_related_link("m1", "m2", "related", Some(0.7), Some("overlap"))
            .unwrap();
        db.upsert_related_link("m1", "m2", "related", Some(0.9), Some("stronger overlap"))
            .unwrap();

        let links = db.related_links("m1").unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].confidence, Some(0.9));
    }

    #[test]
    fn test_locate_excerpt_case_insensitive() {
        let span = locate_excerpt("Alpha BETA gamma", "beta").unwrap();
        assert_eq!(span, (6, 10));
        assert!(locate_excerpt("Alpha", "missing").is_none());
    }
}
