use anyhow::Result;
use chrono::Utc;
use memory_engine_schemas::{MemoryId, MemoryRecord, RankedCitation, SourceId};
use rusqlite::{params, Connection, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embedding::{cosine_similarity, tokenize, Embedder, PseudoEmbedder};

/// Hybrid ranking weights: semantic similarity dominates, lexical overlap
/// keeps exact wording relevant, recency breaks near-ties.
const WEIGHT_EMBEDDING: f64 = 0.82;
const WEIGHT_LEXICAL: f64 = 0.13;
const WEIGHT_RECENCY: f64 = 0.05;

/// Recency contribution decays linearly to zero over this window.
const RECENCY_WINDOW_DAYS: f64 = 30.0;

/// Scoring never looks past this many most-recent candidates.
const CANDIDATE_WINDOW: usize = 256;

/// Hybrid search over stored memories.
///
/// Works with zero external dependencies: rows without a stored embedding
/// are scored against a deterministic pseudo-embedding of their own text.
pub struct SearchEngine {
    conn: Connection,
    embedder: Arc<dyn Embedder>,
}

impl SearchEngine {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::with_embedder(db_path, Arc::new(PseudoEmbedder))
    }

    pub fn with_embedder<P: AsRef<Path>>(db_path: P, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        info!("Search engine initialized");
        Ok(Self { conn, embedder })
    }

    /// Rank stored memories against a query.
    ///
    /// An empty query is a listing: most recent first, chronological score.
    /// A non-empty query loads a bounded most-recent candidate window and
    /// scores every candidate with the hybrid formula.
    pub async fn search(
        &self,
        query: &str,
        project: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RankedCitation>> {
        debug!("Searching for: {:?} (limit: {})", query, limit);

        if query.trim().is_empty() {
            let recent = self.load_candidates(project, limit)?;
            return Ok(recent
                .into_iter()
                .enumerate()
                .map(|(index, memory)| RankedCitation {
                    rank: index + 1,
                    score: created_at_epoch(&memory),
                    memory,
                })
                .collect());
        }

        let candidates = self.load_candidates(project, CANDIDATE_WINDOW)?;
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let query_vec = match self.embedder.embed(query).await {
            Ok(vec) => vec,
            Err(e) => {
                warn!("Embedder failed, using pseudo-embedding: {}", e);
                PseudoEmbedder::embed_text(query)
            }
        };
        let query_tokens = tokenize(query);
        let now = Utc::now().timestamp();

        let mut scored: Vec<(f64, MemoryRecord)> = candidates
            .into_iter()
            .map(|memory| {
                let text = searchable_text(&memory);
                let note_vec = memory
                    .embedding
                    .clone()
                    .unwrap_or_else(|| PseudoEmbedder::embed_text(&text));

                let semantic = cosine_similarity(&query_vec, &note_vec) as f64;
                let lexical = lexical_overlap(&query_tokens, &text);
                let recency = recency_boost(&memory.created_at, now);

                let score = WEIGHT_EMBEDDING * semantic
                    + WEIGHT_LEXICAL * lexical
                    + WEIGHT_RECENCY * recency;
                (score, memory)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
                .then_with(|| a.1.id.0.cmp(&b.1.id.0))
        });
        scored.truncate(limit);

        debug!("Found {} results", scored.len());

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(index, (score, memory))| RankedCitation {
                rank: index + 1,
                score,
                memory,
            })
            .collect())
    }

    /// Backfill stored vectors for rows that lack one, so hybrid search
    /// upgrades transparently once a real embedder is configured.
    pub async fn index_missing_embeddings(&self) -> Result<usize> {
        let pending: Vec<MemoryRecord> = {
            let query = format!(
                "SELECT {} FROM memories WHERE embedding IS NULL",
                MEMORY_COLUMNS
            );
            let mut stmt = self.conn.prepare(&query)?;
            let rows = stmt
                .query_map([], row_to_memory)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut indexed = 0;
        for memory in pending {
            let vector = self.embedder.embed(&searchable_text(&memory)).await?;
            let vector_json = serde_json::to_string(&vector)?;
            self.conn.execute(
                "UPDATE memories SET embedding = ?1 WHERE id = ?2",
                params![vector_json, memory.id.0],
            )?;
            indexed += 1;
        }

        if indexed > 0 {
            info!("Indexed embeddings for {} memories", indexed);
        }
        Ok(indexed)
    }

    fn load_candidates(&self, project: Option<&str>, limit: usize) -> Result<Vec<MemoryRecord>> {
        let memories = match project {
            Some(project) => {
                let query = format!(
                    "SELECT {} FROM memories
                     WHERE project = ?1
                     ORDER BY created_at DESC, id ASC
                     LIMIT ?2",
                    MEMORY_COLUMNS
                );
                let mut stmt = self.conn.prepare(&query)?;
                let rows = stmt
                    .query_map(params![project, limit as i64], row_to_memory)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let query = format!(
                    "SELECT {} FROM memories
                     ORDER BY created_at DESC, id ASC
                     LIMIT ?1",
                    MEMORY_COLUMNS
                );
                let mut stmt = self.conn.prepare(&query)?;
                let rows = stmt
                    .query_map(params![limit as i64], row_to_memory)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(memories)
    }
}

const MEMORY_COLUMNS: &str = "id, source_id, source_version, memory_kind, \
     extracted_kind, fingerprint, statement, manual_title, manual_notes, pinned_tags, \
     auto_title, auto_summary, auto_tags, confidence, project, source_url, embedding, \
     created_at, updated_at";

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

/// Every text field that should participate in matching, as one bag.
fn searchable_text(memory: &MemoryRecord) -> String {
    let mut parts = vec![memory.statement.clone()];
    if let Some(title) = memory.effective_title() {
        parts.push(title.to_string());
    }
    if let Some(summary) = &memory.auto_summary {
        parts.push(summary.clone());
    }
    parts.extend(memory.effective_tags().iter().cloned());
    if let Some(project) = &memory.project {
        parts.push(project.clone());
    }
    parts.join(" ")
}

/// Fraction of query tokens present in the note's token bag.
fn lexical_overlap(query_tokens: &[String], note_text: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }

    let note_bag: HashSet<String> = tokenize(note_text).into_iter().collect();
    let hits = query_tokens
        .iter()
        .filter(|token| note_bag.contains(*token))
        .count();

    hits as f64 / query_tokens.len() as f64
}

/// Linear decay from 1.0 (now) to 0.0 (thirty days and older).
fn recency_boost(created_at: &str, now_epoch: i64) -> f64 {
    let created = match chrono::DateTime::parse_from_rfc3339(created_at) {
        Ok(dt) => dt.timestamp(),
        Err(_) => return 0.0,
    };

    let age_days = (now_epoch - created).max(0) as f64 / 86_400.0;
    (1.0 - age_days / RECENCY_WINDOW_DAYS).max(0.0)
}

fn created_at_epoch(memory: &MemoryRecord) -> f64 {
    chrono::DateTime::parse_from_rfc3339(&memory.created_at)
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or(0.0)
}
