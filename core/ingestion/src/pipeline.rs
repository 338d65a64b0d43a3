use anyhow::Result;
use memory_engine_schemas::{IngestReceipt, IngestRequest, RunStatus};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::database::Database;
use crate::extractor::FactExtractor;
use crate::identity::{content_checksum, derive_source_id};

/// Drives one ingestion call end to end: version decision, extraction,
/// persistence, and the audit-run lifecycle around them.
///
/// The extractor is required. When it cannot be reached the whole ingestion
/// fails and the failure is recorded on the run row; persistence only runs
/// after a successful extraction, so a failed call never leaves partial
/// atomic-memory state behind.
pub struct IngestionPipeline {
    db: Arc<Mutex<Database>>,
    extractor: Arc<dyn FactExtractor>,
}

impl IngestionPipeline {
    pub fn new(db: Arc<Mutex<Database>>, extractor: Arc<dyn FactExtractor>) -> Self {
        Self { db, extractor }
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestReceipt> {
        if request.filename.trim().is_empty() && request.external_source_id.is_none() {
            anyhow::bail!("ingest requires a filename or an external source id");
        }
        if request.markdown.trim().is_empty() {
            anyhow::bail!("ingest requires non-empty markdown");
        }

        let source_id =
            derive_source_id(&request.filename, request.external_source_id.as_deref());
        let checksum = content_checksum(&request.markdown);
        let metadata = build_metadata(&request);

        // Version decision and the skip check happen under one lock so the
        // answer cannot drift between the two reads.
        let (decision, skip) = {
            let db = self.db.lock().await;

            db.upsert_source(
                &source_id,
                &request.filename,
                request.source_path.as_deref(),
                "markdown",
                &checksum,
                &metadata,
            )?;

            let decision = db.create_version_if_changed(&source_id, &request.markdown, &metadata)?;

            let skip = !decision.changed
                && db.has_extracted_memories(&source_id)?
                && !db.has_legacy_document_memory(&source_id)?;

            (decision, skip)
        };

        if skip {
            // Identical content already extracted: answering from the store
            // avoids a redundant model call and the result drift that comes
            // with it.
            let db = self.db.lock().await;
            let memories = db.memories_for_source(&source_id)?;
            let source = db
                .get_source(&source_id)?
                .ok_or_else(|| anyhow::anyhow!("source {} vanished mid-ingest", source_id))?;

            info!(
                "Skipping extraction for unchanged source {} (v{}, {} memories)",
                source_id,
                decision.version,
                memories.len()
            );

            return Ok(IngestReceipt {
                source,
                extracted_count: memories.len(),
                extracted_memories: memories,
                extraction_run_id: None,
                version: decision.version,
                changed: false,
                extraction_skipped: true,
            });
        }

        let run_id = {
            let db = self.db.lock().await;
            db.begin_extraction_run(&source_id, decision.version, self.extractor.model_name())?
        };

        let extraction = self
            .extractor
            .extract(
                &source_id,
                &request.filename,
                decision.version,
                &request.markdown,
            )
            .await;

        let output = match extraction {
            Ok(output) => output,
            Err(e) => {
                warn!("Extraction failed for source {}: {}", source_id, e);
                let db = self.db.lock().await;
                db.finish_extraction_run(&run_id, RunStatus::Failed, 0, Some(&e.to_string()))?;
                return Err(e.into());
            }
        };

        let db = self.db.lock().await;
        let memories = match db.apply_extracted_memories(
            &source_id,
            decision.version,
            &output.memories,
            false,
        ) {
            Ok(memories) => memories,
            Err(e) => {
                db.finish_extraction_run(&run_id, RunStatus::Failed, 0, Some(&e.to_string()))?;
                return Err(e);
            }
        };

        db.finish_extraction_run(&run_id, RunStatus::Success, memories.len() as u32, None)?;

        let source = db
            .get_source(&source_id)?
            .ok_or_else(|| anyhow::anyhow!("source {} vanished mid-ingest", source_id))?;

        info!(
            "Ingested source {} v{}: {} memories",
            source_id,
            decision.version,
            memories.len()
        );

        Ok(IngestReceipt {
            source,
            extracted_count: memories.len(),
            extracted_memories: memories,
            extraction_run_id: Some(run_id),
            version: decision.version,
            changed: decision.changed,
            extraction_skipped: false,
        })
    }
}

fn build_metadata(request: &IngestRequest) -> serde_json::Value {
    let mut metadata = match &request.metadata {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Some(uri) = &request.agentfs_uri {
        metadata.insert("agentfs_uri".to_string(), serde_json::json!(uri));
    }
    serde_json::Value::Object(metadata)
}
