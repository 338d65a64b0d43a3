use anyhow::{Context, Result};
use clap::Parser;
use memory_engine_ingestion::{Database, IngestionPipeline, LlmExtractor};
use memory_engine_schemas::IngestRequest;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Level;

/// Ingest one markdown file through the full extraction pipeline.
#[derive(Parser, Debug)]
#[command(name = "ingest-file", version, about)]
struct Cli {
    /// Markdown file to ingest
    file: PathBuf,

    /// SQLite database path (defaults to DB_PATH or ./memory.db)
    #[arg(long)]
    db: Option<String>,

    /// Stable external source id, if this document has one
    #[arg(long)]
    external_id: Option<String>,

    /// Project label stored on the extracted memories
    #[arg(long)]
    project: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let markdown = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("failed to read {}", cli.file.display()))?;
    let filename = cli
        .file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| cli.file.display().to_string());

    let db_path = cli
        .db
        .or_else(|| std::env::var("DB_PATH").ok())
        .unwrap_or_else(|| "memory.db".to_string());

    let db = Arc::new(Mutex::new(Database::new(&db_path)?));
    let extractor = Arc::new(LlmExtractor::from_env()?);
    let pipeline = IngestionPipeline::new(db, extractor);

    let metadata = cli
        .project
        .map(|project| serde_json::json!({ "project": project }));

    let receipt = pipeline
        .ingest(IngestRequest {
            filename,
            markdown,
            source_path: Some(cli.file.display().to_string()),
            external_source_id: cli.external_id,
            agentfs_uri: None,
            metadata,
        })
        .await?;

    println!(
        "source {} v{} ({}): {} memories{}",
        receipt.source.id,
        receipt.version,
        if receipt.changed { "changed" } else { "unchanged" },
        receipt.extracted_count,
        if receipt.extraction_skipped {
            ", extraction skipped"
        } else {
            ""
        }
    );

    Ok(())
}
