use anyhow::Result;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use memory_engine_ingestion::{
    Database, ExtractorError, IngestionPipeline, LlmExtractor, MemoryOrganizer,
};
use memory_engine_schemas::{
    AliasProposal, AssignmentSource, CategoryDecision, IngestRequest, RelatedLinkProposal,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    pipeline: Arc<IngestionPipeline>,
    organizer: Arc<MemoryOrganizer>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Memory Engine Ingestion Service v0.1.0");

    // Initialize database
    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap();
        format!("{}/Library/Application Support/MemoryEngine/memory.db", home)
    });

    // Create directory if it doesn't exist
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Arc::new(Mutex::new(Database::new(&db_path)?));
    info!("Database initialized at: {}", db_path);

    // The extractor is a hard requirement for this service: atomic memories
    // must come from the configured model, so a missing config fails startup.
    let extractor = Arc::new(LlmExtractor::from_env()?);
    let pipeline = Arc::new(IngestionPipeline::new(db.clone(), extractor));
    let organizer = Arc::new(MemoryOrganizer::new());

    let state = AppState {
        db,
        pipeline,
        organizer,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ingest", post(ingest))
        .route("/memories/recent", get(list_recent_memories))
        .route("/sources/:source_id/runs", get(list_extraction_runs))
        .route("/organizer/decisions", post(apply_organizer_decisions))
        .route("/consolidator/aliases", post(apply_alias_proposals))
        .with_state(state);

    // Start server
    let addr = std::env::var("INGESTION_ADDR").unwrap_or_else(|_| "127.0.0.1:21963".to_string());
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "ingestion",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    info!("Ingesting source: {}", request.filename);

    let receipt = state.pipeline.ingest(request).await.map_err(|e| {
        error!("Ingestion failed: {}", e);
        let status = if e.downcast_ref::<ExtractorError>().is_some() {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::UNPROCESSABLE_ENTITY
        };
        (status, e.to_string())
    })?;

    Ok(Json(receipt))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn list_recent_memories(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;
    let memories = db
        .list_memory_records(query.limit.unwrap_or(50))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(serde_json::json!({ "memories": memories })))
}

async fn list_extraction_runs(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;
    let runs = db
        .extraction_runs_for_source(&source_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(serde_json::json!({ "runs": runs })))
}

#[derive(Deserialize)]
struct OrganizerRequest {
    #[serde(default)]
    category_assignments: Vec<CategoryDecision>,
    #[serde(default)]
    related_links: Vec<RelatedLinkProposal>,
}

async fn apply_organizer_decisions(
    State(state): State<AppState>,
    Json(request): Json<OrganizerRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;
    let outcome = state
        .organizer
        .apply_decisions(
            &db,
            &request.category_assignments,
            &request.related_links,
            AssignmentSource::OrganizerAgent,
        )
        .map_err(|e| {
            error!("Organizer pass failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(serde_json::json!({
        "assignments_applied": outcome.assignments_applied,
        "links_applied": outcome.links_applied,
        "skipped": outcome.skipped,
    })))
}

#[derive(Deserialize)]
struct AliasRequest {
    proposals: Vec<AliasProposal>,
    proposal_source: Option<String>,
    #[serde(default)]
    default_is_active: bool,
}

async fn apply_alias_proposals(
    State(state): State<AppState>,
    Json(request): Json<AliasRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;
    let source = request
        .proposal_source
        .unwrap_or_else(|| "consolidator_agent".to_string());

    let outcome = state
        .organizer
        .apply_alias_proposals(&db, &request.proposals, &source, request.default_is_active)
        .map_err(|e| {
            error!("Consolidator pass failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(serde_json::json!({
        "proposals_applied": outcome.proposals_applied,
        "rejected": outcome.rejected,
    })))
}
