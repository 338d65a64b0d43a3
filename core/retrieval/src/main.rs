use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use memory_engine_retrieval::{Embedder, PseudoEmbedder, RemoteEmbedder, SearchEngine};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<SearchEngine>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Memory Engine Retrieval Service v0.1.0");

    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap();
        format!("{}/Library/Application Support/MemoryEngine/memory.db", home)
    });

    let embedder: Arc<dyn Embedder> = match RemoteEmbedder::from_env() {
        Some(remote) => {
            info!("Using remote embedder");
            Arc::new(remote)
        }
        None => {
            info!("No embedder configured, using deterministic pseudo-embeddings");
            Arc::new(PseudoEmbedder)
        }
    };

    let engine = SearchEngine::with_embedder(&db_path, embedder)?;
    let state = AppState {
        engine: Arc::new(Mutex::new(engine)),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/search", get(search))
        .route("/index/embeddings", post(index_embeddings))
        .with_state(state);

    // Start server
    let addr = std::env::var("RETRIEVAL_ADDR").unwrap_or_else(|_| "127.0.0.1:21964".to_string());
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "retrieval",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    query: String,
    project: Option<String>,
    limit: Option<usize>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let engine = state.engine.lock().await;
    let results = engine
        .search(
            &params.query,
            params.project.as_deref(),
            params.limit.unwrap_or(10),
        )
        .await
        .map_err(|e| {
            error!("Search failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(serde_json::json!({ "results": results })))
}

async fn index_embeddings(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let engine = state.engine.lock().await;
    let indexed = engine.index_missing_embeddings().await.map_err(|e| {
        error!("Embedding backfill failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(serde_json::json!({ "indexed": indexed })))
}
