use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use memory_engine_composer::{AnswerComposer, AnswerModel, LlmAnswerModel};
use memory_engine_retrieval::SearchEngine;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber;

#[derive(Clone)]
struct AppState {
    composer: Arc<Mutex<AnswerComposer>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Memory Engine Composer Service v0.1.0");

    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap();
        format!("{}/Library/Application Support/MemoryEngine/memory.db", home)
    });

    let engine = SearchEngine::new(&db_path)?;

    let model: Option<Arc<dyn AnswerModel>> = match LlmAnswerModel::from_env_optional() {
        Some(model) => {
            info!("Answer model configured");
            Some(Arc::new(model))
        }
        None => {
            info!("No answer model configured, using heuristic answers");
            None
        }
    };

    let composer = AnswerComposer::new(engine, model);
    let state = AppState {
        composer: Arc::new(Mutex::new(composer)),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ask", post(ask))
        .route("/context", post(build_context))
        .with_state(state);

    // Start server
    let addr = std::env::var("COMPOSER_ADDR").unwrap_or_else(|_| "127.0.0.1:21965".to_string());
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "composer",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    project: Option<String>,
    limit: Option<usize>,
}

async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let composer = state.composer.lock().await;
    let answer = composer
        .ask(
            &request.question,
            request.project.as_deref(),
            request.limit.unwrap_or(8),
        )
        .await
        .map_err(|e| {
            error!("Ask failed: {}", e);
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        })?;

    Ok(Json(answer))
}

#[derive(Deserialize)]
struct ContextRequest {
    task: String,
    project: Option<String>,
    limit: Option<usize>,
}

async fn build_context(
    State(state): State<AppState>,
    Json(request): Json<ContextRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let composer = state.composer.lock().await;
    let brief = composer
        .build_context(
            &request.task,
            request.project.as_deref(),
            request.limit.unwrap_or(8),
        )
        .await
        .map_err(|e| {
            error!("Context build failed: {}", e);
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        })?;

    Ok(Json(brief))
}
