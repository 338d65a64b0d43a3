use anyhow::{Context, Result};
use async_trait::async_trait;
use memory_engine_retrieval::SearchEngine;
use memory_engine_schemas::{AnswerMode, ContextBrief, GroundedAnswer, RankedCitation};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::templates::CitationRenderer;

const HEURISTIC_BULLETS: usize = 5;

/// Optional answer-model collaborator. Answering is best-effort: when this
/// is missing or failing the composer degrades to heuristic bullets instead
/// of failing the request.
#[async_trait]
pub trait AnswerModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Builds citation-grounded answers and context briefs on top of retrieval.
pub struct AnswerComposer {
    engine: SearchEngine,
    model: Option<Arc<dyn AnswerModel>>,
}

impl AnswerComposer {
    pub fn new(engine: SearchEngine, model: Option<Arc<dyn AnswerModel>>) -> Self {
        Self { engine, model }
    }

    /// Answer a question from stored memories, with `[Nk]` citations.
    pub async fn ask(
        &self,
        question: &str,
        project: Option<&str>,
        limit: usize,
    ) -> Result<GroundedAnswer> {
        if question.trim().is_empty() {
            anyhow::bail!("ask requires a non-empty question");
        }

        let citations = self.engine.search(question, project, limit).await?;

        if citations.is_empty() {
            return Ok(GroundedAnswer {
                answer_text: "No stored memories matched this question.".to_string(),
                citations,
                mode: AnswerMode::Empty,
            });
        }

        let block = CitationRenderer::render_block(&citations);
        let prompt = format!(
            "Answer the question using ONLY the numbered citations below.\n\
             Every factual claim in your answer must cite at least one [Nk] label.\n\
             If the citations do not contain the answer, say so.\n\n\
             Question: {}\n\nCitations:\n{}",
            question, block
        );

        let (answer_text, mode) = self.complete_or_fallback(&prompt, &citations).await;

        info!("Answered question with {} citations ({})", citations.len(), mode.as_str());
        Ok(GroundedAnswer {
            answer_text,
            citations,
            mode,
        })
    }

    /// Assemble a working context brief for a task.
    pub async fn build_context(
        &self,
        task: &str,
        project: Option<&str>,
        limit: usize,
    ) -> Result<ContextBrief> {
        if task.trim().is_empty() {
            anyhow::bail!("build_context requires a non-empty task");
        }

        let citations = self.engine.search(task, project, limit).await?;

        if citations.is_empty() {
            return Ok(ContextBrief {
                context_text: "No stored memories are relevant to this task.".to_string(),
                citations,
                mode: AnswerMode::Empty,
            });
        }

        let block = CitationRenderer::render_block(&citations);
        let prompt = format!(
            "Assemble a short working-context brief for the task below, using ONLY\n\
             the numbered citations. Cite at least one [Nk] label per statement.\n\n\
             Task: {}\n\nCitations:\n{}",
            task, block
        );

        let (context_text, mode) = self.complete_or_fallback(&prompt, &citations).await;

        Ok(ContextBrief {
            context_text,
            citations,
            mode,
        })
    }

    async fn complete_or_fallback(
        &self,
        prompt: &str,
        citations: &[RankedCitation],
    ) -> (String, AnswerMode) {
        match &self.model {
            None => (
                CitationRenderer::heuristic_bullets(citations, HEURISTIC_BULLETS),
                AnswerMode::Heuristic,
            ),
            Some(model) => match model.complete(prompt).await {
                Ok(text) => (text, AnswerMode::Model),
                Err(e) => {
                    warn!("Answer model failed, falling back to heuristic: {}", e);
                    (
                        CitationRenderer::heuristic_bullets(citations, HEURISTIC_BULLETS),
                        AnswerMode::Fallback,
                    )
                }
            },
        }
    }
}

/// Configuration for the LLM answer collaborator
#[derive(Debug, Clone)]
pub struct AnswerModelConfig {
    pub provider: AnswerProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnswerProvider {
    Ollama,
    OpenAi,
}

impl AnswerModelConfig {
    pub fn from_env() -> Result<Self> {
        let provider = std::env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "ollama".to_string())
            .to_lowercase();

        let provider = match provider.as_str() {
            "openai" => AnswerProvider::OpenAi,
            _ => AnswerProvider::Ollama,
        };

        let base_url = match provider {
            AnswerProvider::Ollama => {
                std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
            }
            AnswerProvider::OpenAi => std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
        };

        let model = match provider {
            AnswerProvider::Ollama => {
                std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string())
            }
            AnswerProvider::OpenAi => {
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
            }
        };

        let api_key = if provider == AnswerProvider::OpenAi {
            Some(
                std::env::var("OPENAI_API_KEY")
                    .context("OPENAI_API_KEY required for OpenAI provider")?,
            )
        } else {
            None
        };

        Ok(Self {
            provider,
            api_key,
            base_url,
            model,
            timeout_secs: 30,
        })
    }
}

/// LLM-backed answer model
pub struct LlmAnswerModel {
    config: AnswerModelConfig,
    client: reqwest::Client,
}

impl LlmAnswerModel {
    pub fn new(config: AnswerModelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    /// Try to create from environment, None when answer models are disabled
    pub fn from_env_optional() -> Option<Self> {
        let use_llm = std::env::var("USE_LLM_ANSWERS")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase();

        if use_llm == "true" || use_llm == "1" {
            match AnswerModelConfig::from_env().and_then(Self::new) {
                Ok(model) => Some(model),
                Err(e) => {
                    warn!("Failed to initialize answer model: {}", e);
                    None
                }
            }
        } else {
            None
        }
    }

    async fn call_ollama(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.config.base_url);

        debug!("Calling Ollama at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "model": self.config.model,
                "prompt": prompt,
                "stream": false,
                "options": { "temperature": 0.3 }
            }))
            .send()
            .await
            .context("Failed to call Ollama API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error {}: {}", status, error_text);
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let body: OllamaResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(body.response)
    }

    async fn call_openai(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        debug!("Calling OpenAI at {}", url);

        let mut request = self.client.post(&url).json(&json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You answer questions from numbered citations and cite [Nk] labels for every claim."
                },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.3,
            "max_tokens": 1024
        }));

        if let Some(ref api_key) = self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.context("Failed to call OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {}: {}", status, error_text);
        }

        #[derive(Deserialize)]
        struct OpenAiResponse {
            choices: Vec<OpenAiChoice>,
        }

        #[derive(Deserialize)]
        struct OpenAiChoice {
            message: OpenAiMessage,
        }

        #[derive(Deserialize)]
        struct OpenAiMessage {
            content: String,
        }

        let body: OpenAiResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        body.choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from OpenAI"))
    }
}

#[async_trait]
impl AnswerModel for LlmAnswerModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        match self.config.provider {
            AnswerProvider::Ollama => self.call_ollama(prompt).await,
            AnswerProvider::OpenAi => self.call_openai(prompt).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::{params, Connection};
    use tempfile::NamedTempFile;

    const MEMORIES_DDL: &str = "CREATE TABLE IF NOT EXISTS memories (
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
    )";

    fn seeded_composer(
        statements: &[&str],
        model: Option<Arc<dyn AnswerModel>>,
    ) -> (AnswerComposer, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute(MEMORIES_DDL, []).unwrap();

        for (index, statement) in statements.iter().enumerate() {
            conn.execute(
                "INSERT INTO memories (id, source_id, source_version, memory_kind,
                                       extracted_kind, fingerprint, statement,
                                       created_at, updated_at)
                 VALUES (?1, 'src', 1, 'extracted_atomic_memory', 'knowledge', ?1, ?2, ?3, ?3)",
                params![
                    format!("mem-{}", index),
                    statement,
                    format!("2025-01-0{}T00:00:00Z", index + 1)
                ],
            )
            .unwrap();
        }

        let engine = SearchEngine::new(file.path()).unwrap();
        (AnswerComposer::new(engine, model), file)
    }

    /// Collect the k of every [Nk] token in a text.
    fn cited_indexes(text: &str) -> Vec<usize> {
        let mut indexes = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find("[N") {
            rest = &rest[start + 2..];
            if let Some(end) = rest.find(']') {
                if let Ok(index) = rest[..end].parse::<usize>() {
                    indexes.push(index);
                }
            }
        }
        indexes
    }

    struct FailingModel;

    #[async_trait]
    impl AnswerModel for FailingModel {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            anyhow::bail!("model exploded")
        }
    }

    struct EchoModel;

    #[async_trait]
    impl AnswerModel for EchoModel {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok("The user plays soccer on weekends [N1].".to_string())
        }
    }

    #[tokio::test]
    async fn test_empty_store_yields_empty_mode() {
        let (composer, _file) = seeded_composer(&[], None);

        let answer = composer.ask("what sports?", None, 5).await.unwrap();
        assert_eq!(answer.mode, AnswerMode::Empty);
        assert!(answer.citations.is_empty());
        assert!(answer.answer_text.contains("No stored memories"));
    }

    #[tokio::test]
    async fn test_heuristic_answer_citations_align() {
        let (composer, _file) = seeded_composer(
            &[
                "plays soccer every weekend",
                "prefers tea over coffee",
                "works on the importer rewrite",
            ],
            None,
        );

        let answer = composer.ask("soccer weekend", None, 3).await.unwrap();
        assert_eq!(answer.mode, AnswerMode::Heuristic);
        assert!(!answer.citations.is_empty());

        let indexes = cited_indexes(&answer.answer_text);
        assert!(!indexes.is_empty());
        for index in indexes {
            assert!(index >= 1 && index <= answer.citations.len());
        }
    }

    #[tokio::test]
    async fn test_model_answer_passes_through() {
        let (composer, _file) =
            seeded_composer(&["plays soccer every weekend"], Some(Arc::new(EchoModel)));

        let answer = composer.ask("soccer", None, 3).await.unwrap();
        assert_eq!(answer.mode, AnswerMode::Model);
        assert!(answer.answer_text.contains("[N1]"));
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_to_heuristic() {
        let (composer, _file) =
            seeded_composer(&["plays soccer every weekend"], Some(Arc::new(FailingModel)));

        let answer = composer.ask("soccer", None, 3).await.unwrap();
        assert_eq!(answer.mode, AnswerMode::Fallback);
        assert!(answer.answer_text.contains("[N1]"));
        assert!(!answer.citations.is_empty());
    }

    #[tokio::test]
    async fn test_blank_question_is_a_validation_error() {
        let (composer, _file) = seeded_composer(&["anything at all"], None);
        assert!(composer.ask("   ", None, 3).await.is_err());
        assert!(composer.build_context("", None, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_context_brief_modes() {
        let (composer, _file) = seeded_composer(
            &["works on the importer rewrite", "prefers tea over coffee"],
            None,
        );

        let brief = composer
            .build_context("importer rewrite", None, 2)
            .await
            .unwrap();
        assert_eq!(brief.mode, AnswerMode::Heuristic);
        assert!(!brief.citations.is_empty());

        let indexes = cited_indexes(&brief.context_text);
        for index in indexes {
            assert!(index >= 1 && index <= brief.citations.len());
        }
    }
}
