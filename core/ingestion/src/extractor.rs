use anyhow::{Context, Result};
use async_trait::async_trait;
use memory_engine_schemas::{CandidateFact, ExtractionOutput};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

/// Failures from the extraction collaborator.
///
/// Unavailability is its own variant so callers can branch on it: there is
/// no heuristic fallback for atomic fact extraction, and an unreachable
/// model fails the whole ingestion rather than degrading it.
#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("extraction model unavailable: {0}")]
    Unavailable(String),
    #[error("extraction model returned malformed output: {0}")]
    Malformed(String),
}

/// Collaborator that turns a source version's markdown into candidate
/// atomic facts.
///
/// An empty `memories` list is a legitimate answer ("found nothing") and
/// must never be used to signal unavailability; implementations signal that
/// with `ExtractorError::Unavailable`.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    /// Model identifier recorded on the extraction-run audit row.
    fn model_name(&self) -> &str;

    async fn extract(
        &self,
        source_id: &str,
        source_filename: &str,
        source_version: u32,
        markdown: &str,
    ) -> Result<ExtractionOutput, ExtractorError>;
}

/// Configuration for LLM-based extraction
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmProvider {
    Ollama,
    OpenAi,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let provider = std::env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "ollama".to_string())
            .to_lowercase();

        let provider = match provider.as_str() {
            "openai" => LlmProvider::OpenAi,
            _ => LlmProvider::Ollama,
        };

        let base_url = match provider {
            LlmProvider::Ollama => {
                std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
            }
            LlmProvider::OpenAi => std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
        };

        let model = match provider {
            LlmProvider::Ollama => {
                std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string())
            }
            LlmProvider::OpenAi => {
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
            }
        };

        let api_key = if provider == LlmProvider::OpenAi {
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
            timeout_secs: 60,
        })
    }
}

/// Raw model response shape for extraction
#[derive(Debug, Deserialize, Serialize)]
struct ExtractionResponse {
    memories: Vec<ExtractedFactData>,
    summary: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ExtractedFactData {
    kind: String,
    statement: String,
    title: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    confidence: Option<f32>,
    evidence_text: Option<String>,
}

/// LLM-backed fact extractor
pub struct LlmExtractor {
    config: LlmConfig,
    client: Client,
}

impl LlmExtractor {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(LlmConfig::from_env()?)
    }

    /// Build extraction prompt for the model
    fn build_extraction_prompt(&self, source_filename: &str, markdown: &str) -> String {
        format!(
            r#"Extract durable, atomic facts about the user from the following document.
Each fact must stand on its own and be worth remembering long-term.

Classify each fact as one of: preferences, people, commitments, decisions,
knowledge, resources, events. Use your best judgement for anything else.

Document ({}):
{}

Return a JSON object with this structure:
{{
  "memories": [
    {{
      "kind": "preferences|people|commitments|decisions|knowledge|resources|events",
      "statement": "one self-contained fact about the user",
      "title": "short optional label",
      "tags": ["tag1", "tag2"],
      "confidence": 0.0-1.0,
      "evidence_text": "the literal sentence from the document this fact comes from"
    }}
  ],
  "summary": "one-sentence summary of the document"
}}

Only extract clear, durable facts. Quote evidence_text verbatim from the document."#,
            source_filename, markdown
        )
    }

    /// Call Ollama API
    async fn call_ollama(&self, prompt: &str) -> Result<String, ExtractorError> {
        let url = format!("{}/api/generate", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
            "options": {
                "temperature": 0.2,
                "num_predict": 2048,
            }
        });

        debug!("Calling Ollama at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| ExtractorError::Unavailable(format!("Ollama request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExtractorError::Unavailable(format!(
                "Ollama API error {}: {}",
                status, error_text
            )));
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| ExtractorError::Malformed(format!("Ollama response: {}", e)))?;

        Ok(ollama_response.response)
    }

    /// Call OpenAI-compatible chat API
    async fn call_openai(&self, prompt: &str) -> Result<String, ExtractorError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a memory extraction assistant. Extract atomic facts from documents and return valid JSON."
                },
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "temperature": 0.2,
            "max_tokens": 2048,
            "response_format": { "type": "json_object" }
        });

        debug!("Calling OpenAI at {}", url);

        let mut request = self.client.post(&url).json(&request_body);

        if let Some(ref api_key) = self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExtractorError::Unavailable(format!("OpenAI request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExtractorError::Unavailable(format!(
                "OpenAI API error {}: {}",
                status, error_text
            )));
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

        let openai_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ExtractorError::Malformed(format!("OpenAI response: {}", e)))?;

        openai_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| ExtractorError::Malformed("no choices in OpenAI response".to_string()))
    }

    /// Parse the model response into candidate facts
    fn parse_response(&self, response: &str) -> Result<ExtractionOutput, ExtractorError> {
        let extraction: ExtractionResponse = serde_json::from_str(response)
            .map_err(|e| ExtractorError::Malformed(format!("extraction JSON: {}", e)))?;

        let memories = extraction
            .memories
            .into_iter()
            .map(|data| {
                if data.confidence.is_none() {
                    warn!("Extracted fact without confidence: {}", data.statement);
                }
                CandidateFact {
                    kind: data.kind,
                    statement: data.statement,
                    title: data.title,
                    tags: data.tags,
                    confidence: data.confidence,
                    evidence_text: data.evidence_text,
                }
            })
            .collect();

        Ok(ExtractionOutput {
            memories,
            summary: extraction.summary,
        })
    }
}

#[async_trait]
impl FactExtractor for LlmExtractor {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn extract(
        &self,
        _source_id: &str,
        source_filename: &str,
        _source_version: u32,
        markdown: &str,
    ) -> Result<ExtractionOutput, ExtractorError> {
        let prompt = self.build_extraction_prompt(source_filename, markdown);

        let response = match self.config.provider {
            LlmProvider::Ollama => self.call_ollama(&prompt).await?,
            LlmProvider::OpenAi => self.call_openai(&prompt).await?,
        };

        let output = self.parse_response(&response)?;
        debug!("Model extracted {} facts", output.memories.len());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        std::env::set_var("LLM_PROVIDER", "ollama");
        std::env::set_var("OLLAMA_URL", "http://localhost:11434");
        std::env::set_var("OLLAMA_MODEL", "llama3.2:3b");

        let config = LlmConfig::from_env().unwrap();
        assert_eq!(config.provider, LlmProvider::Ollama);
        assert_eq!(config.base_url, "http://localhost:11434");
        assert_eq!(config.model, "llama3.2:3b");
    }

    #[test]
    fn test_extraction_prompt() {
        let extractor = LlmExtractor::new(LlmConfig::default()).unwrap();
        let prompt =
            extractor.build_extraction_prompt("notes.md", "I like soccer on weekends.");

        assert!(prompt.contains("atomic facts"));
        assert!(prompt.contains("preferences"));
        assert!(prompt.contains("evidence_text"));
        assert!(prompt.contains("I like soccer on weekends."));
    }

    #[test]
    fn test_parse_response() {
        let extractor = LlmExtractor::new(LlmConfig::default()).unwrap();

        let response = r#"{
            "memories": [
                {
                    "kind": "preferences",
                    "statement": "Plays soccer on weekends",
                    "title": "Soccer",
                    "tags": ["sports"],
                    "confidence": 0.9,
                    "evidence_text": "I like soccer on weekends."
                },
                {
                    "kind": "commitments",
                    "statement": "Will ship the report by Friday"
                }
            ],
            "summary": "Weekend plans and a work commitment."
        }"#;

        let output = extractor.parse_response(response).unwrap();
        assert_eq!(output.memories.len(), 2);
        assert_eq!(output.memories[0].kind, "preferences");
        assert_eq!(output.memories[1].confidence, None);
        assert_eq!(
            output.summary.as_deref(),
            Some("Weekend plans and a work commitment.")
        );
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        let extractor = LlmExtractor::new(LlmConfig::default()).unwrap();
        let err = extractor.parse_response("not json at all").unwrap_err();
        assert!(matches!(err, ExtractorError::Malformed(_)));
    }
}
