use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Vector length shared by every embedder implementation.
pub const EMBEDDING_DIM: usize = 384;

/// Collaborator that turns text into a fixed-length vector.
///
/// Absence of a real model is always substitutable by [`PseudoEmbedder`]
/// without changing any call signature; search quality degrades to lexical
/// similarity but never breaks.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Lowercased alphanumeric tokens; shared by the pseudo-embedder and the
/// lexical-overlap scorer so both see the same words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 2)
        .map(str::to_string)
        .collect()
}

/// Deterministic, model-free embedding: each token is hashed into one of
/// the vector's buckets and the result is L2-normalized. Fully reproducible
/// byte-for-byte, which keeps ranking testable with zero dependencies.
pub struct PseudoEmbedder;

impl PseudoEmbedder {
    pub fn embed_text(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; EMBEDDING_DIM];

        for token in tokenize(text) {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
                as usize
                % EMBEDDING_DIM;
            vector[bucket] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for PseudoEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::embed_text(text))
    }
}

/// Embedder backed by an Ollama-compatible embeddings endpoint.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl RemoteEmbedder {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            model,
        }
    }

    /// Construct from EMBEDDER_URL / EMBEDDER_MODEL; None when no remote
    /// embedder is configured.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("EMBEDDER_URL").ok()?;
        let model =
            std::env::var("EMBEDDER_MODEL").unwrap_or_else(|_| "nomic-embed-text".to_string());
        Some(Self::new(base_url, model))
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);

        debug!("Calling embedder at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("embedder API error {}: {}", status, error_text);
        }

        #[derive(Deserialize)]
        struct EmbeddingResponse {
            embedding: Vec<f32>,
        }

        let body: EmbeddingResponse = response.json().await?;
        Ok(body.embedding)
    }
}

/// Cosine similarity between two vectors; zero when either is degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pseudo_embedding_is_deterministic() {
        let a = PseudoEmbedder::embed_text("soccer on weekends");
        let b = PseudoEmbedder::embed_text("soccer on weekends");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_pseudo_embedding_reflects_overlap() {
        let soccer = PseudoEmbedder::embed_text("soccer match on the weekend");
        let similar = PseudoEmbedder::embed_text("weekend soccer game");
        let unrelated = PseudoEmbedder::embed_text("quarterly tax filing deadline");

        let close = cosine_similarity(&soccer, &similar);
        let far = cosine_similarity(&soccer, &unrelated);
        assert!(close > far);
    }

    #[test]
    fn test_empty_text_embeds_to_zero_vector() {
        let vector = PseudoEmbedder::embed_text("");
        assert!(vector.iter().all(|v| *v == 0.0));
        assert_eq!(cosine_similarity(&vector, &vector), 0.0);
    }

    #[test]
    fn test_tokenize_splits_and_lowercases() {
        assert_eq!(
            tokenize("Soccer, on WEEKENDS!"),
            vec!["soccer", "on", "weekends"]
        );
        assert!(tokenize("a !").is_empty());
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_eq!(cosine_similarity(&a, &a), 1.0);
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }
}
