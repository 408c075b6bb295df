//! Embedding provider interface and vector helpers
//!
//! The store only consumes the [`EmbeddingProvider`] trait; the conversation
//! runtime supplies an implementation. [`HttpEmbedder`] is a ready-made
//! adapter for OpenAI-compatible embedding APIs.

use async_trait::async_trait;

use crate::{Error, Result};

/// Embedding dimension for text-embedding-3-small
pub const EMBEDDING_DIM: usize = 1536;

/// External embedding function consumed by ingestion and retrieval
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying call fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, in input order.
    ///
    /// # Errors
    ///
    /// Returns error if any underlying call fails.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Text embedder for OpenAI-compatible embedding APIs
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl HttpEmbedder {
    /// Create a new embedder against the `OpenAI` API
    ///
    /// # Errors
    ///
    /// Returns error if API key is empty
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_endpoint(
            api_key,
            "https://api.openai.com/v1".to_string(),
            "text-embedding-3-small".to_string(),
        )
    }

    /// Create an embedder with a custom endpoint and model
    ///
    /// # Errors
    ///
    /// Returns error if API key is empty
    pub fn with_endpoint(api_key: String, base_url: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "API key required for embeddings".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        })
    }

    async fn request_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        #[derive(serde::Serialize)]
        struct EmbeddingRequest<'a> {
            model: &'a str,
            input: &'a [&'a str],
        }

        #[derive(serde::Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
        }

        #[derive(serde::Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
            index: usize,
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "embedding API error {status}: {body}"
            )));
        }

        let mut result: EmbeddingResponse = response.json().await?;

        // Sort by index to maintain input order
        result.data.sort_by_key(|d| d.index);

        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.request_batch(&[text]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.request_batch(texts).await
    }
}

/// Serialize an embedding to bytes for `SQLite` storage
#[must_use]
pub fn to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize an embedding from bytes
#[must_use]
pub fn from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// The zero vector used when a memory is stored without an embedding
#[must_use]
pub fn zero_vector() -> Vec<f32> {
    vec![0.0; EMBEDDING_DIM]
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in `[-1.0, 1.0]` where 1.0 is identical direction.
/// Returns 0.0 if either vector has zero magnitude.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;

    for (ai, bi) in a.iter().zip(b.iter()) {
        let ai = f64::from(*ai);
        let bi = f64::from(*bi);
        dot += ai * bi;
        norm_a += ai * ai;
        norm_b += bi * bi;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }

    #[allow(clippy::cast_possible_truncation)]
    let sim = (dot / denom) as f32;
    sim
}
