//! Embedding services for generating vector representations.
//!
//! The engine embeds contextual-wrapper strings during ingestion, queries
//! during retrieval, and responses in the echo guard, all through one port.
//! An OpenAI-compatible HTTP provider covers production; a deterministic
//! hash-based provider covers tests and driver-less runs.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::types::MemoryError;

/// Port for embedding generation.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;

    /// Output vector dimension.
    fn dimension(&self) -> usize;
}

/// Cosine similarity between two vectors; 0.0 when either has zero norm or
/// the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Embedding service using an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddingService {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, MemoryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MemoryError::Embedding {
                reason: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut request = self.client.post(&self.api_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.map_err(|e| MemoryError::Embedding {
            reason: format!("embedding request failed: {e}"),
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Embedding {
                reason: format!("embedding endpoint returned {status}: {body_text}"),
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| MemoryError::Embedding {
            reason: format!("failed to parse embedding response: {e}"),
        })?;

        let values = json
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|e| e.get("embedding"))
            .and_then(|v| v.as_array())
            .ok_or_else(|| MemoryError::Embedding {
                reason: "missing 'data[0].embedding' in response".to_string(),
            })?;

        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| MemoryError::Embedding {
                        reason: "non-numeric embedding component".to_string(),
                    })
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic embedding service for tests and driver-less development.
///
/// Hashes the text into a pseudo-random unit vector: identical inputs map to
/// identical vectors (cosine 1.0), distinct inputs to near-orthogonal ones.
pub struct HashEmbeddingService {
    dimension: usize,
}

impl HashEmbeddingService {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingService for HashEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut counter: u32 = 0;
        while vector.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if vector.len() >= self.dimension {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1]
                vector.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, -0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn hash_embeddings_are_deterministic() {
        let service = HashEmbeddingService::new(64);
        let a = service.embed("Hello.").await.unwrap();
        let b = service.embed("Hello.").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn distinct_texts_are_dissimilar() {
        let service = HashEmbeddingService::new(256);
        let a = service.embed("Hello.").await.unwrap();
        let b = service
            .embed("A completely different response about orbital mechanics.")
            .await
            .unwrap();
        assert!(cosine_similarity(&a, &b).abs() < 0.5);
    }

    #[tokio::test]
    async fn hash_embeddings_are_unit_length() {
        let service = HashEmbeddingService::new(128);
        let v = service.embed("normalize me").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
