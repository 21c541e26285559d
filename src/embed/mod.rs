//! Embedding generation
//!
//! This module provides an abstraction over embedding models with:
//! - A trait for different embedding backends
//! - Local embeddings using FastEmbed (feature `local-embed`)
//! - An HTTP embedding backend
//!
//! Every backend failure surfaces as [`Error::EmbeddingUnavailable`]; callers
//! leave the affected records stale and keep going.

#[cfg(feature = "local-embed")]
mod fastembed_impl;
mod http_backend;

#[cfg(feature = "local-embed")]
pub use fastembed_impl::*;
pub use http_backend::*;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Trait for embedding providers; a pure function of the input text
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input in order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(vec![text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::EmbeddingUnavailable("backend returned no vector".to_string()))
    }

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.backend.to_lowercase().as_str() {
        #[cfg(feature = "local-embed")]
        "fastembed" | "local" => Ok(Arc::new(FastEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embed"))]
        "fastembed" | "local" => Err(Error::Config(
            "embedding.backend 'fastembed' requires the 'local-embed' feature".to_string(),
        )),
        "http" | "https" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        other => Err(Error::Config(format!(
            "Unsupported embedding backend '{}'; expected 'fastembed' or 'http'",
            other
        ))),
    }
}

/// Embed in batches; the output has one vector per input text
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: Vec<String>,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut all_embeddings = Vec::with_capacity(texts.len());

    for chunk in texts.chunks(batch_size.max(1)) {
        let embeddings = embedder.embed(chunk.to_vec()).await?;
        if embeddings.len() != chunk.len() {
            return Err(Error::EmbeddingUnavailable(format!(
                "backend returned {} vectors for {} inputs",
                embeddings.len(),
                chunk.len()
            )));
        }
        all_embeddings.extend(embeddings);
    }

    Ok(all_embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting;

    #[async_trait]
    impl Embedder for Counting {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    struct Short;

    #[async_trait]
    impl Embedder for Short {
        async fn embed(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0, 0.0]])
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "short"
        }
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let texts: Vec<String> = (0..10).map(|i| "x".repeat(i)).collect();
        let vectors = embed_in_batches(&Counting, texts, 3).await.unwrap();
        assert_eq!(vectors.len(), 10);
        assert_eq!(vectors[7][0], 7.0);
    }

    #[tokio::test]
    async fn test_short_batch_is_unavailable() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embed_in_batches(&Short, texts, 8).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let config = EmbeddingConfig {
            backend: "onnx-remote".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
