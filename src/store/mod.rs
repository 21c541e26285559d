//! Vector index over resource embeddings
//!
//! The index is a derived projection of the metadata store:
//! - Incremental adds as records are embedded
//! - Full rebuilds into a fresh generation, swapped in atomically
//! - In-memory cosine index, or a Qdrant collection per generation

mod qdrant;

pub use qdrant::QdrantIndex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::ResourceKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A vector keyed by the record it was computed from
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub key: ResourceKey,
    pub vector: Vec<f32>,
}

/// A nearest-neighbour hit; similarity is cosine in [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub key: ResourceKey,
    pub similarity: f32,
}

/// A vector index supporting incremental adds and generation swaps
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Expected vector dimension
    fn dimension(&self) -> usize;

    /// Whether the index survives a process restart
    fn is_persistent(&self) -> bool;

    /// Generation currently served to readers
    async fn generation(&self) -> u64;

    /// Number of vectors in the live generation
    async fn len(&self) -> Result<u64>;

    /// Insert or replace vectors in the live generation
    async fn add(&self, entries: Vec<IndexEntry>) -> Result<()>;

    /// Nearest neighbours of `query`, most similar first
    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>>;

    /// Start building the next generation; readers keep the live one until commit
    async fn begin_rebuild(&self) -> Result<Box<dyn IndexBuilder>>;

    /// Release storage held by generations before `live`. Call only once
    /// `live` is durably recorded as the generation to reopen.
    async fn retire_before(&self, _live: u64) -> Result<()> {
        Ok(())
    }
}

/// Builds one index generation off to the side
#[async_trait]
pub trait IndexBuilder: Send {
    async fn add_batch(&mut self, entries: Vec<IndexEntry>) -> Result<()>;

    /// Swap the new generation in and return its number; the previous
    /// generation stays readable until [`VectorIndex::retire_before`]
    async fn commit(self: Box<Self>) -> Result<u64>;

    /// Discard the partially built generation
    async fn abort(self: Box<Self>);
}

/// Create the index configured in `config`
pub async fn create_index(config: &Config, generation: u64) -> Result<Arc<dyn VectorIndex>> {
    let dimension = config.embedding.dimension;
    match config.index.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryIndex::new(dimension))),
        "qdrant" => {
            let index = QdrantIndex::new(
                &config.index.qdrant_url,
                &config.index.collection_name,
                dimension,
                generation,
            )?;
            index.ensure_live_collection().await?;
            Ok(Arc::new(index))
        }
        other => Err(Error::Config(format!("Unsupported index backend '{}'", other))),
    }
}

pub(crate) fn check_dimension(entries: &[IndexEntry], dimension: usize) -> Result<()> {
    if let Some(bad) = entries.iter().find(|e| e.vector.len() != dimension) {
        return Err(Error::DataIntegrity(format!(
            "Vector dimension mismatch for {}: expected {}, got {}",
            bad.key,
            dimension,
            bad.vector.len()
        )));
    }
    Ok(())
}

fn normalized(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|v| v / norm).collect())
}

struct Generation {
    number: u64,
    vectors: RwLock<HashMap<ResourceKey, Vec<f32>>>,
}

/// Brute-force cosine index held in memory
pub struct MemoryIndex {
    dimension: usize,
    live: Arc<RwLock<Arc<Generation>>>,
}

impl MemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            live: Arc::new(RwLock::new(Arc::new(Generation {
                number: 0,
                vectors: RwLock::new(HashMap::new()),
            }))),
        }
    }

    async fn current(&self) -> Arc<Generation> {
        self.live.read().await.clone()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn generation(&self) -> u64 {
        self.current().await.number
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.current().await.vectors.read().await.len() as u64)
    }

    async fn add(&self, entries: Vec<IndexEntry>) -> Result<()> {
        check_dimension(&entries, self.dimension)?;
        let generation = self.current().await;
        let mut vectors = generation.vectors.write().await;
        for entry in entries {
            match normalized(&entry.vector) {
                Some(v) => {
                    vectors.insert(entry.key, v);
                }
                None => debug!(key = %entry.key, "Skipping zero vector"),
            }
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(Error::DataIntegrity(format!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        let Some(query) = normalized(query) else {
            return Ok(Vec::new());
        };

        let generation = self.current().await;
        let vectors = generation.vectors.read().await;
        let mut hits: Vec<VectorHit> = vectors
            .iter()
            .map(|(key, v)| VectorHit {
                key: key.clone(),
                similarity: v.iter().zip(&query).map(|(a, b)| a * b).sum(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn begin_rebuild(&self) -> Result<Box<dyn IndexBuilder>> {
        Ok(Box::new(MemoryIndexBuilder {
            dimension: self.dimension,
            live: self.live.clone(),
            vectors: HashMap::new(),
        }))
    }
}

struct MemoryIndexBuilder {
    dimension: usize,
    live: Arc<RwLock<Arc<Generation>>>,
    vectors: HashMap<ResourceKey, Vec<f32>>,
}

#[async_trait]
impl IndexBuilder for MemoryIndexBuilder {
    async fn add_batch(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        check_dimension(&entries, self.dimension)?;
        for entry in entries {
            if let Some(v) = normalized(&entry.vector) {
                self.vectors.insert(entry.key, v);
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let mut live = self.live.write().await;
        let number = live.number + 1;
        let size = self.vectors.len();
        *live = Arc::new(Generation {
            number,
            vectors: RwLock::new(self.vectors),
        });
        info!(generation = number, vectors = size, "Swapped in rebuilt vector index");
        Ok(number)
    }

    async fn abort(self: Box<Self>) {
        debug!("Discarding partially built in-memory index");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceType;

    fn entry(id: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            key: ResourceKey::new(ResourceType::Model, id),
            vector,
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity_then_key() {
        let index = MemoryIndex::new(2);
        index
            .add(vec![
                entry("b", vec![1.0, 0.0]),
                entry("a", vec![2.0, 0.0]),
                entry("c", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.key.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_add_rejects_dimension_mismatch() {
        let index = MemoryIndex::new(3);
        let err = index.add(vec![entry("x", vec![0.1, 0.2])]).await.unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[tokio::test]
    async fn test_readers_see_old_generation_until_commit() {
        let index = MemoryIndex::new(2);
        index.add(vec![entry("old", vec![1.0, 0.0])]).await.unwrap();

        let mut builder = index.begin_rebuild().await.unwrap();
        builder.add_batch(vec![entry("new", vec![1.0, 0.0])]).await.unwrap();

        let hits = index.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits[0].key.id, "old");
        assert_eq!(index.generation().await, 0);

        let generation = builder.commit().await.unwrap();
        assert_eq!(generation, 1);
        let hits = index.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key.id, "new");
    }

    #[tokio::test]
    async fn test_abort_keeps_live_generation() {
        let index = MemoryIndex::new(2);
        index.add(vec![entry("keep", vec![0.0, 1.0])]).await.unwrap();
        let builder = index.begin_rebuild().await.unwrap();
        builder.abort().await;
        assert_eq!(index.len().await.unwrap(), 1);
        assert_eq!(index.generation().await, 0);
    }
}
