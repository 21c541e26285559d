//! Qdrant-backed vector index
//!
//! Each generation lives in its own collection named `{prefix}_g{n}`. A rebuild
//! fills the next collection and swaps the live name under a write lock. The
//! previous collection is dropped only after the new generation is recorded, so
//! a restart in between reopens a collection that still exists.

use super::{check_dimension, IndexBuilder, IndexEntry, VectorHit, VectorIndex};
use crate::error::{Error, Result};
use crate::models::ResourceKey;
use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace for deterministic point ids derived from resource keys
const POINT_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_4c2e_9a0b_4b7e_8f3a_2c5d_7e91_0a64);

#[derive(Debug, Clone)]
struct LiveCollection {
    name: String,
    generation: u64,
}

/// Qdrant index handle
pub struct QdrantIndex {
    client: Arc<Qdrant>,
    prefix: String,
    dimension: usize,
    live: Arc<RwLock<LiveCollection>>,
}

impl QdrantIndex {
    /// Create a handle; no network traffic happens until the first call
    pub fn new(url: &str, prefix: &str, dimension: usize, generation: u64) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .skip_compatibility_check()
            .build()
            .map_err(|e| Error::Qdrant(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.to_string(),
            dimension,
            live: Arc::new(RwLock::new(LiveCollection {
                name: collection_name(prefix, generation),
                generation,
            })),
        })
    }

    /// Make sure the live generation's collection exists
    pub async fn ensure_live_collection(&self) -> Result<()> {
        let live = self.live.read().await;
        if !self.client.collection_exists(&live.name).await? {
            create_collection(&self.client, &live.name, self.dimension).await?;
        }
        Ok(())
    }
}

fn collection_name(prefix: &str, generation: u64) -> String {
    format!("{}_g{}", prefix, generation)
}

async fn create_collection(client: &Qdrant, name: &str, dimension: usize) -> Result<()> {
    info!("Creating collection {} with dimension {}", name, dimension);
    client
        .create_collection(
            CreateCollectionBuilder::new(name)
                .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
        )
        .await?;
    Ok(())
}

fn point_id(key: &ResourceKey) -> String {
    Uuid::new_v5(&POINT_NAMESPACE, key.to_string().as_bytes()).to_string()
}

fn string_value(s: &str) -> QdrantValue {
    QdrantValue {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}

fn to_point(entry: IndexEntry) -> PointStruct {
    let mut payload: HashMap<String, QdrantValue> = HashMap::new();
    payload.insert(
        "resource_type".to_string(),
        string_value(entry.key.resource_type.as_str()),
    );
    payload.insert("id".to_string(), string_value(&entry.key.id));
    PointStruct::new(point_id(&entry.key), entry.vector, payload)
}

fn key_from_payload(payload: &HashMap<String, QdrantValue>) -> Option<ResourceKey> {
    let text = |field: &str| match payload.get(field).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    };
    let resource_type = text("resource_type")?.parse().ok()?;
    Some(ResourceKey::new(resource_type, text("id")?))
}

async fn upsert(client: &Qdrant, collection: &str, entries: Vec<IndexEntry>) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    debug!("Upserting {} points to collection {}", entries.len(), collection);
    let points: Vec<PointStruct> = entries.into_iter().map(to_point).collect();
    client
        .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
        .await?;
    Ok(())
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn generation(&self) -> u64 {
        self.live.read().await.generation
    }

    async fn len(&self) -> Result<u64> {
        let live = self.live.read().await;
        let info = self.client.collection_info(&live.name).await?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0))
    }

    async fn add(&self, entries: Vec<IndexEntry>) -> Result<()> {
        check_dimension(&entries, self.dimension)?;
        let live = self.live.read().await;
        upsert(&self.client, &live.name, entries).await
    }

    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        // Hold the read guard so a commit cannot drop the collection mid-query
        let live = self.live.read().await;
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&live.name, query.to_vec(), limit as u64)
                    .with_payload(true),
            )
            .await?;

        let mut hits: Vec<VectorHit> = response
            .result
            .into_iter()
            .filter_map(|p| {
                let key = key_from_payload(&p.payload)?;
                Some(VectorHit {
                    key,
                    similarity: p.score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(hits)
    }

    async fn begin_rebuild(&self) -> Result<Box<dyn IndexBuilder>> {
        let generation = self.live.read().await.generation + 1;
        let name = collection_name(&self.prefix, generation);
        if self.client.collection_exists(&name).await? {
            warn!("Dropping leftover collection {} from an interrupted rebuild", name);
            self.client.delete_collection(&name).await?;
        }
        create_collection(&self.client, &name, self.dimension).await?;

        Ok(Box::new(QdrantIndexBuilder {
            client: self.client.clone(),
            dimension: self.dimension,
            live: self.live.clone(),
            next: LiveCollection { name, generation },
        }))
    }

    async fn retire_before(&self, live: u64) -> Result<()> {
        let Some(previous) = live.checked_sub(1) else {
            return Ok(());
        };
        let name = collection_name(&self.prefix, previous);
        if self.client.collection_exists(&name).await? {
            self.client.delete_collection(&name).await?;
            info!(collection = %name, "Dropped previous Qdrant collection");
        }
        Ok(())
    }
}

struct QdrantIndexBuilder {
    client: Arc<Qdrant>,
    dimension: usize,
    live: Arc<RwLock<LiveCollection>>,
    next: LiveCollection,
}

#[async_trait]
impl IndexBuilder for QdrantIndexBuilder {
    async fn add_batch(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        check_dimension(&entries, self.dimension)?;
        upsert(&self.client, &self.next.name, entries).await
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let previous = {
            let mut live = self.live.write().await;
            std::mem::replace(&mut *live, self.next.clone())
        };
        info!(
            generation = self.next.generation,
            collection = %self.next.name,
            "Swapped in rebuilt Qdrant collection"
        );
        debug!(collection = %previous.name, "Previous collection kept until retired");
        Ok(self.next.generation)
    }

    async fn abort(self: Box<Self>) {
        if let Err(e) = self.client.delete_collection(&self.next.name).await {
            warn!(collection = %self.next.name, error = %e, "Failed to drop aborted collection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceType;

    #[test]
    fn test_point_ids_are_stable_per_key() {
        let a = ResourceKey::new(ResourceType::Model, "org/model");
        let b = ResourceKey::new(ResourceType::Dataset, "org/model");
        assert_eq!(point_id(&a), point_id(&a.clone()));
        assert_ne!(point_id(&a), point_id(&b));
    }

    #[test]
    fn test_payload_roundtrip() {
        let key = ResourceKey::new(ResourceType::Space, "org/demo");
        let point = to_point(IndexEntry {
            key: key.clone(),
            vector: vec![0.1, 0.2],
        });
        assert_eq!(key_from_payload(&point.payload), Some(key));
    }

    #[tokio::test]
    async fn test_add_rejects_dimension_mismatch() {
        let index = QdrantIndex::new("http://127.0.0.1:6334", "test_resources", 3, 0)
            .expect("handle should initialize");

        let err = index
            .add(vec![IndexEntry {
                key: ResourceKey::new(ResourceType::Model, "x"),
                vector: vec![0.1, 0.2],
            }])
            .await
            .expect_err("should reject mismatched vector length");

        assert!(matches!(err, Error::DataIntegrity(_)));
    }
}
