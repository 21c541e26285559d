//! Knowledge Store
//!
//! Owns the metadata store and its derived vector index:
//! - Upserts by content hash, with embedding staleness tracking
//! - Lexical (FTS5), vector and hybrid search
//! - Full index rebuilds into a new generation while reads continue
//!
//! The vector index is never a source of truth. Vector hits are resolved
//! against metadata and dropped unless the record's embedding is current.

mod rank;

pub use rank::*;

use crate::config::{Config, SearchConfig, WatchConfig};
use crate::embed::{create_embedder, embed_in_batches, Embedder};
use crate::error::{Error, Result};
use crate::meta::{MetaDb, TypeStats};
use crate::models::{
    format_ts, parse_ts, ChangeKind, EmbeddingState, ResourceKey, ResourceRecord, ResourceType,
    WatchKind,
};
use crate::store::{create_index, IndexEntry, VectorIndex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STATE_GENERATION: &str = "index_generation";
const STATE_BUILT_AT: &str = "index_built_at";
const STATE_ENTRIES: &str = "index_entries";

/// Rows fetched per page when walking the store
const SCAN_PAGE: usize = 512;

/// Outcome of a full index rebuild
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexBuildReport {
    pub generation: u64,
    pub entries: u64,
    /// Records embedded while catching up before the rebuild
    pub embedded: u64,
    pub built_at: DateTime<Utc>,
}

/// Vector index freshness as reported by stats
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFreshness {
    pub backend: String,
    pub generation: u64,
    pub built_at: Option<DateTime<Utc>>,
    pub entries_at_build: u64,
    pub live_vectors: Option<u64>,
    pub embedder: Option<String>,
}

/// Metadata store plus derived vector index
pub struct KnowledgeStore {
    db: MetaDb,
    index: Arc<dyn VectorIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    ranker: Ranker,
    search: SearchConfig,
    batch_size: usize,
    backend: String,
    /// Entries added to the live index while a rebuild is in flight
    rebuild_journal: Mutex<Option<Vec<IndexEntry>>>,
    rebuild_lock: Mutex<()>,
}

impl KnowledgeStore {
    pub fn new(
        db: MetaDb,
        index: Arc<dyn VectorIndex>,
        embedder: Option<Arc<dyn Embedder>>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            index,
            embedder,
            ranker: Ranker::new(config.search.lexical_weight as f64),
            search: config.search.clone(),
            batch_size: config.embedding.batch_size.max(1),
            backend: config.index.backend.clone(),
            rebuild_journal: Mutex::new(None),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Open the configured database, index and embedder.
    ///
    /// An embedder that fails to load leaves the store lexical-only.
    pub async fn open(config: &Config) -> Result<Self> {
        let db = MetaDb::connect(config).await?;
        let generation = db
            .get_index_state(STATE_GENERATION)
            .await?
            .and_then(|g| g.parse().ok())
            .unwrap_or(0);
        let index = create_index(config, generation).await?;
        let embedder = match create_embedder(&config.embedding) {
            Ok(embedder) => Some(embedder),
            Err(e) => {
                warn!(error = %e, "Embedder unavailable, search falls back to lexical");
                None
            }
        };
        Ok(Self::new(db, index, embedder, config))
    }

    pub fn db(&self) -> &MetaDb {
        &self.db
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    fn embedder(&self) -> Result<&Arc<dyn Embedder>> {
        self.embedder
            .as_ref()
            .ok_or_else(|| Error::EmbeddingUnavailable("no embedding model loaded".to_string()))
    }

    fn clamp_limit(&self, limit: usize) -> usize {
        if limit == 0 {
            self.search.default_limit
        } else {
            limit.min(self.search.max_limit)
        }
    }

    fn candidates(&self, limit: usize) -> usize {
        limit.saturating_mul(self.search.candidate_multiplier.max(1))
    }

    // ===== Records =====

    /// Insert or update a record by content hash
    pub async fn upsert(&self, record: &ResourceRecord) -> Result<ChangeKind> {
        let (change, _) = self.db.upsert_resource(record, |_, _| {}).await?;
        Ok(change)
    }

    /// Upsert, invoking `publish` in commit order for the record's key
    pub async fn upsert_with<F>(
        &self,
        record: &ResourceRecord,
        publish: F,
    ) -> Result<(ChangeKind, ResourceRecord)>
    where
        F: FnOnce(ChangeKind, &ResourceRecord) + Send,
    {
        self.db.upsert_resource(record, publish).await
    }

    pub async fn get(&self, id: &str, resource_type: ResourceType) -> Result<ResourceRecord> {
        let key = ResourceKey::new(resource_type, id);
        self.db
            .get_resource(&key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Flag records as stale without removing them
    pub async fn mark_stale(&self, keys: &[ResourceKey]) -> Result<u64> {
        self.db.mark_stale(keys).await
    }

    pub async fn mark_unseen_stale(
        &self,
        resource_type: ResourceType,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        self.db.mark_unseen_stale(resource_type, cutoff).await
    }

    // ===== Embeddings =====

    /// Embed records and add current vectors to the live index.
    ///
    /// Returns the number of embeddings that are current after the call.
    pub async fn embed_records(&self, records: &[ResourceRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let embedder = self.embedder()?;
        let texts: Vec<String> = records.iter().map(ResourceRecord::embedding_text).collect();
        let vectors = embed_in_batches(&**embedder, texts, self.batch_size).await?;

        let mut entries = Vec::with_capacity(records.len());
        for (record, vector) in records.iter().zip(vectors) {
            let key = record.key();
            let state = self
                .db
                .store_embedding(&key, &vector, embedder.model_name(), &record.text_hash())
                .await?;
            if state == EmbeddingState::Current {
                entries.push(IndexEntry { key, vector });
            } else {
                debug!(key = %key, "Text changed while embedding, left stale");
            }
        }
        let current = entries.len();
        self.add_to_index(entries).await;
        Ok(current)
    }

    /// Add to the live index and journal the entries for an in-flight rebuild
    async fn add_to_index(&self, entries: Vec<IndexEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut journal = self.rebuild_journal.lock().await;
        if let Err(e) = self.index.add(entries.clone()).await {
            warn!(error = %e, count = entries.len(), "Vector index add failed, next rebuild will include them");
        }
        if journal.is_some() && self.rebuild_lock.try_lock().is_ok() {
            // Left behind by a rebuild that was dropped mid-flight
            *journal = None;
        }
        if let Some(pending) = journal.as_mut() {
            pending.extend(entries);
        }
    }

    /// Embed every record whose embedding is absent or stale
    pub async fn catch_up_embeddings(&self) -> Result<u64> {
        let mut after: Option<ResourceKey> = None;
        let mut embedded = 0u64;
        loop {
            let pending = self.db.list_pending_embeddings(after.as_ref(), SCAN_PAGE).await?;
            let Some(last) = pending.last() else {
                break;
            };
            after = Some(last.key());
            embedded += self.embed_records(&pending).await? as u64;
        }
        if embedded > 0 {
            info!(embedded, "Caught up pending embeddings");
        }
        Ok(embedded)
    }

    /// Load stored embeddings into a non-persistent index after startup
    pub async fn warm_index(&self) -> Result<u64> {
        if self.index.is_persistent() {
            return Ok(0);
        }
        let mut after: Option<ResourceKey> = None;
        let mut loaded = 0u64;
        loop {
            let batch = self.db.list_current_embeddings(after.as_ref(), SCAN_PAGE).await?;
            let Some((last, _)) = batch.last() else {
                break;
            };
            after = Some(last.clone());
            loaded += batch.len() as u64;
            let entries = batch
                .into_iter()
                .map(|(key, vector)| IndexEntry { key, vector })
                .collect();
            self.add_to_index(entries).await;
        }
        debug!(loaded, "Warmed in-memory vector index");
        Ok(loaded)
    }

    // ===== Index rebuild =====

    /// Rebuild the vector index from stored embeddings and swap it in.
    ///
    /// Pending embeddings are caught up first when an embedder is loaded.
    /// On failure the previous generation stays live.
    pub async fn build_index_from_store(&self) -> Result<IndexBuildReport> {
        let _rebuilding = self.rebuild_lock.lock().await;

        let embedded = if self.embedder.is_some() {
            match self.catch_up_embeddings().await {
                Ok(n) => n,
                Err(e @ Error::EmbeddingUnavailable(_)) => {
                    warn!(error = %e, "Embedding catch-up skipped, stale records stay lexical-only");
                    0
                }
                Err(e) => return Err(e),
            }
        } else {
            0
        };

        *self.rebuild_journal.lock().await = Some(Vec::new());
        let result = self.rebuild_generation().await;
        if result.is_err() {
            *self.rebuild_journal.lock().await = None;
        }
        let (generation, entries) =
            result.map_err(|e| Error::IndexRebuild(format!("index rebuild failed: {}", e)))?;

        let built_at = Utc::now();
        self.db
            .set_index_state(STATE_GENERATION, &generation.to_string())
            .await?;
        self.db
            .set_index_state(STATE_BUILT_AT, &format_ts(built_at))
            .await?;
        self.db
            .set_index_state(STATE_ENTRIES, &entries.to_string())
            .await?;
        if let Err(e) = self.index.retire_before(generation).await {
            warn!(generation, error = %e, "Failed to release the previous index generation");
        }

        info!(generation, entries, embedded, "Vector index rebuilt");
        Ok(IndexBuildReport {
            generation,
            entries,
            embedded,
            built_at,
        })
    }

    async fn rebuild_generation(&self) -> Result<(u64, u64)> {
        let mut builder = self.index.begin_rebuild().await?;
        let mut after: Option<ResourceKey> = None;
        let mut entries = 0u64;

        loop {
            let batch = match self.db.list_current_embeddings(after.as_ref(), SCAN_PAGE).await {
                Ok(batch) => batch,
                Err(e) => {
                    builder.abort().await;
                    return Err(e);
                }
            };
            let Some((last, _)) = batch.last() else {
                break;
            };
            after = Some(last.clone());
            entries += batch.len() as u64;
            let batch = batch
                .into_iter()
                .map(|(key, vector)| IndexEntry { key, vector })
                .collect();
            if let Err(e) = builder.add_batch(batch).await {
                builder.abort().await;
                return Err(e);
            }
        }

        // Hold the journal across drain and commit so no concurrent add is lost
        let mut journal = self.rebuild_journal.lock().await;
        let replay = journal.take().unwrap_or_default();
        if !replay.is_empty() {
            debug!(count = replay.len(), "Replaying adds made during rebuild");
            if let Err(e) = builder.add_batch(replay).await {
                builder.abort().await;
                return Err(e);
            }
        }
        let generation = builder.commit().await?;
        drop(journal);
        Ok((generation, entries))
    }

    // ===== Search =====

    pub async fn lexical_search(
        &self,
        query: &str,
        resource_type: Option<ResourceType>,
        limit: usize,
    ) -> Result<Vec<(ResourceRecord, f64)>> {
        self.db.lexical_search(query, resource_type, limit).await
    }

    /// Nearest records to `query_vector` whose embedding is current
    pub async fn vector_search(
        &self,
        query_vector: &[f32],
        resource_type: Option<ResourceType>,
        limit: usize,
    ) -> Result<Vec<(ResourceRecord, f64)>> {
        let hits = self.index.search(query_vector, self.candidates(limit)).await?;
        let mut results = Vec::with_capacity(limit);
        for hit in hits {
            if resource_type.is_some_and(|t| t != hit.key.resource_type) {
                continue;
            }
            let Some(record) = self.db.get_resource(&hit.key).await? else {
                debug!(key = %hit.key, "Vector hit without metadata, skipped");
                continue;
            };
            if record.embedding_state != EmbeddingState::Current {
                continue;
            }
            results.push((record, hit.similarity as f64));
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    pub async fn semantic_search(
        &self,
        query: &str,
        resource_type: Option<ResourceType>,
        limit: usize,
    ) -> Result<Vec<(ResourceRecord, f64)>> {
        let vector = self.embedder()?.embed_one(query).await?;
        self.vector_search(&vector, resource_type, limit).await
    }

    /// Fused lexical and vector ranking; lexical-only if the embedder is down
    pub async fn hybrid_search(
        &self,
        query: &str,
        resource_type: Option<ResourceType>,
        limit: usize,
    ) -> Result<Vec<RankedResult>> {
        let limit = self.clamp_limit(limit);
        let candidates = self.candidates(limit);
        let lexical = self.lexical_search(query, resource_type, candidates).await?;

        let vector = match self.semantic_search(query, resource_type, candidates).await {
            Ok(hits) => hits,
            Err(Error::EmbeddingUnavailable(reason)) => {
                debug!(%reason, "Hybrid search running lexical-only");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Vector search failed, using lexical results only");
                Vec::new()
            }
        };

        let mut ranked = self.ranker.rank_hybrid(lexical, vector);
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Search in the requested mode
    pub async fn search(
        &self,
        query: &str,
        resource_type: Option<ResourceType>,
        mode: SearchMode,
        limit: usize,
    ) -> Result<Vec<RankedResult>> {
        let limit = self.clamp_limit(limit);
        match mode {
            SearchMode::Lexical => {
                let hits = self.lexical_search(query, resource_type, limit).await?;
                Ok(self.ranker.rank_lexical(hits))
            }
            SearchMode::Semantic => {
                let hits = self.semantic_search(query, resource_type, limit).await?;
                Ok(self.ranker.rank_vector(hits))
            }
            SearchMode::Hybrid => self.hybrid_search(query, resource_type, limit).await,
        }
    }

    /// Records closest to a stored record's embedding, excluding itself
    pub async fn get_similar(
        &self,
        id: &str,
        resource_type: ResourceType,
        limit: usize,
    ) -> Result<Vec<(ResourceRecord, f64)>> {
        let key = ResourceKey::new(resource_type, id);
        let vector = self.db.get_embedding(&key).await?.ok_or_else(|| {
            Error::NotFound(format!("{} has no current embedding", key))
        })?;
        let limit = self.clamp_limit(limit);
        let mut hits = self.vector_search(&vector, None, limit + 1).await?;
        hits.retain(|(record, _)| record.key() != key);
        hits.truncate(limit);
        Ok(hits)
    }

    // ===== Reporting =====

    /// Stored records matching any watch rule, most downloaded first
    pub async fn priority_resources(
        &self,
        watch: &WatchConfig,
        limit: usize,
    ) -> Result<Vec<ResourceRecord>> {
        let mut found: BTreeMap<ResourceKey, ResourceRecord> = BTreeMap::new();
        for rule in watch.rules() {
            let records = match rule.kind {
                WatchKind::Author => self.db.resources_by_author(&rule.value, limit).await?,
                WatchKind::Tag => self.db.resources_by_tag(&rule.value, limit).await?,
            };
            for record in records {
                found.entry(record.key()).or_insert(record);
            }
        }
        let mut records: Vec<ResourceRecord> = found.into_values().collect();
        records.sort_by(|a, b| {
            b.popularity
                .cmp(&a.popularity)
                .then_with(|| a.id.cmp(&b.id))
        });
        records.truncate(limit);
        Ok(records)
    }

    pub async fn type_stats(&self) -> Result<Vec<TypeStats>> {
        self.db.type_stats().await
    }

    pub async fn index_freshness(&self) -> Result<IndexFreshness> {
        let built_at = match self.db.get_index_state(STATE_BUILT_AT).await? {
            Some(ts) => Some(parse_ts(&ts)?),
            None => None,
        };
        let entries_at_build = self
            .db
            .get_index_state(STATE_ENTRIES)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let live_vectors = match self.index.len().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Could not read vector index size");
                None
            }
        };
        Ok(IndexFreshness {
            backend: self.backend.clone(),
            generation: self.index.generation().await,
            built_at,
            entries_at_build,
            live_vectors,
            embedder: self.embedder.as_ref().map(|e| e.model_name().to_string()),
        })
    }

    /// Write every record as a JSON array; returns the record count
    pub async fn export(&self, path: &Path) -> Result<usize> {
        let mut records = Vec::new();
        loop {
            let page = self
                .db
                .list_resources(None, SCAN_PAGE, records.len())
                .await?;
            let done = page.len() < SCAN_PAGE;
            records.extend(page);
            if done {
                break;
            }
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &records)?;
        info!(count = records.len(), path = %path.display(), "Exported knowledge base");
        Ok(records.len())
    }
}
