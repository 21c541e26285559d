//! Metadata storage using SQLite
//!
//! This module is the durable source of truth:
//! - Resources (one row per `(resource_type, id)`, with staleness flags)
//! - The FTS5 lexical index kept in step with resources
//! - Persisted embeddings (the input for vector index rebuilds)
//! - Crawl cycles, scheduler tasks and index bookkeeping

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{
    format_ts, parse_ts, ChangeKind, CrawlCycleRecord, EmbeddingState, Popularity, ResourceKey,
    ResourceRecord, ResourceType, TaskKind, TaskParams, TaskRecord, TaskState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use unicode_segmentation::UnicodeSegmentation;

/// Column weights for `bm25()`: ident, display_name, author, description, tags
const BM25_WEIGHTS: &str = "3.0, 4.0, 2.0, 1.0, 2.0";

#[derive(Debug, Clone, FromRow)]
struct ResourceRow {
    resource_type: String,
    id: String,
    author: String,
    display_name: String,
    description: String,
    tags_json: String,
    downloads: i64,
    likes: i64,
    upstream_last_modified: Option<String>,
    first_seen_at: String,
    last_seen_at: String,
    content_hash: String,
    embedding_state: String,
    stale: bool,
}

impl ResourceRow {
    fn into_record(self) -> Result<ResourceRecord> {
        let tags = serde_json::from_str(&self.tags_json).map_err(|e| {
            Error::DataIntegrity(format!("Corrupt tags for {}: {}", self.id, e))
        })?;
        Ok(ResourceRecord {
            resource_type: self.resource_type.parse()?,
            id: self.id,
            author: self.author,
            display_name: self.display_name,
            description: self.description,
            tags,
            popularity: Popularity {
                downloads: self.downloads.max(0) as u64,
                likes: self.likes.max(0) as u64,
            },
            upstream_last_modified: self
                .upstream_last_modified
                .as_deref()
                .map(parse_ts)
                .transpose()?,
            first_seen_at: parse_ts(&self.first_seen_at)?,
            last_seen_at: parse_ts(&self.last_seen_at)?,
            content_hash: self.content_hash,
            stale: self.stale,
            embedding_state: self.embedding_state.parse()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ScoredRow {
    #[sqlx(flatten)]
    resource: ResourceRow,
    score: f64,
}

#[derive(Debug, FromRow)]
struct EmbeddingRow {
    resource_type: String,
    id: String,
    vector: Vec<u8>,
    dimension: i64,
}

impl EmbeddingRow {
    fn into_entry(self) -> Result<(ResourceKey, Vec<f32>)> {
        let key = ResourceKey::new(self.resource_type.parse()?, self.id);
        let vector = decode_vector(&self.vector, self.dimension.max(0) as usize)?;
        Ok((key, vector))
    }
}

#[derive(Debug, FromRow)]
struct CycleRow {
    cycle_id: String,
    resource_type_scope: String,
    started_at: String,
    finished_at: Option<String>,
    items_seen: i64,
    items_new: i64,
    items_updated: i64,
    errors_count: i64,
    terminal_status: String,
    error: Option<String>,
}

impl CycleRow {
    fn into_record(self) -> Result<CrawlCycleRecord> {
        Ok(CrawlCycleRecord {
            cycle_id: self.cycle_id,
            resource_type_scope: self.resource_type_scope.parse()?,
            started_at: parse_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            items_seen: self.items_seen.max(0) as u64,
            items_new: self.items_new.max(0) as u64,
            items_updated: self.items_updated.max(0) as u64,
            errors_count: self.errors_count.max(0) as u64,
            terminal_status: self.terminal_status.parse()?,
            error: self.error,
        })
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: String,
    kind: String,
    state: String,
    scheduled_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    error: Option<String>,
    interval_secs: Option<i64>,
    params_json: String,
}

impl TaskRow {
    fn into_record(self) -> Result<TaskRecord> {
        let params: TaskParams = serde_json::from_str(&self.params_json).map_err(|e| {
            Error::DataIntegrity(format!("Corrupt params for task {}: {}", self.task_id, e))
        })?;
        Ok(TaskRecord {
            task_id: self.task_id,
            kind: self.kind.parse()?,
            state: self.state.parse()?,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            error: self.error,
            interval_secs: self.interval_secs.map(|s| s.max(0) as u64),
            params,
        })
    }
}

/// Per-type record and embedding counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeStats {
    pub resource_type: String,
    pub total: u64,
    pub stale: u64,
    pub embeddings_current: u64,
    pub embeddings_stale: u64,
    pub embeddings_absent: u64,
}

/// Metadata database handle
#[derive(Clone)]
pub struct MetaDb {
    pool: SqlitePool,
    /// Serializes read-decide-write sequences on resources and embeddings
    write_lock: Arc<Mutex<()>>,
}

impl MetaDb {
    /// Connect to the metadata database
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file).await
    }

    async fn open(db_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Create database with path directly, initializing the schema if needed
    pub async fn new(db_path: &std::path::Path) -> Result<Self> {
        let db = Self::open(db_path).await?;
        if !db.is_initialized().await? {
            db.init_schema().await?;
        }
        Ok(db)
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='resources'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    // ===== Resource Operations =====

    /// Insert or update a resource by content hash.
    ///
    /// An older `upstream_last_modified` never overwrites a newer one. `publish`
    /// runs after commit while the write lock is still held, so callbacks for the
    /// same key observe commit order.
    pub async fn upsert_resource<F>(
        &self,
        incoming: &ResourceRecord,
        publish: F,
    ) -> Result<(ChangeKind, ResourceRecord)>
    where
        F: FnOnce(ChangeKind, &ResourceRecord) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let content_hash = incoming.compute_content_hash();
        let text_hash = incoming.text_hash();

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM resources WHERE resource_type = ? AND id = ?",
        )
        .bind(incoming.resource_type.as_str())
        .bind(&incoming.id)
        .fetch_optional(&mut *tx)
        .await?;

        let (change, stored) = match existing {
            None => {
                let mut record = incoming.clone();
                record.content_hash = content_hash;
                record.first_seen_at = now;
                record.last_seen_at = now;
                record.stale = false;
                record.embedding_state = EmbeddingState::Absent;

                let result = sqlx::query(
                    r#"
                    INSERT INTO resources (resource_type, id, author, display_name, description,
                        tags_json, downloads, likes, upstream_last_modified, first_seen_at,
                        last_seen_at, content_hash, text_hash, embedding_state, stale)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
                    "#,
                )
                .bind(record.resource_type.as_str())
                .bind(&record.id)
                .bind(&record.author)
                .bind(&record.display_name)
                .bind(&record.description)
                .bind(serde_json::to_string(&record.tags)?)
                .bind(record.popularity.downloads as i64)
                .bind(record.popularity.likes as i64)
                .bind(record.upstream_last_modified.map(format_ts))
                .bind(format_ts(now))
                .bind(format_ts(now))
                .bind(&record.content_hash)
                .bind(&text_hash)
                .bind(EmbeddingState::Absent.to_string())
                .execute(&mut *tx)
                .await?;

                insert_fts(&mut tx, result.last_insert_rowid(), &record).await?;
                (ChangeKind::Inserted, record)
            }
            Some(row) => {
                let mut current = row.into_record()?;
                let superseded = matches!(
                    (incoming.upstream_last_modified, current.upstream_last_modified),
                    (Some(new), Some(old)) if new < old
                );
                let last_seen = now.max(current.first_seen_at);

                if superseded || current.content_hash == content_hash {
                    if !superseded {
                        current.popularity = incoming.popularity;
                    }
                    sqlx::query(
                        r#"
                        UPDATE resources SET last_seen_at = ?, stale = 0, downloads = ?, likes = ?
                        WHERE resource_type = ? AND id = ?
                        "#,
                    )
                    .bind(format_ts(last_seen))
                    .bind(current.popularity.downloads as i64)
                    .bind(current.popularity.likes as i64)
                    .bind(current.resource_type.as_str())
                    .bind(&current.id)
                    .execute(&mut *tx)
                    .await?;

                    if superseded {
                        debug!(key = %current.key(), "Ignoring observation older than stored record");
                    }
                    current.last_seen_at = last_seen;
                    current.stale = false;
                    (ChangeKind::Unchanged, current)
                } else {
                    let embedded_hash: Option<String> = sqlx::query_scalar(
                        "SELECT text_hash FROM embeddings WHERE resource_type = ? AND id = ?",
                    )
                    .bind(incoming.resource_type.as_str())
                    .bind(&incoming.id)
                    .fetch_optional(&mut *tx)
                    .await?;
                    let embedding_state = match embedded_hash {
                        Some(hash) if hash == text_hash => EmbeddingState::Current,
                        Some(_) => EmbeddingState::Stale,
                        None => EmbeddingState::Absent,
                    };

                    let mut record = incoming.clone();
                    record.content_hash = content_hash;
                    record.first_seen_at = current.first_seen_at;
                    record.last_seen_at = last_seen;
                    record.stale = false;
                    record.embedding_state = embedding_state;

                    sqlx::query(
                        r#"
                        UPDATE resources SET
                            author = ?, display_name = ?, description = ?, tags_json = ?,
                            downloads = ?, likes = ?, upstream_last_modified = ?,
                            last_seen_at = ?, content_hash = ?, text_hash = ?,
                            embedding_state = ?, stale = 0
                        WHERE resource_type = ? AND id = ?
                        "#,
                    )
                    .bind(&record.author)
                    .bind(&record.display_name)
                    .bind(&record.description)
                    .bind(serde_json::to_string(&record.tags)?)
                    .bind(record.popularity.downloads as i64)
                    .bind(record.popularity.likes as i64)
                    .bind(record.upstream_last_modified.map(format_ts))
                    .bind(format_ts(last_seen))
                    .bind(&record.content_hash)
                    .bind(&text_hash)
                    .bind(embedding_state.to_string())
                    .bind(record.resource_type.as_str())
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await?;

                    let rowid: i64 = sqlx::query_scalar(
                        "SELECT rowid FROM resources WHERE resource_type = ? AND id = ?",
                    )
                    .bind(record.resource_type.as_str())
                    .bind(&record.id)
                    .fetch_one(&mut *tx)
                    .await?;
                    sqlx::query("DELETE FROM resources_fts WHERE rowid = ?")
                        .bind(rowid)
                        .execute(&mut *tx)
                        .await?;
                    insert_fts(&mut tx, rowid, &record).await?;

                    (ChangeKind::Updated, record)
                }
            }
        };

        tx.commit().await?;
        publish(change, &stored);
        Ok((change, stored))
    }

    /// Get a resource by key
    pub async fn get_resource(&self, key: &ResourceKey) -> Result<Option<ResourceRecord>> {
        let row = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM resources WHERE resource_type = ? AND id = ?",
        )
        .bind(key.resource_type.as_str())
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ResourceRow::into_record).transpose()
    }

    /// Flag records as stale; they stay retrievable
    pub async fn mark_stale(&self, keys: &[ResourceKey]) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for key in keys {
            affected += sqlx::query(
                "UPDATE resources SET stale = 1 WHERE resource_type = ? AND id = ? AND stale = 0",
            )
            .bind(key.resource_type.as_str())
            .bind(&key.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    /// Flag every record of a type not seen since `cutoff`
    pub async fn mark_unseen_stale(
        &self,
        resource_type: ResourceType,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE resources SET stale = 1 WHERE resource_type = ? AND last_seen_at < ? AND stale = 0",
        )
        .bind(resource_type.as_str())
        .bind(format_ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// BM25 search over the FTS5 index; higher scores are better
    pub async fn lexical_search(
        &self,
        query: &str,
        resource_type: Option<ResourceType>,
        limit: usize,
    ) -> Result<Vec<(ResourceRecord, f64)>> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let filter = if resource_type.is_some() {
            "AND r.resource_type = ?"
        } else {
            ""
        };
        let sql = format!(
            r#"
            SELECT r.*, -bm25(resources_fts, {weights}) AS score
            FROM resources_fts
            JOIN resources r ON r.rowid = resources_fts.rowid
            WHERE resources_fts MATCH ? {filter}
            ORDER BY score DESC, r.downloads DESC, r.likes DESC, r.id ASC
            LIMIT ?
            "#,
            weights = BM25_WEIGHTS,
            filter = filter,
        );

        let mut query = sqlx::query_as::<_, ScoredRow>(&sql).bind(match_expr);
        if let Some(resource_type) = resource_type {
            query = query.bind(resource_type.as_str());
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| Ok((row.resource.into_record()?, row.score)))
            .collect()
    }

    /// List resources, ordered by key
    pub async fn list_resources(
        &self,
        resource_type: Option<ResourceType>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ResourceRecord>> {
        let rows = match resource_type {
            Some(resource_type) => {
                sqlx::query_as::<_, ResourceRow>(
                    "SELECT * FROM resources WHERE resource_type = ? ORDER BY id LIMIT ? OFFSET ?",
                )
                .bind(resource_type.as_str())
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ResourceRow>(
                    "SELECT * FROM resources ORDER BY resource_type, id LIMIT ? OFFSET ?",
                )
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(ResourceRow::into_record).collect()
    }

    /// Records by a given author (case-insensitive), most downloaded first
    pub async fn resources_by_author(
        &self,
        author: &str,
        limit: usize,
    ) -> Result<Vec<ResourceRecord>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT * FROM resources WHERE author = ? COLLATE NOCASE
            ORDER BY downloads DESC, likes DESC, id ASC LIMIT ?
            "#,
        )
        .bind(author)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResourceRow::into_record).collect()
    }

    /// Records carrying a given tag (case-insensitive), most downloaded first
    pub async fn resources_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<ResourceRecord>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT * FROM resources r
            WHERE EXISTS (SELECT 1 FROM json_each(r.tags_json) WHERE lower(json_each.value) = lower(?))
            ORDER BY downloads DESC, likes DESC, id ASC LIMIT ?
            "#,
        )
        .bind(tag)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResourceRow::into_record).collect()
    }

    // ===== Embedding Operations =====

    /// Persist an embedding computed from text with hash `text_hash`.
    ///
    /// Returns the record's resulting embedding state: `Stale` if the record's
    /// text changed while the embedding was being computed.
    pub async fn store_embedding(
        &self,
        key: &ResourceKey,
        vector: &[f32],
        model: &str,
        text_hash: &str,
    ) -> Result<EmbeddingState> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current_hash: Option<String> = sqlx::query_scalar(
            "SELECT text_hash FROM resources WHERE resource_type = ? AND id = ?",
        )
        .bind(key.resource_type.as_str())
        .bind(&key.id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current_hash) = current_hash else {
            return Err(Error::NotFound(key.to_string()));
        };

        sqlx::query(
            r#"
            INSERT INTO embeddings (resource_type, id, vector, dimension, model, text_hash, embedded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(resource_type, id) DO UPDATE SET
                vector = excluded.vector,
                dimension = excluded.dimension,
                model = excluded.model,
                text_hash = excluded.text_hash,
                embedded_at = excluded.embedded_at
            "#,
        )
        .bind(key.resource_type.as_str())
        .bind(&key.id)
        .bind(encode_vector(vector))
        .bind(vector.len() as i64)
        .bind(model)
        .bind(text_hash)
        .bind(format_ts(Utc::now()))
        .execute(&mut *tx)
        .await?;

        let state = if current_hash == text_hash {
            EmbeddingState::Current
        } else {
            EmbeddingState::Stale
        };
        sqlx::query("UPDATE resources SET embedding_state = ? WHERE resource_type = ? AND id = ?")
            .bind(state.to_string())
            .bind(key.resource_type.as_str())
            .bind(&key.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(state)
    }

    /// The current embedding of a record, if it has one
    pub async fn get_embedding(&self, key: &ResourceKey) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query_as::<_, EmbeddingRow>(
            r#"
            SELECT e.resource_type, e.id, e.vector, e.dimension FROM embeddings e
            JOIN resources r ON r.resource_type = e.resource_type AND r.id = e.id
            WHERE e.resource_type = ? AND e.id = ? AND r.embedding_state = 'current'
            "#,
        )
        .bind(key.resource_type.as_str())
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EmbeddingRow::into_entry).transpose()?.map(|(_, v)| v))
    }

    /// Records whose embedding is absent or stale, ordered by key, after `after`
    pub async fn list_pending_embeddings(
        &self,
        after: Option<&ResourceKey>,
        limit: usize,
    ) -> Result<Vec<ResourceRecord>> {
        let (after_type, after_id) = keyset(after);
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT * FROM resources
            WHERE embedding_state != 'current'
              AND (resource_type > ? OR (resource_type = ? AND id > ?))
            ORDER BY resource_type, id
            LIMIT ?
            "#,
        )
        .bind(&after_type)
        .bind(&after_type)
        .bind(&after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResourceRow::into_record).collect()
    }

    /// Current embeddings ordered by key, after `after`
    pub async fn list_current_embeddings(
        &self,
        after: Option<&ResourceKey>,
        limit: usize,
    ) -> Result<Vec<(ResourceKey, Vec<f32>)>> {
        let (after_type, after_id) = keyset(after);
        let rows = sqlx::query_as::<_, EmbeddingRow>(
            r#"
            SELECT e.resource_type, e.id, e.vector, e.dimension FROM embeddings e
            JOIN resources r ON r.resource_type = e.resource_type AND r.id = e.id
            WHERE r.embedding_state = 'current' AND e.text_hash = r.text_hash
              AND (e.resource_type > ? OR (e.resource_type = ? AND e.id > ?))
            ORDER BY e.resource_type, e.id
            LIMIT ?
            "#,
        )
        .bind(&after_type)
        .bind(&after_type)
        .bind(&after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EmbeddingRow::into_entry).collect()
    }

    // ===== Crawl Cycle Operations =====

    /// Record the start of a crawl cycle
    pub async fn insert_cycle(&self, cycle: &CrawlCycleRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_cycles (cycle_id, resource_type_scope, started_at, items_seen,
                items_new, items_updated, errors_count, terminal_status)
            VALUES (?, ?, ?, 0, 0, 0, 0, ?)
            "#,
        )
        .bind(&cycle.cycle_id)
        .bind(cycle.resource_type_scope.as_str())
        .bind(format_ts(cycle.started_at))
        .bind(cycle.terminal_status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write final counts; a finished cycle is never updated again
    pub async fn finish_cycle(&self, cycle: &CrawlCycleRecord) -> Result<()> {
        let finished_at = cycle.finished_at.unwrap_or_else(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE crawl_cycles SET
                finished_at = ?, items_seen = ?, items_new = ?, items_updated = ?,
                errors_count = ?, terminal_status = ?, error = ?
            WHERE cycle_id = ? AND finished_at IS NULL
            "#,
        )
        .bind(format_ts(finished_at))
        .bind(cycle.items_seen as i64)
        .bind(cycle.items_new as i64)
        .bind(cycle.items_updated as i64)
        .bind(cycle.errors_count as i64)
        .bind(cycle.terminal_status.to_string())
        .bind(&cycle.error)
        .bind(&cycle.cycle_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DataIntegrity(format!(
                "Crawl cycle {} is unknown or already finished",
                cycle.cycle_id
            )));
        }
        Ok(())
    }

    pub async fn get_cycle(&self, cycle_id: &str) -> Result<Option<CrawlCycleRecord>> {
        let row = sqlx::query_as::<_, CycleRow>("SELECT * FROM crawl_cycles WHERE cycle_id = ?")
            .bind(cycle_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CycleRow::into_record).transpose()
    }

    /// Most recently started cycle
    pub async fn latest_cycle(&self) -> Result<Option<CrawlCycleRecord>> {
        let row = sqlx::query_as::<_, CycleRow>(
            "SELECT * FROM crawl_cycles ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(CycleRow::into_record).transpose()
    }

    /// Latest finished cycle for each resource type
    pub async fn last_cycle_per_type(&self) -> Result<Vec<CrawlCycleRecord>> {
        let rows = sqlx::query_as::<_, CycleRow>(
            r#"
            SELECT c.* FROM crawl_cycles c
            WHERE c.finished_at IS NOT NULL AND c.started_at = (
                SELECT MAX(started_at) FROM crawl_cycles
                WHERE resource_type_scope = c.resource_type_scope AND finished_at IS NOT NULL
            )
            ORDER BY c.resource_type_scope
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CycleRow::into_record).collect()
    }

    pub async fn count_cycles(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crawl_cycles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Close cycles interrupted by a crash
    pub async fn fail_unfinished_cycles(&self, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_cycles SET finished_at = ?, terminal_status = 'failed', error = ?
            WHERE finished_at IS NULL
            "#,
        )
        .bind(format_ts(Utc::now()))
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ===== Task Operations =====

    pub async fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, kind, state, scheduled_at, started_at, ended_at, error,
                interval_secs, params_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_id)
        .bind(task.kind.to_string())
        .bind(task.state.to_string())
        .bind(format_ts(task.scheduled_at))
        .bind(task.started_at.map(format_ts))
        .bind(task.ended_at.map(format_ts))
        .bind(&task.error)
        .bind(task.interval_secs.map(|s| s as i64))
        .bind(serde_json::to_string(&task.params)?)
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_record).transpose()
    }

    /// Most recently scheduled tasks first
    pub async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks ORDER BY scheduled_at DESC, created_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    pub async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE state = ? ORDER BY scheduled_at",
        )
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    /// Queued tasks due at or before `now`, oldest first
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE state = 'queued' AND scheduled_at <= ? ORDER BY scheduled_at, created_at",
        )
        .bind(format_ts(now))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    /// Queued tasks of `kind` due at or before `now`, oldest first
    pub async fn due_tasks_of_kind(
        &self,
        kind: TaskKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks WHERE kind = ? AND state = 'queued' AND scheduled_at <= ?
            ORDER BY scheduled_at, created_at
            "#,
        )
        .bind(kind.to_string())
        .bind(format_ts(now))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    /// The queued run of a recurring task of `kind`, if any
    pub async fn queued_recurring_task(&self, kind: TaskKind) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks WHERE kind = ? AND state = 'queued' AND interval_secs IS NOT NULL
            ORDER BY scheduled_at LIMIT 1
            "#,
        )
        .bind(kind.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_record).transpose()
    }

    /// Move a task from `from` to `to`; returns false if it was not in `from`
    pub async fn transition_task(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<bool> {
        let sql = if to == TaskState::Running {
            "UPDATE tasks SET state = ?, started_at = ?, error = ? WHERE task_id = ? AND state = ?"
        } else {
            "UPDATE tasks SET state = ?, ended_at = ?, error = ? WHERE task_id = ? AND state = ?"
        };
        let result = sqlx::query(sql)
            .bind(to.to_string())
            .bind(format_ts(at))
            .bind(error)
            .bind(task_id)
            .bind(from.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Task counts keyed by state
    pub async fn task_state_counts(&self) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state ORDER BY state")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(state, count)| (state, count.max(0) as u64))
            .collect())
    }

    // ===== Index Bookkeeping =====

    pub async fn get_index_state(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM index_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_index_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ===== Statistics =====

    /// Record and embedding counts per resource type
    pub async fn type_stats(&self) -> Result<Vec<TypeStats>> {
        let rows: Vec<(String, i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT resource_type,
                COUNT(*),
                COALESCE(SUM(stale), 0),
                COALESCE(SUM(embedding_state = 'current'), 0),
                COALESCE(SUM(embedding_state = 'stale'), 0),
                COALESCE(SUM(embedding_state = 'absent'), 0)
            FROM resources
            GROUP BY resource_type
            ORDER BY resource_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(resource_type, total, stale, current, stale_emb, absent)| TypeStats {
                resource_type,
                total: total.max(0) as u64,
                stale: stale.max(0) as u64,
                embeddings_current: current.max(0) as u64,
                embeddings_stale: stale_emb.max(0) as u64,
                embeddings_absent: absent.max(0) as u64,
            })
            .collect())
    }
}

async fn insert_fts(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    rowid: i64,
    record: &ResourceRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO resources_fts (rowid, ident, display_name, author, description, tags)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(rowid)
    .bind(&record.id)
    .bind(&record.display_name)
    .bind(&record.author)
    .bind(&record.description)
    .bind(record.tags.iter().cloned().collect::<Vec<_>>().join(" "))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Turn free text into an FTS5 expression: every word quoted, OR-ed together.
///
/// Returns `None` when the query has no searchable words.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .unicode_words()
        .map(|w| format!("\"{}\"", w.replace('"', "")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn keyset(after: Option<&ResourceKey>) -> (String, String) {
    match after {
        Some(key) => (key.resource_type.as_str().to_string(), key.id.clone()),
        None => (String::new(), String::new()),
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(blob: &[u8], dimension: usize) -> Result<Vec<f32>> {
    if blob.len() != dimension * std::mem::size_of::<f32>() {
        return Err(Error::DataIntegrity(format!(
            "Embedding blob has {} bytes, expected {} for dimension {}",
            blob.len(),
            dimension * std::mem::size_of::<f32>(),
            dimension
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
