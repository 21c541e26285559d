//! Domain types shared by the store, crawler, scheduler and evaluator.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Kind of upstream artifact; ids are unique within one type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Model,
    Dataset,
    Space,
    Paper,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Model,
        ResourceType::Dataset,
        ResourceType::Space,
        ResourceType::Paper,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Model => "model",
            ResourceType::Dataset => "dataset",
            ResourceType::Space => "space",
            ResourceType::Paper => "paper",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "model" | "models" => Ok(ResourceType::Model),
            "dataset" | "datasets" => Ok(ResourceType::Dataset),
            "space" | "spaces" => Ok(ResourceType::Space),
            "paper" | "papers" => Ok(ResourceType::Paper),
            _ => Err(Error::Config(format!("Unknown resource type: {}", s))),
        }
    }
}

/// Composite key `(resource_type, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.id)
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::DataIntegrity(format!("Malformed resource key: {}", s)))?;
        Ok(Self::new(kind.parse()?, id))
    }
}

/// Popularity counters; ordering compares downloads first, then likes
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Popularity {
    pub downloads: u64,
    pub likes: u64,
}

/// Freshness of a record's embedding relative to its current text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingState {
    Absent,
    Current,
    Stale,
}

impl fmt::Display for EmbeddingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingState::Absent => write!(f, "absent"),
            EmbeddingState::Current => write!(f, "current"),
            EmbeddingState::Stale => write!(f, "stale"),
        }
    }
}

impl FromStr for EmbeddingState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "absent" => Ok(EmbeddingState::Absent),
            "current" => Ok(EmbeddingState::Current),
            "stale" => Ok(EmbeddingState::Stale),
            _ => Err(Error::DataIntegrity(format!("Unknown embedding state: {}", s))),
        }
    }
}

/// One upstream artifact as known to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub resource_type: ResourceType,
    pub author: String,
    pub display_name: String,
    pub description: String,
    pub tags: BTreeSet<String>,
    pub popularity: Popularity,
    pub upstream_last_modified: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub content_hash: String,
    /// Absent from the latest full crawl of its type
    pub stale: bool,
    pub embedding_state: EmbeddingState,
}

impl ResourceRecord {
    /// A freshly observed record; timestamps are set to now and the hash is computed.
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        let id = id.into();
        let now = Utc::now();
        let display_name = id.rsplit('/').next().unwrap_or(&id).to_string();
        let author = id
            .split_once('/')
            .map(|(author, _)| author.to_string())
            .unwrap_or_default();
        let mut record = Self {
            id,
            resource_type,
            author,
            display_name,
            description: String::new(),
            tags: BTreeSet::new(),
            popularity: Popularity::default(),
            upstream_last_modified: None,
            first_seen_at: now,
            last_seen_at: now,
            content_hash: String::new(),
            stale: false,
            embedding_state: EmbeddingState::Absent,
        };
        record.refresh_hash();
        record
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type, self.id.clone())
    }

    /// Recompute `content_hash` after mutating fields
    pub fn refresh_hash(&mut self) {
        self.content_hash = self.compute_content_hash();
    }

    /// Digest of the fields that participate in change detection.
    ///
    /// Popularity counters are excluded; they move on every crawl.
    pub fn compute_content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for field in [
            self.author.as_str(),
            self.display_name.as_str(),
            self.description.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(&[0]);
        }
        for tag in &self.tags {
            hasher.update(tag.as_bytes());
            hasher.update(&[0x1f]);
        }
        hasher.update(&[0]);
        if let Some(modified) = self.upstream_last_modified {
            hasher.update(format_ts(modified).as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Text handed to the embedding generator
    pub fn embedding_text(&self) -> String {
        let mut text = self.display_name.clone();
        if !self.description.trim().is_empty() {
            text.push_str(". ");
            text.push_str(self.description.trim());
        }
        if !self.tags.is_empty() {
            text.push_str(". Tags: ");
            text.push_str(&self.tags.iter().cloned().collect::<Vec<_>>().join(", "));
        }
        text
    }

    /// Hash of [`embedding_text`](Self::embedding_text), used to detect stale embeddings
    pub fn text_hash(&self) -> String {
        blake3::hash(self.embedding_text().as_bytes()).to_hex().to_string()
    }
}

/// Outcome of an upsert, and the change carried by an ingestion event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Unchanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Inserted => write!(f, "inserted"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Emitted for every inserted or updated record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionEvent {
    pub record: ResourceRecord,
    pub change: ChangeKind,
    pub cycle_id: Option<String>,
}

/// Terminal state of a crawl cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleStatus::Running => write!(f, "running"),
            CycleStatus::Success => write!(f, "success"),
            CycleStatus::Partial => write!(f, "partial"),
            CycleStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for CycleStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(CycleStatus::Running),
            "success" => Ok(CycleStatus::Success),
            "partial" => Ok(CycleStatus::Partial),
            "failed" => Ok(CycleStatus::Failed),
            _ => Err(Error::DataIntegrity(format!("Unknown cycle status: {}", s))),
        }
    }
}

/// One orchestrator run over a single resource type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlCycleRecord {
    pub cycle_id: String,
    pub resource_type_scope: ResourceType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items_seen: u64,
    pub items_new: u64,
    pub items_updated: u64,
    pub errors_count: u64,
    pub terminal_status: CycleStatus,
    pub error: Option<String>,
}

impl CrawlCycleRecord {
    pub fn start(scope: ResourceType) -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            resource_type_scope: scope,
            started_at: Utc::now(),
            finished_at: None,
            items_seen: 0,
            items_new: 0,
            items_updated: 0,
            errors_count: 0,
            terminal_status: CycleStatus::Running,
            error: None,
        }
    }
}

/// Job kinds; each kind runs in its own lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Crawl,
    Reindex,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Crawl => write!(f, "crawl"),
            TaskKind::Reindex => write!(f, "reindex"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "crawl" => Ok(TaskKind::Crawl),
            "reindex" => Ok(TaskKind::Reindex),
            _ => Err(Error::DataIntegrity(format!("Unknown task kind: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            _ => Err(Error::DataIntegrity(format!("Unknown task state: {}", s))),
        }
    }
}

/// Arguments carried by a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Restrict a crawl to one type; `None` crawls every configured type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_limit: Option<usize>,
}

impl TaskParams {
    /// Whether a run with these params does all the work a run with `other` would
    pub fn covers(&self, other: &TaskParams) -> bool {
        let scope = match (self.resource_type, other.resource_type) {
            (None, _) => true,
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => false,
        };
        let limit = match (self.item_limit, other.item_limit) {
            (None, _) => true,
            (Some(a), Some(b)) => a >= b,
            (Some(_), None) => false,
        };
        scope && limit
    }
}

/// One scheduled or ad-hoc job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Set for recurring jobs; a successor is queued after each run
    pub interval_secs: Option<u64>,
    pub params: TaskParams,
}

/// Ten years; longer intervals are clamped
const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 3600;

impl TaskRecord {
    /// A new queued task
    pub fn queued(
        kind: TaskKind,
        scheduled_at: DateTime<Utc>,
        interval_secs: Option<u64>,
        params: TaskParams,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            kind,
            state: TaskState::Queued,
            scheduled_at,
            started_at: None,
            ended_at: None,
            error: None,
            interval_secs,
            params,
        }
    }

    /// The next run of a recurring task
    pub fn successor(&self, now: DateTime<Utc>) -> Option<Self> {
        let interval = self.interval_secs?;
        let next = now + chrono::Duration::seconds(interval.min(MAX_INTERVAL_SECS) as i64);
        Some(Self::queued(self.kind, next, self.interval_secs, self.params.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Author,
    Tag,
}

/// A watched author or tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchRule {
    pub kind: WatchKind,
    pub value: String,
}

impl WatchRule {
    pub fn author(value: impl Into<String>) -> Self {
        Self {
            kind: WatchKind::Author,
            value: value.into(),
        }
    }

    pub fn tag(value: impl Into<String>) -> Self {
        Self {
            kind: WatchKind::Tag,
            value: value.into(),
        }
    }

    /// Case-insensitive author equality or tag membership
    pub fn matches(&self, record: &ResourceRecord) -> bool {
        let wanted = self.value.trim();
        if wanted.is_empty() {
            return false;
        }
        match self.kind {
            WatchKind::Author => record.author.to_lowercase() == wanted.to_lowercase(),
            WatchKind::Tag => {
                let wanted = wanted.to_lowercase();
                record.tags.iter().any(|t| t.to_lowercase() == wanted)
            }
        }
    }
}

impl fmt::Display for WatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WatchKind::Author => write!(f, "author:{}", self.value),
            WatchKind::Tag => write!(f, "tag:{}", self.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Why an alert fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchedRule {
    Watch { rule: WatchRule },
    RestartBudgetExhausted { component: String },
    ComponentRecovered { component: String },
}

/// Ephemeral notification handed to the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Resource id, or the component name for supervisor alerts
    pub resource_id: String,
    pub resource_type: Option<ResourceType>,
    pub matched_rule: MatchedRule,
    pub severity: Severity,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn watch_match(record: &ResourceRecord, rule: &WatchRule, change: ChangeKind) -> Self {
        Self {
            resource_id: record.id.clone(),
            resource_type: Some(record.resource_type),
            matched_rule: MatchedRule::Watch { rule: rule.clone() },
            severity: Severity::Info,
            message: format!(
                "{} {} {} matched {}",
                change, record.resource_type, record.id, rule
            ),
            emitted_at: Utc::now(),
        }
    }

    pub fn restart_budget_exhausted(component: &str, restarts: u32) -> Self {
        Self {
            resource_id: component.to_string(),
            resource_type: None,
            matched_rule: MatchedRule::RestartBudgetExhausted {
                component: component.to_string(),
            },
            severity: Severity::Critical,
            message: format!(
                "{} failed {} restarts within the window; automatic restarts stopped",
                component, restarts
            ),
            emitted_at: Utc::now(),
        }
    }

    pub fn component_recovered(component: &str) -> Self {
        Self {
            resource_id: component.to_string(),
            resource_type: None,
            matched_rule: MatchedRule::ComponentRecovered {
                component: component.to_string(),
            },
            severity: Severity::Info,
            message: format!("{} is healthy again after restart", component),
            emitted_at: Utc::now(),
        }
    }
}

/// Fixed-width RFC 3339 timestamp so stored values sort lexicographically
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::DataIntegrity(format!("Invalid timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResourceRecord {
        let mut record = ResourceRecord::new(ResourceType::Model, "Nymbo/tiny-llm");
        record.description = "A tiny model".to_string();
        record.tags = ["gguf".to_string(), "llm".to_string()].into_iter().collect();
        record.refresh_hash();
        record
    }

    #[test]
    fn test_new_record_derives_author_and_name() {
        let record = ResourceRecord::new(ResourceType::Model, "Nymbo/tiny-llm");
        assert_eq!(record.author, "Nymbo");
        assert_eq!(record.display_name, "tiny-llm");
        assert!(record.last_seen_at >= record.first_seen_at);
        assert_eq!(record.embedding_state, EmbeddingState::Absent);
    }

    #[test]
    fn test_content_hash_tracks_description_not_popularity() {
        let record = sample();
        let original = record.compute_content_hash();

        let mut popular = record.clone();
        popular.popularity.downloads = 1_000_000;
        assert_eq!(popular.compute_content_hash(), original);

        let mut edited = record;
        edited.description = "A slightly larger model".to_string();
        assert_ne!(edited.compute_content_hash(), original);
    }

    #[test]
    fn test_content_hash_ignores_tag_order() {
        let a = sample();
        let mut b = ResourceRecord::new(ResourceType::Model, "Nymbo/tiny-llm");
        b.description = "A tiny model".to_string();
        b.tags.insert("llm".to_string());
        b.tags.insert("gguf".to_string());
        b.refresh_hash();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_watch_rule_matching_is_case_insensitive() {
        let record = sample();
        assert!(WatchRule::author("nymbo").matches(&record));
        assert!(WatchRule::tag("GGUF").matches(&record));
        assert!(!WatchRule::tag("quantized").matches(&record));
        assert!(!WatchRule::author("other").matches(&record));
        assert!(!WatchRule::author("  ").matches(&record));
    }

    #[test]
    fn test_task_params_cover_narrower_scope() {
        let everything = TaskParams::default();
        let models = TaskParams {
            resource_type: Some(ResourceType::Model),
            item_limit: None,
        };
        let datasets = TaskParams {
            resource_type: Some(ResourceType::Dataset),
            item_limit: None,
        };
        let few_models = TaskParams {
            resource_type: Some(ResourceType::Model),
            item_limit: Some(10),
        };

        assert!(everything.covers(&models));
        assert!(models.covers(&few_models));
        assert!(!models.covers(&datasets));
        assert!(!models.covers(&everything));
        assert!(!few_models.covers(&models));
    }

    #[test]
    fn test_resource_key_roundtrip() {
        let key = ResourceKey::new(ResourceType::Dataset, "org/data:v2");
        let parsed: ResourceKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = parse_ts("2024-01-01T00:00:00Z").unwrap();
        let late = parse_ts("2024-01-01T00:00:00.5Z").unwrap();
        assert!(format_ts(early) < format_ts(late));
    }
}
