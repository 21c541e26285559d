//! Configuration management for hubwarden
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use crate::models::{ResourceType, WatchRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream registry access
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Crawl cycle configuration
    #[serde(default)]
    pub crawl: CrawlConfig,

    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Search configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Task scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Watchdog configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Watched authors and tags
    #[serde(default)]
    pub watch: WatchConfig,

    /// Alert delivery configuration
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Registry client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the registry REST API
    #[serde(default = "default_registry_base_url")]
    pub base_url: String,

    /// Environment variable name for the access token
    #[serde(default = "default_registry_token_env")]
    pub token_env: String,

    /// Items per page
    #[serde(default = "default_registry_page_size")]
    pub page_size: usize,

    /// Page fetches per second
    #[serde(default = "default_registry_requests_per_second")]
    pub requests_per_second: f64,

    /// Lowest rate the limiter backs off to
    #[serde(default = "default_registry_min_requests_per_second")]
    pub min_requests_per_second: f64,

    /// Request timeout in seconds
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// User agent string
    #[serde(default = "default_registry_user_agent")]
    pub user_agent: String,
}

/// Bounded exponential retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_factor")]
    pub factor: f64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

/// Crawl cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Resource types crawled by the recurring crawl job
    #[serde(default = "default_crawl_resource_types")]
    pub resource_types: Vec<ResourceType>,

    /// Maximum items per scheduled cycle; unset crawls to the end of the
    /// listing, which is required for unseen records to be marked stale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_limit: Option<usize>,

    /// Seconds between scheduled crawls (0 disables the recurring crawl)
    #[serde(default = "default_crawl_interval_secs")]
    pub interval_secs: u64,

    /// Consecutive abandoned pages that fail the cycle
    #[serde(default = "default_max_consecutive_page_failures")]
    pub max_consecutive_page_failures: u32,

    /// Upper bound on a crawl task's run time
    #[serde(default = "default_crawl_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Per-page retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend kind ("fastembed" or "http")
    #[serde(default = "default_embedding_backend")]
    pub backend: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (must match model)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// URL of the HTTP embedding backend
    #[serde(default = "default_embedding_backend_url")]
    pub backend_url: String,
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Backend kind ("memory" or "qdrant")
    #[serde(default = "default_index_backend")]
    pub backend: String,

    /// Qdrant connection URL
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    /// Qdrant collection name prefix; generations get a numeric suffix
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    /// Seconds between full rebuilds (0 disables the recurring reindex)
    #[serde(default = "default_index_rebuild_interval_secs")]
    pub rebuild_interval_secs: u64,

    /// Upper bound on a reindex task's run time
    #[serde(default = "default_index_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

/// Search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Weight of the lexical score in hybrid fusion (vector gets 1 - this)
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,

    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    #[serde(default = "default_search_max_limit")]
    pub max_limit: usize,

    #[serde(default = "default_search_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatch loop tick in milliseconds
    #[serde(default = "default_scheduler_tick_ms")]
    pub tick_ms: u64,
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisor_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Silence tolerated before a component is suspected
    #[serde(default = "default_heartbeat_grace_secs")]
    pub heartbeat_grace_secs: u64,

    /// Restarts allowed inside the sliding window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// Delay between consecutive restarts
    #[serde(default)]
    pub restart_backoff: RetryConfig,
}

/// Watch rules, read-only at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_watch_authors")]
    pub authors: Vec<String>,

    #[serde(default = "default_watch_tags")]
    pub tags: Vec<String>,
}

/// Alert delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Attempts per alert before it is dropped
    #[serde(default = "default_alert_delivery_attempts")]
    pub delivery_attempts: u32,

    /// Alerts retained for priority match queries
    #[serde(default = "default_alert_history_capacity")]
    pub history_capacity: usize,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for hubwarden data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            crawl: CrawlConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            scheduler: SchedulerConfig::default(),
            supervisor: SupervisorConfig::default(),
            watch: WatchConfig::default(),
            alerts: AlertConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_base_url(),
            token_env: default_registry_token_env(),
            page_size: default_registry_page_size(),
            requests_per_second: default_registry_requests_per_second(),
            min_requests_per_second: default_registry_min_requests_per_second(),
            timeout_secs: default_registry_timeout(),
            user_agent: default_registry_user_agent(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_delay_ms(),
            factor: default_retry_factor(),
            max_delay_ms: default_retry_max_delay_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            resource_types: default_crawl_resource_types(),
            item_limit: None,
            interval_secs: default_crawl_interval_secs(),
            max_consecutive_page_failures: default_max_consecutive_page_failures(),
            task_timeout_secs: default_crawl_task_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            backend_url: default_embedding_backend_url(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            qdrant_url: default_qdrant_url(),
            collection_name: default_collection_name(),
            rebuild_interval_secs: default_index_rebuild_interval_secs(),
            task_timeout_secs: default_index_task_timeout_secs(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            lexical_weight: default_lexical_weight(),
            default_limit: default_search_limit(),
            max_limit: default_search_max_limit(),
            candidate_multiplier: default_search_candidate_multiplier(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_scheduler_tick_ms(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_supervisor_check_interval_secs(),
            heartbeat_grace_secs: default_heartbeat_grace_secs(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
            restart_backoff: RetryConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            authors: default_watch_authors(),
            tags: default_watch_tags(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            delivery_attempts: default_alert_delivery_attempts(),
            history_capacity: default_alert_history_capacity(),
        }
    }
}

impl WatchConfig {
    /// Expand the configured authors and tags into watch rules
    pub fn rules(&self) -> Vec<WatchRule> {
        let authors = self.authors.iter().map(|a| WatchRule::author(a.as_str()));
        let tags = self.tags.iter().map(|t| WatchRule::tag(t.as_str()));
        authors.chain(tags).collect()
    }
}

impl RegistryConfig {
    /// Get the registry token from environment
    pub fn token(&self) -> Option<String> {
        if self.token_env.is_empty() {
            return None;
        }
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Get the default base directory for hubwarden (~/.hubwarden)
    pub fn default_base_dir() -> PathBuf {
        if let Ok(home) = std::env::var("HUBWARDEN_HOME") {
            return PathBuf::from(home);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hubwarden")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("metadata.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("metadata.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if hubwarden is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.registry.page_size == 0 {
            return Err(Error::Config(
                "registry.page_size must be positive".to_string(),
            ));
        }

        if self.registry.requests_per_second <= 0.0 || self.registry.min_requests_per_second <= 0.0
        {
            return Err(Error::Config(
                "registry.requests_per_second and min_requests_per_second must be positive"
                    .to_string(),
            ));
        }

        if self.registry.min_requests_per_second > self.registry.requests_per_second {
            return Err(Error::Config(
                "registry.min_requests_per_second must be <= requests_per_second".to_string(),
            ));
        }

        if self.crawl.resource_types.is_empty() {
            return Err(Error::Config(
                "crawl.resource_types must not be empty".to_string(),
            ));
        }

        if self.crawl.item_limit == Some(0) {
            return Err(Error::Config(
                "crawl.item_limit must be >= 1 when set".to_string(),
            ));
        }

        if self.crawl.max_consecutive_page_failures == 0 {
            return Err(Error::Config(
                "crawl.max_consecutive_page_failures must be >= 1".to_string(),
            ));
        }

        for (name, retry) in [
            ("crawl.retry", &self.crawl.retry),
            ("supervisor.restart_backoff", &self.supervisor.restart_backoff),
        ] {
            if retry.max_attempts == 0 {
                return Err(Error::Config(format!("{}.max_attempts must be >= 1", name)));
            }
            if retry.factor < 1.0 {
                return Err(Error::Config(format!("{}.factor must be >= 1.0", name)));
            }
            if retry.max_delay_ms < retry.base_delay_ms {
                return Err(Error::Config(format!(
                    "{}.max_delay_ms must be >= base_delay_ms",
                    name
                )));
            }
        }

        if self.embedding.dimension == 0 || self.embedding.batch_size == 0 {
            return Err(Error::Config(
                "embedding.dimension and embedding.batch_size must be positive".to_string(),
            ));
        }

        match self.index.backend.as_str() {
            "memory" | "qdrant" => {}
            other => {
                return Err(Error::Config(format!(
                    "Unsupported index backend '{}'; expected 'memory' or 'qdrant'",
                    other
                )))
            }
        }

        if !(0.0..=1.0).contains(&self.search.lexical_weight) {
            return Err(Error::Config(
                "search.lexical_weight must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.search.default_limit == 0 || self.search.default_limit > self.search.max_limit {
            return Err(Error::Config(
                "search.default_limit must be between 1 and search.max_limit".to_string(),
            ));
        }

        if self.scheduler.tick_ms == 0 {
            return Err(Error::Config("scheduler.tick_ms must be positive".to_string()));
        }

        if self.supervisor.max_restarts == 0 || self.supervisor.heartbeat_grace_secs == 0 {
            return Err(Error::Config(
                "supervisor.max_restarts and heartbeat_grace_secs must be positive".to_string(),
            ));
        }

        if self.alerts.delivery_attempts == 0 {
            return Err(Error::Config(
                "alerts.delivery_attempts must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.search.lexical_weight, 0.5);
        assert_eq!(config.crawl.retry.base_delay_ms, 1000);
        assert_eq!(config.crawl.retry.max_delay_ms, 60_000);
        assert_eq!(config.crawl.retry.max_attempts, 5);
        assert_eq!(config.crawl.item_limit, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.crawl.item_limit = Some(250);
        config.watch.authors = vec!["someone".to_string()];

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.crawl.item_limit, Some(250));
        assert_eq!(loaded.watch.authors, vec!["someone".to_string()]);
        assert_eq!(loaded.paths.db_file, tmp.path().join("metadata.db"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [crawl]
            resource_types = ["model", "paper"]

            [search]
            lexical_weight = 0.3
            "#,
        )
        .unwrap();
        assert_eq!(
            config.crawl.resource_types,
            vec![ResourceType::Model, ResourceType::Paper]
        );
        assert_eq!(config.search.lexical_weight, 0.3);
        assert_eq!(config.registry.page_size, 100);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.search.lexical_weight = 1.5;
        assert!(config.validate().is_err());
        config.search.lexical_weight = 0.5;
        assert!(config.validate().is_ok());

        config.crawl.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());
        config.crawl.retry.max_delay_ms = 60_000;

        config.crawl.item_limit = Some(0);
        assert!(config.validate().is_err());
        config.crawl.item_limit = None;

        config.index.backend = "faiss".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watch_rules_expansion() {
        let config = Config::default();
        let rules = config.watch.rules();
        assert_eq!(rules.len(), 5);
        assert!(rules.contains(&WatchRule::author("Nymbo")));
        assert!(rules.contains(&WatchRule::tag("gguf")));
    }
}
