//! Default values for configuration

use crate::models::ResourceType;

/// Default registry base URL
pub fn default_registry_base_url() -> String {
    std::env::var("HUBWARDEN_REGISTRY_URL").unwrap_or_else(|_| "https://huggingface.co".to_string())
}

/// Environment variable holding the registry access token
pub fn default_registry_token_env() -> String {
    "HF_TOKEN".to_string()
}

/// Items requested per registry page
pub fn default_registry_page_size() -> usize {
    100
}

/// Registry requests per second
pub fn default_registry_requests_per_second() -> f64 {
    2.0
}

/// Floor for the adaptive rate limit after repeated 429s
pub fn default_registry_min_requests_per_second() -> f64 {
    0.1
}

/// Registry request timeout in seconds
pub fn default_registry_timeout() -> u64 {
    30
}

/// Default user agent
pub fn default_registry_user_agent() -> String {
    format!("hubwarden/{}", env!("CARGO_PKG_VERSION"))
}

/// Resource types crawled when no scope is given
pub fn default_crawl_resource_types() -> Vec<ResourceType> {
    vec![ResourceType::Model, ResourceType::Dataset, ResourceType::Space]
}

/// Interval between scheduled crawls (1 hour)
pub fn default_crawl_interval_secs() -> u64 {
    3600
}

/// Consecutive abandoned pages before a cycle is failed
pub fn default_max_consecutive_page_failures() -> u32 {
    5
}

/// Upper bound on a single crawl task (6 hours)
pub fn default_crawl_task_timeout_secs() -> u64 {
    6 * 3600
}

/// Initial retry delay in milliseconds
pub fn default_retry_base_delay_ms() -> u64 {
    1000
}

/// Retry delay growth factor
pub fn default_retry_factor() -> f64 {
    2.0
}

/// Retry delay cap in milliseconds
pub fn default_retry_max_delay_ms() -> u64 {
    60_000
}

/// Attempts per page before it is abandoned
pub fn default_retry_max_attempts() -> u32 {
    5
}

/// Default embedding backend kind
pub fn default_embedding_backend() -> String {
    if cfg!(feature = "local-embed") {
        "fastembed".to_string()
    } else {
        "http".to_string()
    }
}

/// Default embedding model (all-MiniLM-L6-v2)
pub fn default_embedding_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

/// Default embedding dimension
pub fn default_embedding_dimension() -> usize {
    384
}

/// Default batch size for embedding
pub fn default_embedding_batch_size() -> usize {
    32
}

/// Default embedding backend URL
pub fn default_embedding_backend_url() -> String {
    std::env::var("HUBWARDEN_EMBEDDING_BACKEND_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:7997".to_string())
}

/// Default vector index backend
pub fn default_index_backend() -> String {
    "memory".to_string()
}

/// Default Qdrant gRPC URL for local development (port 6334, not 6333 REST)
pub fn default_qdrant_url() -> String {
    std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6334".to_string())
}

/// Default collection name prefix
pub fn default_collection_name() -> String {
    "hubwarden_resources".to_string()
}

/// Interval between full index rebuilds (6 hours)
pub fn default_index_rebuild_interval_secs() -> u64 {
    6 * 3600
}

/// Upper bound on a single reindex task (2 hours)
pub fn default_index_task_timeout_secs() -> u64 {
    2 * 3600
}

/// Weight of the lexical score in hybrid fusion
pub fn default_lexical_weight() -> f32 {
    0.5
}

/// Default number of results
pub fn default_search_limit() -> usize {
    10
}

/// Maximum results returned by a single search
pub fn default_search_max_limit() -> usize {
    100
}

/// Candidates fetched per result from each index before fusion
pub fn default_search_candidate_multiplier() -> usize {
    4
}

/// Scheduler dispatch tick in milliseconds
pub fn default_scheduler_tick_ms() -> u64 {
    1000
}

/// Supervisor check interval in seconds
pub fn default_supervisor_check_interval_secs() -> u64 {
    60
}

/// Time without a heartbeat before a component is suspected
pub fn default_heartbeat_grace_secs() -> u64 {
    180
}

/// Restarts allowed within the restart window
pub fn default_max_restarts() -> u32 {
    3
}

/// Sliding restart window (1 hour)
pub fn default_restart_window_secs() -> u64 {
    3600
}

/// Authors watched by default
pub fn default_watch_authors() -> Vec<String> {
    vec!["DavidAU".to_string(), "Nymbo".to_string()]
}

/// Tags watched by default
pub fn default_watch_tags() -> Vec<String> {
    vec!["llm".to_string(), "gguf".to_string(), "quantized".to_string()]
}

/// Delivery attempts per alert
pub fn default_alert_delivery_attempts() -> u32 {
    2
}

/// Alerts kept in memory for priority match queries
pub fn default_alert_history_capacity() -> usize {
    10_000
}
