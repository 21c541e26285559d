//! Upstream registry access
//!
//! The crawler only sees the [`RegistryClient`] trait: one page of records
//! per call, addressed by an opaque cursor. Per-item decoding failures are
//! returned inline so a bad record never sinks its page.

mod hub;
mod rate_limit;

pub use hub::HubClient;
pub use rate_limit::AdaptiveRateLimiter;

use crate::error::Result;
use crate::models::{ResourceRecord, ResourceType};
use async_trait::async_trait;

/// One page of listing results
#[derive(Debug)]
pub struct RegistryPage {
    /// Decoded records in upstream order; malformed items are `Err(DataIntegrity)`
    pub items: Vec<Result<ResourceRecord>>,
    /// Cursor for the following page, `None` when the listing is exhausted
    pub next_cursor: Option<String>,
}

impl RegistryPage {
    pub fn last(items: Vec<Result<ResourceRecord>>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Paginated, typed listing of upstream resources
///
/// Errors are classified as `TransientIo`, `RateLimited`, `Unauthorized`
/// or `Fatal`; the crawler decides what to retry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn list_page(
        &self,
        resource_type: ResourceType,
        cursor: Option<&str>,
    ) -> Result<RegistryPage>;
}
