//! Crawl Orchestrator
//!
//! Drives one paginated pass over the registry for a single resource type:
//! - Cooperative rate limiting between page fetches
//! - Bounded exponential retry per page
//! - Upserts into the knowledge store, embedding changed records
//! - Ingestion events for every inserted or updated record

mod backoff;

pub use backoff::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::knowledge::KnowledgeStore;
use crate::models::{
    ChangeKind, CrawlCycleRecord, CycleStatus, IngestionEvent, ResourceRecord, ResourceType,
};
use crate::registry::{AdaptiveRateLimiter, RegistryClient, RegistryPage};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of fetching one page with retries
enum PageFetch {
    Page(RegistryPage),
    /// Retries used up on retryable errors
    Abandoned(Error),
    /// Unauthorized or otherwise non-retryable
    Terminal(Error),
    Cancelled,
}

/// Why the page loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exhausted,
    ItemLimit,
    Cancelled,
    Failed,
}

/// Runs crawl cycles against a registry
pub struct CrawlOrchestrator {
    registry: Arc<dyn RegistryClient>,
    store: Arc<KnowledgeStore>,
    limiter: Arc<AdaptiveRateLimiter>,
    backoff: BackoffPolicy,
    max_consecutive_page_failures: u32,
    events: mpsc::UnboundedSender<IngestionEvent>,
}

impl CrawlOrchestrator {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        store: Arc<KnowledgeStore>,
        config: &Config,
        events: mpsc::UnboundedSender<IngestionEvent>,
    ) -> Self {
        Self {
            registry,
            store,
            limiter: Arc::new(AdaptiveRateLimiter::new(
                config.registry.requests_per_second,
                config.registry.min_requests_per_second,
            )),
            backoff: BackoffPolicy::from(&config.crawl.retry),
            max_consecutive_page_failures: config.crawl.max_consecutive_page_failures.max(1),
            events,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    /// Run one cycle over `scope`, stopping after `item_limit` items if given.
    ///
    /// Page and item failures are absorbed into the returned record; `Err` means
    /// the cycle log itself could not be written.
    pub async fn run_cycle(
        &self,
        scope: ResourceType,
        item_limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<CrawlCycleRecord> {
        let mut cycle = CrawlCycleRecord::start(scope);
        self.store.db().insert_cycle(&cycle).await?;
        info!(cycle_id = %cycle.cycle_id, resource_type = %scope, "Crawl cycle started");

        let stop = self.crawl_pages(&mut cycle, item_limit, cancel).await;

        if stop == Stop::Exhausted {
            match self.store.mark_unseen_stale(scope, cycle.started_at).await {
                Ok(0) => {}
                Ok(n) => info!(cycle_id = %cycle.cycle_id, stale = n, "Marked unseen records stale"),
                Err(e) => {
                    warn!(cycle_id = %cycle.cycle_id, error = %e, "Failed to mark unseen records stale");
                    cycle.errors_count += 1;
                }
            }
        }

        cycle.terminal_status = match stop {
            Stop::Failed => CycleStatus::Failed,
            Stop::Cancelled => CycleStatus::Partial,
            _ if cycle.errors_count > 0 => CycleStatus::Partial,
            _ => CycleStatus::Success,
        };
        if stop == Stop::Cancelled && cycle.error.is_none() {
            cycle.error = Some("cancelled".to_string());
        }
        cycle.finished_at = Some(Utc::now());
        self.store.db().finish_cycle(&cycle).await?;

        info!(
            cycle_id = %cycle.cycle_id,
            resource_type = %scope,
            status = %cycle.terminal_status,
            seen = cycle.items_seen,
            new = cycle.items_new,
            updated = cycle.items_updated,
            errors = cycle.errors_count,
            "Crawl cycle finished"
        );
        Ok(cycle)
    }

    async fn crawl_pages(
        &self,
        cycle: &mut CrawlCycleRecord,
        item_limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Stop {
        let scope = cycle.resource_type_scope;
        let mut cursor: Option<String> = None;
        let mut consecutive_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Stop::Cancelled;
            }

            let page = match self.fetch_page(scope, cursor.as_deref(), cancel).await {
                PageFetch::Page(page) => page,
                PageFetch::Cancelled => return Stop::Cancelled,
                PageFetch::Terminal(e) => {
                    warn!(cycle_id = %cycle.cycle_id, error = %e, "Crawl cycle terminated");
                    cycle.errors_count += 1;
                    cycle.error = Some(e.to_string());
                    return Stop::Failed;
                }
                PageFetch::Abandoned(e) => {
                    cycle.errors_count += 1;
                    consecutive_failures += 1;
                    warn!(
                        cycle_id = %cycle.cycle_id,
                        consecutive_failures,
                        error = %e,
                        "Page abandoned after retries"
                    );
                    if consecutive_failures >= self.max_consecutive_page_failures {
                        cycle.error = Some(format!(
                            "{} consecutive pages failed, last error: {}",
                            consecutive_failures, e
                        ));
                        return Stop::Failed;
                    }
                    // No cursor past a failed page, so the same page is tried again
                    continue;
                }
            };
            consecutive_failures = 0;

            let RegistryPage { items, next_cursor } = page;
            match self.ingest_page(cycle, items, item_limit, cancel).await {
                Ok(None) => {}
                Ok(Some(stop)) => return stop,
                Err(e) => {
                    warn!(cycle_id = %cycle.cycle_id, error = %e, "Knowledge store write failed");
                    cycle.errors_count += 1;
                    cycle.error = Some(e.to_string());
                    return Stop::Failed;
                }
            }

            match next_cursor {
                Some(next) => cursor = Some(next),
                None => return Stop::Exhausted,
            }
        }
    }

    /// Upsert one page; `Some(stop)` ends the cycle early
    async fn ingest_page(
        &self,
        cycle: &mut CrawlCycleRecord,
        items: Vec<Result<ResourceRecord>>,
        item_limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Option<Stop>> {
        let mut changed = Vec::new();
        let mut stop = None;

        for item in items {
            if cancel.is_cancelled() {
                stop = Some(Stop::Cancelled);
                break;
            }
            if item_limit.is_some_and(|limit| cycle.items_seen as usize >= limit) {
                stop = Some(Stop::ItemLimit);
                break;
            }

            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    warn!(cycle_id = %cycle.cycle_id, error = %e, "Skipping malformed item");
                    cycle.errors_count += 1;
                    continue;
                }
            };

            let events = self.events.clone();
            let cycle_id = cycle.cycle_id.clone();
            let (change, stored) = self
                .store
                .upsert_with(&record, move |change, stored| {
                    if change == ChangeKind::Unchanged {
                        return;
                    }
                    let event = IngestionEvent {
                        record: stored.clone(),
                        change,
                        cycle_id: Some(cycle_id),
                    };
                    if events.send(event).is_err() {
                        debug!("No ingestion event consumer attached");
                    }
                })
                .await?;

            cycle.items_seen += 1;
            match change {
                ChangeKind::Inserted => cycle.items_new += 1,
                ChangeKind::Updated => cycle.items_updated += 1,
                ChangeKind::Unchanged => {}
            }
            if change != ChangeKind::Unchanged {
                changed.push(stored);
            }
        }

        self.embed_changed(cycle, &changed).await;
        Ok(stop)
    }

    /// Embedding failures leave records absent or stale; ingestion carries on
    async fn embed_changed(&self, cycle: &CrawlCycleRecord, changed: &[ResourceRecord]) {
        if changed.is_empty() || !self.store.has_embedder() {
            return;
        }
        match self.store.embed_records(changed).await {
            Ok(n) => debug!(cycle_id = %cycle.cycle_id, embedded = n, "Embedded changed records"),
            Err(Error::EmbeddingUnavailable(reason)) => warn!(
                cycle_id = %cycle.cycle_id,
                records = changed.len(),
                %reason,
                "Embedding unavailable, records stay lexical-only"
            ),
            Err(e) => warn!(cycle_id = %cycle.cycle_id, error = %e, "Embedding changed records failed"),
        }
    }

    async fn fetch_page(
        &self,
        scope: ResourceType,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> PageFetch {
        let mut attempts = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return PageFetch::Cancelled,
                _ = self.limiter.wait() => {}
            }

            let err = match self.registry.list_page(scope, cursor).await {
                Ok(page) => {
                    self.limiter.record_success().await;
                    return PageFetch::Page(page);
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return PageFetch::Terminal(e),
            };

            let delay = match &err {
                Error::RateLimited { retry_after } => {
                    self.limiter.slow_down().await;
                    self.backoff.rate_limited_delay(attempts, *retry_after)
                }
                _ => self.backoff.delay(attempts),
            };
            attempts += 1;
            if !self.backoff.allows(attempts) {
                return PageFetch::Abandoned(err);
            }

            warn!(
                resource_type = %scope,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Page fetch failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return PageFetch::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted responses; once drained, every call returns an empty last page
    pub struct ScriptedRegistry {
        script: Mutex<VecDeque<Result<RegistryPage>>>,
        pub cursors: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedRegistry {
        pub fn new(script: Vec<Result<RegistryPage>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RegistryClient for ScriptedRegistry {
        async fn list_page(
            &self,
            _resource_type: ResourceType,
            cursor: Option<&str>,
        ) -> Result<RegistryPage> {
            self.cursors
                .lock()
                .unwrap()
                .push(cursor.map(str::to_string));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RegistryPage::last(Vec::new())))
        }
    }

    pub fn page(records: Vec<ResourceRecord>, next: Option<&str>) -> Result<RegistryPage> {
        Ok(RegistryPage {
            items: records.into_iter().map(Ok).collect(),
            next_cursor: next.map(str::to_string),
        })
    }

    pub fn fast_config() -> Config {
        let mut config = Config::default();
        config.registry.requests_per_second = 1000.0;
        config.crawl.retry.base_delay_ms = 1;
        config.crawl.retry.max_delay_ms = 4;
        config.crawl.retry.max_attempts = 3;
        config.crawl.max_consecutive_page_failures = 2;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::knowledge::testing::{record, store_with};
    use crate::models::ResourceKey;

    fn orchestrator(
        registry: Arc<ScriptedRegistry>,
        store: Arc<KnowledgeStore>,
    ) -> (CrawlOrchestrator, mpsc::UnboundedReceiver<IngestionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CrawlOrchestrator::new(registry, store, &fast_config(), tx),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<IngestionEvent>) -> Vec<IngestionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_rerun_over_same_state_is_unchanged() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        let pages = || {
            vec![
                page(vec![record("org/a", "one"), record("org/b", "two")], Some("p2")),
                page(vec![record("org/c", "three")], None),
            ]
        };

        let (first, mut rx) = orchestrator(Arc::new(ScriptedRegistry::new(pages())), store.clone());
        let cycle = first
            .run_cycle(ResourceType::Model, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cycle.terminal_status, CycleStatus::Success);
        assert_eq!(cycle.items_new, 3);
        assert_eq!(drain(&mut rx).len(), 3);

        let (second, mut rx) =
            orchestrator(Arc::new(ScriptedRegistry::new(pages())), store.clone());
        let cycle = second
            .run_cycle(ResourceType::Model, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cycle.items_seen, 3);
        assert_eq!(cycle.items_new + cycle.items_updated, 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.db().count_cycles().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_full_pass_marks_missing_records_stale() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        let registry = Arc::new(ScriptedRegistry::new(vec![page(
            vec![record("org/a", "one"), record("org/gone", "two")],
            None,
        )]));
        let (orch, _rx) = orchestrator(registry, store.clone());
        orch.run_cycle(ResourceType::Model, None, &CancellationToken::new())
            .await
            .unwrap();

        let registry = Arc::new(ScriptedRegistry::new(vec![page(
            vec![record("org/a", "one")],
            None,
        )]));
        let (orch, _rx) = orchestrator(registry, store.clone());
        orch.run_cycle(ResourceType::Model, None, &CancellationToken::new())
            .await
            .unwrap();

        let gone = store.get("org/gone", ResourceType::Model).await.unwrap();
        assert!(gone.stale);
        assert!(!store.get("org/a", ResourceType::Model).await.unwrap().stale);
    }

    #[tokio::test]
    async fn test_item_limit_does_not_mark_stale() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        store.upsert(&record("org/old", "x")).await.unwrap();
        let registry = Arc::new(ScriptedRegistry::new(vec![page(
            vec![record("org/a", "1"), record("org/b", "2"), record("org/c", "3")],
            Some("more"),
        )]));
        let (orch, _rx) = orchestrator(registry, store.clone());
        let cycle = orch
            .run_cycle(ResourceType::Model, Some(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cycle.items_seen, 2);
        assert_eq!(cycle.terminal_status, CycleStatus::Success);
        assert!(!store.get("org/old", ResourceType::Model).await.unwrap().stale);
    }

    #[tokio::test]
    async fn test_transient_page_failure_is_retried_then_counted() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        let registry = Arc::new(ScriptedRegistry::new(vec![
            Err(Error::TransientIo("timeout".into())),
            Err(Error::RateLimited { retry_after: None }),
            Err(Error::TransientIo("502".into())),
            page(vec![record("org/a", "1")], None),
        ]));
        let (orch, _rx) = orchestrator(registry.clone(), store);
        let cycle = orch
            .run_cycle(ResourceType::Model, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cycle.errors_count, 1);
        assert_eq!(cycle.items_new, 1);
        assert_eq!(cycle.terminal_status, CycleStatus::Partial);
        let cursors = registry.cursors.lock().unwrap().clone();
        assert_eq!(cursors, vec![None, None, None, None]);
        assert!(orch.rate_limiter().current_rate().await < 1000.0);
    }

    #[tokio::test]
    async fn test_consecutive_abandoned_pages_fail_cycle() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        let registry = Arc::new(ScriptedRegistry::new(
            (0..6).map(|_| Err(Error::TransientIo("down".into()))).collect(),
        ));
        let (orch, _rx) = orchestrator(registry, store.clone());
        let cycle = orch
            .run_cycle(ResourceType::Dataset, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cycle.terminal_status, CycleStatus::Failed);
        assert_eq!(cycle.errors_count, 2);
        let stored = store.db().get_cycle(&cycle.cycle_id).await.unwrap().unwrap();
        assert_eq!(stored.terminal_status, CycleStatus::Failed);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_unauthorized_terminates_without_retry() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        let registry = Arc::new(ScriptedRegistry::new(vec![Err(Error::Unauthorized(
            "401".into(),
        ))]));
        let (orch, _rx) = orchestrator(registry.clone(), store);
        let cycle = orch
            .run_cycle(ResourceType::Space, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cycle.terminal_status, CycleStatus::Failed);
        assert_eq!(registry.cursors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_items_are_skipped_and_counted() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        let registry = Arc::new(ScriptedRegistry::new(vec![Ok(RegistryPage {
            items: vec![
                Ok(record("org/a", "1")),
                Err(Error::DataIntegrity("missing id".into())),
                Ok(record("org/b", "2")),
            ],
            next_cursor: None,
        })]));
        let (orch, _rx) = orchestrator(registry, store.clone());
        let cycle = orch
            .run_cycle(ResourceType::Model, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cycle.items_new, 2);
        assert_eq!(cycle.errors_count, 1);
        assert_eq!(cycle.terminal_status, CycleStatus::Partial);
        assert!(store
            .db()
            .get_resource(&ResourceKey::new(ResourceType::Model, "org/b"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_cancelled_cycle_is_partial_and_keeps_records() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        let registry = Arc::new(ScriptedRegistry::new(vec![page(
            vec![record("org/a", "1")],
            None,
        )]));
        let (orch, _rx) = orchestrator(registry, store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cycle = orch
            .run_cycle(ResourceType::Model, None, &cancel)
            .await
            .unwrap();
        assert_eq!(cycle.terminal_status, CycleStatus::Partial);
        assert_eq!(cycle.items_seen, 0);
        assert_eq!(cycle.error.as_deref(), Some("cancelled"));
    }
}
