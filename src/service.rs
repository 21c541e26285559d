//! Runtime wiring and the exposed API
//!
//! [`HubService`] owns every component. `start` launches the dispatcher,
//! the priority evaluator and the watchdog; the query methods are safe to
//! call whether or not the background loops are running.

use crate::config::Config;
use crate::crawl::CrawlOrchestrator;
use crate::error::{Error, Result};
use crate::knowledge::{IndexBuildReport, IndexFreshness, KnowledgeStore, RankedResult, SearchMode};
use crate::meta::TypeStats;
use crate::models::{
    AlertEvent, CrawlCycleRecord, CycleStatus, ResourceRecord, ResourceType, TaskKind,
    TaskParams, TaskRecord,
};
use crate::priority::{AlertRouter, LogSink, NotificationSink, PriorityEvaluator};
use crate::registry::{HubClient, RegistryClient};
use crate::scheduler::{JobRunner, QueueStats, RecoveryReport, Scheduler};
use crate::supervisor::{ComponentHealth, Heartbeat, SupervisedLoop, Watchdog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DISPATCHER: &str = "dispatcher";
const EVALUATOR: &str = "priority-evaluator";

/// Snapshot returned by [`HubService::get_stats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub types: Vec<TypeStats>,
    pub last_cycle: Option<CrawlCycleRecord>,
    pub last_cycle_per_type: Vec<CrawlCycleRecord>,
    pub total_cycles: u64,
    pub index: IndexFreshness,
    pub queue: QueueStats,
    pub components: Vec<ComponentHealth>,
    pub alerts_retained: usize,
}

/// Runs crawl and reindex tasks for the scheduler
struct Jobs {
    orchestrator: Arc<CrawlOrchestrator>,
    store: Arc<KnowledgeStore>,
    resource_types: Vec<ResourceType>,
    item_limit: Option<usize>,
}

impl Jobs {
    async fn crawl(&self, params: &TaskParams, cancel: &CancellationToken) -> Result<()> {
        let scopes = match params.resource_type {
            Some(t) => vec![t],
            None => self.resource_types.clone(),
        };
        let limit = params.item_limit.or(self.item_limit);

        let mut failed = Vec::new();
        for scope in scopes {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let cycle = self.orchestrator.run_cycle(scope, limit, cancel).await?;
            if cycle.terminal_status == CycleStatus::Failed {
                failed.push(format!(
                    "{}: {}",
                    scope,
                    cycle.error.as_deref().unwrap_or("failed")
                ));
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !failed.is_empty() {
            return Err(Error::Fatal(format!("crawl cycles failed: {}", failed.join("; "))));
        }
        Ok(())
    }

    async fn reindex(&self) -> Result<IndexBuildReport> {
        self.store.build_index_from_store().await
    }
}

#[async_trait]
impl JobRunner for Jobs {
    async fn run(&self, task: &TaskRecord, cancel: CancellationToken) -> Result<()> {
        match task.kind {
            TaskKind::Crawl => self.crawl(&task.params, &cancel).await,
            TaskKind::Reindex => self.reindex().await.map(|_| ()),
        }
    }
}

pub struct HubService {
    config: Config,
    store: Arc<KnowledgeStore>,
    jobs: Arc<Jobs>,
    router: Arc<AlertRouter>,
    evaluator: Arc<PriorityEvaluator>,
    scheduler: Arc<Scheduler>,
    watchdog: Arc<Watchdog>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<Arc<SupervisedLoop>>>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
}

impl HubService {
    /// Open the configured store and registry, alerting through the log
    pub async fn open(config: Config) -> Result<Self> {
        let store = Arc::new(KnowledgeStore::open(&config).await?);
        let registry: Arc<dyn RegistryClient> = Arc::new(HubClient::new(&config.registry)?);
        Ok(Self::build(config, store, registry, Arc::new(LogSink)))
    }

    /// Assemble a service from its external collaborators
    pub fn build(
        config: Config,
        store: Arc<KnowledgeStore>,
        registry: Arc<dyn RegistryClient>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = Arc::new(AlertRouter::new(sink, &config.alerts));
        let orchestrator = Arc::new(CrawlOrchestrator::new(
            registry,
            store.clone(),
            &config,
            events_tx,
        ));
        let evaluator = Arc::new(PriorityEvaluator::new(
            config.watch.rules(),
            router.clone(),
            events_rx,
        ));
        let jobs = Arc::new(Jobs {
            orchestrator,
            store: store.clone(),
            resource_types: config.crawl.resource_types.clone(),
            item_limit: config.crawl.item_limit,
        });
        let timeouts = HashMap::from([
            (TaskKind::Crawl, Duration::from_secs(config.crawl.task_timeout_secs.max(1))),
            (TaskKind::Reindex, Duration::from_secs(config.index.task_timeout_secs.max(1))),
        ]);
        let scheduler = Arc::new(Scheduler::new(
            store.db().clone(),
            jobs.clone(),
            Duration::from_millis(config.scheduler.tick_ms),
            timeouts,
        ));
        let watchdog = Arc::new(Watchdog::new(&config.supervisor, router.clone()));

        Self {
            config,
            store,
            jobs,
            router,
            evaluator,
            scheduler,
            watchdog,
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            watchdog_task: Mutex::new(None),
        }
    }

    /// Recover from a crash, register recurring jobs and start the background loops
    pub async fn start(&self) -> Result<RecoveryReport> {
        let report = self.scheduler.recover().await?;

        if let Err(e) = self.store.warm_index().await {
            warn!(error = %e, "Could not warm the vector index, semantic results may be sparse");
        }

        if self.config.crawl.interval_secs > 0 {
            self.scheduler
                .ensure_recurring(
                    TaskKind::Crawl,
                    Duration::from_secs(self.config.crawl.interval_secs),
                    TaskParams::default(),
                )
                .await?;
        }
        if self.config.index.rebuild_interval_secs > 0 {
            self.scheduler
                .ensure_recurring(
                    TaskKind::Reindex,
                    Duration::from_secs(self.config.index.rebuild_interval_secs),
                    TaskParams::default(),
                )
                .await?;
        }

        let scheduler = self.scheduler.clone();
        self.supervise(DISPATCHER, move |token, beat| {
            let scheduler = scheduler.clone();
            Box::pin(async move { scheduler.run(token, move || beat.beat()).await })
        })
        .await;

        let evaluator = self.evaluator.clone();
        let tick = Duration::from_millis(self.config.scheduler.tick_ms);
        self.supervise(EVALUATOR, move |token, beat| {
            let evaluator = evaluator.clone();
            Box::pin(async move {
                if let Err(e) = evaluator.run(token, tick, move || beat.beat()).await {
                    warn!(error = %e, "Priority evaluator stopped");
                }
            })
        })
        .await;

        let watchdog = self.watchdog.clone();
        let shutdown = self.shutdown.clone();
        *self.watchdog_task.lock().await =
            Some(tokio::spawn(async move { watchdog.run(shutdown).await }));

        info!(
            rules = self.evaluator.rules().len(),
            recovered_tasks = report.failed_tasks,
            "Service started"
        );
        Ok(report)
    }

    /// Spawn a restartable loop under the watchdog
    async fn supervise<F>(&self, name: &str, run: F)
    where
        F: Fn(CancellationToken, Heartbeat) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let slot: Arc<OnceLock<Heartbeat>> = Arc::default();
        let handle = slot.clone();
        let component = Arc::new(SupervisedLoop::new(name, self.shutdown.clone(), move |token| {
            match handle.get() {
                Some(beat) => run(token, beat.clone()),
                None => Box::pin(async {}),
            }
        }));
        let beat = self.watchdog.watch(component.clone()).await;
        let _ = slot.set(beat);
        component.start().await;
        self.loops.lock().await.push(component);
    }

    // ===== Exposed API =====

    /// Ranked results; `limit` of 0 means the configured default
    pub async fn search(
        &self,
        query: &str,
        resource_type: Option<ResourceType>,
        mode: SearchMode,
        limit: usize,
    ) -> Result<Vec<RankedResult>> {
        self.store.search(query, resource_type, mode, limit).await
    }

    /// Queue a crawl now, coalescing with one already running or due
    pub async fn trigger_crawl(
        &self,
        resource_type: Option<ResourceType>,
        limit: Option<usize>,
    ) -> Result<String> {
        let params = TaskParams {
            resource_type,
            item_limit: limit,
        };
        self.scheduler.trigger(TaskKind::Crawl, params).await
    }

    pub async fn trigger_reindex(&self) -> Result<String> {
        self.scheduler
            .trigger(TaskKind::Reindex, TaskParams::default())
            .await
    }

    pub async fn get_stats(&self) -> Result<ServiceStats> {
        let db = self.store.db();
        Ok(ServiceStats {
            types: self.store.type_stats().await?,
            last_cycle: db.latest_cycle().await?,
            last_cycle_per_type: db.last_cycle_per_type().await?,
            total_cycles: db.count_cycles().await?,
            index: self.store.index_freshness().await?,
            queue: self.scheduler.queue_stats().await?,
            components: self.watchdog.health().await,
            alerts_retained: self.router.log().len().await,
        })
    }

    /// Alerts emitted at or after `since`, oldest first
    pub async fn get_priority_matches(&self, since: Option<DateTime<Utc>>) -> Vec<AlertEvent> {
        self.router.log().since(since).await
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskRecord> {
        self.scheduler.status(task_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        self.scheduler.cancel(task_id).await
    }

    pub async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        self.scheduler.list_tasks(limit).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.scheduler.queue_stats().await
    }

    pub async fn get_similar(
        &self,
        id: &str,
        resource_type: ResourceType,
        limit: usize,
    ) -> Result<Vec<(ResourceRecord, f64)>> {
        self.store.get_similar(id, resource_type, limit).await
    }

    /// Stored records matching the watch rules
    pub async fn get_priority_resources(&self, limit: usize) -> Result<Vec<ResourceRecord>> {
        self.store.priority_resources(&self.config.watch, limit).await
    }

    pub async fn export_knowledge(&self, path: &Path) -> Result<usize> {
        self.store.export(path).await
    }

    /// Run one crawl in the foreground, outside the scheduler
    pub async fn crawl_now(
        &self,
        resource_type: Option<ResourceType>,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let params = TaskParams {
            resource_type,
            item_limit: limit,
        };
        self.jobs.crawl(&params, cancel).await
    }

    /// Evaluate ingestion events left by a foreground crawl; returns alerts fired
    pub async fn evaluate_pending(&self) -> usize {
        self.evaluator.drain_pending().await
    }

    /// Rebuild the vector index in the foreground
    pub async fn reindex_now(&self) -> Result<IndexBuildReport> {
        self.jobs.reindex().await
    }

    /// Stop background loops, giving running tasks `grace` to wind down
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down");
        self.shutdown.cancel();
        self.scheduler.shutdown(grace).await;
        for component in self.loops.lock().await.drain(..) {
            component.stop().await;
        }
        if let Some(handle) = self.watchdog_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Watchdog ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::testing::{fast_config, page, ScriptedRegistry};
    use crate::knowledge::testing::{record, store_with, LetterEmbedder};
    use crate::models::{MatchedRule, TaskState};
    use crate::priority::testing::RecordingSink;
    use tempfile::TempDir;

    async fn service(
        script: Vec<Result<crate::registry::RegistryPage>>,
    ) -> (TempDir, HubService, Arc<RecordingSink>) {
        let (dir, store) = store_with(Some(Arc::new(LetterEmbedder::new()))).await;
        let mut config = fast_config();
        config.crawl.resource_types = vec![ResourceType::Model];
        config.crawl.interval_secs = 0;
        config.index.rebuild_interval_secs = 0;
        config.scheduler.tick_ms = 10;
        let sink = Arc::new(RecordingSink::default());
        let service = HubService::build(
            config,
            Arc::new(store),
            Arc::new(ScriptedRegistry::new(script)),
            sink.clone(),
        );
        (dir, service, sink)
    }

    async fn wait_done(service: &HubService, task_id: &str) -> TaskRecord {
        for _ in 0..300 {
            let task = service.get_task_status(task_id).await.unwrap();
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not finish", task_id);
    }

    #[tokio::test]
    async fn test_triggered_crawl_feeds_search_stats_and_alerts() {
        let watched = record("Nymbo/tiny-llama", "small chat model");
        let other = record("acme/vision", "image classifier");
        let (_dir, service, sink) = service(vec![page(vec![watched, other], None)]).await;
        service.start().await.unwrap();

        let task_id = service.trigger_crawl(None, None).await.unwrap();
        let task = wait_done(&service, &task_id).await;
        assert_eq!(task.state, TaskState::Succeeded);

        let results = service
            .search("chat", None, SearchMode::Hybrid, 5)
            .await
            .unwrap();
        assert_eq!(results[0].record.id, "Nymbo/tiny-llama");

        // Alert delivery runs on the evaluator loop
        let mut matches = Vec::new();
        for _ in 0..100 {
            matches = service.get_priority_matches(None).await;
            if !matches.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].resource_id, "Nymbo/tiny-llama");
        assert!(matches!(matches[0].matched_rule, MatchedRule::Watch { .. }));
        assert_eq!(sink.alerts().len(), 1);

        let stats = service.get_stats().await.unwrap();
        let models = stats
            .types
            .iter()
            .find(|t| t.resource_type == "model")
            .unwrap();
        assert_eq!(models.total, 2);
        assert_eq!(stats.total_cycles, 1);
        assert_eq!(stats.last_cycle.unwrap().items_new, 2);
        assert_eq!(stats.queue.succeeded, 1);
        assert_eq!(stats.components.len(), 2);

        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (_dir, service, _sink) = service(Vec::new()).await;
        let err = service.get_task_status("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_cycle_fails_the_task() {
        let script = vec![Err(Error::Unauthorized("bad token".to_string()))];
        let (_dir, service, _sink) = service(script).await;
        service.start().await.unwrap();

        let task_id = service.trigger_crawl(Some(ResourceType::Model), Some(10)).await.unwrap();
        let task = wait_done(&service, &task_id).await;
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().contains("model"));

        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_recurring_crawl_reads_every_page_and_marks_unseen_stale() {
        let (_dir, store) = store_with(None).await;
        let store = Arc::new(store);
        store.upsert(&record("org/retired", "old model")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut config = fast_config();
        config.crawl.resource_types = vec![ResourceType::Model];
        config.crawl.interval_secs = 3600;
        config.index.rebuild_interval_secs = 0;
        config.scheduler.tick_ms = 10;
        assert_eq!(config.crawl.item_limit, None);
        let registry = ScriptedRegistry::new(vec![
            page(vec![record("org/a", "alpha model")], Some("2")),
            page(vec![record("org/b", "beta model")], None),
        ]);
        let service = HubService::build(
            config,
            store.clone(),
            Arc::new(registry),
            Arc::new(RecordingSink::default()),
        );
        service.start().await.unwrap();

        let first = service
            .list_tasks(10)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.kind == TaskKind::Crawl)
            .unwrap();
        let task = wait_done(&service, &first.task_id).await;
        assert_eq!(task.state, TaskState::Succeeded);

        assert!(store.get("org/retired", ResourceType::Model).await.unwrap().stale);
        assert!(!store.get("org/b", ResourceType::Model).await.unwrap().stale);

        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_foreground_reindex_reports_generation() {
        let (_dir, service, _sink) =
            service(vec![page(vec![record("org/a", "alpha model")], None)]).await;
        service
            .crawl_now(None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(service.evaluate_pending().await, 0);
        let report = service.reindex_now().await.unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.entries, 1);
    }
}
