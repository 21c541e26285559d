//! Task Scheduler
//!
//! Tasks are rows in the metadata database. A dispatcher loop hands due
//! tasks to executions, one lane per kind; each execution claims its task
//! with a `queued` to `running` compare-and-set before calling the
//! [`JobRunner`]. Recurring tasks queue a successor after every run whatever
//! its outcome, a panic included.

use crate::error::{Error, Result};
use crate::meta::MetaDb;
use crate::models::{TaskKind, TaskParams, TaskRecord, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INTERRUPTED: &str = "interrupted by restart";
const PANICKED: &str = "panicked";

/// Executes the work behind a task
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `task` to completion; should return promptly once `cancel` fires
    async fn run(&self, task: &TaskRecord, cancel: CancellationToken) -> Result<()>;
}

/// When a scheduled task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Once, at the given time
    At(DateTime<Utc>),
    /// Now, then every interval after each run ends
    Every(Duration),
}

/// What startup reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub failed_tasks: u64,
    pub rescheduled: u64,
    pub failed_cycles: u64,
}

/// Task counts per state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

struct Lane {
    task_id: String,
    params: TaskParams,
    cancel: CancellationToken,
}

type Lanes = Arc<StdMutex<HashMap<TaskKind, Lane>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees a lane when its execution ends, however it ends
struct LaneGuard {
    lanes: Lanes,
    kind: TaskKind,
    task_id: String,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        let mut lanes = lock(&self.lanes);
        if lanes.get(&self.kind).is_some_and(|l| l.task_id == self.task_id) {
            lanes.remove(&self.kind);
        }
    }
}

/// Spawned executions and the task each one runs
#[derive(Default)]
struct Executions {
    set: JoinSet<()>,
    tasks: HashMap<task::Id, TaskRecord>,
}

pub struct Scheduler {
    db: MetaDb,
    runner: Arc<dyn JobRunner>,
    tick: Duration,
    timeouts: HashMap<TaskKind, Duration>,
    lanes: Lanes,
    /// Serializes trigger coalescing against dispatch
    submit_lock: Mutex<()>,
    executions: StdMutex<Executions>,
}

impl Scheduler {
    pub fn new(
        db: MetaDb,
        runner: Arc<dyn JobRunner>,
        tick: Duration,
        timeouts: HashMap<TaskKind, Duration>,
    ) -> Self {
        Self {
            db,
            runner,
            tick: tick.max(Duration::from_millis(10)),
            timeouts,
            lanes: Arc::default(),
            submit_lock: Mutex::new(()),
            executions: StdMutex::default(),
        }
    }

    /// Queue a task; returns its id
    pub async fn schedule(
        &self,
        kind: TaskKind,
        when: Schedule,
        params: TaskParams,
    ) -> Result<String> {
        let task = match when {
            Schedule::At(at) => TaskRecord::queued(kind, at, None, params),
            Schedule::Every(interval) => {
                TaskRecord::queued(kind, Utc::now(), Some(interval.as_secs().max(1)), params)
            }
        };
        self.db.insert_task(&task).await?;
        info!(task_id = %task.task_id, kind = %kind, scheduled_at = %task.scheduled_at, "Task scheduled");
        Ok(task.task_id)
    }

    /// Schedule a recurring task unless one of this kind is already queued
    pub async fn ensure_recurring(
        &self,
        kind: TaskKind,
        interval: Duration,
        params: TaskParams,
    ) -> Result<String> {
        let _guard = self.submit_lock.lock().await;
        if let Some(existing) = self.db.queued_recurring_task(kind).await? {
            debug!(task_id = %existing.task_id, kind = %kind, "Recurring task already queued");
            return Ok(existing.task_id);
        }
        self.schedule(kind, Schedule::Every(interval), params).await
    }

    /// Run `kind` now. Coalesces into a running or already-due task of that
    /// kind whose params cover `params`; otherwise queues a new task, which
    /// waits for the lane if it is busy.
    pub async fn trigger(&self, kind: TaskKind, params: TaskParams) -> Result<String> {
        let _guard = self.submit_lock.lock().await;
        let running = lock(&self.lanes)
            .get(&kind)
            .filter(|lane| lane.params.covers(&params))
            .map(|lane| lane.task_id.clone());
        if let Some(task_id) = running {
            debug!(task_id = %task_id, kind = %kind, "Trigger coalesced into running task");
            return Ok(task_id);
        }

        let now = Utc::now();
        let due = self
            .db
            .due_tasks_of_kind(kind, now)
            .await?
            .into_iter()
            .find(|task| task.params.covers(&params));
        if let Some(due) = due {
            debug!(task_id = %due.task_id, kind = %kind, "Trigger coalesced into due task");
            return Ok(due.task_id);
        }
        self.schedule(kind, Schedule::At(now), params).await
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskRecord> {
        self.db
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
    }

    /// Cancel a queued task outright, or signal a running one to stop at its
    /// next item boundary. Returns false for finished or unknown tasks.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let _guard = self.submit_lock.lock().await;
        if self
            .db
            .transition_task(task_id, TaskState::Queued, TaskState::Cancelled, Utc::now(), None)
            .await?
        {
            info!(task_id, "Queued task cancelled");
            return Ok(true);
        }
        let lanes = lock(&self.lanes);
        if let Some(lane) = lanes.values().find(|l| l.task_id == task_id) {
            info!(task_id, "Cancelling running task");
            lane.cancel.cancel();
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        self.db.list_tasks(limit).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for (state, count) in self.db.task_state_counts().await? {
            match state.parse::<TaskState>() {
                Ok(TaskState::Queued) => stats.queued = count,
                Ok(TaskState::Running) => stats.running = count,
                Ok(TaskState::Succeeded) => stats.succeeded = count,
                Ok(TaskState::Failed) => stats.failed = count,
                Ok(TaskState::Cancelled) => stats.cancelled = count,
                Err(e) => warn!(error = %e, "Unknown task state in table"),
            }
        }
        Ok(stats)
    }

    /// Reconcile state left by a crash; call once before dispatching
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for task in self.db.tasks_in_state(TaskState::Running).await? {
            if !self
                .db
                .transition_task(&task.task_id, TaskState::Running, TaskState::Failed, now, Some(INTERRUPTED))
                .await?
            {
                continue;
            }
            report.failed_tasks += 1;
            warn!(task_id = %task.task_id, kind = %task.kind, "Task left running by previous process marked failed");

            if task.interval_secs.is_some() {
                let next = TaskRecord::queued(task.kind, now, task.interval_secs, task.params.clone());
                self.db.insert_task(&next).await?;
                report.rescheduled += 1;
                info!(task_id = %next.task_id, kind = %task.kind, "Recurring task rescheduled after crash");
            }
        }

        report.failed_cycles = self.db.fail_unfinished_cycles(INTERRUPTED).await?;
        if report != RecoveryReport::default() {
            info!(
                failed_tasks = report.failed_tasks,
                rescheduled = report.rescheduled,
                failed_cycles = report.failed_cycles,
                "Recovered from unclean shutdown"
            );
        }
        Ok(report)
    }

    /// Hand every due task whose lane is free to an execution; returns how
    /// many were handed off
    pub async fn dispatch_once(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.submit_lock.lock().await;
        let mut started = 0;
        for task in self.db.due_tasks(now).await? {
            if self.spawn_execution(task) {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Takes the lane and spawns the execution without yielding in between,
    /// so an aborted dispatcher never holds a lane with nothing running in it
    fn spawn_execution(self: &Arc<Self>, task: TaskRecord) -> bool {
        let cancel = CancellationToken::new();
        {
            let mut lanes = lock(&self.lanes);
            if lanes.contains_key(&task.kind) {
                return false;
            }
            lanes.insert(
                task.kind,
                Lane {
                    task_id: task.task_id.clone(),
                    params: task.params.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        let lane = LaneGuard {
            lanes: Arc::clone(&self.lanes),
            kind: task.kind,
            task_id: task.task_id.clone(),
        };

        let scheduler = Arc::clone(self);
        let record = task.clone();
        let mut executions = lock(&self.executions);
        let handle = executions.set.spawn(async move {
            let _lane = lane;
            scheduler.claim_and_execute(task, cancel).await;
        });
        executions.tasks.insert(handle.id(), record);
        true
    }

    async fn claim_and_execute(&self, task: TaskRecord, cancel: CancellationToken) {
        match self
            .db
            .transition_task(&task.task_id, TaskState::Queued, TaskState::Running, Utc::now(), None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %task.task_id, "Task no longer queued, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "Failed to claim task");
                return;
            }
        }
        info!(task_id = %task.task_id, kind = %task.kind, "Task started");
        self.execute(task, cancel).await;
    }

    async fn execute(&self, task: TaskRecord, cancel: CancellationToken) {
        let run = AssertUnwindSafe(self.runner.run(&task, cancel.clone()))
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|_| Err(Error::Other(PANICKED.to_string()))));
        tokio::pin!(run);
        // Past the timeout the runner is cancelled and allowed to wind down
        let outcome = match self.timeouts.get(&task.kind) {
            Some(limit) => tokio::select! {
                result = &mut run => result,
                _ = tokio::time::sleep(*limit) => {
                    warn!(task_id = %task.task_id, kind = %task.kind, "Task timed out, cancelling");
                    cancel.cancel();
                    let _ = run.await;
                    Err(Error::Other(format!("timed out after {}s", limit.as_secs_f64())))
                }
            },
            None => run.await,
        };

        let (state, message) = match outcome {
            Ok(()) if cancel.is_cancelled() => (TaskState::Cancelled, None),
            Ok(()) => (TaskState::Succeeded, None),
            Err(Error::Cancelled) => (TaskState::Cancelled, None),
            Err(e) => (TaskState::Failed, Some(e.to_string())),
        };

        if let Err(e) = self.finish(&task, state, message.as_deref()).await {
            error!(task_id = %task.task_id, error = %e, "Task bookkeeping failed");
        }
    }

    /// Record the outcome and queue the next run of a recurring task. The
    /// next run is queued even when the outcome could not be written.
    async fn finish(&self, task: &TaskRecord, state: TaskState, message: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let recorded = self
            .db
            .transition_task(&task.task_id, TaskState::Running, state, now, message)
            .await;

        match (&recorded, message) {
            (Ok(true), Some(msg)) if state == TaskState::Failed => {
                warn!(task_id = %task.task_id, kind = %task.kind, error = msg, "Task failed")
            }
            (Ok(true), _) => {
                info!(task_id = %task.task_id, kind = %task.kind, state = %state, "Task finished")
            }
            (Ok(false), _) => {
                // Someone else settled it, and queued any successor
                debug!(task_id = %task.task_id, "Task already settled");
                return Ok(());
            }
            (Err(e), _) => {
                error!(task_id = %task.task_id, error = %e, "Failed to record task outcome")
            }
        }

        if let Some(next) = task.successor(now) {
            self.db.insert_task(&next).await?;
            debug!(task_id = %next.task_id, scheduled_at = %next.scheduled_at, "Next run queued");
        }
        recorded.map(|_| ())
    }

    /// Dispatcher loop; `beat` is called every tick
    pub async fn run<F>(self: Arc<Self>, cancel: CancellationToken, beat: F)
    where
        F: Fn() + Send + Sync,
    {
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Dispatcher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    beat();
                    if let Err(e) = self.dispatch_once(Utc::now()).await {
                        error!(error = %e, "Dispatch failed");
                    }
                    self.reap().await;
                }
            }
        }
    }

    /// Collect finished executions; one that died outside the runner has its
    /// task failed and its successor queued here
    async fn reap(&self) {
        let mut panicked = Vec::new();
        {
            let mut executions = lock(&self.executions);
            while let Some(joined) = executions.set.try_join_next_with_id() {
                match joined {
                    Ok((id, ())) => {
                        executions.tasks.remove(&id);
                    }
                    Err(e) => {
                        let task = executions.tasks.remove(&e.id());
                        if e.is_panic() {
                            error!(error = %e, "Task execution panicked");
                            panicked.extend(task);
                        }
                    }
                }
            }
        }

        for task in panicked {
            if let Err(e) = self.finish(&task, TaskState::Failed, Some(PANICKED)).await {
                error!(task_id = %task.task_id, error = %e, "Task bookkeeping failed");
            }
        }
    }

    /// Signal running tasks and wait up to `grace` for them to finish
    pub async fn shutdown(&self, grace: Duration) {
        for lane in lock(&self.lanes).values() {
            lane.cancel.cancel();
        }
        let mut executions = std::mem::take(&mut *lock(&self.executions));
        let drained = tokio::time::timeout(grace, async {
            while executions.set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Tasks still running at shutdown; they will be recovered on next start");
            executions.set.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceType;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Blocks until released or cancelled
    struct GatedRunner {
        release: Notify,
        runs: AtomicU32,
        fail: bool,
    }

    impl GatedRunner {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                runs: AtomicU32::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run(&self, _task: &TaskRecord, cancel: CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.release.notified() => {}
            }
            if self.fail {
                Err(Error::TransientIo("registry down".into()))
            } else {
                Ok(())
            }
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl JobRunner for PanickingRunner {
        async fn run(&self, task: &TaskRecord, _cancel: CancellationToken) -> Result<()> {
            panic!("runner bug on {}", task.task_id);
        }
    }

    async fn scheduler(
        runner: Arc<dyn JobRunner>,
        timeouts: HashMap<TaskKind, Duration>,
    ) -> (TempDir, Arc<Scheduler>) {
        let dir = TempDir::new().unwrap();
        let db = MetaDb::new(&dir.path().join("tasks.db")).await.unwrap();
        let scheduler = Arc::new(Scheduler::new(db, runner, Duration::from_millis(10), timeouts));
        (dir, scheduler)
    }

    async fn wait_for_state(scheduler: &Scheduler, task_id: &str, state: TaskState) -> TaskRecord {
        for _ in 0..200 {
            let task = scheduler.status(task_id).await.unwrap();
            if task.state == state {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {}", task_id, state);
    }

    #[tokio::test]
    async fn test_trigger_coalesces_while_running() {
        let runner = GatedRunner::new(false);
        let (_dir, scheduler) = scheduler(runner.clone(), HashMap::new()).await;

        let first = scheduler.trigger(TaskKind::Crawl, TaskParams::default()).await.unwrap();
        assert_eq!(scheduler.dispatch_once(Utc::now()).await.unwrap(), 1);
        let second = scheduler.trigger(TaskKind::Crawl, TaskParams::default()).await.unwrap();
        let third = scheduler.trigger(TaskKind::Crawl, TaskParams::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);

        // A different kind gets its own lane
        let reindex = scheduler.trigger(TaskKind::Reindex, TaskParams::default()).await.unwrap();
        assert_ne!(first, reindex);

        runner.release.notify_one();
        let done = wait_for_state(&scheduler, &first, TaskState::Succeeded).await;
        assert!(done.started_at.is_some() && done.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_trigger_with_wider_params_queues_behind_running_task() {
        let runner = GatedRunner::new(false);
        let (_dir, scheduler) = scheduler(runner.clone(), HashMap::new()).await;
        let params = |resource_type, item_limit| TaskParams {
            resource_type: Some(resource_type),
            item_limit,
        };

        let models = scheduler
            .trigger(TaskKind::Crawl, params(ResourceType::Model, None))
            .await
            .unwrap();
        assert_eq!(scheduler.dispatch_once(Utc::now()).await.unwrap(), 1);

        // Covered by the running model crawl
        let few_models = scheduler
            .trigger(TaskKind::Crawl, params(ResourceType::Model, Some(5)))
            .await
            .unwrap();
        assert_eq!(few_models, models);

        let datasets = scheduler
            .trigger(TaskKind::Crawl, params(ResourceType::Dataset, None))
            .await
            .unwrap();
        assert_ne!(datasets, models);
        let again = scheduler
            .trigger(TaskKind::Crawl, params(ResourceType::Dataset, None))
            .await
            .unwrap();
        assert_eq!(again, datasets);

        // The lane is busy, so the dataset crawl waits
        assert_eq!(scheduler.dispatch_once(Utc::now()).await.unwrap(), 0);
        assert_eq!(scheduler.status(&datasets).await.unwrap().state, TaskState::Queued);

        runner.release.notify_one();
        wait_for_state(&scheduler, &models, TaskState::Succeeded).await;
        for _ in 0..200 {
            scheduler.dispatch_once(Utc::now()).await.unwrap();
            if scheduler.status(&datasets).await.unwrap().state == TaskState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runner.release.notify_one();
        let done = wait_for_state(&scheduler, &datasets, TaskState::Succeeded).await;
        assert_eq!(done.params.resource_type, Some(ResourceType::Dataset));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_runner_fails_task_and_frees_lane() {
        let (_dir, scheduler) = scheduler(Arc::new(PanickingRunner), HashMap::new()).await;
        let id = scheduler
            .schedule(TaskKind::Crawl, Schedule::Every(Duration::from_secs(1)), TaskParams::default())
            .await
            .unwrap();
        assert_eq!(scheduler.dispatch_once(Utc::now()).await.unwrap(), 1);

        let failed = wait_for_state(&scheduler, &id, TaskState::Failed).await;
        assert_eq!(failed.error.as_deref(), Some(PANICKED));

        let mut successor = None;
        for _ in 0..100 {
            scheduler.reap().await;
            successor = scheduler.db.queued_recurring_task(TaskKind::Crawl).await.unwrap();
            if successor.is_some() && lock(&scheduler.lanes).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let successor = successor.expect("successor should be queued");
        assert_ne!(successor.task_id, id);
        assert!(lock(&scheduler.lanes).is_empty());

        let triggered = scheduler.trigger(TaskKind::Crawl, TaskParams::default()).await.unwrap();
        assert_ne!(triggered, id);
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(scheduler.dispatch_once(later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let runner = GatedRunner::new(false);
        let (_dir, scheduler) = scheduler(runner.clone(), HashMap::new()).await;
        let later = Utc::now() + chrono::Duration::hours(1);
        let id = scheduler
            .schedule(TaskKind::Reindex, Schedule::At(later), TaskParams::default())
            .await
            .unwrap();
        assert!(scheduler.cancel(&id).await.unwrap());
        assert_eq!(scheduler.status(&id).await.unwrap().state, TaskState::Cancelled);
        assert!(!scheduler.cancel(&id).await.unwrap());
        assert!(!scheduler.cancel("no-such-task").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let runner = GatedRunner::new(false);
        let (_dir, scheduler) = scheduler(runner.clone(), HashMap::new()).await;
        let id = scheduler.trigger(TaskKind::Crawl, TaskParams::default()).await.unwrap();
        scheduler.dispatch_once(Utc::now()).await.unwrap();
        wait_for_state(&scheduler, &id, TaskState::Running).await;

        assert!(scheduler.cancel(&id).await.unwrap());
        wait_for_state(&scheduler, &id, TaskState::Cancelled).await;
    }

    #[tokio::test]
    async fn test_recurring_task_requeues_after_failure() {
        let runner = GatedRunner::new(true);
        let (_dir, scheduler) = scheduler(runner.clone(), HashMap::new()).await;
        let id = scheduler
            .schedule(TaskKind::Crawl, Schedule::Every(Duration::from_secs(600)), TaskParams::default())
            .await
            .unwrap();
        scheduler.dispatch_once(Utc::now()).await.unwrap();
        wait_for_state(&scheduler, &id, TaskState::Running).await;
        runner.release.notify_one();

        let failed = wait_for_state(&scheduler, &id, TaskState::Failed).await;
        assert!(failed.error.unwrap().contains("registry down"));

        let mut successor = None;
        for _ in 0..100 {
            successor = scheduler.db.queued_recurring_task(TaskKind::Crawl).await.unwrap();
            if successor.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let successor = successor.expect("successor should be queued");
        assert!(successor.scheduled_at > Utc::now() + chrono::Duration::seconds(500));
    }

    #[tokio::test]
    async fn test_timeout_marks_task_failed() {
        let runner = GatedRunner::new(false);
        let timeouts = HashMap::from([(TaskKind::Reindex, Duration::from_millis(30))]);
        let (_dir, scheduler) = scheduler(runner, timeouts).await;
        let id = scheduler.trigger(TaskKind::Reindex, TaskParams::default()).await.unwrap();
        scheduler.dispatch_once(Utc::now()).await.unwrap();
        let failed = wait_for_state(&scheduler, &id, TaskState::Failed).await;
        assert!(failed.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_recover_fails_running_and_reschedules_recurring() {
        let runner = GatedRunner::new(false);
        let (_dir, scheduler) = scheduler(runner, HashMap::new()).await;
        let now = Utc::now();

        let mut crashed = TaskRecord::queued(TaskKind::Crawl, now, Some(3600), TaskParams::default());
        crashed.state = TaskState::Running;
        crashed.started_at = Some(now);
        scheduler.db.insert_task(&crashed).await.unwrap();
        let mut one_shot = TaskRecord::queued(TaskKind::Reindex, now, None, TaskParams::default());
        one_shot.state = TaskState::Running;
        scheduler.db.insert_task(&one_shot).await.unwrap();

        let report = scheduler.recover().await.unwrap();
        assert_eq!(report.failed_tasks, 2);
        assert_eq!(report.rescheduled, 1);

        let crashed = scheduler.status(&crashed.task_id).await.unwrap();
        assert_eq!(crashed.state, TaskState::Failed);
        assert_eq!(crashed.error.as_deref(), Some(INTERRUPTED));
        let next = scheduler
            .db
            .queued_recurring_task(TaskKind::Crawl)
            .await
            .unwrap()
            .expect("recurring task should be rescheduled");
        assert_eq!(next.interval_secs, Some(3600));

        // Recovery is idempotent
        assert_eq!(scheduler.recover().await.unwrap().failed_tasks, 0);
    }

    #[tokio::test]
    async fn test_ensure_recurring_does_not_duplicate() {
        let runner = GatedRunner::new(false);
        let (_dir, scheduler) = scheduler(runner, HashMap::new()).await;
        let a = scheduler
            .ensure_recurring(TaskKind::Reindex, Duration::from_secs(60), TaskParams::default())
            .await
            .unwrap();
        let b = scheduler
            .ensure_recurring(TaskKind::Reindex, Duration::from_secs(60), TaskParams::default())
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(scheduler.queue_stats().await.unwrap().queued, 1);
    }
}
