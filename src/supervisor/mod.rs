//! Supervisor (watchdog)
//!
//! Watched components heartbeat periodically. A component silent for longer
//! than the grace period is suspected, then restarted with exponential
//! backoff. Too many restarts inside the sliding window degrade it: one
//! critical alert is emitted and automatic restarts stop.

use crate::config::SupervisorConfig;
use crate::crawl::BackoffPolicy;
use crate::error::{Error, Result};
use crate::models::AlertEvent;
use crate::priority::AlertRouter;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Something the watchdog can restart
#[async_trait]
pub trait Supervised: Send + Sync {
    fn name(&self) -> &str;

    async fn restart(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Suspected,
    Restarting,
    Degraded,
}

/// Point-in-time view of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub state: HealthState,
    pub consecutive_restarts: u32,
    pub restarts_in_window: usize,
    pub silent_for_secs: u64,
}

/// Lock-free heartbeat handle for one watched component
#[derive(Clone)]
pub struct Heartbeat {
    epoch: Instant,
    /// Milliseconds since `epoch` of the latest beat
    pulse: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn beat(&self) {
        let at = self.epoch.elapsed().as_millis() as u64;
        self.pulse.fetch_max(at, Ordering::Relaxed);
    }
}

struct Entry {
    component: Arc<dyn Supervised>,
    state: HealthState,
    last_beat: Instant,
    pulse: Arc<AtomicU64>,
    consecutive_restarts: u32,
    restarts: VecDeque<Instant>,
    last_restart: Option<Instant>,
    next_restart_at: Option<Instant>,
}

enum Action {
    Restart(Arc<dyn Supervised>),
    Alert(AlertEvent),
}

/// Tracks heartbeats and restarts unresponsive components
pub struct Watchdog {
    grace: Duration,
    window: Duration,
    max_restarts: u32,
    check_interval: Duration,
    backoff: BackoffPolicy,
    router: Arc<AlertRouter>,
    epoch: Instant,
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl Watchdog {
    pub fn new(config: &SupervisorConfig, router: Arc<AlertRouter>) -> Self {
        Self {
            grace: Duration::from_secs(config.heartbeat_grace_secs),
            window: Duration::from_secs(config.restart_window_secs),
            max_restarts: config.max_restarts,
            check_interval: Duration::from_secs(config.check_interval_secs.max(1)),
            backoff: BackoffPolicy::from(&config.restart_backoff),
            router,
            epoch: Instant::now(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start watching; the component counts as having just heartbeated
    pub async fn watch(&self, component: Arc<dyn Supervised>) -> Heartbeat {
        let name = component.name().to_string();
        let pulse = Arc::new(AtomicU64::new(0));
        info!(component = %name, "Watching component");
        self.entries.lock().await.insert(
            name,
            Entry {
                component,
                state: HealthState::Healthy,
                last_beat: Instant::now(),
                pulse: pulse.clone(),
                consecutive_restarts: 0,
                restarts: VecDeque::new(),
                last_restart: None,
                next_restart_at: None,
            },
        );
        Heartbeat {
            epoch: self.epoch,
            pulse,
        }
    }

    /// Record a beat at a chosen instant, bypassing the component's handle
    #[cfg(test)]
    async fn heartbeat_at(&self, name: &str, at: Instant) {
        match self.entries.lock().await.get_mut(name) {
            Some(entry) => entry.last_beat = entry.last_beat.max(at),
            None => debug!(component = name, "Heartbeat from unwatched component"),
        }
    }

    pub async fn check_all(&self) {
        self.check_at(Instant::now()).await;
    }

    /// Advance every state machine to `now`, then run restarts and alerts
    pub async fn check_at(&self, now: Instant) {
        let mut actions = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            for (name, entry) in entries.iter_mut() {
                self.step(name, entry, now, &mut actions);
            }
        }

        for action in actions {
            match action {
                Action::Restart(component) => {
                    if let Err(e) = component.restart().await {
                        error!(component = component.name(), error = %e, "Restart failed");
                    }
                }
                Action::Alert(alert) => {
                    self.router.dispatch(alert).await;
                }
            }
        }
    }

    fn step(&self, name: &str, entry: &mut Entry, now: Instant, actions: &mut Vec<Action>) {
        let pulsed = self.epoch + Duration::from_millis(entry.pulse.load(Ordering::Relaxed));
        entry.last_beat = entry.last_beat.max(pulsed);
        let silent = now.saturating_duration_since(entry.last_beat);
        while let Some(oldest) = entry.restarts.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                entry.restarts.pop_front();
            } else {
                break;
            }
        }

        match entry.state {
            HealthState::Degraded => {}
            HealthState::Healthy => {
                if silent > self.grace {
                    let err = Error::ComponentUnresponsive(name.to_string());
                    warn!(component = name, silent_secs = silent.as_secs(), error = %err, "Component suspected");
                    entry.state = HealthState::Suspected;
                }
            }
            HealthState::Restarting => {
                let recovered = entry.last_restart.is_some_and(|r| entry.last_beat > r);
                if recovered {
                    info!(component = name, "Component recovered after restart");
                    entry.state = HealthState::Healthy;
                    entry.consecutive_restarts = 0;
                    entry.next_restart_at = None;
                    actions.push(Action::Alert(AlertEvent::component_recovered(name)));
                } else if entry
                    .last_restart
                    .is_some_and(|r| now.saturating_duration_since(r) > self.grace)
                {
                    entry.state = HealthState::Suspected;
                    self.try_restart(name, entry, now, actions);
                }
            }
            HealthState::Suspected => {
                if silent <= self.grace {
                    debug!(component = name, "Suspected component heartbeated again");
                    entry.state = HealthState::Healthy;
                } else {
                    self.try_restart(name, entry, now, actions);
                }
            }
        }
    }

    fn try_restart(&self, name: &str, entry: &mut Entry, now: Instant, actions: &mut Vec<Action>) {
        if entry.restarts.len() >= self.max_restarts as usize {
            let err = Error::RestartBudgetExhausted(name.to_string());
            error!(component = name, restarts = entry.restarts.len(), error = %err, "Component degraded");
            entry.state = HealthState::Degraded;
            actions.push(Action::Alert(AlertEvent::restart_budget_exhausted(
                name,
                entry.restarts.len() as u32,
            )));
            return;
        }
        if entry.next_restart_at.is_some_and(|at| now < at) {
            return;
        }

        let delay = self.backoff.delay(entry.consecutive_restarts);
        entry.consecutive_restarts += 1;
        entry.restarts.push_back(now);
        entry.last_restart = Some(now);
        entry.next_restart_at = Some(now + delay);
        entry.state = HealthState::Restarting;
        warn!(
            component = name,
            attempt = entry.consecutive_restarts,
            next_allowed_in_ms = delay.as_millis() as u64,
            "Restarting component"
        );
        actions.push(Action::Restart(entry.component.clone()));
    }

    pub async fn health(&self) -> Vec<ComponentHealth> {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .iter()
            .map(|(name, e)| {
                let pulsed = self.epoch + Duration::from_millis(e.pulse.load(Ordering::Relaxed));
                ComponentHealth {
                    name: name.clone(),
                    state: e.state,
                    consecutive_restarts: e.consecutive_restarts,
                    restarts_in_window: e.restarts.len(),
                    silent_for_secs: now.saturating_duration_since(e.last_beat.max(pulsed)).as_secs(),
                }
            })
            .collect()
    }

    /// Periodic check loop, independent of the supervised workers
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.check_all().await,
            }
        }
    }
}

type LoopFactory = dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync;

/// A background loop that can be torn down and spawned again
pub struct SupervisedLoop {
    name: String,
    factory: Box<LoopFactory>,
    shutdown: CancellationToken,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SupervisedLoop {
    /// `factory` builds the loop future from a per-incarnation token
    pub fn new<F>(name: impl Into<String>, shutdown: CancellationToken, factory: F) -> Self
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            shutdown,
            running: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if let Some((token, handle)) = running.take() {
            token.cancel();
            handle.abort();
        }
        let token = self.shutdown.child_token();
        let handle = tokio::spawn((self.factory)(token.clone()));
        *running = Some((token, handle));
    }

    pub async fn stop(&self) {
        if let Some((token, handle)) = self.running.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(component = %self.name, error = %e, "Loop ended abnormally");
                }
            }
        }
    }
}

#[async_trait]
impl Supervised for SupervisedLoop {
    fn name(&self) -> &str {
        &self.name
    }

    async fn restart(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.start().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertConfig, RetryConfig};
    use crate::models::{MatchedRule, Severity};
    use crate::priority::testing::RecordingSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        restarts: AtomicU32,
    }

    #[async_trait]
    impl Supervised for Flaky {
        fn name(&self) -> &str {
            "scheduler"
        }

        async fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            check_interval_secs: 1,
            heartbeat_grace_secs: 10,
            max_restarts: 3,
            restart_window_secs: 3600,
            restart_backoff: RetryConfig {
                base_delay_ms: 1_000,
                factor: 2.0,
                max_delay_ms: 8_000,
                max_attempts: 5,
            },
        }
    }

    async fn setup() -> (Watchdog, Arc<Flaky>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let router = Arc::new(AlertRouter::new(sink.clone(), &AlertConfig::default()));
        let watchdog = Watchdog::new(&config(), router);
        let flaky = Arc::new(Flaky {
            restarts: AtomicU32::new(0),
        });
        watchdog.watch(flaky.clone()).await;
        (watchdog, flaky, sink)
    }

    async fn state(watchdog: &Watchdog) -> HealthState {
        watchdog.health().await[0].state
    }

    #[tokio::test]
    async fn test_restart_budget_yields_one_critical_alert() {
        let (watchdog, flaky, sink) = setup().await;
        let start = Instant::now();
        for step in 1..=200u64 {
            watchdog.check_at(start + Duration::from_secs(step * 5)).await;
        }

        assert_eq!(flaky.restarts.load(Ordering::SeqCst), 3);
        assert_eq!(state(&watchdog).await, HealthState::Degraded);
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(matches!(
            alerts[0].matched_rule,
            MatchedRule::RestartBudgetExhausted { .. }
        ));
    }

    #[tokio::test]
    async fn test_suspected_then_healthy_without_restart() {
        let (watchdog, flaky, _sink) = setup().await;
        let start = Instant::now();
        watchdog.check_at(start + Duration::from_secs(11)).await;
        assert_eq!(state(&watchdog).await, HealthState::Suspected);

        watchdog
            .heartbeat_at("scheduler", start + Duration::from_secs(12))
            .await;
        watchdog.check_at(start + Duration::from_secs(13)).await;
        assert_eq!(state(&watchdog).await, HealthState::Healthy);
        assert_eq!(flaky.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_after_restart_recovers_and_resets() {
        let (watchdog, flaky, sink) = setup().await;
        let start = Instant::now();
        watchdog.check_at(start + Duration::from_secs(11)).await;
        watchdog.check_at(start + Duration::from_secs(12)).await;
        assert_eq!(state(&watchdog).await, HealthState::Restarting);
        assert_eq!(flaky.restarts.load(Ordering::SeqCst), 1);

        watchdog
            .heartbeat_at("scheduler", start + Duration::from_secs(13))
            .await;
        watchdog.check_at(start + Duration::from_secs(14)).await;
        assert_eq!(state(&watchdog).await, HealthState::Healthy);
        assert_eq!(watchdog.health().await[0].consecutive_restarts, 0);
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(
            alerts[0].matched_rule,
            MatchedRule::ComponentRecovered { .. }
        ));
    }

    #[tokio::test]
    async fn test_restarts_respect_backoff() {
        let (watchdog, flaky, _sink) = setup().await;
        let start = Instant::now();
        // Suspect at 11s, restart at 12s; silent past grace again only after 22s
        watchdog.check_at(start + Duration::from_secs(11)).await;
        watchdog.check_at(start + Duration::from_secs(12)).await;
        watchdog.check_at(start + Duration::from_secs(12) + Duration::from_millis(500)).await;
        assert_eq!(flaky.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_supervised_loop_restarts_task() {
        let counter = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();
        let looped = {
            let counter = counter.clone();
            SupervisedLoop::new("worker", shutdown.clone(), move |token| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    token.cancelled().await;
                })
            })
        };
        looped.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        looped.restart().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        looped.stop().await;
        assert!(matches!(looped.restart().await, Err(Error::Cancelled)));
    }
}
