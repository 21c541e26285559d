//! Priority Evaluator
//!
//! Consumes ingestion events, applies watch rules and routes the resulting
//! alerts to the notification sink. Delivered alerts are also kept in a
//! bounded in-memory history for priority match queries.

mod sink;

pub use sink::*;

use crate::config::AlertConfig;
use crate::error::Result;
use crate::models::{AlertEvent, ChangeKind, IngestionEvent, WatchRule};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One alert per matched rule, for inserted or updated records only
pub fn evaluate(event: &IngestionEvent, rules: &[WatchRule]) -> Vec<AlertEvent> {
    if event.change == ChangeKind::Unchanged {
        return Vec::new();
    }
    let mut seen: Vec<&WatchRule> = Vec::new();
    let mut alerts = Vec::new();
    for rule in rules {
        if seen.contains(&rule) || !rule.matches(&event.record) {
            continue;
        }
        seen.push(rule);
        alerts.push(AlertEvent::watch_match(&event.record, rule, event.change));
    }
    alerts
}

/// Bounded history of emitted alerts, oldest evicted first
pub struct AlertLog {
    capacity: usize,
    entries: RwLock<VecDeque<AlertEvent>>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, alert: AlertEvent) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
    }

    /// Alerts emitted at or after `since`, oldest first
    pub async fn since(&self, since: Option<DateTime<Utc>>) -> Vec<AlertEvent> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|a| since.map_or(true, |s| a.emitted_at >= s))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Delivers alerts to the sink with bounded attempts and records them
pub struct AlertRouter {
    sink: Arc<dyn NotificationSink>,
    log: Arc<AlertLog>,
    attempts: u32,
}

impl AlertRouter {
    pub fn new(sink: Arc<dyn NotificationSink>, config: &AlertConfig) -> Self {
        Self {
            sink,
            log: Arc::new(AlertLog::new(config.history_capacity)),
            attempts: config.delivery_attempts.max(1),
        }
    }

    pub fn log(&self) -> &Arc<AlertLog> {
        &self.log
    }

    /// Never fails: a delivery that keeps failing is logged and dropped
    pub async fn dispatch(&self, alert: AlertEvent) -> bool {
        self.log.push(alert.clone()).await;
        for attempt in 1..=self.attempts {
            match self.sink.deliver(&alert).await {
                Ok(()) => return true,
                Err(e) if attempt < self.attempts => {
                    debug!(sink = self.sink.name(), attempt, error = %e, "Alert delivery failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => {
                    warn!(
                        sink = self.sink.name(),
                        resource_id = %alert.resource_id,
                        error = %e,
                        "Alert delivery failed, dropping"
                    );
                }
            }
        }
        false
    }
}

/// Applies watch rules to the ingestion event stream
pub struct PriorityEvaluator {
    rules: Vec<WatchRule>,
    router: Arc<AlertRouter>,
    events: Mutex<mpsc::UnboundedReceiver<IngestionEvent>>,
}

impl PriorityEvaluator {
    pub fn new(
        rules: Vec<WatchRule>,
        router: Arc<AlertRouter>,
        events: mpsc::UnboundedReceiver<IngestionEvent>,
    ) -> Self {
        Self {
            rules,
            router,
            events: Mutex::new(events),
        }
    }

    pub fn rules(&self) -> &[WatchRule] {
        &self.rules
    }

    /// Evaluate one event and route its alerts; returns how many fired
    pub async fn handle(&self, event: &IngestionEvent) -> usize {
        let alerts = evaluate(event, &self.rules);
        let fired = alerts.len();
        for alert in alerts {
            info!(resource_id = %alert.resource_id, rule = ?alert.matched_rule, "Priority match");
            self.router.dispatch(alert).await;
        }
        fired
    }

    /// Evaluate events already queued, for callers not running the loop.
    ///
    /// Returns 0 without waiting if the loop currently owns the stream.
    pub async fn drain_pending(&self) -> usize {
        let Ok(mut events) = self.events.try_lock() else {
            return 0;
        };
        let mut fired = 0;
        while let Ok(event) = events.try_recv() {
            fired += self.handle(&event).await;
        }
        fired
    }

    /// Consume events until cancelled or the channel closes.
    ///
    /// `beat` is called on every event and on every idle `tick`.
    pub async fn run<F>(&self, cancel: CancellationToken, tick: Duration, beat: F) -> Result<()>
    where
        F: Fn() + Send + Sync,
    {
        let mut events = self.events.lock().await;
        let mut ticker = tokio::time::interval(tick);
        info!(rules = self.rules.len(), "Priority evaluator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Priority evaluator stopping");
                    return Ok(());
                }
                _ = ticker.tick() => beat(),
                event = events.recv() => {
                    beat();
                    match event {
                        Some(event) => {
                            self.handle(&event).await;
                        }
                        None => {
                            error!("Ingestion event stream closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records deliveries; can be switched to fail
    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: std::sync::Mutex<Vec<AlertEvent>>,
        pub failing: AtomicBool,
    }

    impl RecordingSink {
        pub fn alerts(&self) -> Vec<AlertEvent> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, alert: &AlertEvent) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::DeliveryFailed("sink offline".to_string()));
            }
            self.delivered.lock().unwrap().push(alert.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }
}
