//! Notification sinks

use crate::error::Result;
use crate::models::{AlertEvent, Severity};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Destination for alert events; delivery may fail with `DeliveryFailed`
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, alert: &AlertEvent) -> Result<()>;

    fn name(&self) -> &str;
}

/// Writes alerts to the log at a level matching their severity
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, alert: &AlertEvent) -> Result<()> {
        let resource_type = alert
            .resource_type
            .map(|t| t.to_string())
            .unwrap_or_default();
        match alert.severity {
            Severity::Info => info!(
                resource_id = %alert.resource_id,
                resource_type = %resource_type,
                "ALERT {}", alert.message
            ),
            Severity::Warning => warn!(
                resource_id = %alert.resource_id,
                resource_type = %resource_type,
                "ALERT {}", alert.message
            ),
            Severity::Critical => error!(
                resource_id = %alert.resource_id,
                resource_type = %resource_type,
                "ALERT {}", alert.message
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
