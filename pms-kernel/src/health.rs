use crate::automation::operation::OperationHandle;
use crate::control::Topics;
use crate::monitor::{HealthStatus, MonitorReport};
use crate::mqtt::Publisher;
use crate::scheduler::{DeviceScheduler, DeviceStats};
use crate::shutdown::wait_or_cancel;
use crate::state::{new_state, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const STATUS_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub devices_tracked: usize,
    pub unhealthy_devices: Vec<String>,
    pub monitor_status: HealthStatus,
    pub memory_usage_mb: Option<f64>,
    pub devices: Vec<DeviceStats>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: new_state("connecting".to_string()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, scheduler: &DeviceScheduler, monitor: &Shared<MonitorReport>) -> KernelHealth {
        let report = monitor.lock().clone();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            devices_tracked: scheduler.registry().len(),
            unhealthy_devices: scheduler.unhealthy_devices(),
            monitor_status: report.status,
            memory_usage_mb: report.latest.as_ref().map(|s| s.memory_mb()),
            devices: scheduler.stats(),
        }
    }
}

/// Publication périodique des statuts : santé du noyau, mode d'opération, seuils
pub struct StatusPublisher {
    publisher: Arc<dyn Publisher>,
    topics: Topics,
    operations: OperationHandle,
    scheduler: DeviceScheduler,
    monitor: Shared<MonitorReport>,
    health: HealthTracker,
}

impl StatusPublisher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topics: Topics,
        operations: OperationHandle,
        scheduler: DeviceScheduler,
        monitor: Shared<MonitorReport>,
        health: HealthTracker,
    ) -> Self {
        Self { publisher, topics, operations, scheduler, monitor, health }
    }

    async fn publish<T: Serialize>(&self, topic: &str, value: &T) {
        let body = match serde_json::to_value(value) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, %topic, "status not serializable");
                return;
            }
        };
        if let Err(e) = self.publisher.publish_json(topic, &body, true).await {
            warn!(error = %e, %topic, "status publish failed");
        }
    }

    pub async fn publish_operation_status(&self) {
        self.publish(&self.topics.operation_status(), &self.operations.status()).await;
    }

    pub async fn publish_all(&self) {
        let health = self.health.get_health(&self.scheduler, &self.monitor);
        self.publish(&self.topics.kernel_health(), &health).await;
        self.publish_operation_status().await;
        self.publish(&self.topics.threshold_status(), &self.operations.thresholds()).await;
        debug!(uptime = health.uptime_seconds, unhealthy = health.unhealthy_devices.len(), "published status");
    }

    /// Démarre la publication auto, premier envoi immédiat
    pub fn spawn(self: Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        task::spawn(async move {
            loop {
                self.publish_all().await;
                if wait_or_cancel(&shutdown, period).await.is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_status_transitions() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.mqtt_status(), "connecting");
        tracker.increment_reconnects();
        tracker.increment_reconnects();
        assert_eq!(tracker.mqtt_status(), "reconnecting");
        tracker.mark_mqtt_connected();
        assert_eq!(tracker.mqtt_status(), "connected");
        assert_eq!(tracker.mqtt_reconnects.load(Ordering::Relaxed), 2);
    }
}
