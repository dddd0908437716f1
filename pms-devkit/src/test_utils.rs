/*!
Test Harness du noyau PMS

Assemble un noyau complet sur équipements scriptés :
- batterie `bms1`, onduleur `pcs1`, convertisseur solaire `dcdc1` (poll 1s)
- ordonnanceur (non démarré), gestionnaire de mode à la demande
- routeur de contrôle dont les réponses partent dans le `MockMqttClient`
*/

use crate::mqtt_stub::MockMqttClient;
use crate::scripted_device::ScriptedDevice;
use anyhow::Result;
use pms_kernel::automation::operation::{OperationHandle, OperationManager};
use pms_kernel::config::{DeviceConf, KernelConfig};
use pms_kernel::control::{ControlResponse, ControlRouter, Routed, Topics};
use pms_kernel::devices::DeviceRegistry;
use pms_kernel::models::DeviceType;
use pms_kernel::mqtt::Publisher;
use pms_kernel::scheduler::{DeviceScheduler, SchedulerSettings};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct TestHarness {
    pub config: KernelConfig,
    pub battery: ScriptedDevice,
    pub converter: ScriptedDevice,
    pub solar: ScriptedDevice,
    pub mqtt_client: MockMqttClient,
    pub root: CancellationToken,
    pub topics: Topics,
    registry: DeviceRegistry,
    scheduler: DeviceScheduler,
}

/// Configuration de test : auto mode autorisé, équipements scriptés
pub fn test_config() -> KernelConfig {
    let mut cfg = KernelConfig::default();
    cfg.auto_mode.enabled = true;
    cfg.devices = vec![
        DeviceConf { poll_interval_secs: 1.0, ..DeviceConf::simulated("bms1", DeviceType::Battery) },
        DeviceConf { poll_interval_secs: 1.0, ..DeviceConf::simulated("pcs1", DeviceType::Converter) },
        DeviceConf { poll_interval_secs: 1.0, ..DeviceConf::simulated("dcdc1", DeviceType::SolarLink) },
    ];
    cfg
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("pms_kernel=debug"))
        .with_test_writer()
        .try_init()
        .ok();
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        init_tracing();
        let battery = ScriptedDevice::new("bms1", DeviceType::Battery);
        let converter = ScriptedDevice::new("pcs1", DeviceType::Converter);
        let solar = ScriptedDevice::new("dcdc1", DeviceType::SolarLink);
        let registry = DeviceRegistry::new(vec![battery.handle(), converter.handle(), solar.handle()]);
        let root = CancellationToken::new();
        let scheduler = DeviceScheduler::new(registry.clone(), SchedulerSettings::from(&config.scheduler), &root);
        let topics = Topics::new(&config.mqtt.base_topic);
        Self {
            config,
            battery,
            converter,
            solar,
            mqtt_client: MockMqttClient::new(),
            root,
            topics,
            registry,
            scheduler,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &DeviceScheduler {
        &self.scheduler
    }

    /// Démarre le gestionnaire de mode (automate SOC + séquenceur de défaut)
    pub fn start_operations(&self) -> OperationHandle {
        OperationManager::start(&self.config, &self.scheduler, &self.root)
    }

    pub fn router(&self, operations: &OperationHandle) -> ControlRouter {
        ControlRouter::new(
            self.topics.clone(),
            operations.clone(),
            Duration::from_secs(self.config.control.command_timeout_secs),
        )
    }

    /// Injecte une requête de contrôle et publie la réponse dans le mock
    pub async fn send(&self, router: &ControlRouter, topic: &str, body: &Value) -> Result<Option<Routed>> {
        let payload = serde_json::to_vec(body)?;
        let routed = router.handle(topic, &payload).await;
        if let Some(routed) = &routed {
            let response = serde_json::to_value(&routed.response)?;
            self.mqtt_client.publish_json(&routed.topic, &response, false).await?;
        }
        Ok(routed)
    }

    /// Réponses publiées sur un topic, décodées
    pub fn responses(&self, topic: &str) -> Vec<ControlResponse> {
        self.mqtt_client
            .json_messages(topic)
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    /// Attend un message sur un topic (temps tokio, compatible `start_paused`)
    pub async fn wait_for_message(&self, topic: &str, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(msg) = self.mqtt_client.json_messages(topic).pop() {
                return Some(msg);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    pub async fn shutdown(&self) {
        self.root.cancel();
        self.scheduler.stop().await;
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
