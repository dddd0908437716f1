use crate::models::{Device, DeviceType, Endpoint};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("device '{device}': unsupported driver '{driver}'")]
    UnsupportedDriver { device: String, driver: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub devices: Vec<DeviceConf>,
    pub scheduler: SchedulerConf,
    pub monitoring: MonitoringConf,
    pub recovery: RecoveryConf,
    pub auto_mode: AutoModeConf,
    pub fault_recovery: FaultRecoveryConf,
    pub control: ControlConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub base_topic: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConf {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(alias = "ip", default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(alias = "slave_id", default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(alias = "poll_interval", default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_driver() -> String { "simulated".into() }
fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 502 }
fn default_unit_id() -> u8 { 1 }
fn default_poll_interval() -> f64 { 5.0 }
fn default_true() -> bool { true }

pub fn default_thread_threshold() -> u32 {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    50 + cores as u32
}

impl DeviceConf {
    pub fn simulated(name: &str, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            device_type,
            driver: default_driver(),
            host: default_host(),
            port: default_port(),
            unit_id: default_unit_id(),
            poll_interval_secs: default_poll_interval(),
            active: true,
        }
    }

    pub fn to_device(&self) -> Device {
        Device {
            id: self.name.clone(),
            device_type: self.device_type,
            endpoint: Endpoint { host: self.host.clone(), port: self.port, unit_id: self.unit_id },
            poll_interval: Duration::from_secs_f64(self.poll_interval_secs),
            active: self.active,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConf {
    /// Nombre d'échecs consécutifs tolérés avant de déclarer l'équipement malade
    pub unhealthy_after: u32,
    pub health_check_interval_secs: u64,
    /// Contrôles propres consécutifs avant remise à zéro des compteurs
    pub reset_threshold: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConf {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub memory_threshold_mb: f64,
    pub cpu_threshold_percent: f32,
    /// Par défaut 50 + nombre de cœurs (le runtime tokio lance un worker par cœur)
    pub thread_threshold: u32,
    /// Croissance moyenne par échantillon au-delà de laquelle on suspecte une fuite
    pub memory_growth_mb: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecoveryConf {
    pub enabled: bool,
    pub max_attempts: u32,
    pub cooldown_seconds: u64,
    pub restart_on_emergency: bool,
    pub healthy_samples_to_reset: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AutoModeConf {
    pub enabled: bool,
    pub soc_field: String,
    #[serde(flatten)]
    pub thresholds: ThresholdConfig,
}

/// Seuils de l'automate SOC. Valeur immuable, remplacée en bloc après validation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ThresholdConfig {
    #[serde(rename = "soc_high_threshold")]
    pub soc_high: f64,
    #[serde(rename = "soc_low_threshold")]
    pub soc_low: f64,
    #[serde(rename = "soc_charge_stop_threshold")]
    pub soc_charge_stop: f64,
    #[serde(rename = "dcdc_standby_time")]
    pub standby_secs: u64,
    #[serde(rename = "command_interval")]
    pub command_interval_secs: u64,
    /// kW
    pub charging_power: f64,
}

/// Mise à jour reçue sur `pms/control/threshold_config`
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ThresholdUpdate {
    pub soc_high_threshold: Option<f64>,
    pub soc_low_threshold: Option<f64>,
    pub soc_charge_stop_threshold: Option<f64>,
    pub dcdc_standby_time: Option<u64>,
    pub command_interval: Option<u64>,
    pub charging_power: Option<f64>,
}

impl ThresholdConfig {
    pub fn standby_duration(&self) -> Duration {
        Duration::from_secs(self.standby_secs)
    }

    pub fn command_interval(&self) -> Duration {
        Duration::from_secs(self.command_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !(in_range(self.soc_low) && in_range(self.soc_high) && in_range(self.soc_charge_stop)) {
            return Err(ConfigError::Invalid("SOC thresholds must be within 0..=100".into()));
        }
        if self.soc_low >= self.soc_high {
            return Err(ConfigError::Invalid(format!(
                "soc_low_threshold ({}) must be below soc_high_threshold ({})",
                self.soc_low, self.soc_high
            )));
        }
        if self.soc_charge_stop <= self.soc_low || self.soc_charge_stop > self.soc_high {
            return Err(ConfigError::Invalid(format!(
                "soc_charge_stop_threshold ({}) must be within ({}, {}]",
                self.soc_charge_stop, self.soc_low, self.soc_high
            )));
        }
        if self.charging_power <= 0.0 {
            return Err(ConfigError::Invalid("charging_power must be positive".into()));
        }
        if self.standby_secs == 0 {
            return Err(ConfigError::Invalid("dcdc_standby_time must be positive".into()));
        }
        Ok(())
    }

    /// Produit la nouvelle configuration; les trois seuils SOC sont obligatoires.
    pub fn apply(&self, update: &ThresholdUpdate) -> Result<ThresholdConfig, ConfigError> {
        let next = ThresholdConfig {
            soc_high: update.soc_high_threshold.ok_or(ConfigError::MissingKey("soc_high_threshold"))?,
            soc_low: update.soc_low_threshold.ok_or(ConfigError::MissingKey("soc_low_threshold"))?,
            soc_charge_stop: update
                .soc_charge_stop_threshold
                .ok_or(ConfigError::MissingKey("soc_charge_stop_threshold"))?,
            standby_secs: update.dcdc_standby_time.unwrap_or(self.standby_secs),
            command_interval_secs: update.command_interval.unwrap_or(self.command_interval_secs),
            charging_power: update.charging_power.unwrap_or(self.charging_power),
        };
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FaultRecoveryConf {
    pub enabled: bool,
    pub field: String,
    pub bit: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConf {
    pub command_timeout_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            http: HttpConf::default(),
            devices: vec![
                DeviceConf::simulated("bms1", DeviceType::Battery),
                DeviceConf::simulated("pcs1", DeviceType::Converter),
                DeviceConf::simulated("dcdc1", DeviceType::SolarLink),
            ],
            scheduler: SchedulerConf::default(),
            monitoring: MonitoringConf::default(),
            recovery: RecoveryConf::default(),
            auto_mode: AutoModeConf::default(),
            fault_recovery: FaultRecoveryConf::default(),
            control: ControlConf::default(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "pms-kernel".into(),
            base_topic: "pms".into(),
            keep_alive_secs: 15,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self { unhealthy_after: 5, health_check_interval_secs: 30, reset_threshold: 6 }
    }
}

impl Default for MonitoringConf {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 10,
            memory_threshold_mb: 500.0,
            cpu_threshold_percent: 80.0,
            thread_threshold: default_thread_threshold(),
            memory_growth_mb: 10.0,
        }
    }
}

impl Default for RecoveryConf {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            cooldown_seconds: 60,
            restart_on_emergency: false,
            healthy_samples_to_reset: None,
        }
    }
}

impl Default for AutoModeConf {
    fn default() -> Self {
        Self { enabled: false, soc_field: "battery_soc".into(), thresholds: ThresholdConfig::default() }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            soc_high: 88.0,
            soc_low: 5.0,
            soc_charge_stop: 25.0,
            standby_secs: 30,
            command_interval_secs: 5,
            charging_power: 10.0,
        }
    }
}

impl Default for FaultRecoveryConf {
    fn default() -> Self {
        Self { enabled: true, field: "error_code_2".into(), bit: 3 }
    }
}

impl Default for ControlConf {
    fn default() -> Self {
        Self { command_timeout_secs: 10 }
    }
}

impl KernelConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: KernelConfig = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut types = HashSet::new();
        for dev in &self.devices {
            if !names.insert(dev.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate device name '{}'", dev.name)));
            }
            if !types.insert(dev.device_type) {
                return Err(ConfigError::Invalid(format!("more than one {} device", dev.device_type)));
            }
            if !(dev.poll_interval_secs.is_finite() && dev.poll_interval_secs > 0.0) {
                return Err(ConfigError::Invalid(format!("device '{}': poll_interval must be positive", dev.name)));
            }
        }
        if self.scheduler.health_check_interval_secs == 0 || self.monitoring.check_interval_secs == 0 {
            return Err(ConfigError::Invalid("check intervals must be positive".into()));
        }
        if self.recovery.max_attempts == 0 {
            return Err(ConfigError::Invalid("recovery.max_attempts must be at least 1".into()));
        }
        if self.fault_recovery.bit >= 32 {
            return Err(ConfigError::Invalid("fault_recovery.bit must be below 32".into()));
        }
        self.auto_mode.thresholds.validate()
    }

    pub fn device(&self, device_type: DeviceType) -> Option<&DeviceConf> {
        self.devices.iter().find(|d| d.device_type == device_type)
    }
}

pub async fn load_config_from(path: &str) -> Result<KernelConfig, ConfigError> {
    if !Path::new(path).exists() {
        warn!(path, "no configuration file, using defaults");
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
    let cfg = KernelConfig::from_yaml_str(&txt)?;
    info!(path, devices = cfg.devices.len(), "configuration loaded");
    Ok(cfg)
}

/// Charge la configuration désignée par `PMS_CONFIG` (défaut `pms.yaml`)
pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("PMS_CONFIG").unwrap_or_else(|_| "pms.yaml".into());
    load_config_from(&path).await
}
