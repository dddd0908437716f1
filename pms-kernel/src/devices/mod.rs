/**
 * EQUIPEMENTS - Contrat d'accès aux batteries, onduleurs et convertisseurs solaires
 *
 * RÔLE :
 * Le noyau ne parle jamais Modbus directement. Chaque équipement est un `DeviceHandle`
 * (poll + command) fourni par un driver choisi au chargement de la configuration.
 *
 * FONCTIONNEMENT :
 * - `DeviceLink` enveloppe un handle et sérialise les écritures vers un même équipement
 * - Une commande sans réponse sous `command_timeout` échoue en `Timeout` et libère le verrou
 * - `DeviceRegistry` indexe les liens par nom, immuable après le démarrage
 * - `build_registry` instancie les drivers déclarés (seul `simulated` est embarqué)
 */

pub mod simulated;

use crate::config::{ConfigError, KernelConfig};
use crate::models::{Device, DeviceType, TelemetrySnapshot};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Délai maximal d'une écriture, au-delà de la fenêtre de réponse du canal de contrôle (10s)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("device '{device}' does not support '{command}'")]
    Unsupported { device: String, command: &'static str },
    #[error("unknown register address {0:#06x}")]
    UnknownRegister(u16),
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Commandes nommées par type d'équipement, plus l'écriture brute de registre.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    // onduleur (+ `Standby` partagé avec le convertisseur solaire)
    Standby,
    Independent,
    Stop,
    Charge { power_kw: f64 },
    ResetFaults,
    // convertisseur solaire
    Reset,
    SolarCharge,
    // batterie
    ResetErrors,
    Contactor { closed: bool },
    ResetSystemLock,
    WriteRegister { address: u16, value: u16 },
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Standby => "standby",
            DeviceCommand::Independent => "independent",
            DeviceCommand::Stop => "stop",
            DeviceCommand::Charge { .. } => "charge",
            DeviceCommand::ResetFaults => "reset_faults",
            DeviceCommand::Reset => "reset",
            DeviceCommand::SolarCharge => "solar_charge",
            DeviceCommand::ResetErrors => "reset_errors",
            DeviceCommand::Contactor { .. } => "contactor",
            DeviceCommand::ResetSystemLock => "reset_system_lock",
            DeviceCommand::WriteRegister { .. } => "write_register",
        }
    }

    pub fn supported_by(&self, device_type: DeviceType) -> bool {
        use DeviceCommand::*;
        match (self, device_type) {
            (WriteRegister { .. }, _) => true,
            (Standby, DeviceType::Converter | DeviceType::SolarLink) => true,
            (Independent | Stop | Charge { .. } | ResetFaults, DeviceType::Converter) => true,
            (Reset | SolarCharge, DeviceType::SolarLink) => true,
            (ResetErrors | Contactor { .. } | ResetSystemLock, DeviceType::Battery) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::Charge { power_kw } => write!(f, "charge({power_kw} kW)"),
            DeviceCommand::Contactor { closed } => write!(f, "contactor({})", if *closed { "on" } else { "off" }),
            DeviceCommand::WriteRegister { address, value } => write!(f, "write_register({address:#06x}={value})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Acquittement renvoyé par l'équipement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub message: String,
}

impl Ack {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
pub trait DeviceHandle: Send + Sync {
    fn device(&self) -> &Device;
    async fn poll(&self) -> Result<TelemetrySnapshot, DeviceError>;
    async fn command(&self, command: &DeviceCommand) -> Result<Ack, DeviceError>;
}

/// Handle partagé + file d'écriture par équipement.
///
/// Deux séquences (automate SOC, récupération défaut comm) peuvent viser le même
/// équipement : chaque commande prend le verrou, jamais deux écritures en parallèle.
#[derive(Clone)]
pub struct DeviceLink {
    handle: Arc<dyn DeviceHandle>,
    writes: Arc<tokio::sync::Mutex<()>>,
    command_timeout: Duration,
}

impl DeviceLink {
    pub fn new(handle: Arc<dyn DeviceHandle>) -> Self {
        Self::with_command_timeout(handle, DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_command_timeout(handle: Arc<dyn DeviceHandle>, command_timeout: Duration) -> Self {
        Self { handle, writes: Arc::new(tokio::sync::Mutex::new(())), command_timeout }
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn device(&self) -> &Device {
        self.handle.device()
    }

    pub fn id(&self) -> &str {
        &self.handle.device().id
    }

    pub async fn poll(&self) -> Result<TelemetrySnapshot, DeviceError> {
        self.handle.poll().await
    }

    pub async fn command(&self, command: &DeviceCommand) -> Result<Ack, DeviceError> {
        let device = self.handle.device();
        if !command.supported_by(device.device_type) {
            return Err(DeviceError::Unsupported { device: device.id.clone(), command: command.name() });
        }
        let _guard = self.writes.lock().await;
        debug!(device = %device.id, %command, "issuing command");
        match tokio::time::timeout(self.command_timeout, self.handle.command(command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(device = %device.id, %command, timeout = ?self.command_timeout, "command timed out");
                Err(DeviceError::Timeout(self.command_timeout))
            }
        }
    }
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink").field("device", self.device()).finish()
    }
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    links: Arc<BTreeMap<String, DeviceLink>>,
}

impl DeviceRegistry {
    pub fn new(handles: Vec<Arc<dyn DeviceHandle>>) -> Self {
        let links = handles
            .into_iter()
            .map(|h| (h.device().id.clone(), DeviceLink::new(h)))
            .collect();
        Self { links: Arc::new(links) }
    }

    pub fn get(&self, id: &str) -> Option<DeviceLink> {
        self.links.get(id).cloned()
    }

    /// Premier équipement du type demandé (la configuration en garantit au plus un)
    pub fn first_of(&self, device_type: DeviceType) -> Option<DeviceLink> {
        self.links.values().find(|l| l.device().device_type == device_type).cloned()
    }

    pub fn links(&self) -> impl Iterator<Item = &DeviceLink> {
        self.links.values()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.links.values().map(|l| l.device().clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Instancie les drivers déclarés dans la configuration
pub fn build_registry(cfg: &KernelConfig) -> Result<DeviceRegistry, ConfigError> {
    let plant = simulated::SimulatedPlant::new();
    let mut handles: Vec<Arc<dyn DeviceHandle>> = Vec::with_capacity(cfg.devices.len());
    for dev in &cfg.devices {
        match dev.driver.as_str() {
            "simulated" => handles.push(Arc::new(plant.attach(dev.to_device()))),
            other => {
                return Err(ConfigError::UnsupportedDriver { device: dev.name.clone(), driver: other.to_string() })
            }
        }
    }
    Ok(DeviceRegistry::new(handles))
}
