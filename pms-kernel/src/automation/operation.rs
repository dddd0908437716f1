/**
 * GESTIONNAIRE DE MODE - Basic / Auto + routage des commandes
 *
 * RÔLE :
 * Seul propriétaire du mode courant et du token de marche de l'automate SOC.
 * Toutes les demandes externes arrivent par messages (`OperationRequest`);
 * les lecteurs consultent des copies via `watch`.
 *
 * FONCTIONNEMENT :
 * - Basic : commandes directes autorisées, automate SOC arrêté
 * - Auto : commandes directes refusées, automate démarrable
 * - Passage en Basic pendant une séquence : la séquence est abandonnée, jamais reprise
 * - La récupération du défaut de communication tourne dans les deux modes
 */

use super::fault_recovery::{CommFaultSequencer, SequencerStatus};
use super::soc::{SocController, SocInput, SocStatus};
use crate::config::{KernelConfig, ThresholdConfig, ThresholdUpdate};
use crate::control::ControlError;
use crate::devices::{Ack, DeviceCommand, DeviceRegistry};
use crate::models::DeviceType;
use crate::scheduler::DeviceScheduler;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Basic,
    Auto,
}

impl FromStr for OperationMode {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(OperationMode::Basic),
            "auto" => Ok(OperationMode::Auto),
            other => Err(ControlError::UnsupportedMode(other.to_string())),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ControlError>>;

#[derive(Debug)]
pub enum OperationRequest {
    SetMode { mode: OperationMode, reply: Reply<String> },
    StartAuto { reply: Reply<String> },
    StopAuto { reply: Reply<String> },
    UpdateThresholds { update: ThresholdUpdate, reply: Reply<ThresholdConfig> },
    DeviceCommand { device: String, command: DeviceCommand, reply: Reply<Ack> },
}

#[derive(Debug, Clone, Serialize)]
pub struct BasicModeStatus {
    pub active: bool,
    pub available_devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoModeStatus {
    pub available: bool,
    #[serde(flatten)]
    pub controller: Option<SocStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationStatus {
    pub current_mode: OperationMode,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub basic_mode: BasicModeStatus,
    pub auto_mode: AutoModeStatus,
    pub fault_recovery: Option<SequencerStatus>,
}

struct SocParts {
    input: mpsc::Sender<SocInput>,
    status: watch::Receiver<SocStatus>,
}

pub struct OperationManager {
    registry: DeviceRegistry,
    auto_enabled: bool,
    mode: watch::Sender<OperationMode>,
    thresholds: watch::Sender<ThresholdConfig>,
    soc: Option<SocParts>,
    run: Option<CancellationToken>,
    shutdown: CancellationToken,
}

impl OperationManager {
    /// Construit l'automate SOC et le séquenceur de défaut, lance les tâches, retourne la poignée.
    pub fn start(cfg: &KernelConfig, scheduler: &DeviceScheduler, shutdown: &CancellationToken) -> OperationHandle {
        let registry = scheduler.registry().clone();
        let shutdown = shutdown.child_token();
        let thresholds = cfg.auto_mode.thresholds.clone();

        let battery = registry.first_of(DeviceType::Battery);
        let converter = registry.first_of(DeviceType::Converter);

        let soc = match (&battery, &converter) {
            (Some(battery), Some(converter)) => {
                let (controller, status) = SocController::new(
                    converter.clone(),
                    registry.first_of(DeviceType::SolarLink),
                    battery,
                    &cfg.auto_mode.soc_field,
                    thresholds.clone(),
                );
                let (input, inputs) = mpsc::channel(16);
                controller.spawn(inputs, scheduler.subscribe(), shutdown.clone());
                Some(SocParts { input, status })
            }
            _ => {
                warn!("auto mode unavailable: a battery and a converter are required");
                None
            }
        };

        let sequencer = match (&battery, &converter) {
            (Some(battery), Some(converter)) if cfg.fault_recovery.enabled => {
                let sequencer = CommFaultSequencer::new(battery.clone(), converter.clone(), &cfg.fault_recovery);
                sequencer.spawn(scheduler.subscribe(), shutdown.clone());
                Some(sequencer)
            }
            _ => None,
        };

        let (mode_tx, mode_rx) = watch::channel(OperationMode::Basic);
        let (thresholds_tx, thresholds_rx) = watch::channel(thresholds);
        let (requests, inbox) = mpsc::channel(64);
        let handle = OperationHandle {
            requests,
            mode: mode_rx,
            thresholds: thresholds_rx,
            soc: soc.as_ref().map(|s| s.status.clone()),
            sequencer,
            devices: registry.names(),
        };

        let manager = OperationManager {
            registry,
            auto_enabled: cfg.auto_mode.enabled,
            mode: mode_tx,
            thresholds: thresholds_tx,
            soc,
            run: None,
            shutdown,
        };
        tokio::spawn(manager.run(inbox));
        handle
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<OperationRequest>) {
        let mode = *self.mode.borrow();
        info!(?mode, auto_enabled = self.auto_enabled, "operation manager started");
        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                request = inbox.recv() => request,
            };
            let Some(request) = request else { break };
            self.handle(request).await;
        }
        if let Some(run) = self.run.take() {
            run.cancel();
        }
        info!("operation manager stopped");
    }

    async fn handle(&mut self, request: OperationRequest) {
        match request {
            OperationRequest::SetMode { mode, reply } => {
                let _ = reply.send(self.set_mode(mode).await);
            }
            OperationRequest::StartAuto { reply } => {
                let _ = reply.send(self.start_auto().await);
            }
            OperationRequest::StopAuto { reply } => {
                let _ = reply.send(self.stop_auto().await);
            }
            OperationRequest::UpdateThresholds { update, reply } => {
                let _ = reply.send(self.update_thresholds(update).await);
            }
            OperationRequest::DeviceCommand { device, command, reply } => {
                if *self.mode.borrow() == OperationMode::Auto {
                    let _ = reply.send(Err(ControlError::AutoModeActive));
                    return;
                }
                let Some(link) = self.registry.get(&device) else {
                    let _ = reply.send(Err(ControlError::UnknownDevice(device)));
                    return;
                };
                info!(device = %device, %command, "direct command");
                // l'écriture peut être lente, la boucle de messages ne l'attend pas
                tokio::spawn(async move {
                    let _ = reply.send(link.command(&command).await.map_err(ControlError::from));
                });
            }
        }
    }

    async fn set_mode(&mut self, mode: OperationMode) -> Result<String, ControlError> {
        let current = *self.mode.borrow();
        match mode {
            OperationMode::Basic => {
                let message = if current == OperationMode::Auto {
                    self.stop_auto().await?;
                    "switched to basic mode, auto mode stopped"
                } else {
                    "switched to basic mode"
                };
                self.mode.send_replace(OperationMode::Basic);
                info!("operation mode: basic");
                Ok(message.into())
            }
            OperationMode::Auto => {
                if !self.auto_enabled {
                    return Err(ControlError::AutoModeDisabled);
                }
                self.mode.send_replace(OperationMode::Auto);
                info!("operation mode: auto");
                Ok("switched to auto mode".into())
            }
        }
    }

    async fn start_auto(&mut self) -> Result<String, ControlError> {
        let Some(soc) = &self.soc else {
            let missing = if self.registry.first_of(DeviceType::Battery).is_none() {
                DeviceType::Battery
            } else {
                DeviceType::Converter
            };
            return Err(ControlError::MissingDevice(missing));
        };
        let active = soc.status.borrow().is_active;
        if *self.mode.borrow() != OperationMode::Auto {
            self.set_mode(OperationMode::Auto).await?;
        }
        if let Some(run) = &self.run {
            if !run.is_cancelled() && active {
                return Ok("auto mode already running".into());
            }
            run.cancel();
        }

        let run = self.shutdown.child_token();
        let soc = self.soc.as_ref().ok_or(ControlError::ManagerUnavailable)?;
        soc.input
            .send(SocInput::Start(run.clone()))
            .await
            .map_err(|_| ControlError::ManagerUnavailable)?;
        self.run = Some(run);
        Ok("auto mode starting".into())
    }

    async fn stop_auto(&mut self) -> Result<String, ControlError> {
        if let Some(run) = self.run.take() {
            run.cancel();
        }
        if let Some(soc) = &self.soc {
            soc.input.send(SocInput::Stop).await.map_err(|_| ControlError::ManagerUnavailable)?;
        }
        Ok("auto mode stopped".into())
    }

    async fn update_thresholds(&mut self, update: ThresholdUpdate) -> Result<ThresholdConfig, ControlError> {
        let next = self
            .thresholds
            .borrow()
            .apply(&update)
            .map_err(|e| ControlError::InvalidThresholds(e.to_string()))?;
        self.thresholds.send_replace(next.clone());
        if let Some(soc) = &self.soc {
            soc.input
                .send(SocInput::Thresholds(next.clone()))
                .await
                .map_err(|_| ControlError::ManagerUnavailable)?;
        }
        info!(?next, "thresholds replaced");
        Ok(next)
    }
}

/// Poignée clonable vers le gestionnaire de mode
#[derive(Clone)]
pub struct OperationHandle {
    requests: mpsc::Sender<OperationRequest>,
    mode: watch::Receiver<OperationMode>,
    thresholds: watch::Receiver<ThresholdConfig>,
    soc: Option<watch::Receiver<SocStatus>>,
    sequencer: Option<Arc<CommFaultSequencer>>,
    devices: Vec<String>,
}

impl OperationHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> OperationRequest) -> Result<T, ControlError> {
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| ControlError::ManagerUnavailable)?;
        answer.await.map_err(|_| ControlError::ManagerUnavailable)?
    }

    pub async fn set_mode(&self, mode: OperationMode) -> Result<String, ControlError> {
        self.request(|reply| OperationRequest::SetMode { mode, reply }).await
    }

    pub async fn start_auto(&self) -> Result<String, ControlError> {
        self.request(|reply| OperationRequest::StartAuto { reply }).await
    }

    pub async fn stop_auto(&self) -> Result<String, ControlError> {
        self.request(|reply| OperationRequest::StopAuto { reply }).await
    }

    pub async fn update_thresholds(&self, update: ThresholdUpdate) -> Result<ThresholdConfig, ControlError> {
        self.request(|reply| OperationRequest::UpdateThresholds { update, reply }).await
    }

    pub async fn device_command(&self, device: &str, command: DeviceCommand) -> Result<Ack, ControlError> {
        let device = device.to_string();
        self.request(|reply| OperationRequest::DeviceCommand { device, command, reply }).await
    }

    pub fn mode(&self) -> OperationMode {
        *self.mode.borrow()
    }

    pub fn thresholds(&self) -> ThresholdConfig {
        self.thresholds.borrow().clone()
    }

    pub fn soc_status(&self) -> Option<SocStatus> {
        self.soc.as_ref().map(|rx| rx.borrow().refreshed())
    }

    /// Attend le prochain changement d'état de l'automate (outillage de test)
    pub async fn soc_changed(&mut self) -> Option<SocStatus> {
        let rx = self.soc.as_mut()?;
        rx.changed().await.ok()?;
        let status = rx.borrow().refreshed();
        Some(status)
    }

    pub fn fault_recovery(&self) -> Option<SequencerStatus> {
        self.sequencer.as_ref().map(|s| s.status())
    }

    pub fn status(&self) -> OperationStatus {
        let mode = self.mode();
        OperationStatus {
            current_mode: mode,
            timestamp: OffsetDateTime::now_utc(),
            basic_mode: BasicModeStatus {
                active: mode == OperationMode::Basic,
                available_devices: self.devices.clone(),
            },
            auto_mode: AutoModeStatus { available: self.soc.is_some(), controller: self.soc_status() },
            fault_recovery: self.fault_recovery(),
        }
    }
}
