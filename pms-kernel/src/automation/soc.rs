/**
 * AUTOMATE SOC - Conduite autonome sur l'état de charge batterie
 *
 * Idle → StartingConverter → StartingSolarLink → Running
 * Running → SocHighStandby (SOC ≥ haut)  → Running après la durée de veille
 * Running → SocLowCharging (SOC ≤ bas)   → SocLowStopping (SOC ≥ arrêt charge) → Running
 *
 * Le seuil haut est évalué avant le bas, une seule transition par snapshot.
 * Le seuil haut n'est traité qu'une fois par franchissement : il faut repasser en dessous
 * pour qu'une nouvelle mise en veille soit possible.
 * Un SOC périmé, absent ou hors de [0, 100] suspend l'évaluation.
 * L'annulation du token de marche coupe les attentes sans envoyer la commande suivante.
 */

use super::{issue, pause, SequenceError};
use crate::config::ThresholdConfig;
use crate::devices::{DeviceCommand, DeviceLink};
use crate::models::TelemetrySnapshot;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoState {
    Idle,
    StartingConverter,
    StartingSolarLink,
    Running,
    SocHighStandby,
    SocLowCharging,
    SocLowStopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    EnterStandby,
    EnterLowCharging,
    EnterLowStopping,
}

/// Décision pure sur un échantillon SOC frais.
/// `high_handled` : la veille a déjà été faite depuis le dernier passage au-dessus du seuil haut.
pub fn decide(state: AutoState, soc: f64, high_handled: bool, thresholds: &ThresholdConfig) -> Option<Transition> {
    match state {
        AutoState::Running if soc >= thresholds.soc_high => (!high_handled).then_some(Transition::EnterStandby),
        AutoState::Running if soc <= thresholds.soc_low => Some(Transition::EnterLowCharging),
        AutoState::SocLowCharging if soc >= thresholds.soc_charge_stop => Some(Transition::EnterLowStopping),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SocStatus {
    pub current_state: AutoState,
    pub previous_state: Option<AutoState>,
    pub is_active: bool,
    pub state_duration_seconds: u64,
    pub last_soc: Option<f64>,
    pub config: ThresholdConfig,
    #[serde(skip)]
    entered_at: Instant,
}

impl SocStatus {
    pub fn idle(config: ThresholdConfig) -> Self {
        Self {
            current_state: AutoState::Idle,
            previous_state: None,
            is_active: false,
            state_duration_seconds: 0,
            last_soc: None,
            config,
            entered_at: Instant::now(),
        }
    }

    /// Copie avec la durée dans l'état recalculée
    pub fn refreshed(&self) -> Self {
        let mut status = self.clone();
        status.state_duration_seconds = self.entered_at.elapsed().as_secs();
        status
    }
}

#[derive(Debug)]
pub enum SocInput {
    /// Démarrage; le token est annulé par le gestionnaire de mode pour tout arrêter
    Start(CancellationToken),
    Stop,
    Thresholds(ThresholdConfig),
}

pub struct SocController {
    converter: DeviceLink,
    solar_link: Option<DeviceLink>,
    battery_id: String,
    freshness: Duration,
    soc_field: String,
    thresholds: ThresholdConfig,
    state: AutoState,
    previous: Option<AutoState>,
    entered_at: Instant,
    last_soc: Option<f64>,
    high_handled: bool,
    status: watch::Sender<SocStatus>,
}

impl SocController {
    /// `battery` fournit l'identifiant surveillé et la fenêtre de fraîcheur (son intervalle de poll)
    pub fn new(
        converter: DeviceLink,
        solar_link: Option<DeviceLink>,
        battery: &DeviceLink,
        soc_field: &str,
        thresholds: ThresholdConfig,
    ) -> (Self, watch::Receiver<SocStatus>) {
        let (status, status_rx) = watch::channel(SocStatus::idle(thresholds.clone()));
        let controller = Self {
            converter,
            solar_link,
            battery_id: battery.id().to_string(),
            freshness: battery.device().poll_interval,
            soc_field: soc_field.to_string(),
            thresholds,
            state: AutoState::Idle,
            previous: None,
            entered_at: Instant::now(),
            last_soc: None,
            high_handled: false,
            status,
        };
        (controller, status_rx)
    }

    pub fn spawn(
        self,
        inputs: mpsc::Receiver<SocInput>,
        snapshots: broadcast::Receiver<TelemetrySnapshot>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(inputs, snapshots, shutdown))
    }

    async fn run(
        mut self,
        mut inputs: mpsc::Receiver<SocInput>,
        mut snapshots: broadcast::Receiver<TelemetrySnapshot>,
        shutdown: CancellationToken,
    ) {
        let mut run: Option<CancellationToken> = None;
        let mut standby_until: Option<Instant> = None;

        loop {
            let deadline = standby_until;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                input = inputs.recv() => match input {
                    None => break,
                    Some(SocInput::Start(token)) => {
                        if self.state != AutoState::Idle {
                            debug!(state = ?self.state, "auto mode already active");
                            continue;
                        }
                        run = Some(token.clone());
                        standby_until = None;
                        self.high_handled = false;
                        match self.startup(&token).await {
                            Ok(()) => info!("auto mode running"),
                            Err(e) => self.sequence_failed(e, AutoState::Idle),
                        }
                    }
                    Some(SocInput::Stop) => {
                        if let Some(token) = run.take() {
                            token.cancel();
                        }
                        standby_until = None;
                        if self.state != AutoState::Idle {
                            info!(state = ?self.state, "auto mode stopped");
                            self.enter(AutoState::Idle);
                        }
                    }
                    Some(SocInput::Thresholds(thresholds)) => {
                        info!(?thresholds, "thresholds updated");
                        self.thresholds = thresholds;
                        self.publish();
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    standby_until = None;
                    if let Some(token) = run.clone() {
                        self.resume_solar_charge(&token).await;
                    }
                }
                received = snapshots.recv() => match received {
                    Ok(snapshot) => {
                        if let Some(token) = run.clone() {
                            if let Some(until) = self.on_snapshot(&snapshot, &token).await {
                                standby_until = Some(until);
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "soc controller lagging behind telemetry"),
                    Err(RecvError::Closed) => break,
                },
            }

            if self.state == AutoState::Idle || run.as_ref().is_some_and(|t| t.is_cancelled()) {
                run = None;
                standby_until = None;
                if self.state != AutoState::Idle {
                    self.enter(AutoState::Idle);
                }
            }
        }
        debug!("soc controller task ended");
    }

    async fn startup(&mut self, run: &CancellationToken) -> Result<(), SequenceError> {
        let converter = self.converter.clone();
        let interval = self.thresholds.command_interval();

        self.enter(AutoState::StartingConverter);
        issue(&converter, DeviceCommand::Standby, run).await?;
        pause(run, interval).await?;
        issue(&converter, DeviceCommand::Independent, run).await?;

        if let Some(solar) = self.solar_link.clone() {
            self.enter(AutoState::StartingSolarLink);
            issue(&solar, DeviceCommand::Reset, run).await?;
            pause(run, interval).await?;
            issue(&solar, DeviceCommand::SolarCharge, run).await?;
        } else {
            info!("no solar link configured, skipping its startup");
        }

        self.enter(AutoState::Running);
        Ok(())
    }

    /// Retourne l'échéance de veille quand le seuil haut vient d'être franchi
    async fn on_snapshot(&mut self, snapshot: &TelemetrySnapshot, run: &CancellationToken) -> Option<Instant> {
        if snapshot.device_id != self.battery_id {
            return None;
        }
        if !snapshot.is_fresh(self.freshness) {
            debug!(age = ?snapshot.age(), "stale battery snapshot ignored");
            return None;
        }
        let Some(soc) = snapshot.number(&self.soc_field) else {
            warn!(field = %self.soc_field, "battery snapshot without SOC");
            return None;
        };
        if !(0.0..=100.0).contains(&soc) {
            warn!(soc, "SOC out of range, evaluation skipped");
            return None;
        }
        self.last_soc = Some(soc);
        self.publish();
        if soc < self.thresholds.soc_high {
            self.high_handled = false;
        }

        match decide(self.state, soc, self.high_handled, &self.thresholds)? {
            Transition::EnterStandby => {
                let Some(solar) = self.solar_link.clone() else {
                    debug!(soc, "high SOC but no solar link to curtail");
                    return None;
                };
                info!(soc, threshold = self.thresholds.soc_high, "SOC high, solar link to standby");
                self.high_handled = true;
                self.enter(AutoState::SocHighStandby);
                match issue(&solar, DeviceCommand::Standby, run).await {
                    Ok(()) => Some(Instant::now() + self.thresholds.standby_duration()),
                    Err(e) => {
                        self.sequence_failed(e, AutoState::Running);
                        None
                    }
                }
            }
            Transition::EnterLowCharging => {
                info!(soc, threshold = self.thresholds.soc_low, "SOC low, switching converter to charge");
                self.enter(AutoState::SocLowCharging);
                if let Err(e) = self.low_soc_sequence(run).await {
                    self.sequence_failed(e, AutoState::Running);
                }
                None
            }
            Transition::EnterLowStopping => {
                info!(soc, threshold = self.thresholds.soc_charge_stop, "charge target reached, stopping charge");
                self.enter(AutoState::SocLowStopping);
                match self.charge_stop_sequence(run).await {
                    Ok(()) => self.enter(AutoState::Running),
                    Err(e) => self.sequence_failed(e, AutoState::Running),
                }
                None
            }
        }
    }

    async fn low_soc_sequence(&self, run: &CancellationToken) -> Result<(), SequenceError> {
        let interval = self.thresholds.command_interval();
        issue(&self.converter, DeviceCommand::Stop, run).await?;
        pause(run, interval).await?;
        issue(&self.converter, DeviceCommand::Standby, run).await?;
        pause(run, interval).await?;
        let power_kw = self.thresholds.charging_power;
        issue(&self.converter, DeviceCommand::Charge { power_kw }, run).await
    }

    async fn charge_stop_sequence(&self, run: &CancellationToken) -> Result<(), SequenceError> {
        issue(&self.converter, DeviceCommand::Stop, run).await?;
        pause(run, self.thresholds.command_interval()).await?;
        issue(&self.converter, DeviceCommand::Independent, run).await
    }

    async fn resume_solar_charge(&mut self, run: &CancellationToken) {
        if self.state != AutoState::SocHighStandby {
            return;
        }
        let Some(solar) = self.solar_link.clone() else { return };
        info!("standby elapsed, resuming solar charge");
        match issue(&solar, DeviceCommand::SolarCharge, run).await {
            Ok(()) => self.enter(AutoState::Running),
            Err(e) => self.sequence_failed(e, AutoState::Running),
        }
    }

    fn sequence_failed(&mut self, err: SequenceError, fallback: AutoState) {
        match err {
            SequenceError::Aborted => {
                info!(state = ?self.state, "sequence aborted");
                self.enter(AutoState::Idle);
            }
            SequenceError::Command { .. } => {
                error!(state = ?self.state, error = %err, fallback = ?fallback, "sequence failed");
                self.enter(fallback);
            }
        }
    }

    fn enter(&mut self, next: AutoState) {
        if next == self.state {
            return;
        }
        debug!(from = ?self.state, to = ?next, "state transition");
        self.previous = Some(self.state);
        self.state = next;
        self.entered_at = Instant::now();
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(SocStatus {
            current_state: self.state,
            previous_state: self.previous,
            is_active: self.state != AutoState::Idle,
            state_duration_seconds: 0,
            last_soc: self.last_soc,
            config: self.thresholds.clone(),
            entered_at: self.entered_at,
        });
    }
}
