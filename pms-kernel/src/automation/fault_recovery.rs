//! Auto-réparation du défaut de communication BMS ↔ PCS.
//!
//! Surveille le bit de défaut (par défaut `error_code_2`, bit 3) sur chaque snapshot batterie.
//! Une seule séquence à la fois ; un échec abandonne le reste, la détection suivante
//! recommence depuis le début.

use super::{issue, pause, SequenceError};
use crate::config::FaultRecoveryConf;
use crate::devices::{DeviceCommand, DeviceLink};
use crate::models::TelemetrySnapshot;
use crate::state::{new_state, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const AFTER_RESET: Duration = Duration::from_secs(2);
const AFTER_CONTACTOR: Duration = Duration::from_secs(3);
const AFTER_FAULT_RESET: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    Idle,
    Recovering,
}

#[derive(Debug, Clone, Serialize)]
pub struct SequencerStatus {
    pub state: SequencerState,
    pub enabled: bool,
    pub attempts: u64,
    pub completed: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

/// Remet `in_flight` à faux quoi qu'il arrive à la séquence (erreur, panique, annulation)
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CommFaultSequencer {
    battery: DeviceLink,
    converter: DeviceLink,
    field: String,
    bit: u8,
    in_flight: Arc<AtomicBool>,
    status: Shared<SequencerStatus>,
}

impl CommFaultSequencer {
    pub fn new(battery: DeviceLink, converter: DeviceLink, conf: &FaultRecoveryConf) -> Arc<Self> {
        Arc::new(Self {
            battery,
            converter,
            field: conf.field.clone(),
            bit: conf.bit,
            in_flight: Arc::new(AtomicBool::new(false)),
            status: new_state(SequencerStatus {
                state: SequencerState::Idle,
                enabled: conf.enabled,
                attempts: 0,
                completed: 0,
                last_attempt: None,
                last_error: None,
            }),
        })
    }

    pub fn status(&self) -> SequencerStatus {
        self.status.lock().clone()
    }

    pub fn is_recovering(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Vrai si ce snapshot porte le défaut surveillé
    pub fn detects(&self, snapshot: &TelemetrySnapshot) -> bool {
        snapshot.device_id == self.battery.id() && snapshot.bit_set(&self.field, self.bit)
    }

    /// Boucle de surveillance : la séquence tourne dans sa propre tâche,
    /// la boucle continue donc de consommer les snapshots pendant la réparation.
    pub fn spawn(
        self: &Arc<Self>,
        mut snapshots: broadcast::Receiver<TelemetrySnapshot>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(field = %this.field, bit = this.bit, battery = this.battery.id(), "comm fault watcher started");
            loop {
                let received = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    received = snapshots.recv() => received,
                };
                match received {
                    Ok(snapshot) => {
                        this.observe(&snapshot, &shutdown);
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "comm fault watcher lagging behind telemetry"),
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("comm fault watcher stopped");
        })
    }

    /// Démarre une séquence si le défaut est présent et qu'aucune n'est en cours
    pub fn observe(self: &Arc<Self>, snapshot: &TelemetrySnapshot, shutdown: &CancellationToken) -> Option<JoinHandle<()>> {
        if !self.detects(snapshot) {
            return None;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("comm fault still reported, recovery already in progress");
            return None;
        }
        let guard = InFlight(self.in_flight.clone());
        let this = self.clone();
        let run = shutdown.child_token();
        Some(tokio::spawn(async move {
            let _guard = guard;
            this.recover(&run).await;
        }))
    }

    async fn recover(&self, run: &CancellationToken) {
        {
            let mut st = self.status.lock();
            st.state = SequencerState::Recovering;
            st.attempts += 1;
            st.last_attempt = Some(OffsetDateTime::now_utc());
        }
        warn!(battery = self.battery.id(), "communication fault detected, starting recovery");

        let result = self.sequence(run).await;
        let mut st = self.status.lock();
        st.state = SequencerState::Idle;
        match result {
            Ok(()) => {
                st.completed += 1;
                st.last_error = None;
                info!(total = st.completed, "communication fault recovery completed");
            }
            Err(SequenceError::Aborted) => info!("communication fault recovery aborted by shutdown"),
            Err(e) => {
                error!(error = %e, "communication fault recovery failed");
                st.last_error = Some(e.to_string());
            }
        }
    }

    async fn sequence(&self, run: &CancellationToken) -> Result<(), SequenceError> {
        issue(&self.battery, DeviceCommand::ResetErrors, run).await?;
        pause(run, AFTER_RESET).await?;
        issue(&self.battery, DeviceCommand::Contactor { closed: true }, run).await?;
        pause(run, AFTER_CONTACTOR).await?;
        issue(&self.converter, DeviceCommand::ResetFaults, run).await?;
        pause(run, AFTER_FAULT_RESET).await?;
        issue(&self.converter, DeviceCommand::Independent, run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::SimulatedPlant;
    use crate::models::{Device, DeviceType, Endpoint, FieldValue};

    fn device(id: &str, device_type: DeviceType) -> Device {
        Device {
            id: id.into(),
            device_type,
            endpoint: Endpoint { host: "sim".into(), port: 502, unit_id: 1 },
            poll_interval: Duration::from_secs(5),
            active: true,
        }
    }

    fn sequencer(plant: &SimulatedPlant) -> Arc<CommFaultSequencer> {
        let bms = DeviceLink::new(Arc::new(plant.attach(device("bms1", DeviceType::Battery))));
        let pcs = DeviceLink::new(Arc::new(plant.attach(device("pcs1", DeviceType::Converter))));
        CommFaultSequencer::new(bms, pcs, &FaultRecoveryConf::default())
    }

    #[test]
    fn test_detects_only_configured_bit_on_battery() {
        let seq = sequencer(&SimulatedPlant::new());
        let bms = device("bms1", DeviceType::Battery);
        let faulted = TelemetrySnapshot::new(&bms).with_field("error_code_2", FieldValue::Status(0b1000));
        let other_bit = TelemetrySnapshot::new(&bms).with_field("error_code_2", FieldValue::Status(0b0100));
        let other_device = TelemetrySnapshot::new(&device("pcs1", DeviceType::Converter))
            .with_field("error_code_2", FieldValue::Status(0b1000));

        assert!(seq.detects(&faulted));
        assert!(!seq.detects(&other_bit));
        assert!(!seq.detects(&other_device));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_clears_simulated_fault() {
        let plant = SimulatedPlant::new();
        let seq = sequencer(&plant);
        plant.inject_comm_fault();
        let bms = device("bms1", DeviceType::Battery);
        let snap = TelemetrySnapshot::new(&bms).with_field("error_code_2", FieldValue::Status(8));
        let shutdown = CancellationToken::new();

        let handle = seq.observe(&snap, &shutdown).expect("sequence should start");
        assert!(seq.is_recovering());
        assert!(seq.observe(&snap, &shutdown).is_none());

        handle.await.unwrap();
        let st = plant.snapshot();
        assert_eq!(st.error_code_2, 0);
        assert!(st.contactor_closed);
        assert!(!seq.is_recovering());
        let status = seq.status();
        assert_eq!((status.attempts, status.completed), (1, 1));
        assert_eq!(status.state, SequencerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_without_counting() {
        let seq = sequencer(&SimulatedPlant::new());
        let snap = TelemetrySnapshot::new(&device("bms1", DeviceType::Battery))
            .with_field("error_code_2", FieldValue::Status(8));
        let shutdown = CancellationToken::new();

        let handle = seq.observe(&snap, &shutdown).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let status = seq.status();
        assert_eq!(status.completed, 0);
        assert!(status.last_error.is_none());
        assert!(!seq.is_recovering());
    }
}
