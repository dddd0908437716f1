/**
 * ORDONNANCEUR DE POLLING - Une boucle par équipement + suivi de santé
 *
 * RÔLE :
 * Interroge chaque équipement actif à son intervalle, diffuse les snapshots
 * et tient les compteurs de santé consultés par l'API et le moniteur process.
 *
 * FONCTIONNEMENT :
 * - Un échec de poll incrémente `consecutive_errors`; au-delà du plafond l'équipement
 *   passe malade (événement émis) mais la boucle continue de poller
 * - Une boucle ne s'arrête que sur arrêt global, pause ou désactivation
 * - La boucle de contrôle (30s) compte les passages sans équipement malade et remet
 *   tous les compteurs à zéro après `reset_threshold` passages propres
 * - `pause`/`resume_all` sont réservés au gouverneur de récupération
 */

use crate::config::SchedulerConf;
use crate::devices::{DeviceLink, DeviceRegistry};
use crate::models::{Device, DeviceType, TelemetrySnapshot};
use crate::shutdown::wait_or_cancel;
use crate::state::{new_state, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SNAPSHOT_CHANNEL_CAPACITY: usize = 256;
const HEALTH_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("device '{0}' not found")]
    UnknownDevice(String),
    #[error("device '{0}' is not active")]
    Inactive(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub unhealthy_after: u32,
    pub health_check_interval: Duration,
    pub reset_threshold: u32,
}

impl From<&SchedulerConf> for SchedulerSettings {
    fn from(conf: &SchedulerConf) -> Self {
        Self {
            unhealthy_after: conf.unhealthy_after,
            health_check_interval: Duration::from_secs(conf.health_check_interval_secs),
            reset_threshold: conf.reset_threshold,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConf::default())
    }
}

/// Timeout d'un poll : 2x l'intervalle, borné à [5s, 15s]
pub fn poll_timeout(interval: Duration) -> Duration {
    (interval * 2).clamp(Duration::from_secs(5), Duration::from_secs(15))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceHealthEvent {
    Unhealthy { device_id: String, consecutive_errors: u32, last_error: String },
    Recovered { device_id: String },
    CountersReset { devices: usize },
}

/// État d'exécution d'un équipement, écrit uniquement par sa boucle et par le contrôle de santé.
#[derive(Debug, Clone)]
pub struct DeviceTask {
    device: Device,
    consecutive_errors: u32,
    is_healthy: bool,
    last_poll_time: Option<OffsetDateTime>,
    last_snapshot: Option<TelemetrySnapshot>,
    total_polls: u64,
    successful_polls: u64,
    failed_polls: u64,
    last_error: Option<String>,
}

impl DeviceTask {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            consecutive_errors: 0,
            is_healthy: true,
            last_poll_time: None,
            last_snapshot: None,
            total_polls: 0,
            successful_polls: 0,
            failed_polls: 0,
            last_error: None,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }

    pub fn last_snapshot(&self) -> Option<&TelemetrySnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn record_success(&mut self, snapshot: TelemetrySnapshot) -> Option<DeviceHealthEvent> {
        let was_unhealthy = !self.is_healthy;
        self.total_polls += 1;
        self.successful_polls += 1;
        self.consecutive_errors = 0;
        self.is_healthy = true;
        self.last_poll_time = Some(snapshot.timestamp);
        self.last_snapshot = Some(snapshot);
        was_unhealthy.then(|| DeviceHealthEvent::Recovered { device_id: self.device.id.clone() })
    }

    /// Retourne l'événement `Unhealthy` uniquement au franchissement du plafond
    pub fn record_failure(&mut self, error: String, ceiling: u32) -> Option<DeviceHealthEvent> {
        self.total_polls += 1;
        self.failed_polls += 1;
        self.consecutive_errors += 1;
        self.last_poll_time = Some(OffsetDateTime::now_utc());
        self.last_error = Some(error.clone());
        if self.is_healthy && self.consecutive_errors > ceiling {
            self.is_healthy = false;
            return Some(DeviceHealthEvent::Unhealthy {
                device_id: self.device.id.clone(),
                consecutive_errors: self.consecutive_errors,
                last_error: error,
            });
        }
        None
    }

    /// Vrai si quelque chose a été remis à zéro
    pub fn reset_counters(&mut self) -> bool {
        let changed = self.consecutive_errors > 0 || !self.is_healthy;
        self.consecutive_errors = 0;
        self.is_healthy = true;
        changed
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_polls == 0 {
            return 0.0;
        }
        self.successful_polls as f64 / self.total_polls as f64 * 100.0
    }

    fn stats(&self, polling: bool, paused: bool) -> DeviceStats {
        DeviceStats {
            device_id: self.device.id.clone(),
            device_type: self.device.device_type,
            polling,
            paused,
            consecutive_errors: self.consecutive_errors,
            is_healthy: self.is_healthy,
            total_polls: self.total_polls,
            successful_polls: self.successful_polls,
            failed_polls: self.failed_polls,
            success_rate: self.success_rate(),
            last_error: self.last_error.clone(),
            last_poll_time: self.last_poll_time,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub device_id: String,
    pub device_type: DeviceType,
    pub polling: bool,
    pub paused: bool,
    pub consecutive_errors: u32,
    pub is_healthy: bool,
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub success_rate: f64,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_poll_time: Option<OffsetDateTime>,
}

/// Hystérésis du contrôle de santé
#[derive(Debug, Clone)]
pub struct HealthCheck {
    reset_threshold: u32,
    consecutive_healthy_checks: u32,
}

impl HealthCheck {
    pub fn new(reset_threshold: u32) -> Self {
        Self { reset_threshold, consecutive_healthy_checks: 0 }
    }

    pub fn consecutive_healthy_checks(&self) -> u32 {
        self.consecutive_healthy_checks
    }

    /// Enregistre un passage; vrai quand les compteurs doivent être remis à zéro
    pub fn observe(&mut self, unhealthy_devices: usize) -> bool {
        if unhealthy_devices > 0 {
            self.consecutive_healthy_checks = 0;
            return false;
        }
        self.consecutive_healthy_checks += 1;
        if self.consecutive_healthy_checks >= self.reset_threshold {
            self.consecutive_healthy_checks = 0;
            return true;
        }
        false
    }
}

struct PollSlot {
    task: Shared<DeviceTask>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    paused: bool,
}

impl PollSlot {
    fn is_polling(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct SchedulerInner {
    registry: DeviceRegistry,
    settings: SchedulerSettings,
    shutdown: CancellationToken,
    slots: Mutex<BTreeMap<String, PollSlot>>,
    snapshots: broadcast::Sender<TelemetrySnapshot>,
    health_events: broadcast::Sender<DeviceHealthEvent>,
    health_check: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct DeviceScheduler {
    inner: Arc<SchedulerInner>,
}

impl DeviceScheduler {
    pub fn new(registry: DeviceRegistry, settings: SchedulerSettings, shutdown: &CancellationToken) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let (health_events, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                settings,
                shutdown: shutdown.child_token(),
                slots: Mutex::new(BTreeMap::new()),
                snapshots,
                health_events,
                health_check: Mutex::new(None),
            }),
        }
    }

    /// Lance une boucle par équipement déclaré actif, puis la boucle de contrôle de santé
    pub fn start(&self) {
        for link in self.inner.registry.links() {
            if link.device().active {
                self.inner.spawn_loop(link.clone());
            }
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_health_check().await });
        if let Some(previous) = self.inner.health_check.lock().replace(handle) {
            previous.abort();
        }
        info!(devices = self.inner.slots.lock().len(), "scheduler started");
    }

    /// Arrêt global : annule toutes les boucles et détruit les DeviceTask
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.inner.slots.lock();
            let handles = slots.values_mut().filter_map(|s| s.handle.take()).collect();
            slots.clear();
            handles
        };
        for handle in handles {
            let _ = handle.await;
        }
        let health = self.inner.health_check.lock().take();
        if let Some(handle) = health {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }

    /// Suspend la boucle d'un équipement (compteurs conservés)
    pub async fn pause(&self, device_id: &str) -> Result<(), SchedulerError> {
        let handle = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .get_mut(device_id)
                .ok_or_else(|| SchedulerError::UnknownDevice(device_id.to_string()))?;
            slot.paused = true;
            slot.token.cancel();
            slot.handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(device = device_id, "polling paused");
        Ok(())
    }

    /// Relance toutes les boucles suspendues; retourne le nombre de boucles relancées
    pub fn resume_all(&self) -> usize {
        if self.inner.shutdown.is_cancelled() {
            return 0;
        }
        let paused: Vec<String> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter(|(_, s)| s.paused)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &paused {
            if let Some(link) = self.inner.registry.get(id) {
                self.inner.spawn_loop(link);
            }
        }
        if !paused.is_empty() {
            info!(resumed = paused.len(), "polling resumed");
        }
        paused.len()
    }

    pub fn activate(&self, device_id: &str) -> Result<(), SchedulerError> {
        let link = self
            .inner
            .registry
            .get(device_id)
            .ok_or_else(|| SchedulerError::UnknownDevice(device_id.to_string()))?;
        let running = self.inner.slots.lock().get(device_id).is_some_and(|s| s.is_polling());
        if !running {
            self.inner.spawn_loop(link);
            info!(device = device_id, "device activated");
        }
        Ok(())
    }

    /// Arrête la boucle et détruit la DeviceTask
    pub async fn deactivate(&self, device_id: &str) -> Result<(), SchedulerError> {
        let slot = self
            .inner
            .slots
            .lock()
            .remove(device_id)
            .ok_or_else(|| SchedulerError::Inactive(device_id.to_string()))?;
        slot.token.cancel();
        if let Some(handle) = slot.handle {
            let _ = handle.await;
        }
        info!(device = device_id, "device deactivated");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetrySnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<DeviceHealthEvent> {
        self.inner.health_events.subscribe()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn stats(&self) -> Vec<DeviceStats> {
        self.inner
            .slots
            .lock()
            .values()
            .map(|s| s.task.lock().stats(s.is_polling(), s.paused))
            .collect()
    }

    pub fn device_stats(&self, device_id: &str) -> Option<DeviceStats> {
        let slots = self.inner.slots.lock();
        let slot = slots.get(device_id)?;
        let stats = slot.task.lock().stats(slot.is_polling(), slot.paused);
        Some(stats)
    }

    pub fn latest(&self, device_id: &str) -> Option<TelemetrySnapshot> {
        let slots = self.inner.slots.lock();
        let snapshot = slots.get(device_id)?.task.lock().last_snapshot.clone();
        snapshot
    }

    pub fn is_polling(&self, device_id: &str) -> bool {
        self.inner.slots.lock().get(device_id).is_some_and(|s| s.is_polling())
    }

    pub fn unhealthy_devices(&self) -> Vec<String> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|(_, s)| !s.task.lock().is_healthy)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Un passage de contrôle de santé (exposé pour les tests et l'outillage)
    pub fn run_health_check_once(&self, check: &mut HealthCheck) {
        self.inner.check_once(check);
    }
}

impl SchedulerInner {
    fn spawn_loop(self: &Arc<Self>, link: DeviceLink) {
        let id = link.id().to_string();
        let mut slots = self.slots.lock();
        let slot = slots.entry(id.clone()).or_insert_with(|| PollSlot {
            task: new_state(DeviceTask::new(link.device().clone())),
            token: CancellationToken::new(),
            handle: None,
            paused: false,
        });
        if let Some(old) = slot.handle.take() {
            old.abort();
        }
        let token = self.shutdown.child_token();
        slot.token = token.clone();
        slot.paused = false;

        let task = slot.task.clone();
        let snapshots = self.snapshots.clone();
        let events = self.health_events.clone();
        let ceiling = self.settings.unhealthy_after;
        slot.handle = Some(tokio::spawn(async move {
            run_poll_loop(link, task, token, snapshots, events, ceiling).await
        }));
    }

    async fn run_health_check(self: Arc<Self>) {
        let mut check = HealthCheck::new(self.settings.reset_threshold);
        info!(interval = ?self.settings.health_check_interval, "health check loop started");
        while wait_or_cancel(&self.shutdown, self.settings.health_check_interval).await.is_ok() {
            self.check_once(&mut check);
        }
        info!("health check loop stopped");
    }

    fn check_once(self: &Arc<Self>, check: &mut HealthCheck) {
        let (tasks, ended): (Vec<Shared<DeviceTask>>, Vec<String>) = {
            let slots = self.slots.lock();
            let tasks = slots.values().map(|s| s.task.clone()).collect();
            let ended = slots
                .iter()
                .filter(|(_, s)| !s.paused && !s.is_polling())
                .map(|(id, _)| id.clone())
                .collect();
            (tasks, ended)
        };

        if !self.shutdown.is_cancelled() {
            for id in ended {
                if let Some(link) = self.registry.get(&id) {
                    warn!(device = %id, "polling loop ended unexpectedly, restarting");
                    self.spawn_loop(link);
                }
            }
        }

        let unhealthy: Vec<String> = tasks
            .iter()
            .filter_map(|t| {
                let t = t.lock();
                (!t.is_healthy).then(|| t.device.id.clone())
            })
            .collect();
        if !unhealthy.is_empty() {
            warn!(devices = ?unhealthy, "unhealthy devices");
        }

        if check.observe(unhealthy.len()) {
            let mut reset = 0;
            for task in &tasks {
                let mut t = task.lock();
                let errors = t.consecutive_errors;
                if t.reset_counters() {
                    info!(device = %t.device.id, errors, "error counters cleared");
                    reset += 1;
                }
            }
            let _ = self.health_events.send(DeviceHealthEvent::CountersReset { devices: reset });
        } else {
            debug!(clean_checks = check.consecutive_healthy_checks(), "health check done");
        }
    }
}

async fn run_poll_loop(
    link: DeviceLink,
    task: Shared<DeviceTask>,
    token: CancellationToken,
    snapshots: broadcast::Sender<TelemetrySnapshot>,
    events: broadcast::Sender<DeviceHealthEvent>,
    ceiling: u32,
) {
    let device_id = link.id().to_string();
    let interval = link.device().poll_interval;
    let timeout = poll_timeout(interval);
    info!(device = %device_id, ?interval, "polling loop started");

    loop {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            outcome = tokio::time::timeout(timeout, link.poll()) => outcome,
        };

        let event = match outcome {
            Ok(Ok(snapshot)) => {
                let event = task.lock().record_success(snapshot.clone());
                // aucun abonné n'est pas une erreur
                let _ = snapshots.send(snapshot);
                event
            }
            Ok(Err(e)) => {
                warn!(device = %device_id, error = %e, "poll failed");
                task.lock().record_failure(e.to_string(), ceiling)
            }
            Err(_) => {
                warn!(device = %device_id, ?timeout, "poll timed out");
                task.lock().record_failure(format!("poll timed out after {timeout:?}"), ceiling)
            }
        };

        match &event {
            Some(DeviceHealthEvent::Unhealthy { consecutive_errors, last_error, .. }) => {
                error!(device = %device_id, consecutive_errors, %last_error, "device unhealthy, polling continues");
            }
            Some(DeviceHealthEvent::Recovered { .. }) => info!(device = %device_id, "device healthy again"),
            _ => {}
        }
        if let Some(event) = event {
            let _ = events.send(event);
        }

        if wait_or_cancel(&token, interval).await.is_err() {
            break;
        }
    }
    info!(device = %device_id, "polling loop stopped");
}
