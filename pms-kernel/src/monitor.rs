/**
 * MONITEUR PROCESS - Mémoire, CPU, threads + gouverneur de récupération
 *
 * RÔLE :
 * Échantillonne le process à cadence fixe, classe sa santé et déclenche une
 * récupération bornée. Ne touche jamais aux automates, seulement au cycle de vie
 * de l'ordonnanceur via le `RecoveryHandler`.
 *
 * FONCTIONNEMENT :
 * - Échantillon malade = au moins un seuil dépassé
 * - Chaque échantillon malade incrémente le compteur et lance le handler, puis attente cooldown
 * - Au `max_attempts`-ième : récupération d'urgence, une seule fois tant que le verrou tient
 * - Urgence + `restart_on_emergency` : annulation du token racine, le process sort en code 1
 * - Un handler en échec n'écourte pas le cooldown : l'erreur remonte après l'attente
 * - Un cycle en retard de plus de `STALL_GRACE` sur l'intervalle compte comme dépassement (runtime bloqué)
 * - N échantillons sains d'affilée remettent compteur et verrou à zéro
 * - `Cancelled` remonte et termine la boucle; toute autre erreur est journalisée, la boucle continue
 */

use crate::config::{MonitoringConf, RecoveryConf};
use crate::scheduler::DeviceScheduler;
use crate::shutdown::{wait_or_cancel, wait_until_or_cancel, Cancelled};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use sysinfo::{Pid, System};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const HISTORY_LEN: usize = 100;
const LEAK_WINDOW: usize = 5;
const MB: f64 = 1024.0 * 1024.0;
/// Retard toléré sur l'intervalle de contrôle avant de signaler un blocage
pub const STALL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("sampling failed: {0}")]
    Sampling(String),
    #[error("recovery handler failed: {0}")]
    Recovery(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub thread_count: u32,
}

impl ResourceSample {
    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / MB
    }
}

pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<ResourceSample, MonitorError>;
}

/// Échantillonneur réel basé sur sysinfo
pub struct SysinfoSampler {
    system: System,
    pid: Pid,
}

impl SysinfoSampler {
    pub fn new() -> Result<Self, MonitorError> {
        let pid = sysinfo::get_current_pid().map_err(|e| MonitorError::Sampling(e.to_string()))?;
        Ok(Self { system: System::new(), pid })
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
        self.system.refresh_process(self.pid);
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| MonitorError::Sampling(format!("process {} not found", self.pid)))?;
        Ok(ResourceSample {
            timestamp: OffsetDateTime::now_utc(),
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
            thread_count: thread_count(),
        })
    }
}

fn thread_count() -> u32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("Threads:") {
                    if let Ok(n) = rest.trim().parse::<u32>() {
                        return n;
                    }
                }
            }
        }
    }
    0
}

#[derive(Debug, Clone)]
pub struct Thresholds {
    pub memory_mb: f64,
    pub cpu_percent: f32,
    pub threads: u32,
    pub memory_growth_mb: f64,
}

impl From<&MonitoringConf> for Thresholds {
    fn from(conf: &MonitoringConf) -> Self {
        Self {
            memory_mb: conf.memory_threshold_mb,
            cpu_percent: conf.cpu_threshold_percent,
            threads: conf.thread_threshold,
            memory_growth_mb: conf.memory_growth_mb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Breach {
    Memory { mb: f64, limit: f64 },
    Cpu { percent: f32, limit: f32 },
    Threads { count: u32, limit: u32 },
    /// Suspicion de fuite (informatif, ne rend pas l'échantillon malade)
    MemoryGrowth { mb_per_sample: f64 },
    /// Écart entre deux cycles bien au-delà de l'intervalle attendu
    Stalled { gap_secs: f64, expected_secs: f64 },
}

impl Breach {
    pub fn is_threshold(&self) -> bool {
        !matches!(self, Breach::MemoryGrowth { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Emergency,
}

impl HealthStatus {
    pub fn classify(breaches: &[Breach]) -> Self {
        let thresholds = breaches.iter().filter(|b| b.is_threshold()).count();
        match (thresholds, breaches.len()) {
            (0, 0) => HealthStatus::Healthy,
            (0, _) => HealthStatus::Warning,
            (_, n) if n > 2 => HealthStatus::Emergency,
            _ => HealthStatus::Critical,
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Critical | HealthStatus::Emergency)
    }
}

/// Fenêtre glissante des derniers échantillons
#[derive(Debug, Default)]
pub struct SampleWindow {
    samples: VecDeque<ResourceSample>,
    baseline_mb: Option<f64>,
}

impl SampleWindow {
    pub fn push(&mut self, sample: ResourceSample) {
        if self.baseline_mb.is_none() {
            self.baseline_mb = Some(sample.memory_mb());
        }
        if self.samples.len() == HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&ResourceSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn baseline_mb(&self) -> f64 {
        self.baseline_mb.unwrap_or(0.0)
    }

    /// Croissance moyenne (Mo/échantillon) sur les derniers échantillons
    pub fn growth_per_sample_mb(&self) -> Option<f64> {
        if self.samples.len() < LEAK_WINDOW {
            return None;
        }
        let recent: Vec<&ResourceSample> = self.samples.iter().rev().take(LEAK_WINDOW).collect();
        let newest = recent.first()?.memory_mb();
        let oldest = recent.last()?.memory_mb();
        Some((newest - oldest) / LEAK_WINDOW as f64)
    }

    pub fn evaluate(&self, thresholds: &Thresholds) -> Vec<Breach> {
        let Some(sample) = self.latest() else { return Vec::new() };
        let mut breaches = Vec::new();
        if sample.memory_mb() > thresholds.memory_mb {
            breaches.push(Breach::Memory { mb: sample.memory_mb(), limit: thresholds.memory_mb });
        }
        if sample.cpu_percent > thresholds.cpu_percent {
            breaches.push(Breach::Cpu { percent: sample.cpu_percent, limit: thresholds.cpu_percent });
        }
        if sample.thread_count > thresholds.threads {
            breaches.push(Breach::Threads { count: sample.thread_count, limit: thresholds.threads });
        }
        if let Some(growth) = self.growth_per_sample_mb() {
            if growth > thresholds.memory_growth_mb {
                breaches.push(Breach::MemoryGrowth { mb_per_sample: growth });
            }
        }
        breaches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorAction {
    None,
    Recover { attempt: u32 },
    Emergency,
    /// Déjà escaladé, on attend le retour à la normale
    Latched,
}

/// Compteur de tentatives + verrou d'urgence
#[derive(Debug, Clone)]
pub struct RecoveryGovernor {
    max_attempts: u32,
    cooldown: Duration,
    healthy_samples_to_reset: u32,
    attempts: u32,
    healthy_streak: u32,
    emergency_latched: bool,
    emergencies: u32,
    cooldown_until: Option<Instant>,
    last_recovery: Option<OffsetDateTime>,
}

impl RecoveryGovernor {
    pub fn new(max_attempts: u32, cooldown: Duration, healthy_samples_to_reset: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            cooldown,
            healthy_samples_to_reset: healthy_samples_to_reset.max(1),
            attempts: 0,
            healthy_streak: 0,
            emergency_latched: false,
            emergencies: 0,
            cooldown_until: None,
            last_recovery: None,
        }
    }

    /// Par défaut, le cooldown exprimé en nombre d'échantillons sains
    pub fn from_conf(recovery: &RecoveryConf, check_interval: Duration) -> Self {
        let reset = recovery.healthy_samples_to_reset.unwrap_or_else(|| {
            let secs = check_interval.as_secs().max(1);
            recovery.cooldown_seconds.div_ceil(secs) as u32
        });
        Self::new(recovery.max_attempts, Duration::from_secs(recovery.cooldown_seconds), reset)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn emergencies(&self) -> u32 {
        self.emergencies
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    pub fn on_sample(&mut self, unhealthy: bool) -> GovernorAction {
        if !unhealthy {
            self.healthy_streak += 1;
            if self.healthy_streak >= self.healthy_samples_to_reset && (self.attempts > 0 || self.emergency_latched) {
                info!(attempts = self.attempts, "system stable again, recovery counter reset");
                self.attempts = 0;
                self.emergency_latched = false;
                self.cooldown_until = None;
            }
            return GovernorAction::None;
        }

        self.healthy_streak = 0;
        if self.emergency_latched {
            return GovernorAction::Latched;
        }
        self.attempts += 1;
        self.last_recovery = Some(OffsetDateTime::now_utc());
        if self.attempts >= self.max_attempts {
            self.emergency_latched = true;
            self.emergencies += 1;
            self.cooldown_until = None;
            GovernorAction::Emergency
        } else {
            self.cooldown_until = Some(Instant::now() + self.cooldown);
            GovernorAction::Recover { attempt: self.attempts }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    Routine,
    Emergency,
}

#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(&self, kind: RecoveryKind, breaches: &[Breach]) -> anyhow::Result<()>;
}

/// Récupération par défaut : redémarre uniquement les boucles des équipements malades.
/// Les boucles saines ne sont jamais touchées.
pub struct SchedulerRecovery {
    scheduler: DeviceScheduler,
}

impl SchedulerRecovery {
    pub fn new(scheduler: DeviceScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl RecoveryHandler for SchedulerRecovery {
    async fn recover(&self, kind: RecoveryKind, breaches: &[Breach]) -> anyhow::Result<()> {
        let unhealthy = self.scheduler.unhealthy_devices();
        info!(?kind, breaches = breaches.len(), restarting = ?unhealthy, "running recovery");
        for id in &unhealthy {
            self.scheduler.pause(id).await?;
        }
        self.scheduler.resume_all();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub status: HealthStatus,
    pub latest: Option<ResourceSample>,
    pub breaches: Vec<Breach>,
    pub recovery_attempts: u32,
    pub emergencies: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_recovery: Option<OffsetDateTime>,
    pub memory_baseline_mb: f64,
    pub memory_growth_mb: f64,
    pub monitoring_enabled: bool,
    pub auto_recovery_enabled: bool,
}

impl MonitorReport {
    pub fn disabled() -> Self {
        Self {
            status: HealthStatus::Healthy,
            latest: None,
            breaches: Vec::new(),
            recovery_attempts: 0,
            emergencies: 0,
            last_recovery: None,
            memory_baseline_mb: 0.0,
            memory_growth_mb: 0.0,
            monitoring_enabled: false,
            auto_recovery_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Arrêt demandé
    Shutdown,
    /// Urgence avec `restart_on_emergency`; le token racine est déjà annulé
    RestartRequested,
}

pub struct ProcessMonitor {
    sampler: Box<dyn ResourceSampler>,
    handler: Box<dyn RecoveryHandler>,
    thresholds: Thresholds,
    governor: RecoveryGovernor,
    window: SampleWindow,
    check_interval: Duration,
    recovery_enabled: bool,
    restart_on_emergency: bool,
    last_tick: Option<Instant>,
    root: CancellationToken,
    report: Shared<MonitorReport>,
}

impl ProcessMonitor {
    /// `root` est le token racine du process : seul ce moniteur a le droit de l'annuler
    pub fn new(
        monitoring: &MonitoringConf,
        recovery: &RecoveryConf,
        sampler: Box<dyn ResourceSampler>,
        handler: Box<dyn RecoveryHandler>,
        root: CancellationToken,
    ) -> Self {
        let check_interval = Duration::from_secs(monitoring.check_interval_secs);
        let mut report = MonitorReport::disabled();
        report.monitoring_enabled = true;
        report.auto_recovery_enabled = recovery.enabled;
        Self {
            sampler,
            handler,
            thresholds: Thresholds::from(monitoring),
            governor: RecoveryGovernor::from_conf(recovery, check_interval),
            window: SampleWindow::default(),
            check_interval,
            recovery_enabled: recovery.enabled,
            restart_on_emergency: recovery.restart_on_emergency,
            last_tick: None,
            root,
            report: new_state(report),
        }
    }

    pub fn report(&self) -> Shared<MonitorReport> {
        self.report.clone()
    }

    pub async fn run(mut self) -> MonitorExit {
        info!(interval = ?self.check_interval, "process monitor started");
        loop {
            match self.tick().await {
                Ok(Some(exit)) => return exit,
                Ok(None) => {}
                Err(MonitorError::Cancelled(_)) => break,
                Err(e) => error!(error = %e, "monitor cycle failed, continuing"),
            }
            if wait_or_cancel(&self.root, self.check_interval).await.is_err() {
                break;
            }
        }
        info!("process monitor stopped");
        MonitorExit::Shutdown
    }

    /// Un cycle : échantillon, classement, décision du gouverneur
    pub async fn tick(&mut self) -> Result<Option<MonitorExit>, MonitorError> {
        let outcome = self.check().await;
        self.last_tick = Some(Instant::now());
        outcome
    }

    /// Écart depuis la fin du cycle précédent, s'il dépasse l'intervalle de plus de `STALL_GRACE`
    fn stall(&self) -> Option<Breach> {
        let gap = self.last_tick?.elapsed();
        (gap > self.check_interval + STALL_GRACE).then(|| Breach::Stalled {
            gap_secs: gap.as_secs_f64(),
            expected_secs: self.check_interval.as_secs_f64(),
        })
    }

    async fn check(&mut self) -> Result<Option<MonitorExit>, MonitorError> {
        if self.root.is_cancelled() {
            return Err(Cancelled.into());
        }
        let sample = self.sampler.sample()?;
        self.window.push(sample);
        let mut breaches = self.window.evaluate(&self.thresholds);
        if let Some(stall) = self.stall() {
            error!(?stall, "monitor cycle late, runtime was blocked");
            breaches.push(stall);
        }
        let status = HealthStatus::classify(&breaches);
        self.publish(status, &breaches);

        match status {
            HealthStatus::Healthy => debug!(memory_mb = sample.memory_mb(), cpu = sample.cpu_percent, "process healthy"),
            HealthStatus::Warning => warn!(?breaches, "process warning"),
            _ => warn!(?status, ?breaches, "process unhealthy"),
        }
        if !self.recovery_enabled {
            return Ok(None);
        }

        match self.governor.on_sample(status.is_unhealthy()) {
            GovernorAction::None => Ok(None),
            GovernorAction::Latched => {
                debug!("emergency already handled, waiting for stable samples");
                Ok(None)
            }
            GovernorAction::Recover { attempt } => {
                warn!(attempt, max = self.governor.max_attempts, "automatic recovery");
                let outcome = self.handler.recover(RecoveryKind::Routine, &breaches).await;
                self.publish(status, &breaches);
                if let Some(deadline) = self.governor.cooldown_until() {
                    wait_until_or_cancel(&self.root, deadline).await?;
                }
                outcome.map_err(MonitorError::Recovery)?;
                Ok(None)
            }
            GovernorAction::Emergency => self.emergency(&breaches).await,
        }
    }

    async fn emergency(&mut self, breaches: &[Breach]) -> Result<Option<MonitorExit>, MonitorError> {
        error!(attempts = self.governor.attempts(), "maximum recovery attempts reached, emergency recovery");
        if let Err(e) = self.handler.recover(RecoveryKind::Emergency, breaches).await {
            error!(error = %e, "emergency recovery handler failed");
        }
        self.publish(HealthStatus::classify(breaches), breaches);
        if self.restart_on_emergency {
            error!("restart_on_emergency set: cancelling all tasks, process will exit");
            self.root.cancel();
            return Ok(Some(MonitorExit::RestartRequested));
        }
        warn!("emergency recovery done, all tasks keep running (restart_on_emergency=false)");
        Ok(None)
    }

    fn publish(&self, status: HealthStatus, breaches: &[Breach]) {
        let mut report = self.report.lock();
        report.status = status;
        report.latest = self.window.latest().copied();
        report.breaches = breaches.to_vec();
        report.recovery_attempts = self.governor.attempts();
        report.emergencies = self.governor.emergencies();
        report.last_recovery = self.governor.last_recovery;
        report.memory_baseline_mb = self.window.baseline_mb();
        report.memory_growth_mb = report.latest.map(|s| s.memory_mb() - self.window.baseline_mb()).unwrap_or(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(memory_mb: f64, cpu: f32, threads: u32) -> ResourceSample {
        ResourceSample {
            timestamp: OffsetDateTime::now_utc(),
            memory_bytes: (memory_mb * MB) as u64,
            cpu_percent: cpu,
            thread_count: threads,
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds::from(&MonitoringConf::default())
    }

    struct FixedSampler(ResourceSample);

    impl ResourceSampler for FixedSampler {
        fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
            Ok(self.0)
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl RecoveryHandler for FailingHandler {
        async fn recover(&self, _kind: RecoveryKind, _breaches: &[Breach]) -> anyhow::Result<()> {
            anyhow::bail!("scheduler unavailable")
        }
    }

    fn monitor(sample: ResourceSample) -> ProcessMonitor {
        ProcessMonitor::new(
            &MonitoringConf::default(),
            &RecoveryConf::default(),
            Box::new(FixedSampler(sample)),
            Box::new(FailingHandler),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_each_threshold_breaches_independently() {
        let over = thresholds().threads + 1;
        let cases = [(600.0, 10.0, 10), (100.0, 95.0, 10), (100.0, 10.0, over)];
        for (mem, cpu, threads) in cases {
            let mut window = SampleWindow::default();
            window.push(sample(mem, cpu, threads));
            let breaches = window.evaluate(&thresholds());
            assert_eq!(breaches.len(), 1, "{mem} {cpu} {threads}");
            assert_eq!(HealthStatus::classify(&breaches), HealthStatus::Critical);
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(HealthStatus::classify(&[]), HealthStatus::Healthy);
        let growth = Breach::MemoryGrowth { mb_per_sample: 12.0 };
        assert_eq!(HealthStatus::classify(&[growth.clone()]), HealthStatus::Warning);
        let cpu = Breach::Cpu { percent: 90.0, limit: 80.0 };
        let mem = Breach::Memory { mb: 600.0, limit: 500.0 };
        assert_eq!(HealthStatus::classify(&[cpu.clone(), mem.clone()]), HealthStatus::Critical);
        assert_eq!(HealthStatus::classify(&[cpu, mem, growth]), HealthStatus::Emergency);
    }

    #[test]
    fn test_memory_growth_detection() {
        let mut window = SampleWindow::default();
        for i in 0..5 {
            window.push(sample(100.0 + 20.0 * i as f64, 1.0, 4));
        }
        // (180 - 100) / 5 = 16 Mo par échantillon
        let growth = window.growth_per_sample_mb().unwrap();
        assert!((growth - 16.0).abs() < 0.01);
        assert_eq!(HealthStatus::classify(&window.evaluate(&thresholds())), HealthStatus::Warning);
        assert!((window.baseline_mb() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = SampleWindow::default();
        for _ in 0..150 {
            window.push(sample(50.0, 1.0, 4));
        }
        assert_eq!(window.len(), HISTORY_LEN);
    }

    #[test]
    fn test_governor_escalates_once() {
        let mut gov = RecoveryGovernor::new(3, Duration::from_secs(60), 6);
        let actions: Vec<_> = (0..6).map(|_| gov.on_sample(true)).collect();
        assert_eq!(
            actions,
            vec![
                GovernorAction::Recover { attempt: 1 },
                GovernorAction::Recover { attempt: 2 },
                GovernorAction::Emergency,
                GovernorAction::Latched,
                GovernorAction::Latched,
                GovernorAction::Latched,
            ]
        );
        assert_eq!(gov.emergencies(), 1);
    }

    #[test]
    fn test_governor_resets_after_stable_period() {
        let mut gov = RecoveryGovernor::new(3, Duration::from_secs(60), 6);
        gov.on_sample(true);
        gov.on_sample(true);
        for _ in 0..5 {
            gov.on_sample(false);
        }
        assert_eq!(gov.attempts(), 2);
        gov.on_sample(false);
        assert_eq!(gov.attempts(), 0);

        // un incident isolé n'hérite pas de l'historique
        assert_eq!(gov.on_sample(true), GovernorAction::Recover { attempt: 1 });
    }

    #[test]
    fn test_reset_samples_default_from_cooldown() {
        let gov = RecoveryGovernor::from_conf(&RecoveryConf::default(), Duration::from_secs(10));
        assert_eq!(gov.healthy_samples_to_reset, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handler_still_waits_cooldown() {
        let mut monitor = monitor(sample(100.0, 95.0, 10));
        let started = Instant::now();
        let err = monitor.tick().await.unwrap_err();
        assert!(matches!(err, MonitorError::Recovery(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(monitor.report().lock().recovery_attempts, 1);

        // la tentative suivante attend aussi son cooldown
        assert!(monitor.tick().await.is_err());
        assert_eq!(started.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_cycle_reported_as_stall() {
        let mut monitor = monitor(sample(100.0, 5.0, 10));
        monitor.tick().await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        monitor.tick().await.unwrap();
        assert_eq!(monitor.report().lock().status, HealthStatus::Healthy);

        tokio::time::advance(Duration::from_secs(41)).await;
        let _ = monitor.tick().await;
        let report = monitor.report().lock().clone();
        assert!(report.breaches.iter().any(|b| matches!(b, Breach::Stalled { .. })));
        assert!(report.recovery_attempts >= 1);

        // cycle suivant à l'heure : plus de blocage signalé
        tokio::time::advance(Duration::from_secs(10)).await;
        let _ = monitor.tick().await;
        let report = monitor.report().lock().clone();
        assert!(!report.breaches.iter().any(|b| matches!(b, Breach::Stalled { .. })));
    }
}
