use async_trait::async_trait;
use parking_lot::Mutex;
use pms_devkit::ScriptedDevice;
use pms_integration_tests::{critical_sample, healthy_sample, ScriptedSampler};
use pms_kernel::config::{MonitoringConf, RecoveryConf};
use pms_kernel::devices::DeviceRegistry;
use pms_kernel::models::DeviceType;
use pms_kernel::monitor::{Breach, HealthStatus, MonitorExit, ProcessMonitor, RecoveryHandler, RecoveryKind, SchedulerRecovery};
use pms_kernel::scheduler::{DeviceScheduler, SchedulerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Délègue à `SchedulerRecovery` en gardant la trace des appels
struct Recording {
    inner: SchedulerRecovery,
    calls: Arc<Mutex<Vec<RecoveryKind>>>,
}

#[async_trait]
impl RecoveryHandler for Recording {
    async fn recover(&self, kind: RecoveryKind, breaches: &[Breach]) -> anyhow::Result<()> {
        self.calls.lock().push(kind);
        self.inner.recover(kind, breaches).await
    }
}

struct Fixture {
    root: CancellationToken,
    scheduler: DeviceScheduler,
    bms: ScriptedDevice,
    pcs: ScriptedDevice,
    calls: Arc<Mutex<Vec<RecoveryKind>>>,
}

fn fixture() -> Fixture {
    let bms = ScriptedDevice::new("bms1", DeviceType::Battery);
    let pcs = ScriptedDevice::new("pcs1", DeviceType::Converter);
    let root = CancellationToken::new();
    let registry = DeviceRegistry::new(vec![bms.handle(), pcs.handle()]);
    let scheduler = DeviceScheduler::new(registry, SchedulerSettings::default(), &root);
    scheduler.start();
    Fixture { root, scheduler, bms, pcs, calls: Arc::new(Mutex::new(Vec::new())) }
}

fn monitor(f: &Fixture, sampler: ScriptedSampler, restart_on_emergency: bool) -> ProcessMonitor {
    let monitoring = MonitoringConf { check_interval_secs: 10, ..MonitoringConf::default() };
    let recovery = RecoveryConf {
        enabled: true,
        max_attempts: 3,
        cooldown_seconds: 60,
        restart_on_emergency,
        healthy_samples_to_reset: None,
    };
    let handler = Recording { inner: SchedulerRecovery::new(f.scheduler.clone()), calls: f.calls.clone() };
    ProcessMonitor::new(&monitoring, &recovery, Box::new(sampler), Box::new(handler), f.root.clone())
}

#[tokio::test(start_paused = true)]
async fn test_emergency_fires_once_and_keeps_polling() {
    let f = fixture();
    let monitor = monitor(&f, ScriptedSampler::new([critical_sample()]), false);
    let report = monitor.report();
    let task = tokio::spawn(monitor.run());

    // t=0 essai 1, t=70 essai 2, t=140 urgence, puis verrou
    sleep(Duration::from_secs(300)).await;
    assert_eq!(*f.calls.lock(), vec![RecoveryKind::Routine, RecoveryKind::Routine, RecoveryKind::Emergency]);
    {
        let report = report.lock();
        assert_eq!(report.emergencies, 1);
        assert_eq!(report.status, HealthStatus::Critical);
    }

    // aucun équipement sain n'a été touché
    assert!(!f.root.is_cancelled());
    for id in ["bms1", "pcs1"] {
        assert!(f.scheduler.is_polling(id), "{id} stopped");
        assert!(!f.scheduler.device_stats(id).unwrap().paused);
    }
    assert!(f.bms.poll_count() >= 300);
    assert!(f.pcs.poll_count() >= 300);

    f.root.cancel();
    assert_eq!(task.await.unwrap(), MonitorExit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_stable_period_rearms_governor() {
    let f = fixture();
    let sampler = ScriptedSampler::new([critical_sample(), critical_sample(), critical_sample()]);
    // six échantillons sains (cooldown 60s / intervalle 10s) puis une nouvelle alerte
    for _ in 0..6 {
        sampler.push(healthy_sample());
    }
    sampler.push(critical_sample());
    sampler.push(healthy_sample());
    let monitor = monitor(&f, sampler, false);
    let report = monitor.report();
    let _task = tokio::spawn(monitor.run());

    sleep(Duration::from_secs(400)).await;
    assert_eq!(
        *f.calls.lock(),
        vec![RecoveryKind::Routine, RecoveryKind::Routine, RecoveryKind::Emergency, RecoveryKind::Routine]
    );
    assert_eq!(report.lock().emergencies, 1);
    f.root.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_restart_on_emergency_cancels_everything() {
    let f = fixture();
    let monitor = monitor(&f, ScriptedSampler::new([critical_sample()]), true);

    let exit = tokio::spawn(monitor.run()).await.unwrap();
    assert_eq!(exit, MonitorExit::RestartRequested);
    assert!(f.root.is_cancelled());

    sleep(Duration::from_millis(10)).await;
    assert!(!f.scheduler.is_polling("bms1"));
    assert!(!f.scheduler.is_polling("pcs1"));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_restarts_only_unhealthy_device() {
    let f = fixture();
    f.pcs.fail_always("bus error");
    let sampler = ScriptedSampler::new([healthy_sample(), critical_sample(), healthy_sample()]);
    let monitor = monitor(&f, sampler, false);
    let _task = tokio::spawn(monitor.run());

    // pcs1 malade à t=5, alerte process à t=10
    sleep(Duration::from_secs(8)).await;
    assert_eq!(f.scheduler.unhealthy_devices(), vec!["pcs1".to_string()]);
    let bms_polls = f.bms.poll_count();

    sleep(Duration::from_secs(100)).await;
    assert_eq!(*f.calls.lock(), vec![RecoveryKind::Routine]);
    assert!(f.scheduler.is_polling("pcs1"));
    assert!(!f.scheduler.device_stats("pcs1").unwrap().paused);
    assert!(f.scheduler.is_polling("bms1"));
    // la boucle batterie n'a jamais été interrompue : un poll par seconde
    assert!(f.bms.poll_count() >= bms_polls + 99);
    f.root.cancel();
}
