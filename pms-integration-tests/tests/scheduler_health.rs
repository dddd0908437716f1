use pms_devkit::ScriptedDevice;
use pms_kernel::devices::DeviceRegistry;
use pms_kernel::models::{DeviceType, FieldValue};
use pms_kernel::scheduler::{DeviceHealthEvent, DeviceScheduler, HealthCheck, SchedulerError, SchedulerSettings};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        unhealthy_after: 5,
        // la boucle de contrôle ne doit pas interférer : les passages sont joués à la main
        health_check_interval: Duration::from_secs(3600),
        reset_threshold: 6,
    }
}

fn scheduler_for(devices: &[&ScriptedDevice]) -> DeviceScheduler {
    let registry = DeviceRegistry::new(devices.iter().map(|d| d.handle()).collect());
    DeviceScheduler::new(registry, settings(), &CancellationToken::new())
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_only_past_ceiling() {
    let pcs = ScriptedDevice::new("pcs1", DeviceType::Converter);
    pcs.fail_always("no route to host");
    let scheduler = scheduler_for(&[&pcs]);
    let mut events = scheduler.subscribe_health();
    scheduler.start();

    // polls à t=0..4 : cinq échecs, toujours sain
    sleep(Duration::from_millis(4500)).await;
    let stats = scheduler.device_stats("pcs1").unwrap();
    assert_eq!(stats.consecutive_errors, 5);
    assert!(stats.is_healthy);

    // sixième échec : malade, la boucle continue
    sleep(Duration::from_secs(1)).await;
    let stats = scheduler.device_stats("pcs1").unwrap();
    assert_eq!(stats.consecutive_errors, 6);
    assert!(!stats.is_healthy);
    assert!(scheduler.is_polling("pcs1"));
    assert_eq!(scheduler.unhealthy_devices(), vec!["pcs1".to_string()]);

    match events.try_recv() {
        Ok(DeviceHealthEvent::Unhealthy { device_id, consecutive_errors, .. }) => {
            assert_eq!(device_id, "pcs1");
            assert_eq!(consecutive_errors, 6);
        }
        other => panic!("expected unhealthy event, got {other:?}"),
    }

    // retour des réponses : sain au poll suivant
    pcs.set_default_fields([("operation_mode", FieldValue::Status(1))]);
    sleep(Duration::from_secs(3)).await;
    assert!(scheduler.device_stats("pcs1").unwrap().is_healthy);
    let mut recovered = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            DeviceHealthEvent::Recovered { .. } => recovered += 1,
            DeviceHealthEvent::Unhealthy { .. } => panic!("unhealthy reported twice"),
            DeviceHealthEvent::CountersReset { .. } => {}
        }
    }
    assert_eq!(recovered, 1);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_counters_cleared_after_clean_checks() {
    let bms = ScriptedDevice::new("bms1", DeviceType::Battery);
    bms.fail_always("crc error");
    let scheduler = scheduler_for(&[&bms]);
    scheduler.start();

    sleep(Duration::from_millis(2500)).await;
    // gel des compteurs : la boucle suspendue n'est pas relancée par le contrôle
    scheduler.pause("bms1").await.unwrap();
    assert_eq!(scheduler.device_stats("bms1").unwrap().consecutive_errors, 3);

    let mut check = HealthCheck::new(6);
    for _ in 0..5 {
        scheduler.run_health_check_once(&mut check);
        assert_eq!(scheduler.device_stats("bms1").unwrap().consecutive_errors, 3);
    }
    scheduler.run_health_check_once(&mut check);
    let stats = scheduler.device_stats("bms1").unwrap();
    assert_eq!(stats.consecutive_errors, 0);
    assert!(stats.is_healthy);
    assert!(stats.paused);
    assert!(!scheduler.is_polling("bms1"));
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_hung_poll_counts_as_failure() {
    let dcdc = ScriptedDevice::new("dcdc1", DeviceType::SolarLink);
    dcdc.hang_polls();
    let scheduler = scheduler_for(&[&dcdc]);
    scheduler.start();

    // poll 1s → timeout 5s, puis 1s d'attente
    sleep(Duration::from_millis(5500)).await;
    let stats = scheduler.device_stats("dcdc1").unwrap();
    assert_eq!(stats.failed_polls, 1);
    assert!(stats.last_error.unwrap().contains("timed out"));
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_resume_restarts_only_paused_loops() {
    let bms = ScriptedDevice::new("bms1", DeviceType::Battery);
    let pcs = ScriptedDevice::new("pcs1", DeviceType::Converter);
    let scheduler = scheduler_for(&[&bms, &pcs]);
    scheduler.start();
    sleep(Duration::from_millis(500)).await;

    scheduler.pause("pcs1").await.unwrap();
    assert!(!scheduler.is_polling("pcs1"));
    assert!(scheduler.is_polling("bms1"));
    let polls_before = pcs.poll_count();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(pcs.poll_count(), polls_before);

    assert_eq!(scheduler.resume_all(), 1);
    sleep(Duration::from_millis(100)).await;
    assert!(scheduler.is_polling("pcs1"));
    assert!(pcs.poll_count() > polls_before);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deactivate_drops_task_and_activate_starts_fresh() {
    let bms = ScriptedDevice::new("bms1", DeviceType::Battery);
    let pcs = ScriptedDevice::new("pcs1", DeviceType::Converter);
    pcs.fail_always("timeout");
    let scheduler = scheduler_for(&[&bms, &pcs]);
    let mut snapshots = scheduler.subscribe();
    scheduler.start();

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(scheduler.device_stats("pcs1").unwrap().consecutive_errors, 3);

    scheduler.deactivate("pcs1").await.unwrap();
    assert!(!scheduler.is_polling("pcs1"));
    assert!(scheduler.device_stats("pcs1").is_none());
    assert!(scheduler.is_polling("bms1"));
    let polls = pcs.poll_count();
    while snapshots.try_recv().is_ok() {}

    // plus aucune lecture ni snapshot pour l'équipement retiré
    pcs.set_default_fields([("operation_mode", FieldValue::Status(1))]);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(pcs.poll_count(), polls);
    while let Ok(snapshot) = snapshots.try_recv() {
        assert_eq!(snapshot.device_id, "bms1");
    }
    assert_eq!(scheduler.deactivate("pcs1").await, Err(SchedulerError::Inactive("pcs1".into())));

    // nouvelle DeviceTask : compteurs repartis de zéro
    scheduler.activate("pcs1").unwrap();
    sleep(Duration::from_millis(500)).await;
    let stats = scheduler.device_stats("pcs1").unwrap();
    assert!(stats.polling);
    assert_eq!(stats.total_polls, 1);
    assert_eq!(stats.consecutive_errors, 0);
    assert!(stats.last_error.is_none());
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_inactive_device_waits_for_activation() {
    let bms = ScriptedDevice::new("bms1", DeviceType::Battery);
    let dcdc = ScriptedDevice::new("dcdc1", DeviceType::SolarLink)
        .with_poll_interval(Duration::from_secs(2))
        .inactive();
    let scheduler = scheduler_for(&[&bms, &dcdc]);
    scheduler.start();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(dcdc.poll_count(), 0);
    assert!(!scheduler.is_polling("dcdc1"));
    assert!(scheduler.device_stats("dcdc1").is_none());

    // polls à t=0, 2 et 4 sur son propre intervalle
    scheduler.activate("dcdc1").unwrap();
    sleep(Duration::from_millis(4500)).await;
    assert_eq!(dcdc.poll_count(), 3);
    assert_eq!(scheduler.device_stats("dcdc1").unwrap().successful_polls, 3);

    // activer une boucle déjà lancée ne la double pas
    scheduler.activate("dcdc1").unwrap();
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(dcdc.poll_count(), 3);
    assert_eq!(scheduler.activate("meter9"), Err(SchedulerError::UnknownDevice("meter9".into())));
    scheduler.stop().await;
}
