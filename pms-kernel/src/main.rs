/**
 * PMS KERNEL - Point d'entrée du noyau de conduite
 *
 * RÔLE : Orchestration de tous les modules : config, ordonnanceur, moniteur, automates,
 * MQTT, HTTP. Un seul token racine porte l'arrêt du process.
 *
 * SORTIE : code 1 si le moniteur demande un redémarrage (urgence avec `restart_on_emergency`),
 * le superviseur externe relance alors le service.
 */

use anyhow::Context;
use pms_kernel::automation::operation::OperationManager;
use pms_kernel::config::load_config;
use pms_kernel::control::{ControlRouter, Topics};
use pms_kernel::devices::build_registry;
use pms_kernel::health::{HealthTracker, StatusPublisher, STATUS_PERIOD};
use pms_kernel::http::{self, AppState};
use pms_kernel::monitor::{MonitorExit, MonitorReport, ProcessMonitor, SchedulerRecovery, SysinfoSampler};
use pms_kernel::mqtt::{self, Publisher};
use pms_kernel::scheduler::{DeviceScheduler, SchedulerSettings};
use pms_kernel::shutdown::spawn_signal_listener;
use pms_kernel::state::new_state;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pms_kernel=info")))
        .init();

    let cfg = load_config().await.context("invalid configuration")?;
    let root = CancellationToken::new();

    // équipements + ordonnanceur
    let registry = build_registry(&cfg).context("cannot build device registry")?;
    info!(devices = ?registry.names(), "device registry ready");
    let scheduler = DeviceScheduler::new(registry.clone(), SchedulerSettings::from(&cfg.scheduler), &root);
    scheduler.start();

    // moniteur de ressources
    let mut monitor_task = None;
    let monitor_report = if cfg.monitoring.enabled {
        let sampler = SysinfoSampler::new().context("cannot sample process resources")?;
        let monitor = ProcessMonitor::new(
            &cfg.monitoring,
            &cfg.recovery,
            Box::new(sampler),
            Box::new(SchedulerRecovery::new(scheduler.clone())),
            root.clone(),
        );
        let report = monitor.report();
        monitor_task = Some(tokio::spawn(monitor.run()));
        report
    } else {
        info!("process monitoring disabled");
        new_state(MonitorReport::disabled())
    };

    // mode d'opération, automate SOC, récupération de défaut
    let operations = OperationManager::start(&cfg, &scheduler, &root);

    // MQTT
    let health_tracker = HealthTracker::new();
    let topics = Topics::new(&cfg.mqtt.base_topic);
    let (client, eventloop) = mqtt::create_mqtt_client(&cfg.mqtt);
    let publisher: Arc<dyn Publisher> = Arc::new(client.clone());
    let status = Arc::new(StatusPublisher::new(
        publisher.clone(),
        topics.clone(),
        operations.clone(),
        scheduler.clone(),
        monitor_report.clone(),
        health_tracker.clone(),
    ));
    let router = Arc::new(ControlRouter::new(
        topics.clone(),
        operations.clone(),
        Duration::from_secs(cfg.control.command_timeout_secs),
    ));
    mqtt::spawn_mqtt_listener(client, eventloop, router, status.clone(), health_tracker.clone(), root.clone());
    mqtt::spawn_telemetry_publisher(publisher, topics, registry, scheduler.subscribe(), root.clone());
    status.spawn(STATUS_PERIOD, root.clone());

    // Ctrl-C / SIGTERM → arrêt propre
    spawn_signal_listener(root.clone()).context("cannot install signal handlers")?;

    // HTTP
    let app = http::build_router(AppState {
        scheduler: scheduler.clone(),
        operations,
        monitor: monitor_report,
        health_tracker,
    });
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");
    let http_root = root.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { http_root.cancelled().await })
        .await
        .context("HTTP server failed")?;

    scheduler.stop().await;
    let exit = match monitor_task {
        Some(task) => task.await.unwrap_or(MonitorExit::Shutdown),
        None => MonitorExit::Shutdown,
    };
    if exit == MonitorExit::RestartRequested {
        warn!("exiting for restart after emergency recovery");
        std::process::exit(1);
    }
    info!("kernel stopped");
    Ok(())
}
