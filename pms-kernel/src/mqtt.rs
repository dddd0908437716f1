/**
 * MQTT - Canal de contrôle entrant + publication de télémétrie
 *
 * FONCTIONNEMENT :
 * - Une seule connexion broker partagée (client clonable + boucle d'événements)
 * - Abonnement à `{base}/control/#` renouvelé à chaque ConnAck (reconnexion comprise)
 * - Chaque requête est traitée dans sa propre tâche : la boucle d'événements
 *   n'attend jamais un équipement
 * - Erreur réseau : pause de 2s puis nouvel essai, compteur de reconnexions à jour
 */

use crate::control::{ControlRouter, Topics};
use crate::config::MqttConf;
use crate::devices::DeviceRegistry;
use crate::health::{HealthTracker, StatusPublisher};
use crate::models::TelemetrySnapshot;
use crate::shutdown::wait_or_cancel;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Sortie JSON vers le broker (client réel ou mock de test)
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_json(&self, topic: &str, payload: &Value, retain: bool) -> anyhow::Result<()>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish_json(&self, topic: &str, payload: &Value, retain: bool) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.publish(topic, QoS::AtLeastOnce, retain, bytes).await?;
        Ok(())
    }
}

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    AsyncClient::new(opts, 64)
}

/// Boucle d'événements MQTT : connexion, abonnement, routage des requêtes de contrôle
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    router: Arc<ControlRouter>,
    status: Arc<StatusPublisher>,
    health: HealthTracker,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    task::spawn(async move {
        let filter = router.topics().control_filter();
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("MQTT connected");
                    health.mark_mqtt_connected();
                    // la file du client est vidée par cette boucle : on ne bloque pas dessus
                    let client = client.clone();
                    let filter = filter.clone();
                    task::spawn(async move {
                        match client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
                            Ok(()) => info!(%filter, "subscribed to control topics"),
                            Err(e) => error!(error = %e, "MQTT subscribe failed"),
                        }
                    });
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    let router = router.clone();
                    let status = status.clone();
                    let client = client.clone();
                    task::spawn(async move {
                        let Some(routed) = router.handle(&p.topic, &p.payload).await else {
                            debug!(topic = %p.topic, "ignored message");
                            return;
                        };
                        match serde_json::to_value(&routed.response) {
                            Ok(body) => {
                                if let Err(e) = client.publish_json(&routed.topic, &body, false).await {
                                    error!(error = %e, topic = %routed.topic, "failed to publish control response");
                                }
                            }
                            Err(e) => error!(error = %e, "control response not serializable"),
                        }
                        if routed.refresh_status {
                            status.publish_operation_status().await;
                        }
                    });
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    warn!("MQTT disconnected by broker");
                    health.mark_mqtt_disconnected();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, retrying");
                    health.increment_reconnects();
                    if wait_or_cancel(&shutdown, RETRY_DELAY).await.is_err() {
                        break;
                    }
                }
            }
        }
        info!("MQTT listener stopped");
    })
}

/// Message publié à chaque cycle de lecture
pub fn telemetry_message(snapshot: &TelemetrySnapshot, registry: &DeviceRegistry) -> Value {
    let endpoint = registry.get(&snapshot.device_id).map(|link| link.device().endpoint.to_string());
    json!({
        "device_name": snapshot.device_id,
        "device_type": snapshot.device_type,
        "timestamp": snapshot.timestamp.format(&Rfc3339).unwrap_or_default(),
        "endpoint": endpoint,
        "data": snapshot.fields,
    })
}

/// Relaie chaque snapshot de l'ordonnanceur sur `{base}/{type}/{device}/data`
pub fn spawn_telemetry_publisher(
    publisher: Arc<dyn Publisher>,
    topics: Topics,
    registry: DeviceRegistry,
    mut snapshots: broadcast::Receiver<TelemetrySnapshot>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = snapshots.recv() => received,
            };
            match received {
                Ok(snapshot) => {
                    let topic = topics.telemetry(&snapshot);
                    let body = telemetry_message(&snapshot, &registry);
                    if let Err(e) = publisher.publish_json(&topic, &body, false).await {
                        warn!(error = %e, %topic, "telemetry publish failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "telemetry publisher lagging, snapshots dropped"),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("telemetry publisher stopped");
    })
}
