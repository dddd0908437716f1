use pms_devkit::{MockMqttClient, TestHarness};
use pms_kernel::health::{HealthTracker, StatusPublisher};
use pms_kernel::models::FieldValue;
use pms_kernel::mqtt::{spawn_telemetry_publisher, Publisher};
use pms_kernel::monitor::MonitorReport;
use pms_kernel::state::new_state;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_one_message_per_poll_with_metadata() {
    let harness = TestHarness::new();
    harness.battery.set_default_fields([
        ("error_code_2", FieldValue::Status(0)),
        ("battery_soc", FieldValue::Number(71.5)),
        ("dc_contactor", FieldValue::Bool(true)),
    ]);
    let mqtt = MockMqttClient::new();
    let publisher: Arc<dyn Publisher> = Arc::new(mqtt.clone());
    spawn_telemetry_publisher(
        publisher,
        harness.topics.clone(),
        harness.registry().clone(),
        harness.scheduler().subscribe(),
        harness.root.clone(),
    );
    harness.scheduler().start();

    // polls à t=0, 1, 2
    sleep(Duration::from_millis(2500)).await;
    let messages = mqtt.json_messages("pms/bms/bms1/data");
    assert_eq!(messages.len(), 3);
    let last = &messages[2];
    assert_eq!(last["device_name"], "bms1");
    assert_eq!(last["device_type"], "battery");
    assert_eq!(last["endpoint"], "scripted:502#1");
    assert_eq!(last["data"]["battery_soc"], 71.5);
    assert_eq!(last["data"]["dc_contactor"], true);
    assert!(last["timestamp"].as_str().unwrap().contains('T'));
    // ordre de lecture de l'équipement, pas l'ordre alphabétique
    let keys: Vec<&str> = last["data"].as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(keys, ["error_code_2", "battery_soc", "dc_contactor"]);

    assert_eq!(mqtt.json_messages("pms/pcs/pcs1/data").len(), 3);
    assert_eq!(mqtt.json_messages("pms/dcdc/dcdc1/data").len(), 3);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_polls_publish_nothing() {
    let harness = TestHarness::new();
    harness.converter.fail_always("timeout");
    let mqtt = MockMqttClient::new();
    spawn_telemetry_publisher(
        Arc::new(mqtt.clone()),
        harness.topics.clone(),
        harness.registry().clone(),
        harness.scheduler().subscribe(),
        harness.root.clone(),
    );
    harness.scheduler().start();

    sleep(Duration::from_millis(1500)).await;
    assert!(mqtt.json_messages("pms/pcs/pcs1/data").is_empty());
    assert_eq!(mqtt.json_messages("pms/bms/bms1/data").len(), 2);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_published_periodically() {
    let harness = TestHarness::new();
    let ops = harness.start_operations();
    let status = Arc::new(StatusPublisher::new(
        Arc::new(harness.mqtt_client.clone()),
        harness.topics.clone(),
        ops.clone(),
        harness.scheduler().clone(),
        new_state(MonitorReport::disabled()),
        HealthTracker::new(),
    ));
    status.spawn(Duration::from_secs(30), harness.root.clone());

    sleep(Duration::from_secs(65)).await;
    let health = harness.mqtt_client.json_messages("pms/status/kernel/health");
    assert_eq!(health.len(), 3);
    assert_eq!(health[2]["devices_tracked"], 3);
    assert_eq!(health[2]["mqtt_status"], "connecting");

    let op = harness.mqtt_client.json_messages("pms/status/operation_mode");
    assert_eq!(op.len(), 3);
    assert_eq!(op[0]["current_mode"], "basic");
    assert_eq!(op[0]["basic_mode"]["available_devices"], serde_json::json!(["bms1", "dcdc1", "pcs1"]));

    let thresholds = harness.mqtt_client.json_messages("pms/status/threshold_config");
    assert_eq!(thresholds[0]["soc_high_threshold"], 88.0);
    assert!(harness.mqtt_client.find_messages_by_topic("pms/status/kernel/health")[0].retain);
    harness.root.cancel();
}
