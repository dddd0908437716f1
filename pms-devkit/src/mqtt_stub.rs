/*!
Mock MQTT Client pour tests sans broker

Enregistre toutes les publications du noyau (réponses de contrôle, télémétrie, statuts)
pour assertions. Implémente `Publisher`, il remplace donc `rumqttc::AsyncClient` partout.
*/

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use pms_kernel::mqtt::Publisher;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simule la publication d'un message (compatible avec AsyncClient)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage { topic: topic.into(), payload: payload.into(), qos, retain };
        tracing::debug!(topic = %message.topic, bytes = message.payload.len(), "[mock] published");
        self.published_messages.lock().push(message);
        Ok(())
    }

    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        tracing::debug!(%topic, "[mock] subscribed");
        self.subscriptions.lock().push(topic);
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Tous les messages JSON d'un topic, dans l'ordre de publication
    pub fn json_messages(&self, topic: &str) -> Vec<Value> {
        self.find_messages_by_topic(topic)
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
        self.subscriptions.lock().clear();
    }
}

#[async_trait]
impl Publisher for MockMqttClient {
    async fn publish_json(&self, topic: &str, payload: &Value, retain: bool) -> Result<()> {
        self.publish(topic, QoS::AtLeastOnce, retain, serde_json::to_vec(payload)?).await
    }
}

/// Corps de requêtes du canal de contrôle
pub struct ControlMessageBuilder;

impl ControlMessageBuilder {
    pub fn operation_mode(mode: &str, request_id: &str) -> Value {
        serde_json::json!({ "mode": mode, "request_id": request_id })
    }

    pub fn request(request_id: &str) -> Value {
        serde_json::json!({ "request_id": request_id })
    }

    /// `{action, ...params, request_id}` pour `{base}/control/{device}/command`
    pub fn device_command(action: &str, params: Value, request_id: &str) -> Value {
        let mut body = match params {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        body.insert("action".into(), Value::String(action.into()));
        body.insert("request_id".into(), Value::String(request_id.into()));
        Value::Object(body)
    }

    pub fn thresholds(high: f64, low: f64, charge_stop: f64, request_id: &str) -> Value {
        serde_json::json!({
            "soc_high_threshold": high,
            "soc_low_threshold": low,
            "soc_charge_stop_threshold": charge_stop,
            "request_id": request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_publish_subscribe() {
        let client = MockMqttClient::new();

        client.subscribe("pms/control/#", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(client.get_subscriptions(), vec!["pms/control/#"]);

        client.publish("test/topic", QoS::AtLeastOnce, false, b"payload".to_vec()).await.unwrap();
        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"payload");
    }

    #[tokio::test]
    async fn test_publisher_impl_records_json() {
        let client = MockMqttClient::new();
        let body = ControlMessageBuilder::device_command("charge", serde_json::json!({ "power_kw": 3.0 }), "r1");
        client.publish_json("pms/control/pcs1/command", &body, true).await.unwrap();

        let parsed: Option<Value> = client.get_last_json_message("pms/control/pcs1/command").unwrap();
        let parsed = parsed.unwrap();
        assert_eq!(parsed["action"], "charge");
        assert_eq!(parsed["power_kw"], 3.0);
        assert_eq!(parsed["request_id"], "r1");
        assert!(client.find_messages_by_topic("pms/control/pcs1/command")[0].retain);
    }
}
