/**
 * CANAL DE CONTRÔLE - Requêtes MQTT → gestionnaire de mode → réponse
 *
 * RÔLE :
 * Traduit chaque message reçu sous `pms/control/...` en demande au gestionnaire de mode
 * et produit exactement une réponse portant le `request_id` d'origine.
 *
 * FONCTIONNEMENT :
 * - `Topics` construit et reconnaît les topics (base configurable, `pms` par défaut)
 * - `parse_device_command` valide l'action demandée avant tout envoi à l'équipement
 * - `ControlRouter::handle` borne le traitement par un timeout : succès, échec ou expiration,
 *   le demandeur reçoit toujours une réponse
 *
 * TOPICS :
 * - `{base}/control/operation_mode`, `{base}/control/auto_mode/{start|stop|status}`
 * - `{base}/control/threshold_config`, `{base}/control/basic_mode`
 * - `{base}/control/{device}/command` → réponse sur `{base}/control/{device}/response`
 * - tout le reste répond sur `{base}/status/operation_mode/response`
 */

use crate::automation::operation::{OperationHandle, OperationMode};
use crate::config::ThresholdUpdate;
use crate::devices::{DeviceCommand, DeviceError};
use crate::models::{DeviceType, TelemetrySnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unsupported operation mode '{0}'")]
    UnsupportedMode(String),
    #[error("direct device control is disabled while auto mode is active")]
    AutoModeActive,
    #[error("auto mode is disabled in configuration")]
    AutoModeDisabled,
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("no {0} device configured")]
    MissingDevice(DeviceType),
    #[error("invalid thresholds: {0}")]
    InvalidThresholds(String),
    #[error("operation manager unavailable")]
    ManagerUnavailable,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("no result within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlTopic {
    OperationMode,
    AutoStart,
    AutoStop,
    AutoStatus,
    ThresholdConfig,
    BasicControl,
    DeviceCommand(String),
}

/// Construction et reconnaissance des topics sous une base commune
#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: &str) -> Self {
        Self { base: base.trim_end_matches('/').to_string() }
    }

    pub fn control_filter(&self) -> String {
        format!("{}/control/#", self.base)
    }

    pub fn operation_response(&self) -> String {
        format!("{}/status/operation_mode/response", self.base)
    }

    pub fn device_response(&self, device: &str) -> String {
        format!("{}/control/{device}/response", self.base)
    }

    pub fn telemetry(&self, snapshot: &TelemetrySnapshot) -> String {
        format!("{}/{}/{}/data", self.base, snapshot.device_type.topic_segment(), snapshot.device_id)
    }

    pub fn operation_status(&self) -> String {
        format!("{}/status/operation_mode", self.base)
    }

    pub fn threshold_status(&self) -> String {
        format!("{}/status/threshold_config", self.base)
    }

    pub fn kernel_health(&self) -> String {
        format!("{}/status/kernel/health", self.base)
    }

    /// `None` pour tout ce qui n'est pas une requête (réponses comprises)
    pub fn parse(&self, topic: &str) -> Option<ControlTopic> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix("/control/")?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            ["operation_mode"] => Some(ControlTopic::OperationMode),
            ["auto_mode", "start"] => Some(ControlTopic::AutoStart),
            ["auto_mode", "stop"] => Some(ControlTopic::AutoStop),
            ["auto_mode", "status"] => Some(ControlTopic::AutoStatus),
            ["threshold_config"] => Some(ControlTopic::ThresholdConfig),
            ["basic_mode"] => Some(ControlTopic::BasicControl),
            [device, "command"] if !device.is_empty() => Some(ControlTopic::DeviceCommand(device.to_string())),
            _ => None,
        }
    }
}

/// Corps de réponse commun à toutes les requêtes de contrôle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub request_id: String,
    pub success: bool,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlResponse {
    fn new(request_id: String, device_name: Option<String>, outcome: Result<Outcome, ControlError>) -> Self {
        let (success, message, data) = match outcome {
            Ok(o) => (true, o.message, o.data),
            Err(e) => (false, e.to_string(), None),
        };
        Self {
            request_id,
            success,
            message,
            timestamp: OffsetDateTime::now_utc(),
            device_name,
            data,
        }
    }
}

/// Réponse prête à publier
#[derive(Debug, Clone)]
pub struct Routed {
    pub topic: String,
    pub response: ControlResponse,
    /// Le statut de mode a changé, à republier
    pub refresh_status: bool,
}

struct Outcome {
    message: String,
    data: Option<Value>,
}

impl Outcome {
    fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), data: None }
    }

    fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self { message: message.into(), data: Some(data) }
    }
}

/// `request_id` du message, ou un identifiant généré si absent
pub fn request_id(body: &Value) -> String {
    match body.get("request_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => format!("unknown_{}", Uuid::new_v4()),
    }
}

fn field_f64(body: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| body.get(*k).and_then(Value::as_f64))
}

fn parse_u16(value: &Value, what: &str) -> Result<u16, ControlError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse::<u64>().ok(),
            }
        }
        _ => None,
    };
    parsed
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| ControlError::Malformed(format!("'{what}' must be a 16-bit value")))
}

fn parse_switch(body: &Value) -> Result<bool, ControlError> {
    for key in ["enable", "closed", "state"] {
        match body.get(key) {
            Some(Value::Bool(b)) => return Ok(*b),
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "on" | "close" | "closed" | "true" => return Ok(true),
                "off" | "open" | "false" => return Ok(false),
                other => return Err(ControlError::Malformed(format!("invalid contactor state '{other}'"))),
            },
            Some(Value::Number(n)) => return Ok(n.as_u64().unwrap_or(0) != 0),
            _ => {}
        }
    }
    Err(ControlError::Malformed("contactor command needs 'enable'".into()))
}

/// Traduit `{action, ...params}` en commande typée
pub fn parse_device_command(body: &Value) -> Result<DeviceCommand, ControlError> {
    let action = body
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| ControlError::Malformed("missing 'action'".into()))?;

    let command = match action {
        "write_register" => {
            let address = body
                .get("address")
                .ok_or_else(|| ControlError::Malformed("missing 'address'".into()))?;
            let value = body
                .get("value")
                .ok_or_else(|| ControlError::Malformed("missing 'value'".into()))?;
            DeviceCommand::WriteRegister { address: parse_u16(address, "address")?, value: parse_u16(value, "value")? }
        }
        "standby" => DeviceCommand::Standby,
        "independent" => DeviceCommand::Independent,
        "stop" => DeviceCommand::Stop,
        "charge" => DeviceCommand::Charge { power_kw: charge_power(body)? },
        "reset_faults" => DeviceCommand::ResetFaults,
        "reset" => DeviceCommand::Reset,
        "solar_charge" => DeviceCommand::SolarCharge,
        "reset_errors" => DeviceCommand::ResetErrors,
        "reset_system_lock" => DeviceCommand::ResetSystemLock,
        "contactor" | "dc_contactor" => DeviceCommand::Contactor { closed: parse_switch(body)? },
        "operation_mode" => {
            let mode = body
                .get("mode")
                .and_then(Value::as_str)
                .ok_or_else(|| ControlError::Malformed("operation_mode needs 'mode'".into()))?;
            match mode {
                "standby" => DeviceCommand::Standby,
                "independent" => DeviceCommand::Independent,
                "stop" => DeviceCommand::Stop,
                "solar_charge" => DeviceCommand::SolarCharge,
                "charge" => DeviceCommand::Charge { power_kw: charge_power(body)? },
                other => return Err(ControlError::UnknownAction(format!("operation_mode/{other}"))),
            }
        }
        other => return Err(ControlError::UnknownAction(other.to_string())),
    };
    Ok(command)
}

/// Puissance de charge strictement positive, sous `power_kw` ou `power`
fn charge_power(body: &Value) -> Result<f64, ControlError> {
    let power_kw = field_f64(body, &["power_kw", "power"])
        .ok_or_else(|| ControlError::Malformed("charge needs 'power_kw'".into()))?;
    if power_kw <= 0.0 {
        return Err(ControlError::Malformed("charge power must be positive".into()));
    }
    Ok(power_kw)
}

/// Transforme `{device_name, command, params}` en (équipement, corps `{action, ...params}`)
fn basic_mode_request(body: &Value) -> Result<(String, Value), ControlError> {
    let device = body
        .get("device_name")
        .and_then(Value::as_str)
        .ok_or_else(|| ControlError::Malformed("missing 'device_name'".into()))?;
    let action = body
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| ControlError::Malformed("missing 'command'".into()))?;
    let mut merged = match body.get("params") {
        Some(Value::Object(params)) => params.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => return Err(ControlError::Malformed("'params' must be an object".into())),
    };
    merged.insert("action".into(), Value::String(action.to_string()));
    Ok((device.to_string(), Value::Object(merged)))
}

pub struct ControlRouter {
    topics: Topics,
    operations: OperationHandle,
    timeout: Duration,
}

impl ControlRouter {
    pub fn new(topics: Topics, operations: OperationHandle, timeout: Duration) -> Self {
        Self { topics, operations, timeout }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Traite un message de contrôle ; `None` si le topic n'est pas une requête
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Option<Routed> {
        let route = self.topics.parse(topic)?;

        let body: Result<Value, ControlError> = if payload.iter().all(u8::is_ascii_whitespace) {
            Ok(Value::Object(Map::new()))
        } else {
            serde_json::from_slice(payload).map_err(|e| ControlError::Malformed(e.to_string()))
        };
        let empty = Value::Null;
        let request_id = request_id(body.as_ref().unwrap_or(&empty));

        let device_name = match (&route, &body) {
            (ControlTopic::DeviceCommand(device), _) => Some(device.clone()),
            (ControlTopic::BasicControl, Ok(b)) => b.get("device_name").and_then(Value::as_str).map(String::from),
            _ => None,
        };
        let response_topic = match &device_name {
            Some(device) => self.topics.device_response(device),
            None => self.topics.operation_response(),
        };

        debug!(%topic, %request_id, "control request");
        let outcome = match body {
            Err(e) => Err(e),
            Ok(body) => match tokio::time::timeout(self.timeout, self.dispatch(&route, &body)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ControlError::Timeout(self.timeout)),
            },
        };

        match &outcome {
            Ok(o) => info!(%topic, %request_id, message = %o.message, "control request handled"),
            Err(e) => warn!(%topic, %request_id, error = %e, "control request failed"),
        }
        let refresh_status = outcome.is_ok()
            && matches!(route, ControlTopic::OperationMode | ControlTopic::AutoStart | ControlTopic::AutoStop);

        Some(Routed {
            topic: response_topic,
            response: ControlResponse::new(request_id, device_name, outcome),
            refresh_status,
        })
    }

    async fn dispatch(&self, route: &ControlTopic, body: &Value) -> Result<Outcome, ControlError> {
        match route {
            ControlTopic::OperationMode => {
                let mode = body
                    .get("mode")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ControlError::Malformed("missing 'mode'".into()))?
                    .parse::<OperationMode>()?;
                let message = self.operations.set_mode(mode).await?;
                Ok(Outcome::with_data(message, json!({ "mode": mode })))
            }
            ControlTopic::AutoStart => Ok(Outcome::message(self.operations.start_auto().await?)),
            ControlTopic::AutoStop => Ok(Outcome::message(self.operations.stop_auto().await?)),
            ControlTopic::AutoStatus => {
                let status = self.operations.status();
                let data = serde_json::to_value(&status.auto_mode).map_err(|e| ControlError::Malformed(e.to_string()))?;
                Ok(Outcome::with_data("auto mode status", data))
            }
            ControlTopic::ThresholdConfig => {
                let update: ThresholdUpdate =
                    serde_json::from_value(body.clone()).map_err(|e| ControlError::Malformed(e.to_string()))?;
                let next = self.operations.update_thresholds(update).await?;
                let data = serde_json::to_value(&next).map_err(|e| ControlError::Malformed(e.to_string()))?;
                Ok(Outcome::with_data("thresholds updated", data))
            }
            ControlTopic::BasicControl => {
                let (device, body) = basic_mode_request(body)?;
                self.device_command(&device, &body).await
            }
            ControlTopic::DeviceCommand(device) => self.device_command(device, body).await,
        }
    }

    async fn device_command(&self, device: &str, body: &Value) -> Result<Outcome, ControlError> {
        let command = parse_device_command(body)?;
        let name = command.name();
        let ack = self.operations.device_command(device, command).await?;
        Ok(Outcome::with_data(ack.message, json!({ "command": name })))
    }
}
