use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

/// Famille d'équipement pilotée par le noyau (ensemble fermé).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[serde(alias = "bms", alias = "BMS")]
    Battery,
    #[serde(alias = "pcs", alias = "PCS")]
    Converter,
    #[serde(alias = "dcdc", alias = "DCDC")]
    SolarLink,
}

impl DeviceType {
    /// Segment utilisé dans les topics MQTT (`pms/{segment}/{device}/data`)
    pub fn topic_segment(&self) -> &'static str {
        match self {
            DeviceType::Battery => "bms",
            DeviceType::Converter => "pcs",
            DeviceType::SolarLink => "dcdc",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Battery => "battery",
            DeviceType::Converter => "converter",
            DeviceType::SolarLink => "solar_link",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.unit_id)
    }
}

/// Identité d'un équipement. Seul `active` change après création.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub device_type: DeviceType,
    pub endpoint: Endpoint,
    #[serde(rename = "poll_interval_secs", serialize_with = "as_secs")]
    pub poll_interval: Duration,
    pub active: bool,
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Valeur typée d'un champ de télémétrie
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    /// Mot d'état décodé bit à bit
    Status(u32),
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub device_id: String,
    pub device_type: DeviceType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Ordre de lecture de l'équipement conservé
    pub fields: IndexMap<String, FieldValue>,
    #[serde(skip)]
    pub polled_at: Instant,
}

impl TelemetrySnapshot {
    pub fn new(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            device_type: device.device_type,
            timestamp: OffsetDateTime::now_utc(),
            fields: IndexMap::new(),
            polled_at: Instant::now(),
        }
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.fields.get(name)? {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Status(v) => Some(f64::from(*v)),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.fields.get(name)? {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn status(&self, name: &str) -> Option<u32> {
        match self.fields.get(name)? {
            FieldValue::Status(v) => Some(*v),
            FieldValue::Number(v) if v.fract() == 0.0 && *v >= 0.0 => Some(*v as u32),
            _ => None,
        }
    }

    /// Vrai si le bit `bit` du mot d'état `field` est levé
    pub fn bit_set(&self, field: &str, bit: u8) -> bool {
        self.status(field)
            .map(|word| bit < 32 && word & (1 << bit) != 0)
            .unwrap_or(false)
    }

    pub fn age(&self) -> Duration {
        self.polled_at.elapsed()
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() <= max_age
    }
}
