/*!
Construction de snapshots de télémétrie pour les tests d'automates
*/

use pms_kernel::models::{Device, DeviceType, Endpoint, FieldValue, TelemetrySnapshot};
use std::time::Duration;

pub struct SnapshotBuilder {
    snapshot: TelemetrySnapshot,
}

impl SnapshotBuilder {
    pub fn for_device(device: &Device) -> Self {
        Self { snapshot: TelemetrySnapshot::new(device) }
    }

    pub fn new(id: &str, device_type: DeviceType) -> Self {
        Self::for_device(&Device {
            id: id.to_string(),
            device_type,
            endpoint: Endpoint { host: "scripted".into(), port: 502, unit_id: 1 },
            poll_interval: Duration::from_secs(1),
            active: true,
        })
    }

    pub fn battery(id: &str) -> Self {
        Self::new(id, DeviceType::Battery)
    }

    pub fn soc(self, soc: f64) -> Self {
        self.number("battery_soc", soc)
    }

    pub fn number(mut self, name: &str, value: f64) -> Self {
        self.snapshot = self.snapshot.with_field(name, FieldValue::Number(value));
        self
    }

    pub fn status(mut self, name: &str, value: u32) -> Self {
        self.snapshot = self.snapshot.with_field(name, FieldValue::Status(value));
        self
    }

    pub fn flag(mut self, name: &str, value: bool) -> Self {
        self.snapshot = self.snapshot.with_field(name, FieldValue::Bool(value));
        self
    }

    /// `error_code_2` avec le bit 3 levé
    pub fn comm_fault(self) -> Self {
        self.status("error_code_2", 1 << 3)
    }

    pub fn build(self) -> TelemetrySnapshot {
        self.snapshot
    }
}
