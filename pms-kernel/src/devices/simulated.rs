//! Installation simulée : batterie, onduleur et convertisseur solaire partagent un même
//! modèle physique, ce qui permet de faire tourner le noyau sans matériel.

use super::{Ack, DeviceCommand, DeviceError, DeviceHandle};
use crate::models::{Device, DeviceType, FieldValue, TelemetrySnapshot};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::time::Instant;

const CAPACITY_KWH: f64 = 100.0;
const DISCHARGE_KW: f64 = 5.0;
const SOLAR_KW: f64 = 3.0;
const COMM_FAULT_BIT: u32 = 1 << 3;

// registres inscriptibles par type (adresse, nom)
const BATTERY_REGISTERS: &[(u16, &str)] = &[(0x0200, "reset_errors"), (0x0201, "dc_contactor"), (0x0202, "system_lock")];
const CONVERTER_REGISTERS: &[(u16, &str)] = &[(0x0300, "operation_mode"), (0x0301, "charge_power"), (0x0302, "fault_reset")];
const SOLAR_REGISTERS: &[(u16, &str)] = &[(0x0400, "operation_mode"), (0x0401, "reset")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterMode {
    Stop,
    Standby,
    Independent,
    Charge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolarMode {
    Standby,
    SolarCharge,
}

#[derive(Debug, Clone)]
pub struct PlantState {
    pub soc: f64,
    pub converter_mode: ConverterMode,
    pub charge_power_kw: f64,
    pub solar_mode: SolarMode,
    pub contactor_closed: bool,
    pub error_code_2: u32,
    pub registers: HashMap<(DeviceType, u16), u16>,
    last_step: Instant,
}

impl PlantState {
    fn step(&mut self) {
        let now = Instant::now();
        let hours = now.duration_since(self.last_step).as_secs_f64() / 3600.0;
        self.last_step = now;

        let mut power_kw = 0.0;
        if self.contactor_closed {
            power_kw += match self.converter_mode {
                ConverterMode::Charge => self.charge_power_kw,
                ConverterMode::Independent => -DISCHARGE_KW,
                ConverterMode::Stop | ConverterMode::Standby => 0.0,
            };
            if self.solar_mode == SolarMode::SolarCharge {
                power_kw += SOLAR_KW;
            }
        }
        self.soc = (self.soc + power_kw * hours / CAPACITY_KWH * 100.0).clamp(0.0, 100.0);
    }
}

/// Modèle physique partagé
#[derive(Clone)]
pub struct SimulatedPlant {
    state: Shared<PlantState>,
}

impl Default for SimulatedPlant {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlant {
    pub fn new() -> Self {
        Self {
            state: new_state(PlantState {
                soc: 50.0,
                converter_mode: ConverterMode::Standby,
                charge_power_kw: 0.0,
                solar_mode: SolarMode::Standby,
                contactor_closed: true,
                error_code_2: 0,
                registers: HashMap::new(),
                last_step: Instant::now(),
            }),
        }
    }

    pub fn attach(&self, device: Device) -> SimulatedDevice {
        SimulatedDevice { device, plant: self.clone() }
    }

    pub fn set_soc(&self, soc: f64) {
        let mut st = self.state.lock();
        st.step();
        st.soc = soc.clamp(0.0, 100.0);
    }

    /// Lève le bit de défaut de communication BMS/PCS
    pub fn inject_comm_fault(&self) {
        let mut st = self.state.lock();
        st.error_code_2 |= COMM_FAULT_BIT;
        st.contactor_closed = false;
    }

    pub fn snapshot(&self) -> PlantState {
        self.state.lock().clone()
    }
}

pub struct SimulatedDevice {
    device: Device,
    plant: SimulatedPlant,
}

impl SimulatedDevice {
    fn registers(&self) -> &'static [(u16, &'static str)] {
        match self.device.device_type {
            DeviceType::Battery => BATTERY_REGISTERS,
            DeviceType::Converter => CONVERTER_REGISTERS,
            DeviceType::SolarLink => SOLAR_REGISTERS,
        }
    }
}

#[async_trait]
impl DeviceHandle for SimulatedDevice {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn poll(&self) -> Result<TelemetrySnapshot, DeviceError> {
        let st = {
            let mut st = self.plant.state.lock();
            st.step();
            st.clone()
        };
        let snap = TelemetrySnapshot::new(&self.device);
        let snap = match self.device.device_type {
            DeviceType::Battery => snap
                .with_field("battery_soc", FieldValue::Number((st.soc * 10.0).round() / 10.0))
                .with_field("battery_voltage", FieldValue::Number(720.0 + st.soc * 0.8))
                .with_field("dc_contactor", FieldValue::Bool(st.contactor_closed))
                .with_field("error_code_1", FieldValue::Status(0))
                .with_field("error_code_2", FieldValue::Status(st.error_code_2)),
            DeviceType::Converter => {
                let (code, power) = match st.converter_mode {
                    ConverterMode::Stop => (0, 0.0),
                    ConverterMode::Standby => (1, 0.0),
                    ConverterMode::Charge => (2, -st.charge_power_kw),
                    ConverterMode::Independent => (4, DISCHARGE_KW),
                };
                snap.with_field("operation_mode", FieldValue::Status(code))
                    .with_field("active_power_kw", FieldValue::Number(power))
                    .with_field("fault_status", FieldValue::Status(0))
            }
            DeviceType::SolarLink => {
                let charging = st.solar_mode == SolarMode::SolarCharge;
                snap.with_field("operation_mode", FieldValue::Status(u32::from(charging)))
                    .with_field("pv_power_kw", FieldValue::Number(if charging { SOLAR_KW } else { 0.0 }))
            }
        };
        Ok(snap)
    }

    async fn command(&self, command: &DeviceCommand) -> Result<Ack, DeviceError> {
        use DeviceCommand::*;
        let device_type = self.device.device_type;
        if !command.supported_by(device_type) {
            return Err(DeviceError::Unsupported { device: self.device.id.clone(), command: command.name() });
        }

        let mut st = self.plant.state.lock();
        st.step();
        match (device_type, command) {
            (_, WriteRegister { address, value }) => {
                let Some((_, name)) = self.registers().iter().find(|(a, _)| a == address) else {
                    return Err(DeviceError::UnknownRegister(*address));
                };
                st.registers.insert((device_type, *address), *value);
                return Ok(Ack::new(format!("{name} <- {value}")));
            }
            (DeviceType::Converter, Standby) => st.converter_mode = ConverterMode::Standby,
            (DeviceType::Converter, Independent) => st.converter_mode = ConverterMode::Independent,
            (DeviceType::Converter, Stop) => st.converter_mode = ConverterMode::Stop,
            (DeviceType::Converter, Charge { power_kw }) => {
                if st.converter_mode != ConverterMode::Standby {
                    return Err(DeviceError::Rejected("charge requires standby".into()));
                }
                st.converter_mode = ConverterMode::Charge;
                st.charge_power_kw = *power_kw;
            }
            (DeviceType::Converter, ResetFaults) => {}
            (DeviceType::SolarLink, Standby) => st.solar_mode = SolarMode::Standby,
            (DeviceType::SolarLink, Reset) => st.solar_mode = SolarMode::Standby,
            (DeviceType::SolarLink, SolarCharge) => st.solar_mode = SolarMode::SolarCharge,
            (DeviceType::Battery, ResetErrors) => st.error_code_2 = 0,
            (DeviceType::Battery, Contactor { closed }) => st.contactor_closed = *closed,
            (DeviceType::Battery, ResetSystemLock) => {}
            _ => {
                return Err(DeviceError::Unsupported { device: self.device.id.clone(), command: command.name() })
            }
        }
        Ok(Ack::new(format!("{} ok", command.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Endpoint;
    use std::time::Duration;

    fn device(id: &str, device_type: DeviceType) -> Device {
        Device {
            id: id.into(),
            device_type,
            endpoint: Endpoint { host: "sim".into(), port: 502, unit_id: 1 },
            poll_interval: Duration::from_secs(5),
            active: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_charge_raises_soc() {
        let plant = SimulatedPlant::new();
        let bms = plant.attach(device("bms1", DeviceType::Battery));
        let pcs = plant.attach(device("pcs1", DeviceType::Converter));
        plant.set_soc(10.0);

        pcs.command(&DeviceCommand::Standby).await.unwrap();
        pcs.command(&DeviceCommand::Charge { power_kw: 10.0 }).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;

        let soc = bms.poll().await.unwrap().number("battery_soc").unwrap();
        assert!((soc - 20.0).abs() < 0.2, "soc = {soc}");
    }

    #[tokio::test]
    async fn test_charge_rejected_outside_standby() {
        let plant = SimulatedPlant::new();
        let pcs = plant.attach(device("pcs1", DeviceType::Converter));
        pcs.command(&DeviceCommand::Independent).await.unwrap();

        let err = pcs.command(&DeviceCommand::Charge { power_kw: 10.0 }).await.unwrap_err();
        assert!(matches!(err, DeviceError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_comm_fault_cleared_by_reset() {
        let plant = SimulatedPlant::new();
        let bms = plant.attach(device("bms1", DeviceType::Battery));
        plant.inject_comm_fault();

        let snap = bms.poll().await.unwrap();
        assert!(snap.bit_set("error_code_2", 3));
        assert_eq!(snap.flag("dc_contactor"), Some(false));

        bms.command(&DeviceCommand::ResetErrors).await.unwrap();
        bms.command(&DeviceCommand::Contactor { closed: true }).await.unwrap();
        let snap = bms.poll().await.unwrap();
        assert!(!snap.bit_set("error_code_2", 3));
        assert_eq!(snap.flag("dc_contactor"), Some(true));
    }

    #[tokio::test]
    async fn test_write_register_uses_register_map() {
        let plant = SimulatedPlant::new();
        let dcdc = plant.attach(device("dcdc1", DeviceType::SolarLink));

        let ack = dcdc.command(&DeviceCommand::WriteRegister { address: 0x0400, value: 1 }).await.unwrap();
        assert_eq!(ack.message, "operation_mode <- 1");
        let err = dcdc.command(&DeviceCommand::WriteRegister { address: 0x9999, value: 1 }).await.unwrap_err();
        assert_eq!(err, DeviceError::UnknownRegister(0x9999));
    }
}
