/*!
Équipement scripté

Les lectures sont servies dans l'ordre programmé (puis la dernière valeur par défaut),
chaque commande est enregistrée avec son instant tokio : sous `start_paused`, les écarts
entre commandes sont exacts.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use pms_kernel::devices::{Ack, DeviceCommand, DeviceError, DeviceHandle};
use pms_kernel::models::{Device, DeviceType, Endpoint, FieldValue, TelemetrySnapshot};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum PollStep {
    Fields(Vec<(String, FieldValue)>),
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub command: DeviceCommand,
    pub at: Instant,
}

#[derive(Debug)]
struct Script {
    polls: VecDeque<PollStep>,
    fallback: PollStep,
    poll_count: u64,
    commands: Vec<RecordedCommand>,
    failing: HashSet<&'static str>,
    hang_commands: bool,
}

#[derive(Clone)]
pub struct ScriptedDevice {
    device: Device,
    script: Arc<Mutex<Script>>,
}

impl ScriptedDevice {
    pub fn new(id: &str, device_type: DeviceType) -> Self {
        Self {
            device: Device {
                id: id.to_string(),
                device_type,
                endpoint: Endpoint { host: "scripted".into(), port: 502, unit_id: 1 },
                poll_interval: Duration::from_secs(1),
                active: true,
            },
            script: Arc::new(Mutex::new(Script {
                polls: VecDeque::new(),
                fallback: PollStep::Fields(Vec::new()),
                poll_count: 0,
                commands: Vec::new(),
                failing: HashSet::new(),
                hang_commands: false,
            })),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.device.poll_interval = interval;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.device.active = false;
        self
    }

    pub fn handle(&self) -> Arc<dyn DeviceHandle> {
        Arc::new(self.clone())
    }

    /// Programme la prochaine lecture
    pub fn push_fields(&self, fields: impl IntoIterator<Item = (&'static str, FieldValue)>) {
        let fields = fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        self.script.lock().polls.push_back(PollStep::Fields(fields));
    }

    pub fn push_soc(&self, soc: f64) {
        self.push_fields([("battery_soc", FieldValue::Number(soc))]);
    }

    pub fn push_failure(&self, message: &str) {
        self.script.lock().polls.push_back(PollStep::Fail(message.to_string()));
    }

    /// Lecture renvoyée une fois la file épuisée
    pub fn set_default_fields(&self, fields: impl IntoIterator<Item = (&'static str, FieldValue)>) {
        let fields = fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        self.script.lock().fallback = PollStep::Fields(fields);
    }

    pub fn fail_always(&self, message: &str) {
        let mut script = self.script.lock();
        script.polls.clear();
        script.fallback = PollStep::Fail(message.to_string());
    }

    /// Les lectures ne répondent plus jamais (timeout côté ordonnanceur)
    pub fn hang_polls(&self) {
        let mut script = self.script.lock();
        script.polls.clear();
        script.fallback = PollStep::Hang;
    }

    pub fn fail_command(&self, name: &'static str) {
        self.script.lock().failing.insert(name);
    }

    pub fn hang_commands(&self, hang: bool) {
        self.script.lock().hang_commands = hang;
    }

    pub fn poll_count(&self) -> u64 {
        self.script.lock().poll_count
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.script.lock().commands.clone()
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        self.script.lock().commands.iter().map(|c| c.command.name()).collect()
    }

    pub fn clear_commands(&self) {
        self.script.lock().commands.clear();
    }
}

#[async_trait]
impl DeviceHandle for ScriptedDevice {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn poll(&self) -> Result<TelemetrySnapshot, DeviceError> {
        let step = {
            let mut script = self.script.lock();
            script.poll_count += 1;
            match script.polls.pop_front() {
                Some(step) => step,
                None => script.fallback.clone(),
            }
        };
        match step {
            PollStep::Fields(fields) => Ok(fields
                .into_iter()
                .fold(TelemetrySnapshot::new(&self.device), |snap, (k, v)| snap.with_field(&k, v))),
            PollStep::Fail(message) => Err(DeviceError::Communication(message)),
            PollStep::Hang => std::future::pending().await,
        }
    }

    async fn command(&self, command: &DeviceCommand) -> Result<Ack, DeviceError> {
        let (fail, hang) = {
            let mut script = self.script.lock();
            script.commands.push(RecordedCommand { command: command.clone(), at: Instant::now() });
            (script.failing.contains(command.name()), script.hang_commands)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(DeviceError::Rejected(format!("scripted failure for {}", command.name())));
        }
        Ok(Ack::new(format!("{} {} ok", self.device.id, command.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_polls_follow_script_then_fallback() {
        let dev = ScriptedDevice::new("bms1", DeviceType::Battery);
        dev.push_soc(42.0);
        dev.push_failure("link down");

        assert_eq!(dev.poll().await.unwrap().number("battery_soc"), Some(42.0));
        assert!(matches!(dev.poll().await, Err(DeviceError::Communication(m)) if m == "link down"));
        assert!(dev.poll().await.unwrap().fields.is_empty());
        assert_eq!(dev.poll_count(), 3);
    }

    #[tokio::test]
    async fn test_commands_recorded_even_when_failing() {
        let dev = ScriptedDevice::new("pcs1", DeviceType::Converter);
        dev.fail_command("stop");

        dev.command(&DeviceCommand::Standby).await.unwrap();
        assert!(dev.command(&DeviceCommand::Stop).await.is_err());
        assert_eq!(dev.command_names(), vec!["standby", "stop"]);
    }
}
