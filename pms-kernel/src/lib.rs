//! Noyau de conduite PMS : ordonnancement des équipements, surveillance du process,
//! automates SOC et de récupération, canal de contrôle MQTT.

pub mod automation;
pub mod config;
pub mod control;
pub mod devices;
pub mod health;
pub mod http;
pub mod models;
pub mod monitor;
pub mod mqtt;
pub mod scheduler;
pub mod shutdown;
pub mod state;
