/*!
# PMS DevKit - Doublures et utilitaires de test

Bibliothèque facilitant les tests du noyau sans broker ni matériel :
- Stub MQTT enregistrant toutes les publications
- Équipements scriptés (lectures programmées, commandes horodatées)
- Construction de snapshots de télémétrie
- Harness assemblant registre, ordonnanceur et gestionnaire de mode
*/

pub mod mqtt_stub;
pub mod scripted_device;
pub mod snapshots;
pub mod test_utils;

pub use mqtt_stub::{ControlMessageBuilder, MockMqttClient};
pub use scripted_device::{RecordedCommand, ScriptedDevice};
pub use snapshots::SnapshotBuilder;
pub use test_utils::TestHarness;
