/*!
# Fleetwatch DevKit - Outils de développement pour le kernel

- Builders des payloads voiture (status, telemetry, event)
- Stub MQTT pour tests sans broker
- Simulateur de voiture pilotable contre un vrai broker
*/

pub mod builders;
pub mod mqtt_stub;
pub mod simulator;

pub use builders::{CarMessageBuilder, CarTelemetry};
pub use mqtt_stub::MockMqttClient;
pub use simulator::{run_simulation, Publisher, SimConfig, Simulator};
