/*!
Payloads de test au format des voitures ESP32

Topics `<namespace>/<device_id>/<kind>` et payloads JSON tels que publiés
par le firmware (status, telemetry, event).
*/

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speed {
    pub linear: u32,
    pub rot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSensors {
    pub left: u8,
    pub center: u8,
    pub right: u8,
}

/// Trame telemetry complète d'une voiture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarTelemetry {
    pub device_id: String,
    pub mode: String,
    pub motion: String,
    pub speed: Speed,
    pub distance_cm: f64,
    pub obstacle: bool,
    pub line: LineSensors,
    pub wifi_rssi: i32,
    pub uptime_ms: u64,
}

impl CarTelemetry {
    /// Trame de référence (voiture en marche avant, pas d'obstacle)
    pub fn sample<S: Into<String>>(device_id: S) -> Self {
        Self {
            device_id: device_id.into(),
            mode: "manual".into(),
            motion: "fwd".into(),
            speed: Speed { linear: 120, rot: 80 },
            distance_cm: 23.4,
            obstacle: false,
            line: LineSensors { left: 0, center: 1, right: 0 },
            wifi_rssi: -55,
            uptime_ms: 1_234_567,
        }
    }
}

pub struct CarMessageBuilder {
    namespace: String,
}

impl CarMessageBuilder {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        Self { namespace: namespace.into() }
    }

    pub fn topic(&self, device_id: &str, kind: &str) -> String {
        format!("{}/{}/{}", self.namespace, device_id, kind)
    }

    pub fn telemetry_topic(&self, device_id: &str) -> String {
        self.topic(device_id, "telemetry")
    }

    pub fn event_topic(&self, device_id: &str) -> String {
        self.topic(device_id, "event")
    }

    pub fn status_topic(&self, device_id: &str) -> String {
        self.topic(device_id, "status")
    }

    /// Crée un message status auto-déclaré
    pub fn status<S: Into<String>>(device_id: S, status: &str) -> Value {
        json!({
            "device_id": device_id.into(),
            "status": status,
            "timestamp_ms": chrono::Utc::now().timestamp_millis()
        })
    }

    pub fn telemetry(frame: &CarTelemetry) -> Value {
        serde_json::to_value(frame).unwrap_or(Value::Null)
    }

    /// Crée un event obstacle
    pub fn obstacle_event<S: Into<String>>(device_id: S, distance_cm: f64) -> Value {
        json!({
            "device_id": device_id.into(),
            "event": "obstacle",
            "distance_cm": distance_cm,
            "timestamp_ms": chrono::Utc::now().timestamp_millis()
        })
    }
}
