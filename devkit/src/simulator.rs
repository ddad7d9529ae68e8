/*!
Simulateur de voiture ESP32

Annonce `status: online`, puis publie une trame telemetry par intervalle et
un event `obstacle` dès que la distance simulée passe sous 20 cm.
*/

use crate::builders::{CarMessageBuilder, CarTelemetry, LineSensors, Speed};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Seuil de déclenchement de l'event obstacle
pub const OBSTACLE_THRESHOLD_CM: f64 = 20.0;

/// Publication JSON, implémentée par le vrai client et par le mock
pub trait Publisher {
    fn send(&self, topic: String, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

impl Publisher for rumqttc::AsyncClient {
    async fn send(&self, topic: String, payload: Vec<u8>) -> Result<()> {
        self.publish(topic, rumqttc::QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub mqtt_url: String,
    pub device_id: String,
    pub namespace: String,
    pub interval: Duration,
    /// Durée totale ; None = sans fin
    pub duration: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mqtt_url: "mqtt://localhost:1883".into(),
            device_id: "esp32_car_7E7C3C".into(),
            namespace: "car".into(),
            interval: Duration::from_millis(2000),
            duration: Some(Duration::from_secs(30)),
        }
    }
}

impl SimConfig {
    /// MQTT_URL, DEVICE_ID, NAMESPACE, INTERVAL_MS, DURATION_MS (0 = sans fin)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("MQTT_URL") {
            cfg.mqtt_url = v;
        }
        if let Ok(v) = std::env::var("DEVICE_ID") {
            cfg.device_id = v;
        }
        if let Ok(v) = std::env::var("NAMESPACE") {
            cfg.namespace = v;
        }
        if let Some(ms) = std::env::var("INTERVAL_MS").ok().and_then(|v| v.parse::<u64>().ok()) {
            cfg.interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = std::env::var("DURATION_MS").ok().and_then(|v| v.parse::<u64>().ok()) {
            cfg.duration = (ms > 0).then(|| Duration::from_millis(ms));
        }
        cfg
    }

    /// Décompose `mqtt://host:port`
    pub fn broker(&self) -> (String, u16) {
        let rest = self.mqtt_url.trim_start_matches("mqtt://").trim_start_matches("tcp://");
        match rest.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1883)),
            None => (rest.to_string(), 1883),
        }
    }
}

pub struct Simulator {
    device_id: String,
    builder: CarMessageBuilder,
    rng: StdRng,
    uptime_ms: u64,
    interval_ms: u64,
}

impl Simulator {
    pub fn new(cfg: &SimConfig, seed: u64) -> Self {
        Self {
            device_id: cfg.device_id.clone(),
            builder: CarMessageBuilder::new(cfg.namespace.clone()),
            rng: StdRng::seed_from_u64(seed),
            uptime_ms: 0,
            interval_ms: cfg.interval.as_millis() as u64,
        }
    }

    /// Message d'annonce publié à la connexion
    pub fn announce(&self) -> (String, Value) {
        (
            self.builder.status_topic(&self.device_id),
            CarMessageBuilder::status(self.device_id.as_str(), "online"),
        )
    }

    /// Trame suivante : telemetry, plus un event si obstacle proche
    pub fn next_frame(&mut self) -> Vec<(String, Value)> {
        self.uptime_ms += self.interval_ms;
        let modes = ["manual", "line"];
        let motions = ["stop", "fwd", "back", "left", "right"];
        let distance_cm = (self.rng.gen_range(10.0..60.0_f64) * 10.0).round() / 10.0;

        let frame = CarTelemetry {
            device_id: self.device_id.clone(),
            mode: modes[self.rng.gen_range(0..modes.len())].into(),
            motion: motions[self.rng.gen_range(0..motions.len())].into(),
            speed: Speed {
                linear: self.rng.gen_range(50..200),
                rot: self.rng.gen_range(50..150),
            },
            distance_cm,
            obstacle: distance_cm < OBSTACLE_THRESHOLD_CM,
            line: LineSensors {
                left: self.rng.gen_range(0..2),
                center: self.rng.gen_range(0..2),
                right: self.rng.gen_range(0..2),
            },
            wifi_rssi: self.rng.gen_range(-70..-40),
            uptime_ms: self.uptime_ms,
        };

        let mut out = vec![(
            self.builder.telemetry_topic(&self.device_id),
            CarMessageBuilder::telemetry(&frame),
        )];
        if frame.obstacle {
            out.push((
                self.builder.event_topic(&self.device_id),
                CarMessageBuilder::obstacle_event(self.device_id.as_str(), distance_cm),
            ));
        }
        out
    }
}

async fn publish_all<P: Publisher>(publisher: &P, messages: Vec<(String, Value)>) -> Result<()> {
    for (topic, payload) in messages {
        let bytes = serde_json::to_vec(&payload)?;
        log::info!("[sim] {} ({} bytes)", topic, bytes.len());
        publisher.send(topic, bytes).await?;
    }
    Ok(())
}

/// Annonce puis publie `frames` trames espacées de `interval`
pub async fn run_simulation<P: Publisher>(
    publisher: &P,
    sim: &mut Simulator,
    frames: Option<usize>,
    interval: Duration,
) -> Result<usize> {
    let (topic, payload) = sim.announce();
    publish_all(publisher, vec![(topic, payload)]).await?;

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut sent = 0;
    while frames.map_or(true, |max| sent < max) {
        ticker.tick().await;
        publish_all(publisher, sim.next_frame()).await?;
        sent += 1;
    }
    Ok(sent)
}
