use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub presence: PresenceConf,
    pub store: StoreConf,
    pub http: HttpConf,
    pub ingest: IngestConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Premier segment des topics `<namespace>/<device>/<kind>`
    pub namespace: String,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: format!("fleetwatch-kernel-{}", uuid::Uuid::new_v4()),
            keep_alive_secs: 15,
            namespace: "car".into(),
            reconnect_min_ms: 1000,
            reconnect_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PresenceConf {
    pub offline_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for PresenceConf {
    fn default() -> Self {
        Self {
            offline_timeout_ms: 25_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl PresenceConf {
    pub fn offline_timeout(&self) -> time::Duration {
        time::Duration::milliseconds(self.offline_timeout_ms as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub backend: StoreBackend,
    pub data_dir: PathBuf,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConf {
    pub queue_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for IngestConf {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            broadcast_capacity: 256,
        }
    }
}

/// `mqtt://host:port` (scheme et port optionnels)
pub fn parse_mqtt_url(url: &str) -> Option<(String, Option<u16>)> {
    let rest = url.trim();
    let rest = rest
        .strip_prefix("mqtt://")
        .or_else(|| rest.strip_prefix("tcp://"))
        .unwrap_or(rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => port.parse().ok().map(|p| (host.to_string(), Some(p))),
        Some(_) => None,
        None => Some((authority.to_string(), None)),
    }
}

impl KernelConfig {
    /// Surcharges d'environnement appliquées par-dessus le fichier
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MQTT_URL") {
            match parse_mqtt_url(&url) {
                Some((host, port)) => {
                    self.mqtt.host = host;
                    if let Some(port) = port {
                        self.mqtt.port = port;
                    }
                }
                None => warn!(url = %url, "MQTT_URL invalide, ignorée"),
            }
        }
        if let Some(ms) = lookup_number(&lookup, "OFFLINE_TIMEOUT_MS") {
            self.presence.offline_timeout_ms = ms;
        }
        if let Some(ms) = lookup_number(&lookup, "SWEEP_INTERVAL_MS") {
            self.presence.sweep_interval_ms = ms;
        }
        if let Some(port) = lookup("PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => {
                    let host = self.http.bind.rsplit_once(':').map_or("0.0.0.0", |(h, _)| h);
                    self.http.bind = format!("{host}:{port}");
                }
                Err(_) => warn!(value = %port, "PORT invalide, ignoré"),
            }
        }
        if let Some(dir) = lookup("DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
    }
}

fn lookup_number<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value = %raw, "valeur numérique invalide, ignorée");
            None
        }
    }
}

/// Parse un YAML ; vide ou invalide → défauts
pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!(error = %e, "config invalide, usage config par défaut");
        KernelConfig::default()
    })
}

pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        info!(path = %path.display(), "pas de fichier de config, usage config par défaut");
        return KernelConfig::default();
    }
    match fs::read_to_string(path).await {
        Ok(txt) => parse_config(&txt),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "lecture config impossible");
            KernelConfig::default()
        }
    }
}

/// Fichier désigné par FLEETWATCH_CONFIG puis surcharges d'environnement
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEETWATCH_CONFIG").unwrap_or_else(|_| "fleetwatch.yaml".into());
    let mut cfg = load_config_from(Path::new(&path)).await;
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg
}
