use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::models::RecordKind;
use crate::router::InboundMessage;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Filtres `<namespace>/+/<kind>` pour les trois kinds
pub fn subscription_filters(namespace: &str) -> Vec<String> {
    RecordKind::ALL
        .iter()
        .map(|kind| format!("{namespace}/+/{}", kind.as_str()))
        .collect()
}

/// Backoff exponentiel borné par [min, max]
pub fn next_backoff(current: Duration, min: Duration, max: Duration) -> Duration {
    let max = max.max(min);
    if current < min {
        return min;
    }
    current.saturating_mul(2).min(max)
}

pub fn mqtt_options(cfg: &MqttConf) -> MqttOptions {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    opts
}

/// Transfère un publish vers la file d'ingestion sans jamais bloquer l'event loop
fn forward(tx: &mpsc::Sender<InboundMessage>, health: &HealthTracker, topic: String, payload: Vec<u8>) -> bool {
    let msg = InboundMessage::new(topic, payload, OffsetDateTime::now_utc());
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            health.message_dropped();
            warn!(topic = %msg.topic, "ingest queue full, message dropped");
            false
        }
        Err(TrySendError::Closed(msg)) => {
            debug!(topic = %msg.topic, "ingest queue closed");
            false
        }
    }
}

/// Boucle subscriber : (ré)abonnement à chaque ConnAck, backoff sur erreur, arrêt sur token
pub async fn run_mqtt_subscriber(
    cfg: MqttConf,
    tx: mpsc::Sender<InboundMessage>,
    health: HealthTracker,
    token: CancellationToken,
) {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&cfg), 10);
    let filters = subscription_filters(&cfg.namespace);
    let min = Duration::from_millis(cfg.reconnect_min_ms);
    let max = Duration::from_millis(cfg.reconnect_max_ms);
    let mut backoff = Duration::ZERO;

    info!(host = %cfg.host, port = cfg.port, client_id = %cfg.client_id, "connecting to MQTT broker");

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                backoff = Duration::ZERO;
                health.mark_mqtt_connected();
                for filter in &filters {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        error!(filter = %filter, error = %e, "subscribe failed");
                    }
                }
                info!(filters = ?filters, "connected to MQTT broker");
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                forward(&tx, &health, p.topic.clone(), p.payload.to_vec());
            }
            Ok(_) => {}
            Err(e) => {
                health.increment_reconnects();
                backoff = next_backoff(backoff, min, max);
                warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "MQTT connection error");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "disconnect request not queued");
    }
    health.mark_mqtt_disconnected();
    info!("MQTT subscriber stopped");
}
