use crate::broadcaster::Broadcaster;
use crate::health::HealthTracker;
use crate::models::{Presence, Record, RecordKind};
use crate::presence::{Heartbeat, PresenceHandle};
use crate::store::RecordStore;
use serde_json::{Map, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

/// Message brut livré par le transport, horodaté à la réception
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: OffsetDateTime,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, received_at: OffsetDateTime) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("topic {0} matches no record kind")]
    UnknownTopic(String),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("no device_id in payload or topic {0}")]
    MissingDeviceId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Telemetry / event persisté puis diffusé
    Stored(RecordKind),
    /// Status confié au tracker de présence (seul écrivain des records status)
    Forwarded,
    /// Persistance en échec : ni diffusion ni retry
    StoreFailed,
    /// Tâche de présence arrêtée : le status n'a pas pu lui être remis
    TrackerStopped,
    /// Payload ou device_id invalide
    Dropped,
    /// Topic hors des trois kinds connus
    Ignored,
}

/// Kind d'après le dernier segment du topic
pub fn classify(topic: &str) -> Option<RecordKind> {
    topic.rsplit('/').next().and_then(RecordKind::from_segment)
}

/// Device du topic `<namespace>/<device>/<kind>` ; tout autre forme → None
pub fn device_from_topic<'a>(topic: &'a str, namespace: &str) -> Option<&'a str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(ns), Some(device), Some(kind), None)
            if ns == namespace && !device.is_empty() && RecordKind::from_segment(kind).is_some() =>
        {
            Some(device)
        }
        _ => None,
    }
}

/// Le champ explicite du payload l'emporte sur le topic
fn resolve_device_id(fields: &Map<String, Value>, topic: &str, namespace: &str) -> Option<String> {
    fields
        .get("device_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| device_from_topic(topic, namespace).map(str::to_string))
}

/// Un status auto-déclaré vaut `online` sauf `offline` explicite ; la valeur d'origine est conservée
fn normalize_status(fields: &mut Map<String, Value>) {
    let reported = fields.get("status").and_then(Value::as_str).and_then(Presence::parse);
    if reported.is_none() {
        if let Some(raw) = fields.remove("status") {
            fields.insert("reported_status".into(), raw);
        }
        fields.insert("status".into(), Value::String(Presence::Online.as_str().into()));
    }
}

pub struct MessageRouter {
    store: Arc<dyn RecordStore>,
    presence: PresenceHandle,
    broadcaster: Broadcaster,
    health: HealthTracker,
    namespace: String,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        presence: PresenceHandle,
        broadcaster: Broadcaster,
        health: HealthTracker,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            presence,
            broadcaster,
            health,
            namespace: namespace.into(),
        }
    }

    /// Transformation pure : message brut → record normalisé
    pub fn normalize(&self, msg: &InboundMessage) -> Result<Record, RouteError> {
        let kind = classify(&msg.topic).ok_or_else(|| RouteError::UnknownTopic(msg.topic.clone()))?;

        let mut fields = match serde_json::from_slice::<Value>(&msg.payload)? {
            Value::Object(map) => map,
            _ => return Err(RouteError::NotAnObject),
        };

        let device_id = resolve_device_id(&fields, &msg.topic, &self.namespace)
            .ok_or_else(|| RouteError::MissingDeviceId(msg.topic.clone()))?;

        if kind == RecordKind::Status {
            normalize_status(&mut fields);
        }

        Ok(Record::new(kind, device_id, msg.topic.clone(), msg.received_at, fields))
    }

    /// Route un message : persistance, heartbeat de présence, diffusion
    pub async fn route(&self, msg: InboundMessage) -> RouteOutcome {
        self.health.message_received();

        let record = match self.normalize(&msg) {
            Ok(record) => record,
            Err(RouteError::UnknownTopic(topic)) => {
                debug!(topic = %topic, "ignoring message on unknown topic");
                return RouteOutcome::Ignored;
            }
            Err(e) => {
                warn!(
                    topic = %msg.topic,
                    error = %e,
                    raw = %String::from_utf8_lossy(&msg.payload),
                    "dropping inbound message"
                );
                self.health.message_dropped();
                return RouteOutcome::Dropped;
            }
        };

        let heartbeat = Heartbeat::new(record.device_id.clone(), record.ts);

        if record.kind == RecordKind::Status {
            if let Err(e) = self.presence.heartbeat(heartbeat.with_report(record)).await {
                error!(topic = %msg.topic, error = %e, "status report lost");
                return RouteOutcome::TrackerStopped;
            }
            return RouteOutcome::Forwarded;
        }

        let stored = match self.store.append(&record) {
            Ok(()) => {
                self.health.record_stored();
                debug!(collection = record.kind.collection(), device_id = %record.device_id, "record inserted");
                true
            }
            Err(e) => {
                error!(collection = record.kind.collection(), device_id = %record.device_id, error = %e, "insert failed");
                false
            }
        };

        // la réception prouve que le device est joignable, même si l'insert a échoué
        if let Err(e) = self.presence.heartbeat(heartbeat).await {
            error!(device_id = %record.device_id, error = %e, "heartbeat not delivered");
        }

        if stored {
            self.broadcaster.publish(&record);
            RouteOutcome::Stored(record.kind)
        } else {
            RouteOutcome::StoreFailed
        }
    }
}
