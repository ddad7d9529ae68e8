use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use time::OffsetDateTime;

/// Clés d'enveloppe posées par le serveur ; un payload ne peut pas les écraser
pub const RESERVED_FIELDS: [&str; 4] = ["device_id", "ts", "topic", "kind"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Telemetry,
    Event,
    Status,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Telemetry, RecordKind::Event, RecordKind::Status];

    /// Segment de topic et nom du canal de diffusion
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Telemetry => "telemetry",
            RecordKind::Event => "event",
            RecordKind::Status => "status",
        }
    }

    /// Nom de la collection persistée (events au pluriel, comme l'historique)
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Telemetry => "telemetry",
            RecordKind::Event => "events",
            RecordKind::Status => "status",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "telemetry" => Some(RecordKind::Telemetry),
            "event" => Some(RecordKind::Event),
            "status" => Some(RecordKind::Status),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Valeur d'un record status : seules les transitions sont persistées
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Presence::Online),
            "offline" => Some(Presence::Offline),
            _ => None,
        }
    }
}

/// État dérivé d'un device : `Unknown` tant qu'aucun record status n'existe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Unknown,
    Online,
    Offline,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Unknown => "unknown",
            PresenceState::Online => "online",
            PresenceState::Offline => "offline",
        }
    }

    pub fn is(&self, presence: Presence) -> bool {
        matches!(
            (self, presence),
            (PresenceState::Online, Presence::Online) | (PresenceState::Offline, Presence::Offline)
        )
    }
}

impl From<Presence> for PresenceState {
    fn from(p: Presence) -> Self {
        match p {
            Presence::Online => PresenceState::Online,
            Presence::Offline => PresenceState::Offline,
        }
    }
}

/// Record immuable : enveloppe fixe + sac d'attributs ouvert (ordre du payload conservé)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub topic: String,
    pub kind: RecordKind,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Construit un record en retirant du payload les clés d'enveloppe
    pub fn new(
        kind: RecordKind,
        device_id: impl Into<String>,
        topic: impl Into<String>,
        ts: OffsetDateTime,
        mut fields: Map<String, Value>,
    ) -> Self {
        for key in RESERVED_FIELDS {
            fields.remove(key);
        }
        Self {
            device_id: device_id.into(),
            ts,
            topic: topic.into(),
            kind,
            fields,
        }
    }

    /// Record de transition écrit par le tracker de présence
    pub fn transition(namespace: &str, device_id: &str, presence: Presence, ts: OffsetDateTime) -> Self {
        let mut fields = Map::new();
        fields.insert("status".into(), Value::String(presence.as_str().into()));
        fields.insert("timestamp_ms".into(), Value::from(epoch_millis(ts)));
        Self::new(
            RecordKind::Status,
            device_id,
            status_topic(namespace, device_id),
            ts,
            fields,
        )
    }

    /// Valeur `status` si le record en porte une reconnue
    pub fn presence(&self) -> Option<Presence> {
        self.fields
            .get("status")
            .and_then(Value::as_str)
            .and_then(Presence::parse)
    }
}

pub fn status_topic(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/{device_id}/status")
}

pub fn epoch_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}
