use crate::models::{Record, RecordKind};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Message diffusé aux observateurs : canal (= kind) + record tel que persisté
#[derive(Debug, Clone, Serialize)]
pub struct Broadcast {
    pub channel: RecordKind,
    pub record: Record,
}

/// Fan-out temps réel sans backlog : un observateur arrivé en retard ne
/// reçoit que ce qui est publié après son abonnement
#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<Broadcast>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publie un record déjà persisté ; aucun observateur n'est pas une erreur
    pub fn publish(&self, record: &Record) {
        let msg = Broadcast {
            channel: record.kind,
            record: record.clone(),
        };
        match self.sender.send(msg) {
            Ok(n) => trace!(channel = %record.kind, observers = n, "broadcast"),
            Err(_) => trace!(channel = %record.kind, "broadcast without observers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
