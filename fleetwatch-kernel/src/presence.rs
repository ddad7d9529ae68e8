/**
 * PRESENCE TRACKER - Machine à états online / offline des devices
 *
 * RÔLE :
 * Décide de chaque transition de présence et l'écrit comme record status.
 * L'historique de présence se reconstruit donc depuis le store seul.
 *
 * FONCTIONNEMENT :
 * - Une seule tâche possède la table device → dernier heartbeat et écrit
 *   tous les records status (single writer) ; routeur et timer lui parlent
 *   par un channel mpsc
 * - Heartbeat : rafraîchit la table, écrit `online` si l'état connu n'est pas online
 * - Sweep périodique : `offline` pour chaque device silencieux depuis TIMEOUT,
 *   plus un scan du store pour les devices restés `online` avant un redémarrage
 * - Garde à l'écriture : l'état courant est relu dans le store juste avant
 *   chaque transition ; déjà dans l'état cible → aucun record
 * - Horodatage monotone par device : une transition n'est jamais datée avant
 *   le record status précédent (heartbeat en file derrière un tick)
 */

use crate::broadcaster::Broadcaster;
use crate::health::HealthTracker;
use crate::models::{Presence, PresenceState, Record, RecordKind};
use crate::store::{RecordStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Preuve de vie d'un device, éventuellement accompagnée de son auto-déclaration status
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub device_id: String,
    pub at: OffsetDateTime,
    /// Record status reçu du device (déjà normalisé par le routeur)
    pub report: Option<Record>,
}

impl Heartbeat {
    pub fn new(device_id: impl Into<String>, at: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            at,
            report: None,
        }
    }

    pub fn with_report(mut self, report: Record) -> Self {
        self.report = Some(report);
        self
    }
}

pub struct PresenceTracker {
    store: Arc<dyn RecordStore>,
    broadcaster: Broadcaster,
    health: HealthTracker,
    namespace: String,
    timeout: Duration,
    last_seen: HashMap<String, OffsetDateTime>,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        broadcaster: Broadcaster,
        health: HealthTracker,
        namespace: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            broadcaster,
            health,
            namespace: namespace.into(),
            timeout,
            last_seen: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn last_heartbeat(&self, device_id: &str) -> Option<OffsetDateTime> {
        self.last_seen.get(device_id).copied()
    }

    /// État connu d'après le dernier record status persisté
    pub fn current_state(&self, device_id: &str) -> Result<PresenceState, StoreError> {
        let latest = self.store.latest(RecordKind::Status, device_id)?;
        Ok(state_of(latest.as_ref()))
    }

    /// Traite une preuve de vie ; renvoie la transition écrite s'il y en a une
    pub fn on_heartbeat(&mut self, hb: Heartbeat) -> Result<Option<Record>, StoreError> {
        // un heartbeat resté en file ne fait pas reculer la table
        let last = self.last_seen.entry(hb.device_id.clone()).or_insert(hb.at);
        if hb.at > *last {
            *last = hb.at;
        }
        self.health.set_devices_tracked(self.last_seen.len());

        match hb.report {
            Some(report) => {
                let target = report.presence().unwrap_or(Presence::Online);
                let written = self.commit(&hb.device_id, target, hb.at, Some(report))?;
                if written.is_none() {
                    debug!(device_id = %hb.device_id, status = target.as_str(), "redundant status report not persisted");
                }
                Ok(written)
            }
            None => {
                let written = self.commit(&hb.device_id, Presence::Online, hb.at, None)?;
                if written.is_some() {
                    info!(device_id = %hb.device_id, "device came back online");
                }
                Ok(written)
            }
        }
    }

    /// Évalue les timeouts à l'instant `now` ; renvoie les transitions `offline` écrites
    pub fn sweep(&mut self, now: OffsetDateTime) -> Vec<Record> {
        let mut written = Vec::new();

        let expired: Vec<(String, OffsetDateTime)> = self
            .last_seen
            .iter()
            .filter(|(_, last)| self.is_expired(**last, now))
            .map(|(id, last)| (id.clone(), *last))
            .collect();

        for (device_id, last) in expired {
            if let Some(rec) = self.mark_offline(&device_id, last, now) {
                written.push(rec);
            }
        }

        // devices `online` dans le store mais absents de la table (redémarrage du process)
        match self.store.latest_per_device(RecordKind::Status) {
            Ok(latest) => {
                for rec in latest {
                    if self.last_seen.contains_key(&rec.device_id) {
                        continue;
                    }
                    if rec.presence() == Some(Presence::Online) && self.is_expired(rec.ts, now) {
                        if let Some(rec) = self.mark_offline(&rec.device_id, rec.ts, now) {
                            written.push(rec);
                        }
                    }
                }
            }
            Err(e) => error!(error = %e, "status scan failed during sweep"),
        }

        written
    }

    fn is_expired(&self, last: OffsetDateTime, now: OffsetDateTime) -> bool {
        now - last >= self.timeout
    }

    fn mark_offline(&self, device_id: &str, last: OffsetDateTime, now: OffsetDateTime) -> Option<Record> {
        match self.commit(device_id, Presence::Offline, now, None) {
            Ok(Some(rec)) => {
                info!(
                    device_id,
                    silent_for_secs = (now - last).whole_seconds(),
                    "device marked offline"
                );
                Some(rec)
            }
            Ok(None) => None,
            Err(e) => {
                error!(device_id, error = %e, "failed to write offline transition");
                None
            }
        }
    }

    /// Écrit la transition vers `target` si l'état relu à l'instant n'y est pas déjà
    ///
    /// Le ts du record est strictement postérieur au dernier status du device :
    /// un heartbeat horodaté avant un sweep déjà écrit reste ordonné après lui.
    fn commit(
        &self,
        device_id: &str,
        target: Presence,
        at: OffsetDateTime,
        report: Option<Record>,
    ) -> Result<Option<Record>, StoreError> {
        let latest = self.store.latest(RecordKind::Status, device_id)?;
        if state_of(latest.as_ref()).is(target) {
            return Ok(None);
        }
        let ts = match &latest {
            Some(prev) if at <= prev.ts => prev.ts + Duration::nanoseconds(1),
            _ => at,
        };
        let record = match report {
            Some(mut report) => {
                report.ts = ts;
                report
            }
            None => Record::transition(&self.namespace, device_id, target, ts),
        };
        self.store.append(&record)?;
        self.health.record_stored();
        self.health.transition_written();
        self.broadcaster.publish(&record);
        Ok(Some(record))
    }

    fn handle(&mut self, cmd: PresenceCommand) {
        match cmd {
            PresenceCommand::Heartbeat(hb) => {
                let device_id = hb.device_id.clone();
                if let Err(e) = self.on_heartbeat(hb) {
                    error!(device_id = %device_id, error = %e, "failed to apply heartbeat");
                }
            }
            PresenceCommand::Sweep { now, reply } => {
                let written = self.sweep(now);
                let _ = reply.send(written);
            }
        }
    }
}

fn state_of(latest: Option<&Record>) -> PresenceState {
    match latest.and_then(Record::presence) {
        Some(p) => p.into(),
        None => PresenceState::Unknown,
    }
}

pub enum PresenceCommand {
    Heartbeat(Heartbeat),
    /// Sweep immédiat à un instant donné, hors timer
    Sweep {
        now: OffsetDateTime,
        reply: oneshot::Sender<Vec<Record>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence tracker stopped")]
    Stopped,
}

/// Accès au tracker depuis les autres tâches
#[derive(Clone)]
pub struct PresenceHandle {
    tx: mpsc::Sender<PresenceCommand>,
}

impl PresenceHandle {
    pub async fn heartbeat(&self, hb: Heartbeat) -> Result<(), PresenceError> {
        self.tx
            .send(PresenceCommand::Heartbeat(hb))
            .await
            .map_err(|_| PresenceError::Stopped)
    }

    /// Sweep à l'instant `now` ; répond une fois tous les heartbeats précédents traités
    pub async fn sweep_at(&self, now: OffsetDateTime) -> Result<Vec<Record>, PresenceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PresenceCommand::Sweep { now, reply })
            .await
            .map_err(|_| PresenceError::Stopped)?;
        rx.await.map_err(|_| PresenceError::Stopped)
    }
}

/// Démarre la tâche propriétaire du tracker ; le timer de sweep vit et meurt avec elle
pub fn spawn_presence_tracker(
    tracker: PresenceTracker,
    sweep_interval: std::time::Duration,
    capacity: usize,
    token: CancellationToken,
) -> (PresenceHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(run_presence_tracker(tracker, rx, sweep_interval, token));
    (PresenceHandle { tx }, task)
}

async fn run_presence_tracker(
    mut tracker: PresenceTracker,
    mut rx: mpsc::Receiver<PresenceCommand>,
    sweep_interval: std::time::Duration,
    token: CancellationToken,
) {
    info!(
        timeout_ms = tracker.timeout().whole_milliseconds() as u64,
        sweep_interval_ms = sweep_interval.as_millis() as u64,
        "offline detection started"
    );

    // premier tick immédiat : réconciliation dès le démarrage
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let written = tracker.sweep(OffsetDateTime::now_utc());
                if !written.is_empty() {
                    debug!(count = written.len(), "sweep wrote offline transitions");
                }
            }
            cmd = rx.recv() => match cmd {
                Some(cmd) => tracker.handle(cmd),
                None => {
                    warn!("presence channel closed");
                    break;
                }
            },
        }
    }

    info!("offline detection stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::FlakyStore;
    use crate::store::MemoryStore;
    use serde_json::Map;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2025-06-01 08:00:00 UTC);

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    fn tracker_with(store: Arc<dyn RecordStore>) -> PresenceTracker {
        PresenceTracker::new(store, Broadcaster::new(64), HealthTracker::new(), "car", secs(25))
    }

    fn statuses(store: &MemoryStore, device: &str) -> Vec<Presence> {
        store
            .all(RecordKind::Status)
            .into_iter()
            .filter(|r| r.device_id == device)
            .filter_map(|r| r.presence())
            .collect()
    }

    fn status_report(device: &str, value: &str, ts: OffsetDateTime) -> Record {
        let mut fields = Map::new();
        fields.insert("status".into(), value.into());
        Record::new(RecordKind::Status, device, format!("car/{device}/status"), ts, fields)
    }

    #[test]
    fn test_first_heartbeat_writes_online() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = tracker_with(store.clone());
        assert_eq!(tracker.current_state("x").unwrap(), PresenceState::Unknown);

        let rec = tracker.on_heartbeat(Heartbeat::new("x", T0)).unwrap().unwrap();
        assert_eq!(rec.presence(), Some(Presence::Online));
        assert_eq!(rec.ts, T0);
        assert_eq!(tracker.last_heartbeat("x"), Some(T0));

        // online → online n'écrit rien
        assert!(tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(2))).unwrap().is_none());
        assert_eq!(statuses(&store, "x"), vec![Presence::Online]);
    }

    #[test]
    fn test_heartbeat_clears_offline() {
        let store = Arc::new(MemoryStore::new());
        store.append(&Record::transition("car", "x", Presence::Offline, T0)).unwrap();
        let mut tracker = tracker_with(store.clone());

        let rec = tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(60))).unwrap();
        assert!(rec.is_some());
        assert_eq!(statuses(&store, "x"), vec![Presence::Offline, Presence::Online]);
    }

    #[test]
    fn test_sweep_enforces_timeout_boundary() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = tracker_with(store.clone());
        tracker.on_heartbeat(Heartbeat::new("x", T0)).unwrap();

        assert!(tracker.sweep(T0 + secs(24)).is_empty());
        let written = tracker.sweep(T0 + secs(25));
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].presence(), Some(Presence::Offline));
        assert_eq!(written[0].ts, T0 + secs(25));

        // sweeps suivants : idempotents
        assert!(tracker.sweep(T0 + secs(35)).is_empty());
        assert!(tracker.sweep(T0 + secs(45)).is_empty());
        assert_eq!(statuses(&store, "x"), vec![Presence::Online, Presence::Offline]);
    }

    #[test]
    fn test_concrete_scenario_ten_second_ticks() {
        // TIMEOUT=25s, sweep toutes les 10s, un seul heartbeat à t=0
        let store = Arc::new(MemoryStore::new());
        let mut tracker = tracker_with(store.clone());
        tracker.on_heartbeat(Heartbeat::new("X", T0)).unwrap();

        let mut offline_at = Vec::new();
        for tick in 1..=6 {
            let now = T0 + secs(tick * 10);
            for rec in tracker.sweep(now) {
                offline_at.push((now - T0).whole_seconds());
                assert_eq!(rec.presence(), Some(Presence::Offline));
            }
        }
        assert_eq!(offline_at, vec![30]);
        assert_eq!(statuses(&store, "X"), vec![Presence::Online, Presence::Offline]);
    }

    #[test]
    fn test_restart_reconciliation_marks_stale_online_device() {
        let store = Arc::new(MemoryStore::new());
        store.append(&Record::transition("car", "old", Presence::Online, T0)).unwrap();
        store.append(&Record::transition("car", "fresh", Presence::Online, T0 + secs(20))).unwrap();
        store.append(&Record::transition("car", "gone", Presence::Offline, T0)).unwrap();

        // table vide : simule un redémarrage
        let mut tracker = tracker_with(store.clone());
        assert!(tracker.sweep(T0 + secs(24)).is_empty());

        let written = tracker.sweep(T0 + secs(26));
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].device_id, "old");

        assert!(tracker.sweep(T0 + secs(60)).iter().all(|r| r.device_id == "fresh"));
        assert!(tracker.sweep(T0 + secs(90)).is_empty());
        assert_eq!(statuses(&store, "old"), vec![Presence::Online, Presence::Offline]);
        assert_eq!(statuses(&store, "gone"), vec![Presence::Offline]);
    }

    #[test]
    fn test_store_scan_skips_devices_in_table() {
        let store = Arc::new(MemoryStore::new());
        store.append(&Record::transition("car", "x", Presence::Online, T0)).unwrap();
        let mut tracker = tracker_with(store.clone());

        // heartbeat récent : le scan du store ne doit pas le déclarer offline
        tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(100))).unwrap();
        assert!(tracker.sweep(T0 + secs(110)).is_empty());
        assert_eq!(statuses(&store, "x"), vec![Presence::Online]);
    }

    #[test]
    fn test_self_reported_status() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = tracker_with(store.clone());

        let hb = Heartbeat::new("x", T0).with_report(status_report("x", "online", T0));
        assert!(tracker.on_heartbeat(hb).unwrap().is_some());

        // redondant : non persisté
        let hb = Heartbeat::new("x", T0 + secs(1)).with_report(status_report("x", "online", T0 + secs(1)));
        assert!(tracker.on_heartbeat(hb).unwrap().is_none());

        let hb = Heartbeat::new("x", T0 + secs(2)).with_report(status_report("x", "offline", T0 + secs(2)));
        assert!(tracker.on_heartbeat(hb).unwrap().is_some());
        assert_eq!(tracker.current_state("x").unwrap(), PresenceState::Offline);

        // l'heartbeat suivant repasse online
        assert!(tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(3))).unwrap().is_some());
        assert_eq!(
            statuses(&store, "x"),
            vec![Presence::Online, Presence::Offline, Presence::Online]
        );
    }

    #[test]
    fn test_failed_write_is_not_broadcast_and_retried_later() {
        let store = Arc::new(FlakyStore::default());
        let broadcaster = Broadcaster::new(16);
        let mut rx = broadcaster.subscribe();
        let mut tracker = PresenceTracker::new(
            store.clone(),
            broadcaster,
            HealthTracker::new(),
            "car",
            secs(25),
        );

        store.set_failing(true);
        assert!(tracker.on_heartbeat(Heartbeat::new("x", T0)).is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.current_state("x").unwrap(), PresenceState::Unknown);

        store.set_failing(false);
        assert!(tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(1))).unwrap().is_some());
        assert_eq!(rx.try_recv().unwrap().channel, RecordKind::Status);
    }

    #[test]
    fn test_no_duplicate_transitions_over_mixed_sequence() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = tracker_with(store.clone());
        let devices = ["a", "b", "c"];

        // séquence pseudo-aléatoire déterministe de heartbeats et de sweeps
        let mut seed: u64 = 0x5eed;
        let mut now = T0;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            now += Duration::milliseconds(((seed >> 33) % 9000) as i64);
            let roll = (seed >> 20) % 10;
            if roll < 6 {
                let dev = devices[((seed >> 40) % 3) as usize];
                // reçu jusqu'à 3s plus tôt : peut précéder le dernier sweep
                let lag = Duration::milliseconds(((seed >> 12) % 3000) as i64);
                tracker.on_heartbeat(Heartbeat::new(dev, now - lag)).unwrap();
            } else {
                tracker.sweep(now);
            }
        }

        for dev in devices {
            let seq = statuses(&store, dev);
            assert!(!seq.is_empty());
            for pair in seq.windows(2) {
                assert_ne!(pair[0], pair[1], "duplicate consecutive status for {dev}");
            }
            let stamps: Vec<OffsetDateTime> = store
                .all(RecordKind::Status)
                .into_iter()
                .filter(|r| r.device_id == dev)
                .map(|r| r.ts)
                .collect();
            assert!(stamps.windows(2).all(|w| w[0] < w[1]), "status ts out of write order for {dev}");
        }
    }

    #[test]
    fn test_heartbeat_received_before_sweep_but_handled_after() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = tracker_with(store.clone());
        tracker.on_heartbeat(Heartbeat::new("x", T0)).unwrap();

        // le tick passe avant un heartbeat reçu à T0+26s mais encore en file
        let offline = tracker.sweep(T0 + Duration::milliseconds(26_500));
        assert_eq!(offline.len(), 1);

        let online = tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(26))).unwrap().unwrap();
        assert!(online.ts > offline[0].ts);
        assert_eq!(online.fields["timestamp_ms"], crate::models::epoch_millis(online.ts));
        assert_eq!(tracker.current_state("x").unwrap(), PresenceState::Online);
        assert_eq!(tracker.last_heartbeat("x"), Some(T0 + secs(26)));

        assert!(tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(28))).unwrap().is_none());
        assert_eq!(
            statuses(&store, "x"),
            vec![Presence::Online, Presence::Offline, Presence::Online]
        );
    }

    #[test]
    fn test_stale_heartbeat_does_not_rewind_table() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = tracker_with(store.clone());
        tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(10))).unwrap();
        tracker.on_heartbeat(Heartbeat::new("x", T0 + secs(4))).unwrap();
        assert_eq!(tracker.last_heartbeat("x"), Some(T0 + secs(10)));
        assert!(tracker.sweep(T0 + secs(30)).is_empty());
    }

    #[tokio::test]
    async fn test_task_serializes_heartbeats_and_sweeps() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let (handle, task) = spawn_presence_tracker(
            tracker_with(store.clone()),
            std::time::Duration::from_secs(3600),
            16,
            token.clone(),
        );

        handle.heartbeat(Heartbeat::new("x", T0)).await.unwrap();
        handle.heartbeat(Heartbeat::new("x", T0 + secs(5))).await.unwrap();
        assert!(handle.sweep_at(T0 + secs(20)).await.unwrap().is_empty());
        assert_eq!(handle.sweep_at(T0 + secs(30)).await.unwrap().len(), 1);

        token.cancel();
        task.await.unwrap();
        assert!(matches!(
            handle.sweep_at(T0 + secs(40)).await,
            Err(PresenceError::Stopped)
        ));
        assert_eq!(statuses(&store, "x"), vec![Presence::Online, Presence::Offline]);
    }

    #[tokio::test]
    async fn test_task_orders_sweep_ahead_of_lagging_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let (handle, task) = spawn_presence_tracker(
            tracker_with(store.clone()),
            std::time::Duration::from_secs(3600),
            16,
            token.clone(),
        );

        handle.heartbeat(Heartbeat::new("x", T0)).await.unwrap();
        assert_eq!(handle.sweep_at(T0 + Duration::milliseconds(26_500)).await.unwrap().len(), 1);
        handle.heartbeat(Heartbeat::new("x", T0 + secs(26))).await.unwrap();
        handle.heartbeat(Heartbeat::new("x", T0 + secs(28))).await.unwrap();
        assert!(handle.sweep_at(T0 + secs(40)).await.unwrap().is_empty());

        token.cancel();
        task.await.unwrap();
        assert_eq!(
            statuses(&store, "x"),
            vec![Presence::Online, Presence::Offline, Presence::Online]
        );
        let latest = store.latest(RecordKind::Status, "x").unwrap().unwrap();
        assert_eq!(latest.presence(), Some(Presence::Online));
        assert!(latest.ts > T0 + Duration::milliseconds(26_500));
    }

    #[tokio::test]
    async fn test_periodic_timer_marks_device_offline() {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Broadcaster::new(16);
        let mut rx = broadcaster.subscribe();
        let tracker = PresenceTracker::new(
            store.clone(),
            broadcaster,
            HealthTracker::new(),
            "car",
            Duration::milliseconds(50),
        );
        let token = CancellationToken::new();
        let (handle, task) =
            spawn_presence_tracker(tracker, std::time::Duration::from_millis(20), 16, token.clone());

        handle
            .heartbeat(Heartbeat::new("x", OffsetDateTime::now_utc()))
            .await
            .unwrap();
        let online = rx.recv().await.unwrap();
        assert_eq!(online.record.presence(), Some(Presence::Online));

        let offline = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offline.record.presence(), Some(Presence::Offline));

        token.cancel();
        task.await.unwrap();
        assert_eq!(statuses(&store, "x"), vec![Presence::Online, Presence::Offline]);
    }
}
