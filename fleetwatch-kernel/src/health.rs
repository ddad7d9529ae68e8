use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub records_stored: u64,
    pub transitions_written: u64,
    pub devices_tracked: u64,
}

#[derive(Default)]
struct Counters {
    mqtt_reconnects: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    records_stored: AtomicU64,
    transitions_written: AtomicU64,
    devices_tracked: AtomicU64,
}

/// Compteurs partagés entre subscriber, routeur et tracker de présence
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_status: Arc<Mutex<String>>,
    counters: Arc<Counters>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.counters.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn message_received(&self) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.counters.records_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transition_written(&self) {
        self.counters.transitions_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_devices_tracked(&self, count: usize) {
        self.counters.devices_tracked.store(count as u64, Ordering::Relaxed);
    }

    pub fn get_health(&self) -> KernelHealth {
        let c = &self.counters;
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: c.mqtt_reconnects.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            messages_dropped: c.messages_dropped.load(Ordering::Relaxed),
            records_stored: c.records_stored.load(Ordering::Relaxed),
            transitions_written: c.transitions_written.load(Ordering::Relaxed),
            devices_tracked: c.devices_tracked.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_updates_status_and_counter() {
        let h = HealthTracker::new();
        assert_eq!(h.get_health().mqtt_status, "connecting");
        h.increment_reconnects();
        h.increment_reconnects();
        let snap = h.get_health();
        assert_eq!(snap.mqtt_status, "reconnecting");
        assert_eq!(snap.mqtt_reconnects, 2);

        h.mark_mqtt_connected();
        assert_eq!(h.get_health().mqtt_status, "connected");
    }

    #[test]
    fn test_clones_share_counters() {
        let h = HealthTracker::new();
        let other = h.clone();
        other.message_received();
        other.record_stored();
        other.set_devices_tracked(3);
        let snap = h.get_health();
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.records_stored, 1);
        assert_eq!(snap.devices_tracked, 3);
    }
}
