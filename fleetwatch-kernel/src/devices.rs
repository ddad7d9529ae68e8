use crate::models::{PresenceState, RecordKind};
use crate::store::{RecordStore, StoreError};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Résumé lecture d'un device : dernier status connu + dernière activité
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_ts: OffsetDateTime,
}

/// Un device par identifiant vu dans l'une des trois collections,
/// trié par activité décroissante puis par identifiant
pub fn list_devices(store: &dyn RecordStore) -> Result<Vec<DeviceView>, StoreError> {
    let mut views: BTreeMap<String, DeviceView> = BTreeMap::new();

    for kind in RecordKind::ALL {
        for rec in store.latest_per_device(kind)? {
            let view = views.entry(rec.device_id.clone()).or_insert_with(|| DeviceView {
                device_id: rec.device_id.clone(),
                status: PresenceState::Unknown.as_str().to_string(),
                last_ts: rec.ts,
            });
            if rec.ts > view.last_ts {
                view.last_ts = rec.ts;
            }
            if kind == RecordKind::Status {
                if let Some(status) = rec.fields.get("status").and_then(|v| v.as_str()) {
                    view.status = status.to_string();
                }
            }
        }
    }

    let mut list: Vec<DeviceView> = views.into_values().collect();
    list.sort_by(|a, b| b.last_ts.cmp(&a.last_ts).then_with(|| a.device_id.cmp(&b.device_id)));
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Presence, Record};
    use crate::store::test_support::record;
    use crate::store::MemoryStore;
    use time::macros::datetime;
    use time::Duration;

    const T1: OffsetDateTime = datetime!(2025-06-01 08:00:00 UTC);

    #[test]
    fn test_merge_takes_latest_across_kinds() {
        let store = MemoryStore::new();
        store.append(&record(RecordKind::Telemetry, "d", T1, 1)).unwrap();
        store.append(&record(RecordKind::Event, "d", T1 + Duration::seconds(1), 2)).unwrap();
        store
            .append(&Record::transition("car", "d", Presence::Online, T1 + Duration::seconds(2)))
            .unwrap();

        let list = list_devices(&store).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, "online");
        assert_eq!(list[0].last_ts, T1 + Duration::seconds(2));
    }

    #[test]
    fn test_status_defaults_to_unknown() {
        let store = MemoryStore::new();
        store.append(&record(RecordKind::Telemetry, "fresh", T1, 1)).unwrap();
        let list = list_devices(&store).unwrap();
        assert_eq!(list[0].status, "unknown");
    }

    #[test]
    fn test_status_is_latest_status_not_latest_activity() {
        let store = MemoryStore::new();
        store.append(&Record::transition("car", "d", Presence::Offline, T1)).unwrap();
        store
            .append(&record(RecordKind::Telemetry, "d", T1 + Duration::seconds(30), 1))
            .unwrap();
        let list = list_devices(&store).unwrap();
        assert_eq!(list[0].status, "offline");
        assert_eq!(list[0].last_ts, T1 + Duration::seconds(30));
    }

    #[test]
    fn test_ordering_is_descending_and_stable() {
        let store = MemoryStore::new();
        store.append(&record(RecordKind::Telemetry, "old", T1, 1)).unwrap();
        store.append(&record(RecordKind::Telemetry, "b", T1 + Duration::seconds(5), 1)).unwrap();
        store.append(&record(RecordKind::Event, "a", T1 + Duration::seconds(5), 1)).unwrap();

        let ids: Vec<_> = list_devices(&store).unwrap().into_iter().map(|v| v.device_id).collect();
        assert_eq!(ids, vec!["a", "b", "old"]);
    }

    #[test]
    fn test_view_serializes_rfc3339() {
        let view = DeviceView {
            device_id: "d".into(),
            status: "online".into(),
            last_ts: T1,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["last_ts"], "2025-06-01T08:00:00Z");
    }
}
