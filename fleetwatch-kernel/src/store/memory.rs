use super::{is_newer, select_range, DeleteReport, RangeQuery, RecordStore, StoreError};
use crate::models::{Record, RecordKind};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Store éphémère : les records vivent le temps du process
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

#[derive(Default)]
struct Collections {
    /// Ordre d'écriture, par kind
    records: HashMap<RecordKind, Vec<Record>>,
    /// Dernier record par (kind, device) ; BTreeMap pour sortir trié par device_id
    latest: HashMap<RecordKind, BTreeMap<String, Record>>,
}

impl Collections {
    fn push(&mut self, record: Record) {
        self.index(&record);
        self.records.entry(record.kind).or_default().push(record);
    }

    fn index(&mut self, record: &Record) {
        let per_device = self.latest.entry(record.kind).or_default();
        match per_device.get_mut(&record.device_id) {
            Some(current) if !is_newer(record, current) => {}
            Some(current) => *current = record.clone(),
            None => {
                per_device.insert(record.device_id.clone(), record.clone());
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge un jeu de records déjà ordonnés (utilisé par FileStore au démarrage)
    pub(crate) fn with_records(records: HashMap<RecordKind, Vec<Record>>) -> Self {
        let mut inner = Collections::default();
        for list in records.values() {
            for rec in list {
                inner.index(rec);
            }
        }
        inner.records = records;
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub fn len(&self, kind: RecordKind) -> usize {
        self.inner.read().records.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.values().all(Vec::is_empty)
    }

    /// Tous les records d'un kind en ordre d'écriture
    pub fn all(&self, kind: RecordKind) -> Vec<Record> {
        self.inner.read().records.get(&kind).cloned().unwrap_or_default()
    }

    /// Retire les records d'un device sans toucher au disque
    pub(crate) fn remove_device(&self, device_id: &str) -> DeleteReport {
        let mut report = DeleteReport::default();
        let mut inner = self.inner.write();
        for kind in RecordKind::ALL {
            let list = inner.records.entry(kind).or_default();
            let before = list.len();
            list.retain(|r| r.device_id != device_id);
            report.add(kind, before - list.len());
            if let Some(per_device) = inner.latest.get_mut(&kind) {
                per_device.remove(device_id);
            }
        }
        report
    }
}

impl RecordStore for MemoryStore {
    fn append(&self, record: &Record) -> Result<(), StoreError> {
        self.inner.write().push(record.clone());
        Ok(())
    }

    fn latest(&self, kind: RecordKind, device_id: &str) -> Result<Option<Record>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.latest.get(&kind).and_then(|m| m.get(device_id)).cloned())
    }

    fn range(&self, kind: RecordKind, device_id: &str, query: &RangeQuery) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .records
            .get(&kind)
            .map(|list| select_range(list, device_id, query))
            .unwrap_or_default())
    }

    fn latest_per_device(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .latest
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_device(&self, device_id: &str) -> Result<DeleteReport, StoreError> {
        Ok(self.remove_device(device_id))
    }
}
