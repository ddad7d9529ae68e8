/**
 * RECORD STORE - Persistance append-only des records telemetry / event / status
 *
 * RÔLE :
 * Interface unique de stockage consommée par le routeur (écriture), le tracker
 * de présence (dernier status, scan de réconciliation) et les collaborateurs
 * lecture (API, listing des devices, suppression admin).
 *
 * FONCTIONNEMENT :
 * - RecordStore trait = append / latest / range / latest_per_device / delete_device
 * - MemoryStore = vecteurs par kind + index du dernier record par device,
 *   derrière un RwLock (tests, mode éphémère)
 * - FileStore = un fichier JSON-lines par kind, rejoué en mémoire à l'ouverture
 * - Ordre de lecture : le plus récent d'abord, égalité de ts → dernier écrit
 */

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::models::{Record, RecordKind};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Nombre de records renvoyés par défaut par une requête d'historique
pub const DEFAULT_RANGE_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fenêtre d'historique pour un device ; bornes incluses
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: usize,
}

impl Default for RangeQuery {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            limit: DEFAULT_RANGE_LIMIT,
        }
    }
}

impl RangeQuery {
    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
    }
}

/// Compte des records supprimés par collection
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteReport {
    pub deleted: BTreeMap<String, usize>,
    pub total_deleted: usize,
}

impl DeleteReport {
    fn add(&mut self, kind: RecordKind, count: usize) {
        self.deleted.insert(kind.collection().to_string(), count);
        self.total_deleted += count;
    }
}

/// Interface commune des backends de stockage
pub trait RecordStore: Send + Sync {
    /// Persiste un record ; une erreur signifie qu'il n'a pas été stocké
    fn append(&self, record: &Record) -> Result<(), StoreError>;

    /// Dernier record d'un kind pour un device
    fn latest(&self, kind: RecordKind, device_id: &str) -> Result<Option<Record>, StoreError>;

    /// Historique d'un device, le plus récent d'abord
    fn range(&self, kind: RecordKind, device_id: &str, query: &RangeQuery) -> Result<Vec<Record>, StoreError>;

    /// Dernier record de chaque device pour un kind, trié par device_id
    fn latest_per_device(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError>;

    /// Suppression administrative de tous les records d'un device
    fn delete_device(&self, device_id: &str) -> Result<DeleteReport, StoreError>;
}

/// Vrai si `candidate` doit remplacer `current` comme record le plus récent :
/// ts strictement plus grand, ou égal et écrit plus tard
pub(crate) fn is_newer(candidate: &Record, current: &Record) -> bool {
    candidate.ts >= current.ts
}

/// Historique filtré, servi depuis des records gardés en ordre d'écriture
pub(crate) fn select_range<'a, I>(records: I, device_id: &str, query: &RangeQuery) -> Vec<Record>
where
    I: IntoIterator<Item = &'a Record>,
{
    // parcours en ordre d'écriture puis tri stable inversé : à ts égal le dernier écrit sort en premier
    let mut results: Vec<Record> = records
        .into_iter()
        .filter(|r| r.device_id == device_id && query.contains(r.ts))
        .cloned()
        .collect();
    results.reverse();
    results.sort_by(|a, b| b.ts.cmp(&a.ts));
    results.truncate(query.limit);
    results
}
