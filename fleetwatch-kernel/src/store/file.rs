use super::{DeleteReport, MemoryStore, RangeQuery, RecordStore, StoreError};
use crate::models::{Record, RecordKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Store durable : un fichier JSON-lines append-only par collection
///
/// L'index mémoire est reconstruit à l'ouverture ; chaque écriture passe
/// d'abord par le disque, donc un échec IO ne laisse aucun record fantôme.
/// Une ligne finale tronquée par un arrêt brutal est réparée à l'ouverture.
pub struct FileStore {
    data_dir: PathBuf,
    index: MemoryStore,
    /// Sérialise les écritures disque + index
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Ouvre (ou crée) les fichiers de collection sous `data_dir`
    pub fn open<P: Into<PathBuf>>(data_dir: P) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let mut loaded = HashMap::new();
        for kind in RecordKind::ALL {
            let path = collection_path(&data_dir, kind);
            let records = load_collection(&path, kind)?;
            info!(collection = kind.collection(), count = records.len(), "loaded collection");
            loaded.insert(kind, records);
        }

        Ok(Self {
            data_dir,
            index: MemoryStore::with_records(loaded),
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path(&self, kind: RecordKind) -> PathBuf {
        collection_path(&self.data_dir, kind)
    }

    /// Réécrit une collection complète depuis l'index (fichier temporaire puis rename)
    fn rewrite(&self, kind: RecordKind) -> Result<(), StoreError> {
        let path = self.path(kind);
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for rec in self.index.all(kind) {
                serde_json::to_writer(&mut writer, &rec)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn collection_path(data_dir: &Path, kind: RecordKind) -> PathBuf {
    data_dir.join(format!("{}.jsonl", kind.collection()))
}

fn load_collection(path: &Path, kind: RecordKind) -> Result<Vec<Record>, StoreError> {
    if !path.exists() {
        File::create(path)?;
        return Ok(Vec::new());
    }

    let mut bytes = fs::read(path)?;
    repair_torn_tail(path, &mut bytes)?;

    let mut records = Vec::new();
    for (lineno, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Record>(line) {
            Ok(rec) if rec.kind == kind => records.push(rec),
            Ok(rec) => warn!(path = %path.display(), line = lineno + 1, kind = %rec.kind, "record of wrong kind skipped"),
            Err(e) => warn!(path = %path.display(), line = lineno + 1, error = %e, "corrupt record skipped"),
        }
    }
    Ok(records)
}

/// Dernière ligne sans `\n` (écriture interrompue) : complétée si elle est
/// lisible, sinon tronquée, pour que l'append suivant démarre sur une ligne propre
fn repair_torn_tail(path: &Path, bytes: &mut Vec<u8>) -> Result<(), StoreError> {
    if bytes.last().map_or(true, |b| *b == b'\n') {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let mut file = OpenOptions::new().write(true).open(path)?;

    if serde_json::from_slice::<Record>(&bytes[keep..]).is_ok() {
        file.seek(SeekFrom::End(0))?;
        file.write_all(b"\n")?;
        bytes.push(b'\n');
        warn!(path = %path.display(), "missing trailing newline restored");
    } else {
        file.set_len(keep as u64)?;
        warn!(path = %path.display(), dropped_bytes = bytes.len() - keep, "torn trailing line truncated");
        bytes.truncate(keep);
    }
    file.sync_all()?;
    Ok(())
}

/// Écrit une ligne complète ou rien : en cas d'échec le fichier revient à sa taille d'avant
fn append_line(file: &mut File, line: &[u8]) -> Result<(), StoreError> {
    let len = file.metadata()?.len();
    if let Err(e) = file.write_all(line).and_then(|()| file.flush()) {
        if let Err(rollback) = file.set_len(len) {
            warn!(error = %rollback, "could not roll back partial append");
        }
        return Err(e.into());
    }
    Ok(())
}

impl RecordStore for FileStore {
    fn append(&self, record: &Record) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(self.path(record.kind))?;
        append_line(&mut file, &line)?;
        self.index.append(record)?;
        debug!(collection = record.kind.collection(), device_id = %record.device_id, "record appended");
        Ok(())
    }

    fn latest(&self, kind: RecordKind, device_id: &str) -> Result<Option<Record>, StoreError> {
        self.index.latest(kind, device_id)
    }

    fn range(&self, kind: RecordKind, device_id: &str, query: &RangeQuery) -> Result<Vec<Record>, StoreError> {
        self.index.range(kind, device_id, query)
    }

    fn latest_per_device(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError> {
        self.index.latest_per_device(kind)
    }

    fn delete_device(&self, device_id: &str) -> Result<DeleteReport, StoreError> {
        let _guard = self.write_lock.lock();
        let report = self.index.remove_device(device_id);
        for kind in RecordKind::ALL {
            if report.deleted.get(kind.collection()).copied().unwrap_or(0) > 0 {
                self.rewrite(kind)?;
            }
        }
        info!(device_id, total = report.total_deleted, "device records deleted");
        Ok(report)
    }
}
