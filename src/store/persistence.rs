//! On-disk snapshot format and crash-safe file replacement.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::StoreError;
use crate::domain::TransactionRecord;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub records: HashMap<String, TransactionRecord>,
}

pub enum LoadOutcome {
    Missing,
    Loaded(HashMap<String, TransactionRecord>),
    /// The file could not be parsed and was moved to the given path.
    Quarantined(PathBuf),
}

pub fn load(path: &Path) -> Result<LoadOutcome, StoreError> {
    let Some(bytes) = read_file(path)? else {
        return Ok(LoadOutcome::Missing);
    };

    match parse(&bytes) {
        Ok(records) => Ok(LoadOutcome::Loaded(records)),
        Err(reason) => {
            tracing::error!(path = %path.display(), reason = %reason, "Store file is unreadable");
            quarantine(path).map(LoadOutcome::Quarantined)
        }
    }
}

/// Like [`load`], but never touches the file. An unreadable snapshot is an error.
pub fn load_read_only(path: &Path) -> Result<Option<HashMap<String, TransactionRecord>>, StoreError> {
    let Some(bytes) = read_file(path)? else {
        return Ok(None);
    };
    parse(&bytes).map(Some).map_err(StoreError::Unreadable)
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

fn parse(bytes: &[u8]) -> Result<HashMap<String, TransactionRecord>, String> {
    match serde_json::from_slice::<Snapshot>(bytes) {
        Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Ok(snapshot.records),
        Ok(snapshot) => Err(format!("unsupported version {}", snapshot.version)),
        Err(e) => Err(e.to_string()),
    }
}

fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let mut target = path.as_os_str().to_owned();
    target.push(format!(".corrupt-{}", Utc::now().timestamp()));
    let target = PathBuf::from(target);
    fs::rename(path, &target)?;
    Ok(target)
}

/// Writes the snapshot to `<path>.tmp`, fsyncs it, then renames it over `path`.
pub fn write_atomic(path: &Path, records: &HashMap<String, TransactionRecord>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        records,
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    records: &'a HashMap<String, TransactionRecord>,
}
