//! File-backed reservation store.
//!
//! One JSON record per reservation under `<root>/reservations/<id>.json`.
//! Every mutation goes through an atomic write: serialize to a temp file,
//! fsync, rename over the destination. A crash mid-write leaves either the
//! previous committed record or a stray `*.tmp.*` file, which is discarded
//! on the next open; a partially written record is never visible.
//!
//! Secondary indexes (by twin, by type) live in memory and are rebuilt by
//! scanning the directory at open.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use weft_common::time::now_unix;
use weft_common::{Reservation, ReservationResult, ResultState, TwinId, WorkloadType};

use crate::store::{check_transition, Store, StoreError};

/// Index entry kept in memory per record; enough for listings and ordering
/// without touching the disk.
#[derive(Debug, Clone)]
struct Meta {
    twin_id: TwinId,
    workload_type: WorkloadType,
    created_at: u64,
}

/// Local filesystem store.
#[derive(Debug)]
pub struct FsStore {
    reservations_dir: PathBuf,
    index: RwLock<HashMap<String, Meta>>,
}

impl FsStore {
    /// Open a store rooted at `root`, creating `<root>/reservations` if
    /// missing and rebuilding the indexes from the records on disk.
    ///
    /// Stray temp files from interrupted writes are removed; records that
    /// fail to parse are skipped with a warning and left on disk for
    /// inspection.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let reservations_dir = root.as_ref().join("reservations");
        fs::create_dir_all(&reservations_dir)?;

        let mut index = HashMap::new();
        for entry in fs::read_dir(&reservations_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if name.contains(".tmp.") {
                debug!(file = %name, "removing leftover temp file");
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            match read_record(&path) {
                Ok(r) => {
                    index.insert(id.to_string(), meta_of(&r));
                }
                Err(err) => {
                    warn!(file = %name, %err, "skipping unreadable reservation record");
                }
            }
        }

        debug!(count = index.len(), dir = %reservations_dir.display(), "reservation store opened");
        Ok(FsStore {
            reservations_dir,
            index: RwLock::new(index),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.reservations_dir.join(format!("{id}.json"))
    }

    /// Atomic write: temp file in the same directory, fsync, rename.
    fn atomic_write(&self, id: &str, reservation: &Reservation) -> Result<(), StoreError> {
        let dest = self.record_path(id);
        let tmp = self
            .reservations_dir
            .join(format!("{id}.json.tmp.{}", now_unix()));
        let bytes = serde_json::to_vec_pretty(reservation)?;
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &dest)?;
        Ok(())
    }

    /// Read-modify-write under the index write lock.
    fn update<F>(&self, id: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Reservation) -> Result<bool, StoreError>,
    {
        let index = self.index.write();
        if !index.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let mut reservation = read_record(&self.record_path(id))?;
        if apply(&mut reservation)? {
            self.atomic_write(id, &reservation)?;
        }
        Ok(())
    }
}

fn meta_of(r: &Reservation) -> Meta {
    Meta {
        twin_id: r.twin_id,
        workload_type: r.workload_type,
        created_at: r.created_at,
    }
}

fn read_record(path: &Path) -> Result<Reservation, StoreError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl Store for FsStore {
    fn add(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let mut index = self.index.write();
        if index.contains_key(&reservation.id) {
            return Err(StoreError::AlreadyExists(reservation.id.clone()));
        }
        self.atomic_write(&reservation.id, reservation)?;
        index.insert(reservation.id.clone(), meta_of(reservation));
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Reservation, StoreError> {
        let index = self.index.read();
        if !index.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        read_record(&self.record_path(id))
    }

    fn set_result(&self, id: &str, result: ReservationResult) -> Result<(), StoreError> {
        self.update(id, |r| {
            check_transition(r, result.state, false)?;
            r.result = Some(result);
            Ok(true)
        })
    }

    fn mark_to_delete(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |r| {
            if r.to_delete {
                return Ok(false);
            }
            r.to_delete = true;
            Ok(true)
        })
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut index = self.index.write();
        if !index.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let reservation = read_record(&self.record_path(id))?;
        if reservation.result_state() != Some(ResultState::Deleted) {
            return Err(StoreError::PreconditionFailed {
                id: id.to_string(),
                reason: "result state is not deleted".into(),
            });
        }
        fs::remove_file(self.record_path(id))?;
        index.remove(id);
        Ok(())
    }

    fn reconcile(&self, id: &str, result: ReservationResult) -> Result<(), StoreError> {
        self.update(id, |r| {
            check_transition(r, result.state, true)?;
            if result.state == ResultState::Deleted {
                // the workload is gone in the real world; record the intent too
                r.to_delete = true;
            }
            r.result = Some(result);
            Ok(true)
        })
    }

    fn list_by_twin(&self, twin: TwinId, workload_type: Option<WorkloadType>) -> Vec<String> {
        let index = self.index.read();
        let mut ids: Vec<String> = index
            .iter()
            .filter(|(_, m)| m.twin_id == twin)
            .filter(|(_, m)| workload_type.is_none_or(|t| m.workload_type == t))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn list_by_type(&self, workload_type: WorkloadType) -> Vec<String> {
        let index = self.index.read();
        let mut ids: Vec<String> = index
            .iter()
            .filter(|(_, m)| m.workload_type == workload_type)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn list_all(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.index.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn in_startup_order(&self, priority: &[WorkloadType]) -> Vec<Reservation> {
        let rank = |t: WorkloadType| -> usize {
            priority.iter().position(|p| *p == t).unwrap_or(priority.len())
        };

        let mut keys: Vec<(usize, u64, String)> = {
            let index = self.index.read();
            index
                .iter()
                .map(|(id, m)| (rank(m.workload_type), m.created_at, id.clone()))
                .collect()
        };
        keys.sort();

        let mut out = Vec::with_capacity(keys.len());
        for (_, _, id) in keys {
            match read_record(&self.record_path(&id)) {
                Ok(r) => out.push(r),
                Err(err) => warn!(%id, %err, "skipping unreadable record during startup scan"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use weft_common::ReservationResult;

    fn reservation(id: &str, twin: TwinId, t: WorkloadType, created_at: u64) -> Reservation {
        Reservation {
            id: id.to_string(),
            twin_id: twin,
            workload_type: t,
            data: json!({}),
            created_at,
            duration_secs: 3600,
            signature: String::new(),
            to_delete: false,
            result: None,
        }
    }

    fn ok_result() -> ReservationResult {
        ReservationResult::new(ResultState::Ok, "", json!({"id": "dev"}), 1)
    }

    fn deleted_result() -> ReservationResult {
        ReservationResult::new(ResultState::Deleted, "decommissioned", json!(null), 2)
    }

    #[test]
    fn test_add_get_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        let r = reservation("r-1", 1, WorkloadType::Volume, 10);
        store.add(&r).unwrap();

        let got = store.get("r-1").unwrap();
        assert_eq!(got.twin_id, 1);
        assert!(got.result.is_none());

        assert!(matches!(store.add(&r), Err(StoreError::AlreadyExists(_))));
        assert!(matches!(store.get("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_set_result_and_transitions() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        store.add(&reservation("r-1", 1, WorkloadType::Volume, 10)).unwrap();

        store.set_result("r-1", ok_result()).unwrap();
        assert_eq!(store.get("r-1").unwrap().result_state(), Some(ResultState::Ok));

        // ok -> error is not a legal transition
        let err = store
            .set_result("r-1", ReservationResult::new(ResultState::Error, "boom", json!(null), 3))
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));

        // deleted is terminal
        store.set_result("r-1", deleted_result()).unwrap();
        let err = store.set_result("r-1", ok_result()).unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));
    }

    #[test]
    fn test_to_delete_blocks_ok() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        store.add(&reservation("r-1", 1, WorkloadType::Volume, 10)).unwrap();

        store.mark_to_delete("r-1").unwrap();
        // idempotent
        store.mark_to_delete("r-1").unwrap();
        assert!(store.get("r-1").unwrap().to_delete);

        let err = store.set_result("r-1", ok_result()).unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));
    }

    #[test]
    fn test_remove_requires_deleted() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        store.add(&reservation("r-1", 1, WorkloadType::Volume, 10)).unwrap();

        assert!(matches!(
            store.remove("r-1"),
            Err(StoreError::PreconditionFailed { .. })
        ));

        store.set_result("r-1", deleted_result()).unwrap();
        store.remove("r-1").unwrap();
        assert!(matches!(store.get("r-1"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_reconcile_is_idempotent_on_deleted() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        store.add(&reservation("r-1", 1, WorkloadType::Container, 10)).unwrap();

        store.reconcile("r-1", deleted_result()).unwrap();
        // a rerun of the upgrade hook reports the same fact again
        store.reconcile("r-1", deleted_result()).unwrap();

        let r = store.get("r-1").unwrap();
        assert!(r.to_delete);
        assert_eq!(r.result_state(), Some(ResultState::Deleted));
    }

    #[test]
    fn test_listings() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        store.add(&reservation("a", 1, WorkloadType::Volume, 1)).unwrap();
        store.add(&reservation("b", 1, WorkloadType::Container, 2)).unwrap();
        store.add(&reservation("c", 2, WorkloadType::Volume, 3)).unwrap();

        assert_eq!(store.list_by_twin(1, None), vec!["a", "b"]);
        assert_eq!(store.list_by_twin(1, Some(WorkloadType::Volume)), vec!["a"]);
        assert_eq!(store.list_by_type(WorkloadType::Volume), vec!["a", "c"]);
        assert_eq!(store.list_all(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_startup_order() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        store.add(&reservation("c-1", 1, WorkloadType::Container, 1)).unwrap();
        store.add(&reservation("n-2", 1, WorkloadType::NetworkResource, 9)).unwrap();
        store.add(&reservation("n-1", 1, WorkloadType::NetworkResource, 5)).unwrap();
        store.add(&reservation("v-1", 1, WorkloadType::Volume, 7)).unwrap();

        let order: Vec<String> = store
            .in_startup_order(&[WorkloadType::NetworkResource, WorkloadType::Volume])
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(order, vec!["n-1", "n-2", "v-1", "c-1"]);
    }

    #[test]
    fn test_reload_rebuilds_indexes() {
        let dir = TempDir::new().unwrap();
        {
            let store = FsStore::open(dir.path()).unwrap();
            store.add(&reservation("a", 1, WorkloadType::Volume, 1)).unwrap();
            store.set_result("a", ok_result()).unwrap();
        }
        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(store.list_all(), vec!["a"]);
        assert_eq!(store.get("a").unwrap().result_state(), Some(ResultState::Ok));
    }

    #[test]
    fn test_torn_write_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let store = FsStore::open(dir.path()).unwrap();
            store.add(&reservation("good", 1, WorkloadType::Volume, 1)).unwrap();
        }

        let records = dir.path().join("reservations");
        // a crash mid-write leaves a temp file...
        fs::write(records.join("good.json.tmp.123"), b"{\"id\": \"good\", \"tw").unwrap();
        // ...or, with a corrupted disk, a record that is not valid JSON
        fs::write(records.join("torn.json"), b"{\"id\": \"torn\", ").unwrap();

        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(store.list_all(), vec!["good"]);
        assert_eq!(store.get("good").unwrap().twin_id, 1);
        // the temp file is gone after recovery
        assert!(!records.join("good.json.tmp.123").exists());
    }
}
