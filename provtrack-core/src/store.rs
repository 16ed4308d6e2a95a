//! Snapshot stores: durable backends for the persistent writer.
//!
//! A store keeps run rows and immutable snapshot records. The one hard rule
//! is create-only commits: once `(run_uid, sequence_version)` exists it is
//! never replaced, and a second commit at the same version fails with
//! [`StoreError::Conflict`].
//!
//! Two implementations:
//! - [`MemoryStore`]: mutex-protected maps, for tests and embedding.
//! - [`FileStore`]: one directory per run, one JSON file per snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{TransformEdge, TransformNode};
use crate::graph::LineageGraph;
use crate::persistence::{atomic_write_json, load_json, write_new_json};
use crate::run::{RunKey, RunStatus};

/// A run row as kept by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_uid: String,
    pub session_id: Uuid,
    pub project_name: String,
    pub pipeline_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: RunStatus,
    /// Highest committed sequence version, `None` until the first commit.
    #[serde(default)]
    pub latest_sequence_version: Option<u64>,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn key(&self) -> RunKey {
        RunKey {
            project_name: self.project_name.clone(),
            pipeline_name: self.pipeline_name.clone(),
            user_tag: self.user_tag.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One immutable committed state of a run's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub run_uid: String,
    pub sequence_version: u64,
    pub session_id: Uuid,
    pub project_name: String,
    pub pipeline_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: RunStatus,
    pub nodes: Vec<TransformNode>,
    pub edges: Vec<TransformEdge>,
    pub committed_at: DateTime<Utc>,
    /// SHA-256 over the canonical JSON of `nodes` and `edges`.
    pub content_hash: String,
    /// SHA-256 linking this record to the previous one of the same run.
    pub chain_hash: String,
}

impl SnapshotRecord {
    pub fn key(&self) -> RunKey {
        RunKey {
            project_name: self.project_name.clone(),
            pipeline_name: self.pipeline_name.clone(),
            user_tag: self.user_tag.clone(),
        }
    }

    pub fn graph(&self) -> LineageGraph {
        LineageGraph::from_parts(&self.nodes, &self.edges)
    }
}

/// Durable backend for runs and snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Create a run row. Fails with `Conflict` if the uid is taken.
    fn open_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    /// Commit a snapshot with create-only semantics.
    fn commit(&self, record: &SnapshotRecord) -> Result<(), StoreError>;

    /// Mark a run closed with a terminal status.
    fn close_run(
        &self,
        run_uid: &str,
        status: RunStatus,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn run(&self, run_uid: &str) -> Result<Option<RunRecord>, StoreError>;

    /// Every run, oldest first.
    fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError>;

    /// Every snapshot of a run, ascending by sequence version.
    fn snapshots(&self, run_uid: &str) -> Result<Vec<SnapshotRecord>, StoreError>;

    fn snapshot(
        &self,
        run_uid: &str,
        sequence_version: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError>;

    fn latest_sequence_version(&self, run_uid: &str) -> Result<Option<u64>, StoreError>;
}

fn run_not_found(run_uid: &str) -> StoreError {
    StoreError::RunNotFound {
        run_uid: run_uid.to_string(),
    }
}

fn check_close(run: &RunRecord, status: RunStatus) -> Result<(), StoreError> {
    if !run.status.can_transition_to(status) {
        return Err(StoreError::RunClosed {
            run_uid: run.run_uid.clone(),
        });
    }
    Ok(())
}

fn sort_runs(runs: &mut [RunRecord]) {
    runs.sort_by(|a, b| {
        a.opened_at
            .cmp(&b.opened_at)
            .then_with(|| a.run_uid.cmp(&b.run_uid))
    });
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

struct MemoryRun {
    record: RunRecord,
    snapshots: BTreeMap<u64, SnapshotRecord>,
}

/// In-memory store. Thread-safe via `Mutex<BTreeMap>`.
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<BTreeMap<String, MemoryRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemoryRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn open_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs();
        if runs.contains_key(&run.run_uid) {
            return Err(StoreError::Conflict {
                run_uid: run.run_uid.clone(),
                sequence_version: 0,
            });
        }
        runs.insert(
            run.run_uid.clone(),
            MemoryRun {
                record: run.clone(),
                snapshots: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn commit(&self, record: &SnapshotRecord) -> Result<(), StoreError> {
        let mut runs = self.runs();
        let run = runs
            .get_mut(&record.run_uid)
            .ok_or_else(|| run_not_found(&record.run_uid))?;
        if run.record.is_closed() {
            return Err(StoreError::RunClosed {
                run_uid: record.run_uid.clone(),
            });
        }
        if run.snapshots.contains_key(&record.sequence_version) {
            return Err(StoreError::Conflict {
                run_uid: record.run_uid.clone(),
                sequence_version: record.sequence_version,
            });
        }
        run.snapshots.insert(record.sequence_version, record.clone());
        run.record.latest_sequence_version = run.snapshots.keys().next_back().copied();
        Ok(())
    }

    fn close_run(
        &self,
        run_uid: &str,
        status: RunStatus,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs();
        let run = runs.get_mut(run_uid).ok_or_else(|| run_not_found(run_uid))?;
        check_close(&run.record, status)?;
        run.record.status = status;
        run.record.closed_at = Some(closed_at);
        Ok(())
    }

    fn run(&self, run_uid: &str) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.runs().get(run_uid).map(|r| r.record.clone()))
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let mut runs: Vec<RunRecord> = self.runs().values().map(|r| r.record.clone()).collect();
        sort_runs(&mut runs);
        Ok(runs)
    }

    fn snapshots(&self, run_uid: &str) -> Result<Vec<SnapshotRecord>, StoreError> {
        let runs = self.runs();
        let run = runs.get(run_uid).ok_or_else(|| run_not_found(run_uid))?;
        Ok(run.snapshots.values().cloned().collect())
    }

    fn snapshot(
        &self,
        run_uid: &str,
        sequence_version: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let runs = self.runs();
        let run = runs.get(run_uid).ok_or_else(|| run_not_found(run_uid))?;
        Ok(run.snapshots.get(&sequence_version).cloned())
    }

    fn latest_sequence_version(&self, run_uid: &str) -> Result<Option<u64>, StoreError> {
        let runs = self.runs();
        let run = runs.get(run_uid).ok_or_else(|| run_not_found(run_uid))?;
        Ok(run.snapshots.keys().next_back().copied())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Directory-backed store.
///
/// ```text
/// <root>/runs/<run_uid>/run.json
/// <root>/runs/<run_uid>/snapshots/00000000000000000000.json
/// ```
///
/// Snapshot files are created with [`write_new_json`] and never rewritten.
/// `run.json` is replaced atomically. The sequence version is recovered
/// from the snapshot directory itself, so a crash between writing a
/// snapshot and updating `run.json` loses nothing.
pub struct FileStore {
    root: PathBuf,
    // Serializes read-modify-write of run.json within this process.
    meta_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            meta_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_dir(&self, run_uid: &str) -> PathBuf {
        self.runs_dir().join(run_uid)
    }

    fn run_path(&self, run_uid: &str) -> PathBuf {
        self.run_dir(run_uid).join("run.json")
    }

    fn snapshots_dir(&self, run_uid: &str) -> PathBuf {
        self.run_dir(run_uid).join("snapshots")
    }

    fn snapshot_path(&self, run_uid: &str, sequence_version: u64) -> PathBuf {
        self.snapshots_dir(run_uid)
            .join(format!("{sequence_version:020}.json"))
    }

    fn load_run(&self, run_uid: &str) -> Result<Option<RunRecord>, StoreError> {
        Ok(load_json(&self.run_path(run_uid))?)
    }

    fn require_run(&self, run_uid: &str) -> Result<RunRecord, StoreError> {
        self.load_run(run_uid)?.ok_or_else(|| run_not_found(run_uid))
    }

    /// Sequence versions present on disk, ascending.
    fn versions_on_disk(&self, run_uid: &str) -> Result<Vec<u64>, StoreError> {
        let dir = self.snapshots_dir(run_uid);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(sv) = stem.parse::<u64>() {
                versions.push(sv);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn meta_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.meta_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn open_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let _guard = self.meta_guard();
        match write_new_json(&self.run_path(&run.run_uid), run) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::Conflict {
                run_uid: run.run_uid.clone(),
                sequence_version: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, record: &SnapshotRecord) -> Result<(), StoreError> {
        let _guard = self.meta_guard();
        let mut run = self.require_run(&record.run_uid)?;
        if run.is_closed() {
            return Err(StoreError::RunClosed {
                run_uid: record.run_uid.clone(),
            });
        }

        let path = self.snapshot_path(&record.run_uid, record.sequence_version);
        match write_new_json(&path, record) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Conflict {
                    run_uid: record.run_uid.clone(),
                    sequence_version: record.sequence_version,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let latest = run
            .latest_sequence_version
            .map_or(record.sequence_version, |v| v.max(record.sequence_version));
        run.latest_sequence_version = Some(latest);
        atomic_write_json(&self.run_path(&record.run_uid), &run)?;
        Ok(())
    }

    fn close_run(
        &self,
        run_uid: &str,
        status: RunStatus,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _guard = self.meta_guard();
        let mut run = self.require_run(run_uid)?;
        check_close(&run, status)?;
        run.status = status;
        run.closed_at = Some(closed_at);
        atomic_write_json(&self.run_path(run_uid), &run)?;
        Ok(())
    }

    fn run(&self, run_uid: &str) -> Result<Option<RunRecord>, StoreError> {
        self.load_run(run_uid)
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let entries = match std::fs::read_dir(self.runs_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(run_uid) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load_run(&run_uid) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%run_uid, error = %e, "Skipping unreadable run");
                }
            }
        }
        sort_runs(&mut runs);
        Ok(runs)
    }

    fn snapshots(&self, run_uid: &str) -> Result<Vec<SnapshotRecord>, StoreError> {
        self.require_run(run_uid)?;
        let mut records = Vec::new();
        for sv in self.versions_on_disk(run_uid)? {
            if let Some(record) = load_json(&self.snapshot_path(run_uid, sv))? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn snapshot(
        &self,
        run_uid: &str,
        sequence_version: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        self.require_run(run_uid)?;
        Ok(load_json(&self.snapshot_path(run_uid, sequence_version))?)
    }

    fn latest_sequence_version(&self, run_uid: &str) -> Result<Option<u64>, StoreError> {
        self.require_run(run_uid)?;
        Ok(self.versions_on_disk(run_uid)?.last().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_record(run_uid: &str) -> RunRecord {
        RunRecord {
            run_uid: run_uid.to_string(),
            session_id: Uuid::new_v4(),
            project_name: "demo".into(),
            pipeline_name: "etl".into(),
            user_tag: None,
            description: None,
            status: RunStatus::Open,
            latest_sequence_version: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    fn snapshot(run: &RunRecord, sv: u64) -> SnapshotRecord {
        SnapshotRecord {
            run_uid: run.run_uid.clone(),
            sequence_version: sv,
            session_id: run.session_id,
            project_name: run.project_name.clone(),
            pipeline_name: run.pipeline_name.clone(),
            user_tag: None,
            description: None,
            status: RunStatus::Open,
            nodes: Vec::new(),
            edges: Vec::new(),
            committed_at: Utc::now(),
            content_hash: format!("content-{sv}"),
            chain_hash: format!("chain-{sv}"),
        }
    }

    fn exercise_store(store: &dyn SnapshotStore) {
        let run = run_record("run-a");
        store.open_run(&run).unwrap();
        assert!(matches!(
            store.open_run(&run),
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.latest_sequence_version("run-a").unwrap(), None);

        store.commit(&snapshot(&run, 0)).unwrap();
        store.commit(&snapshot(&run, 1)).unwrap();
        let err = store.commit(&snapshot(&run, 1)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                sequence_version: 1,
                ..
            }
        ));

        assert_eq!(store.latest_sequence_version("run-a").unwrap(), Some(1));
        assert_eq!(
            store.run("run-a").unwrap().unwrap().latest_sequence_version,
            Some(1)
        );
        let all = store.snapshots("run-a").unwrap();
        assert_eq!(
            all.iter().map(|s| s.sequence_version).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(
            store.snapshot("run-a", 0).unwrap().unwrap().content_hash,
            "content-0"
        );
        assert!(store.snapshot("run-a", 7).unwrap().is_none());

        store
            .close_run("run-a", RunStatus::Finished, Utc::now())
            .unwrap();
        assert!(matches!(
            store.commit(&snapshot(&run, 2)),
            Err(StoreError::RunClosed { .. })
        ));
        assert!(matches!(
            store.close_run("run-a", RunStatus::Failed, Utc::now()),
            Err(StoreError::RunClosed { .. })
        ));

        assert!(matches!(
            store.snapshots("missing"),
            Err(StoreError::RunNotFound { .. })
        ));
        assert!(store.run("missing").unwrap().is_none());

        let second = run_record("run-b");
        store.open_run(&second).unwrap();
        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_uid, "run-a");
        assert_eq!(runs[0].status, RunStatus::Finished);
    }

    #[test]
    fn test_memory_store_contract() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn test_file_store_contract() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        exercise_store(&store);

        assert!(dir.path().join("runs/run-a/run.json").exists());
        assert!(
            dir.path()
                .join("runs/run-a/snapshots/00000000000000000001.json")
                .exists()
        );
    }

    #[test]
    fn test_file_store_recovers_version_from_disk() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let run = run_record("run-c");
        store.open_run(&run).unwrap();
        store.commit(&snapshot(&run, 0)).unwrap();

        // Simulate a crash after the snapshot landed but before run.json moved.
        let record = snapshot(&run, 1);
        write_new_json(&store.snapshot_path("run-c", 1), &record).unwrap();

        assert_eq!(store.latest_sequence_version("run-c").unwrap(), Some(1));
        assert!(matches!(
            store.commit(&record),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_file_store_empty_root() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("nothing-here"));
        assert!(store.list_runs().unwrap().is_empty());
    }
}
