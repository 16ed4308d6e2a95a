//! Snapshot/versioning protocol: the persistent writer.
//!
//! Each `write` or `close` turns the tracker's graph into one immutable
//! [`SnapshotRecord`] tagged with a per-run sequence version (SV):
//!
//! 1. The first batch for a [`RunKey`] opens a run in the store (status
//!    `open`, next SV `0`).
//! 2. Every batch is committed create-only at the next SV.
//! 3. The SV advances only after a successful commit.
//! 4. `close` commits the final state with the terminal status, marks the
//!    run closed and forgets the key. A version conflict on the final commit
//!    is retried once at the resynchronized version.
//!
//! Newer SVs supersede older ones; [`resolve_current`] picks the highest.
//!
//! Each record also carries a content hash and a chain hash over the
//! previous record, so a run's history can be checked for gaps and
//! tampering with [`verify_chain`].

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{StoreError, WriteError};
use crate::event::{TransformEdge, TransformNode};
use crate::run::{RunKey, RunMetadata, RunStatus};
use crate::store::{RunRecord, SnapshotRecord, SnapshotStore};
use crate::writer::{GraphBatch, WriteMode, Writer};

/// Chain hash of the (virtual) record before SV 0.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Everything a snapshot's content hash covers: the run it belongs to, its
/// grouping metadata, its status and the graph itself.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SnapshotContent<'a> {
    pub run_uid: &'a str,
    pub session_id: Uuid,
    pub project_name: &'a str,
    pub pipeline_name: &'a str,
    pub user_tag: Option<&'a str>,
    pub description: Option<&'a str>,
    pub status: RunStatus,
    pub nodes: &'a [TransformNode],
    pub edges: &'a [TransformEdge],
}

impl<'a> SnapshotContent<'a> {
    /// Content of a graph batch about to be committed to `run_uid`.
    pub fn of_batch(run_uid: &'a str, batch: &GraphBatch<'a>, status: RunStatus) -> Self {
        let meta = batch.run;
        Self {
            run_uid,
            session_id: meta.session_id,
            project_name: &meta.project_name,
            pipeline_name: &meta.pipeline_name,
            user_tag: meta.user_tag.as_deref(),
            description: meta.description.as_deref(),
            status,
            nodes: batch.nodes,
            edges: batch.edges,
        }
    }

    /// Content of a stored record.
    pub fn of_record(record: &'a SnapshotRecord) -> Self {
        Self {
            run_uid: &record.run_uid,
            session_id: record.session_id,
            project_name: &record.project_name,
            pipeline_name: &record.pipeline_name,
            user_tag: record.user_tag.as_deref(),
            description: record.description.as_deref(),
            status: record.status,
            nodes: &record.nodes,
            edges: &record.edges,
        }
    }
}

/// SHA-256 over the canonical JSON form of a snapshot's content.
///
/// Params are ordered maps and nodes/edges keep tracker order, so equal
/// content hashes equally.
pub fn content_hash(content: &SnapshotContent<'_>) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(content)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of `previous:content:sequence_version`.
pub fn chain_hash(previous: &str, content: &str, sequence_version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(b":");
    hasher.update(content.as_bytes());
    hasher.update(b":");
    hasher.update(sequence_version.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The current (highest-SV) snapshot of a run.
pub fn resolve_current<S: SnapshotStore + ?Sized>(
    store: &S,
    run_uid: &str,
) -> Result<Option<SnapshotRecord>, StoreError> {
    match store.latest_sequence_version(run_uid)? {
        Some(sv) => store.snapshot(run_uid, sv),
        None => Ok(None),
    }
}

/// Outcome of checking a run's snapshot history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub checked: usize,
    pub valid: bool,
    /// First sequence version that failed a check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainReport {
    fn broken(checked: usize, sv: u64, reason: String) -> Self {
        Self {
            checked,
            valid: false,
            first_invalid: Some(sv),
            reason: Some(reason),
        }
    }
}

/// Check that `records` (ascending SV) start at 0, have no gaps, and that
/// every content and chain hash recomputes.
pub fn verify_chain(records: &[SnapshotRecord]) -> ChainReport {
    let mut previous = GENESIS_HASH.to_string();
    for (i, record) in records.iter().enumerate() {
        let expected_sv = i as u64;
        if record.sequence_version != expected_sv {
            return ChainReport::broken(
                i,
                record.sequence_version,
                format!("expected sequence version {expected_sv}"),
            );
        }

        let content = match content_hash(&SnapshotContent::of_record(record)) {
            Ok(hash) => hash,
            Err(e) => return ChainReport::broken(i, expected_sv, e.to_string()),
        };
        if content != record.content_hash {
            return ChainReport::broken(i, expected_sv, "content hash mismatch".to_string());
        }

        let chain = chain_hash(&previous, &content, expected_sv);
        if chain != record.chain_hash {
            return ChainReport::broken(i, expected_sv, "chain hash mismatch".to_string());
        }
        previous = chain;
    }

    ChainReport {
        checked: records.len(),
        valid: true,
        first_invalid: None,
        reason: None,
    }
}

struct OpenRun {
    run_uid: String,
    next_sv: u64,
    prev_chain: String,
}

/// Writer that commits every batch as a versioned snapshot in a store.
///
/// Commits to one run are serialized; different runs commit concurrently.
pub struct PersistentWriter<S: SnapshotStore> {
    name: String,
    store: Arc<S>,
    open: Mutex<HashMap<RunKey, Arc<Mutex<OpenRun>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<S: SnapshotStore> PersistentWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            name: format!("persistent:{}", store.name()),
            store,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run uid of the open run for `key`, if any.
    pub fn current_run_uid(&self, key: &RunKey) -> Option<String> {
        let open = lock(&self.open);
        open.get(key).map(|run| lock(run).run_uid.clone())
    }

    /// Number of runs currently open through this writer.
    pub fn open_runs(&self) -> usize {
        lock(&self.open).len()
    }

    /// Find or open the run for `meta`'s key.
    fn entry(&self, meta: &RunMetadata) -> Result<Arc<Mutex<OpenRun>>, WriteError> {
        let key = meta.key();
        let mut open = lock(&self.open);
        if let Some(run) = open.get(&key) {
            return Ok(run.clone());
        }

        let record = RunRecord {
            run_uid: Uuid::new_v4().to_string(),
            session_id: meta.session_id,
            project_name: meta.project_name.clone(),
            pipeline_name: meta.pipeline_name.clone(),
            user_tag: meta.user_tag.clone(),
            description: meta.description.clone(),
            status: RunStatus::Open,
            latest_sequence_version: None,
            opened_at: Utc::now(),
            closed_at: None,
        };
        self.store.open_run(&record)?;
        tracing::info!(run_uid = %record.run_uid, key = %key, "Opened run");

        let run = Arc::new(Mutex::new(OpenRun {
            run_uid: record.run_uid,
            next_sv: 0,
            prev_chain: GENESIS_HASH.to_string(),
        }));
        open.insert(key, run.clone());
        Ok(run)
    }

    /// Commit `batch` at the run's next SV with `status`.
    fn commit(
        &self,
        run: &mut OpenRun,
        batch: &GraphBatch<'_>,
        status: RunStatus,
    ) -> Result<u64, WriteError> {
        let meta = batch.run;
        let sequence_version = run.next_sv;
        let content = content_hash(&SnapshotContent::of_batch(&run.run_uid, batch, status))?;
        let chain = chain_hash(&run.prev_chain, &content, sequence_version);

        let record = SnapshotRecord {
            run_uid: run.run_uid.clone(),
            sequence_version,
            session_id: meta.session_id,
            project_name: meta.project_name.clone(),
            pipeline_name: meta.pipeline_name.clone(),
            user_tag: meta.user_tag.clone(),
            description: meta.description.clone(),
            status,
            nodes: batch.nodes.to_vec(),
            edges: batch.edges.to_vec(),
            committed_at: Utc::now(),
            content_hash: content,
            chain_hash: chain.clone(),
        };

        match self.store.commit(&record) {
            Ok(()) => {
                run.next_sv += 1;
                run.prev_chain = chain;
                tracing::info!(
                    run_uid = %run.run_uid,
                    sequence_version,
                    %status,
                    nodes = record.nodes.len(),
                    edges = record.edges.len(),
                    "Committed snapshot"
                );
                Ok(sequence_version)
            }
            Err(StoreError::Conflict { .. }) => {
                self.resync(run)?;
                tracing::warn!(
                    run_uid = %run.run_uid,
                    sequence_version,
                    next = run.next_sv,
                    "Sequence version already taken; resynchronized"
                );
                Err(WriteError::VersionConflict {
                    run_uid: run.run_uid.clone(),
                    sequence_version,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move `run` past whatever the store already holds.
    fn resync(&self, run: &mut OpenRun) -> Result<(), StoreError> {
        match self.store.latest_sequence_version(&run.run_uid)? {
            Some(latest) => {
                run.next_sv = latest + 1;
                if let Some(record) = self.store.snapshot(&run.run_uid, latest)? {
                    run.prev_chain = record.chain_hash;
                }
            }
            None => {
                run.next_sv = 0;
                run.prev_chain = GENESIS_HASH.to_string();
            }
        }
        Ok(())
    }

    fn forget(&self, key: &RunKey, run: &Arc<Mutex<OpenRun>>) {
        let mut open = lock(&self.open);
        if open.get(key).is_some_and(|current| Arc::ptr_eq(current, run)) {
            open.remove(key);
        }
    }
}

impl<S: SnapshotStore> Writer for PersistentWriter<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> WriteMode {
        WriteMode::Full
    }

    fn write(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError> {
        let entry = self.entry(batch.run)?;
        let mut run = lock(&entry);
        self.commit(&mut run, batch, RunStatus::Open)?;
        Ok(())
    }

    fn close(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError> {
        let status = if batch.run.status.is_terminal() {
            batch.run.status
        } else {
            RunStatus::Finished
        };
        let key = batch.run.key();
        let entry = self.entry(batch.run)?;
        let result = {
            let mut run = lock(&entry);
            // Retry once at the resynchronized version.
            let committed = match self.commit(&mut run, batch, status) {
                Err(WriteError::VersionConflict { .. }) => self.commit(&mut run, batch, status),
                other => other,
            };
            committed.and_then(|_| {
                let closed_at = batch.run.finished_at.unwrap_or_else(Utc::now);
                self.store
                    .close_run(&run.run_uid, status, closed_at)
                    .map_err(WriteError::from)?;
                tracing::info!(run_uid = %run.run_uid, %status, "Closed run");
                Ok(())
            })
        };
        self.forget(&key, &entry);
        result
    }
}
