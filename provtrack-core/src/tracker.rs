//! Graph assembler: owns the lifecycle of a run and its in-memory DAG.
//!
//! A [`Tracker`] moves between `stopped` and `started`. While started it
//! accepts node and edge events, assigns node ids, and keeps the DAG of the
//! current session. `flush` and `stop` hand the DAG to every attached
//! [`Writer`].
//!
//! ## Locking
//!
//! Run state sits behind one mutex: id assignment and DAG append happen
//! under it together, so node ids are sequentially consistent across
//! threads. Writers sit behind a second mutex that is held for the whole of
//! a delivery, so every writer sees the same sequence of commits. Lock order
//! is always writers, then state; the record path only takes state, so
//! writer I/O never blocks recording.

use chrono::{DateTime, Utc};
use petgraph::graphmap::DiGraphMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::config::{RunConfig, TrackerConfig};
use crate::error::TrackError;
use crate::event::{NodeEvent, NodeId, TransformEdge, TransformNode};
use crate::run::{GraphSnapshot, RunMetadata, RunStatus};
use crate::writer::{ConsoleWriter, GraphBatch, WriteMode, Writer};

/// A node id qualified by the session it belongs to.
///
/// Subjects outlive sessions; a `NodeRef` from an earlier session is never
/// turned into an edge in a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub session_id: Uuid,
    pub node: NodeId,
}

/// Returned by [`Tracker::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// The recording interface the interceptor depends on.
///
/// [`Tracker`] is the production implementation; tests inject isolated
/// instances instead of the process-wide tracker.
pub trait GraphRecorder: Send + Sync {
    /// Validate and append a node; returns its id.
    fn record_node(&self, event: NodeEvent) -> Result<NodeId, TrackError>;

    /// Append an edge between two nodes of the current run.
    fn record_edge(&self, from: NodeId, to: NodeId) -> Result<(), TrackError>;

    /// Append a node and one inbound edge per distinct parent, atomically.
    /// Parents from another session are skipped.
    fn record_derived(&self, event: NodeEvent, parents: &[NodeRef])
    -> Result<NodeRef, TrackError>;

    /// Session id of the active run, if any.
    fn active_session(&self) -> Option<Uuid>;
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

struct ActiveRun {
    meta: RunMetadata,
    nodes: Vec<TransformNode>,
    edges: Vec<TransformEdge>,
    edge_set: HashSet<TransformEdge>,
    graph: DiGraphMap<NodeId, ()>,
    next_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl ActiveRun {
    fn new(meta: RunMetadata) -> Self {
        Self {
            meta,
            nodes: Vec::new(),
            edges: Vec::new(),
            edge_set: HashSet::new(),
            graph: DiGraphMap::new(),
            next_id: 1,
            last_timestamp: None,
        }
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.meta.session_id,
            started_at: self.meta.started_at,
        }
    }

    fn push_node(&mut self, event: NodeEvent) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        // Wall clocks can step backwards; node timestamps may not.
        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);

        let node = event.into_node(id, timestamp);
        tracing::debug!(
            session_id = %self.meta.session_id,
            node = %id,
            operation = %node.operation,
            "Recorded node"
        );
        self.graph.add_node(id);
        self.nodes.push(node);
        id
    }

    fn ensure_node(&self, id: NodeId) -> Result<(), TrackError> {
        if self.graph.contains_node(id) {
            Ok(())
        } else {
            Err(TrackError::UnknownNode { id })
        }
    }

    fn push_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), TrackError> {
        self.ensure_node(from)?;
        self.ensure_node(to)?;

        let edge = TransformEdge::new(from, to);
        if self.edge_set.contains(&edge) {
            return Ok(());
        }
        if from == to || petgraph::algo::has_path_connecting(&self.graph, to, from, None) {
            return Err(TrackError::Cycle { from, to });
        }

        self.graph.add_edge(from, to, ());
        self.edge_set.insert(edge);
        self.edges.push(edge);
        tracing::debug!(session_id = %self.meta.session_id, %edge, "Recorded edge");
        Ok(())
    }

    fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            run: self.meta.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }
}

#[derive(Default)]
struct TrackerState {
    active: Option<ActiveRun>,
    last_run: Option<RunMetadata>,
}

/// How much of a session a delta writer has already received.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    session_id: Option<Uuid>,
    nodes: usize,
    edges: usize,
}

struct AttachedWriter {
    writer: Arc<dyn Writer>,
    cursor: Cursor,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// The graph assembler for one tracking context.
///
/// `start` while already started is a no-op that returns the current
/// session's handle; it never discards a run that is still open. To begin a
/// fresh run, `stop` the current one first.
pub struct Tracker {
    run_config: RunConfig,
    state: Mutex<TrackerState>,
    writers: Mutex<Vec<AttachedWriter>>,
}

impl Tracker {
    pub fn new(run_config: RunConfig) -> Self {
        Self {
            run_config,
            state: Mutex::new(TrackerState::default()),
            writers: Mutex::new(Vec::new()),
        }
    }

    /// Build a tracker from loaded configuration; attaches a console writer
    /// when `console.enabled` is set.
    pub fn from_config(config: &TrackerConfig) -> Self {
        let tracker = Self::new(config.run.clone());
        if config.console.enabled {
            tracker.attach_writer(Arc::new(ConsoleWriter::stdout()));
        }
        tracker
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    /// Begin a new run, or return the active one's handle.
    pub fn start(&self) -> SessionHandle {
        let mut state = lock(&self.state);
        if let Some(run) = &state.active {
            tracing::debug!(session_id = %run.meta.session_id, "Tracker already started");
            return run.handle();
        }

        let meta = RunMetadata {
            session_id: Uuid::new_v4(),
            project_name: self.run_config.project_name.clone(),
            pipeline_name: self.run_config.pipeline_name.clone(),
            user_tag: self.run_config.user_tag.clone(),
            description: self.run_config.description.clone(),
            status: RunStatus::Open,
            started_at: Utc::now(),
            finished_at: None,
        };
        tracing::info!(
            session_id = %meta.session_id,
            project = %meta.project_name,
            pipeline = %meta.pipeline_name,
            "Tracker started"
        );
        let run = ActiveRun::new(meta);
        let handle = run.handle();
        state.active = Some(run);
        handle
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    pub fn session(&self) -> Option<SessionHandle> {
        lock(&self.state).active.as_ref().map(ActiveRun::handle)
    }

    /// Metadata of the most recently stopped run.
    pub fn last_run(&self) -> Option<RunMetadata> {
        lock(&self.state).last_run.clone()
    }

    /// Frozen copy of the current run's graph.
    pub fn snapshot(&self) -> Option<GraphSnapshot> {
        lock(&self.state).active.as_ref().map(ActiveRun::snapshot)
    }

    /// Register a writer for flush/close delivery. Writers stay attached
    /// across runs.
    pub fn attach_writer(&self, writer: Arc<dyn Writer>) {
        tracing::debug!(writer = writer.name(), "Writer attached");
        lock(&self.writers).push(AttachedWriter {
            writer,
            cursor: Cursor::default(),
        });
    }

    /// Detach every writer named `name`. Returns whether any was removed.
    pub fn detach_writer(&self, name: &str) -> bool {
        let mut writers = lock(&self.writers);
        let before = writers.len();
        writers.retain(|w| w.writer.name() != name);
        writers.len() < before
    }

    pub fn writer_count(&self) -> usize {
        lock(&self.writers).len()
    }

    /// Hand the current graph to every writer. The in-memory graph is kept.
    pub fn flush(&self) -> Result<(), TrackError> {
        let mut writers = lock(&self.writers);
        let snapshot = {
            let state = lock(&self.state);
            match &state.active {
                Some(run) => run.snapshot(),
                None => return Err(TrackError::NotStarted),
            }
        };
        deliver(&mut writers, &snapshot, false)
    }

    /// End the run with a terminal `status` and deliver the final graph.
    ///
    /// Idempotent: stopping a stopped tracker does nothing. Recording fails
    /// with `NotStarted` from the moment the run is marked, even while the
    /// final delivery is still in progress.
    pub fn stop(&self, status: RunStatus) -> Result<(), TrackError> {
        if !status.is_terminal() {
            return Err(TrackError::InvalidStatus {
                status: status.to_string(),
            });
        }

        let mut writers = lock(&self.writers);
        let snapshot = {
            let mut state = lock(&self.state);
            let Some(mut run) = state.active.take() else {
                return Ok(());
            };
            run.meta.status = status;
            run.meta.finished_at = Some(Utc::now());
            state.last_run = Some(run.meta.clone());
            run.snapshot()
        };

        tracing::info!(
            session_id = %snapshot.run.session_id,
            %status,
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            "Tracker stopped"
        );
        deliver(&mut writers, &snapshot, true)
    }

    fn with_active<T>(
        &self,
        f: impl FnOnce(&mut ActiveRun) -> Result<T, TrackError>,
    ) -> Result<T, TrackError> {
        let mut state = lock(&self.state);
        match state.active.as_mut() {
            Some(run) => f(run),
            None => Err(TrackError::NotStarted),
        }
    }
}

impl GraphRecorder for Tracker {
    fn record_node(&self, event: NodeEvent) -> Result<NodeId, TrackError> {
        event.validate()?;
        self.with_active(|run| Ok(run.push_node(event)))
    }

    fn record_edge(&self, from: NodeId, to: NodeId) -> Result<(), TrackError> {
        self.with_active(|run| run.push_edge(from, to))
    }

    fn record_derived(
        &self,
        event: NodeEvent,
        parents: &[NodeRef],
    ) -> Result<NodeRef, TrackError> {
        event.validate()?;
        self.with_active(|run| {
            let session_id = run.meta.session_id;
            let mut parent_ids = BTreeSet::new();
            for parent in parents {
                if parent.session_id != session_id {
                    tracing::debug!(
                        node = %parent.node,
                        "Skipping predecessor from a previous session"
                    );
                    continue;
                }
                run.ensure_node(parent.node)?;
                parent_ids.insert(parent.node);
            }

            let id = run.push_node(event);
            for parent in parent_ids {
                run.push_edge(parent, id)?;
            }
            Ok(NodeRef {
                session_id,
                node: id,
            })
        })
    }

    fn active_session(&self) -> Option<Uuid> {
        lock(&self.state).active.as_ref().map(|r| r.meta.session_id)
    }
}

/// Deliver `snapshot` to every writer; every writer is attempted and the
/// first failure is returned.
fn deliver(
    writers: &mut [AttachedWriter],
    snapshot: &GraphSnapshot,
    is_close: bool,
) -> Result<(), TrackError> {
    let session_id = snapshot.run.session_id;
    let mut first_error = None;

    for attached in writers.iter_mut() {
        if attached.cursor.session_id != Some(session_id) {
            attached.cursor = Cursor {
                session_id: Some(session_id),
                nodes: 0,
                edges: 0,
            };
        }

        let mode = attached.writer.mode();
        let (nodes, edges) = match mode {
            WriteMode::Full => (&snapshot.nodes[..], &snapshot.edges[..]),
            WriteMode::Delta => (
                &snapshot.nodes[attached.cursor.nodes.min(snapshot.nodes.len())..],
                &snapshot.edges[attached.cursor.edges.min(snapshot.edges.len())..],
            ),
        };
        let batch = GraphBatch {
            run: &snapshot.run,
            nodes,
            edges,
            mode,
        };

        let result = if is_close {
            attached.writer.close(&batch)
        } else {
            attached.writer.write(&batch)
        };

        match result {
            Ok(()) => {
                attached.cursor.nodes = snapshot.nodes.len();
                attached.cursor.edges = snapshot.edges.len();
            }
            Err(err) => {
                tracing::warn!(
                    writer = attached.writer.name(),
                    session_id = %session_id,
                    error = %err,
                    "Writer failed"
                );
                if first_error.is_none() {
                    first_error = Some(TrackError::Write {
                        writer: attached.writer.name().to_string(),
                        source: err,
                    });
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
