//! # Provtrack Core
//!
//! Lineage capture for in-memory data transformations.
//! Provides the event model, the interceptor that observes operations on
//! subjects, the graph assembler (tracker), pluggable writers, and the
//! persistent writer that commits versioned, hash-chained snapshots to a
//! store.

pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod global;
pub mod graph;
pub mod intercept;
pub mod persistence;
pub mod run;
pub mod snapshot;
pub mod store;
pub mod tracker;
pub mod writer;

// Re-export commonly used types at the crate root.
pub use catalog::{Catalog, Dag, DagFilter, ProjectInfo, ProjectPipelines, SnapshotSummary};
pub use config::{RunConfig, TrackerConfig, load_config};
pub use error::{
    ConfigError, ProvtrackError, Result, StoreError, TrackError, ValidationError, WriteError,
};
pub use event::{
    NodeEvent, NodeId, ParamValue, Params, Shape, SubjectRef, TransformEdge, TransformNode,
};
pub use frame::{FRAME_OPERATIONS, Frame, FrameError, FrameOps, frame_vocabulary};
pub use graph::LineageGraph;
pub use intercept::{Interceptor, OperationVocabulary, Shaped, Traced};
pub use run::{GraphSnapshot, RunKey, RunMetadata, RunStatus};
pub use snapshot::{
    ChainReport, PersistentWriter, SnapshotContent, content_hash, resolve_current, verify_chain,
};
pub use store::{FileStore, MemoryStore, RunRecord, SnapshotRecord, SnapshotStore};
pub use tracker::{GraphRecorder, NodeRef, SessionHandle, Tracker};
pub use writer::{ConsoleWriter, GraphBatch, MemoryWriter, WriteMode, Writer};
