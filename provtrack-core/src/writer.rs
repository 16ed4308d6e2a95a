//! Writers: pluggable sinks that receive the assembled graph.
//!
//! The tracker hands every attached writer a [`GraphBatch`] on `flush` and a
//! final batch on `stop`. A writer declares through [`Writer::mode`] whether
//! it wants the full graph each time or only what was added since its
//! previous batch.

use std::io::Write;
use std::sync::Mutex;

use crate::error::WriteError;
use crate::event::{TransformEdge, TransformNode};
use crate::graph::LineageGraph;
use crate::run::{GraphSnapshot, RunMetadata};

/// What a writer receives on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The full accumulated graph.
    Full,
    /// Only nodes and edges recorded since the writer's previous batch.
    Delta,
}

/// Read-only view of the graph handed to a writer.
#[derive(Debug, Clone, Copy)]
pub struct GraphBatch<'a> {
    pub run: &'a RunMetadata,
    pub nodes: &'a [TransformNode],
    pub edges: &'a [TransformEdge],
    pub mode: WriteMode,
}

impl GraphBatch<'_> {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Owned copy of this batch.
    pub fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            run: self.run.clone(),
            nodes: self.nodes.to_vec(),
            edges: self.edges.to_vec(),
        }
    }
}

/// A sink that commits assembled graphs somewhere.
///
/// Expected conditions (an empty graph, a repeated flush) must not fail.
/// Sink-level failures are reported as [`WriteError`] and surfaced to the
/// caller of `flush`/`stop`.
pub trait Writer: Send + Sync {
    /// Name used in logs and for `Tracker::detach_writer`.
    fn name(&self) -> &str;

    fn mode(&self) -> WriteMode {
        WriteMode::Full
    }

    /// Commit an intermediate state of an open run.
    fn write(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError>;

    /// Commit the final state of a run. `batch.run.status` is terminal.
    fn close(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError>;
}

// ---------------------------------------------------------------------------
// Console writer
// ---------------------------------------------------------------------------

/// Renders the graph as human-readable lines in topological order.
pub struct ConsoleWriter {
    name: String,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleWriter {
    /// Console writer printing to stdout.
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            name: "console".to_string(),
            out: Mutex::new(out),
        }
    }

    /// Render a batch to text without writing it anywhere.
    pub fn render(batch: &GraphBatch<'_>) -> String {
        let run = batch.run;
        let mut output = format!(
            "[provtrack] run {} {}/{} ({}): {} nodes, {} edges\n",
            run.session_id,
            run.project_name,
            run.pipeline_name,
            run.status,
            batch.nodes.len(),
            batch.edges.len(),
        );

        let graph = LineageGraph::from_parts(batch.nodes, batch.edges);
        for node in graph.topological_order() {
            let shape = node
                .output_shape
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            let parents = graph.parents_of(node.id);
            let parents = if parents.is_empty() {
                "<root>".to_string()
            } else {
                parents
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            output.push_str(&format!(
                "[provtrack] {} #{:<4} {:<25} {:<15} parents={}\n",
                node.timestamp.format("%H:%M:%S%.3f"),
                node.id,
                node.operation,
                shape,
                parents,
            ));
        }
        output
    }

    fn emit(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError> {
        let text = Self::render(batch);
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(text.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

impl Writer for ConsoleWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError> {
        self.emit(batch)
    }

    fn close(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError> {
        self.emit(batch)
    }
}

// ---------------------------------------------------------------------------
// In-memory writer
// ---------------------------------------------------------------------------

/// One batch received by a [`MemoryWriter`].
#[derive(Debug, Clone)]
pub struct ReceivedBatch {
    pub snapshot: GraphSnapshot,
    pub is_close: bool,
}

/// Keeps every batch it receives. Thread-safe via `Mutex<Vec>`.
pub struct MemoryWriter {
    name: String,
    mode: WriteMode,
    batches: Mutex<Vec<ReceivedBatch>>,
}

impl MemoryWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_mode(name, WriteMode::Full)
    }

    pub fn with_mode(name: impl Into<String>, mode: WriteMode) -> Self {
        Self {
            name: name.into(),
            mode,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn batches(&self) -> Vec<ReceivedBatch> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<ReceivedBatch> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, batch: &GraphBatch<'_>, is_close: bool) {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ReceivedBatch {
                snapshot: batch.to_snapshot(),
                is_close,
            });
    }
}

impl Writer for MemoryWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> WriteMode {
        self.mode
    }

    fn write(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError> {
        self.push(batch, false);
        Ok(())
    }

    fn close(&self, batch: &GraphBatch<'_>) -> Result<(), WriteError> {
        self.push(batch, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{NodeEvent, NodeId, Shape};
    use crate::run::RunStatus;
    use chrono::Utc;
    use std::sync::Arc;

    fn metadata() -> RunMetadata {
        RunMetadata {
            session_id: uuid::Uuid::new_v4(),
            project_name: "demo".into(),
            pipeline_name: "etl".into(),
            user_tag: None,
            description: None,
            status: RunStatus::Open,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// `io::Write` sink that shares its buffer with the test.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_console_renders_topological_order() {
        let run = metadata();
        let nodes = vec![
            NodeEvent::new("merge")
                .output_shape(Some(Shape::table(4, 3)))
                .into_node(NodeId(1), Utc::now()),
            NodeEvent::new("load").into_node(NodeId(2), Utc::now()),
        ];
        let edges = vec![TransformEdge::new(NodeId(2), NodeId(1))];
        let batch = GraphBatch {
            run: &run,
            nodes: &nodes,
            edges: &edges,
            mode: WriteMode::Full,
        };

        let text = ConsoleWriter::render(&batch);
        let load_pos = text.find("load").unwrap();
        let merge_pos = text.find("merge").unwrap();
        assert!(load_pos < merge_pos);
        assert!(text.contains("(4, 3)"));
        assert!(text.contains("parents=2"));
        assert!(text.contains("parents=<root>"));
        assert!(text.contains("2 nodes, 1 edges"));
    }

    #[test]
    fn test_console_empty_graph() {
        let buf = SharedBuf::default();
        let writer = ConsoleWriter::new(Box::new(buf.clone()));
        let run = metadata();
        let batch = GraphBatch {
            run: &run,
            nodes: &[],
            edges: &[],
            mode: WriteMode::Full,
        };

        writer.write(&batch).unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("0 nodes, 0 edges"));
    }

    #[test]
    fn test_memory_writer_records_batches() {
        let writer = MemoryWriter::with_mode("mem", WriteMode::Delta);
        assert_eq!(writer.mode(), WriteMode::Delta);
        let run = metadata();
        let nodes = vec![NodeEvent::new("load").into_node(NodeId(1), Utc::now())];
        let batch = GraphBatch {
            run: &run,
            nodes: &nodes,
            edges: &[],
            mode: WriteMode::Delta,
        };

        writer.write(&batch).unwrap();
        writer.close(&batch).unwrap();
        assert_eq!(writer.len(), 2);
        assert!(!writer.batches()[0].is_close);
        assert!(writer.last().unwrap().is_close);
    }
}
