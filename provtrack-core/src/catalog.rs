//! Catalog: read-only queries over a snapshot store.
//!
//! Every graph query reads the current (highest sequence version) snapshot
//! of each matching run; older versions are only visible through
//! [`Catalog::history`] and [`Catalog::snapshot`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::StoreError;
use crate::event::{NodeId, TransformNode};
use crate::run::RunStatus;
use crate::snapshot::{ChainReport, resolve_current, verify_chain};
use crate::store::{RunRecord, SnapshotRecord, SnapshotStore};

/// Which runs a query covers.
///
/// `run_uid` wins over `pipeline_name`; with neither, the query covers
/// every run of the project. `user_tag` narrows independently. A `None`
/// project covers all projects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagFilter {
    pub project_name: Option<String>,
    pub pipeline_name: Option<String>,
    pub run_uid: Option<String>,
    pub user_tag: Option<String>,
}

impl DagFilter {
    pub fn project(name: impl Into<String>) -> Self {
        Self {
            project_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    pub fn run(mut self, run_uid: impl Into<String>) -> Self {
        self.run_uid = Some(run_uid.into());
        self
    }

    pub fn user_tag(mut self, tag: impl Into<String>) -> Self {
        self.user_tag = Some(tag.into());
        self
    }

    pub fn matches(&self, run: &RunRecord) -> bool {
        if let Some(project) = &self.project_name {
            if &run.project_name != project {
                return false;
            }
        }
        if let Some(tag) = &self.user_tag {
            if run.user_tag.as_ref() != Some(tag) {
                return false;
            }
        }
        if let Some(run_uid) = &self.run_uid {
            return &run.run_uid == run_uid;
        }
        if let Some(pipeline) = &self.pipeline_name {
            return &run.pipeline_name == pipeline;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInfo {
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    pub runs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineInfo {
    pub name: String,
    pub runs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectPipelines {
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    pub pipelines: Vec<PipelineInfo>,
}

/// A node of a run's current snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogNode {
    pub run_uid: String,
    pub sequence_version: u64,
    #[serde(flatten)]
    pub node: TransformNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEdge {
    pub run_uid: String,
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Dag {
    pub nodes: Vec<CatalogNode>,
    pub edges: Vec<CatalogEdge>,
}

/// One entry of a run's version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub sequence_version: u64,
    pub status: RunStatus,
    pub nodes: usize,
    pub edges: usize,
    pub committed_at: DateTime<Utc>,
    pub content_hash: String,
    pub chain_hash: String,
}

impl From<&SnapshotRecord> for SnapshotSummary {
    fn from(record: &SnapshotRecord) -> Self {
        Self {
            sequence_version: record.sequence_version,
            status: record.status,
            nodes: record.nodes.len(),
            edges: record.edges.len(),
            committed_at: record.committed_at,
            content_hash: record.content_hash.clone(),
            chain_hash: record.chain_hash.clone(),
        }
    }
}

pub struct Catalog<S: SnapshotStore> {
    store: Arc<S>,
}

impl<S: SnapshotStore> Catalog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Distinct `(project, user_tag)` pairs, sorted.
    pub fn list_projects(&self) -> Result<Vec<ProjectInfo>, StoreError> {
        let mut projects: BTreeMap<(String, Option<String>), ProjectInfo> = BTreeMap::new();
        for run in self.store.list_runs()? {
            let key = (run.project_name.clone(), run.user_tag.clone());
            let info = projects.entry(key).or_insert_with(|| ProjectInfo {
                project_name: run.project_name.clone(),
                user_tag: run.user_tag.clone(),
                runs: 0,
                last_opened_at: None,
            });
            info.runs += 1;
            info.last_opened_at = info.last_opened_at.max(Some(run.opened_at));
        }
        Ok(projects.into_values().collect())
    }

    /// Pipeline names of a project, sorted and deduplicated.
    pub fn list_pipelines(
        &self,
        project_name: &str,
        user_tag: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let mut filter = DagFilter::project(project_name);
        filter.user_tag = user_tag.map(str::to_string);
        let names: BTreeSet<String> = self
            .list_runs(&filter)?
            .into_iter()
            .map(|r| r.pipeline_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    pub fn list_runs(&self, filter: &DagFilter) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .store
            .list_runs()?
            .into_iter()
            .filter(|run| filter.matches(run))
            .collect())
    }

    /// Every project with its pipelines and per-pipeline run counts.
    pub fn projects_with_pipelines(&self) -> Result<Vec<ProjectPipelines>, StoreError> {
        let mut grouped: BTreeMap<(String, Option<String>), BTreeMap<String, usize>> =
            BTreeMap::new();
        for run in self.store.list_runs()? {
            *grouped
                .entry((run.project_name, run.user_tag))
                .or_default()
                .entry(run.pipeline_name)
                .or_default() += 1;
        }
        Ok(grouped
            .into_iter()
            .map(|((project_name, user_tag), pipelines)| ProjectPipelines {
                project_name,
                user_tag,
                pipelines: pipelines
                    .into_iter()
                    .map(|(name, runs)| PipelineInfo { name, runs })
                    .collect(),
            })
            .collect())
    }

    pub fn list_nodes(&self, filter: &DagFilter) -> Result<Vec<CatalogNode>, StoreError> {
        Ok(self.list_dag(filter)?.nodes)
    }

    /// Nodes and edges of the current snapshot of every matching run.
    pub fn list_dag(&self, filter: &DagFilter) -> Result<Dag, StoreError> {
        let mut dag = Dag::default();
        for run in self.list_runs(filter)? {
            let Some(current) = resolve_current(self.store.as_ref(), &run.run_uid)? else {
                continue;
            };
            let sequence_version = current.sequence_version;
            dag.edges.extend(current.edges.iter().map(|e| CatalogEdge {
                run_uid: run.run_uid.clone(),
                from: e.from,
                to: e.to,
            }));
            dag.nodes
                .extend(current.nodes.into_iter().map(|node| CatalogNode {
                    run_uid: run.run_uid.clone(),
                    sequence_version,
                    node,
                }));
        }
        Ok(dag)
    }

    pub fn current(&self, run_uid: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        resolve_current(self.store.as_ref(), run_uid)
    }

    pub fn snapshot(
        &self,
        run_uid: &str,
        sequence_version: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        self.store.snapshot(run_uid, sequence_version)
    }

    /// Every committed version of a run, oldest first.
    pub fn history(&self, run_uid: &str) -> Result<Vec<SnapshotSummary>, StoreError> {
        Ok(self
            .store
            .snapshots(run_uid)?
            .iter()
            .map(SnapshotSummary::from)
            .collect())
    }

    pub fn verify_history(&self, run_uid: &str) -> Result<ChainReport, StoreError> {
        Ok(verify_chain(&self.store.snapshots(run_uid)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{NodeEvent, TransformEdge};
    use crate::run::RunMetadata;
    use crate::snapshot::PersistentWriter;
    use crate::store::MemoryStore;
    use crate::writer::{GraphBatch, WriteMode, Writer};
    use uuid::Uuid;

    fn commit_run(
        writer: &PersistentWriter<MemoryStore>,
        project: &str,
        pipeline: &str,
        tag: Option<&str>,
        operations: &[&str],
    ) {
        let run = RunMetadata {
            session_id: Uuid::new_v4(),
            project_name: project.into(),
            pipeline_name: pipeline.into(),
            user_tag: tag.map(str::to_string),
            description: None,
            status: RunStatus::Finished,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };
        let nodes: Vec<TransformNode> = operations
            .iter()
            .enumerate()
            .map(|(i, op)| NodeEvent::new(*op).into_node(NodeId(i as u64 + 1), Utc::now()))
            .collect();
        let edges: Vec<TransformEdge> = (1..nodes.len() as u64)
            .map(|i| TransformEdge::new(NodeId(i), NodeId(i + 1)))
            .collect();
        let batch = GraphBatch {
            run: &run,
            nodes: &nodes,
            edges: &edges,
            mode: WriteMode::Full,
        };
        writer.close(&batch).unwrap();
    }

    fn populated() -> (Arc<MemoryStore>, Catalog<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistentWriter::new(store.clone());
        commit_run(&writer, "churn", "features", None, &["read_csv", "fill_null"]);
        commit_run(&writer, "churn", "features", None, &["read_csv"]);
        commit_run(&writer, "churn", "training", None, &["read_csv", "merge", "head"]);
        commit_run(&writer, "churn", "features", Some("alice"), &["read_csv"]);
        commit_run(&writer, "fraud", "scoring", None, &["read_csv"]);
        (store.clone(), Catalog::new(store))
    }

    #[test]
    fn test_list_projects_and_pipelines() {
        let (_store, catalog) = populated();
        let projects = catalog.list_projects().unwrap();
        assert_eq!(projects.len(), 3);
        assert_eq!(projects[0].project_name, "churn");
        assert_eq!(projects[0].user_tag, None);
        assert_eq!(projects[0].runs, 3);
        assert_eq!(projects[1].user_tag.as_deref(), Some("alice"));

        assert_eq!(
            catalog.list_pipelines("churn", None).unwrap(),
            vec!["features", "training"]
        );
        assert_eq!(
            catalog.list_pipelines("churn", Some("alice")).unwrap(),
            vec!["features"]
        );
        assert!(catalog.list_pipelines("missing", None).unwrap().is_empty());
    }

    #[test]
    fn test_projects_with_pipelines_counts_runs() {
        let (_store, catalog) = populated();
        let grouped = catalog.projects_with_pipelines().unwrap();
        let churn = &grouped[0];
        assert_eq!(churn.project_name, "churn");
        assert_eq!(
            churn.pipelines,
            vec![
                PipelineInfo {
                    name: "features".into(),
                    runs: 2
                },
                PipelineInfo {
                    name: "training".into(),
                    runs: 1
                },
            ]
        );
    }

    #[test]
    fn test_filter_precedence() {
        let (_store, catalog) = populated();

        let project = catalog.list_runs(&DagFilter::project("churn")).unwrap();
        assert_eq!(project.len(), 4);

        let untagged = DagFilter::project("churn").pipeline("features");
        let runs = catalog.list_runs(&untagged).unwrap();
        assert_eq!(runs.len(), 3);

        let tagged = untagged.clone().user_tag("alice");
        assert_eq!(catalog.list_runs(&tagged).unwrap().len(), 1);

        // run_uid wins over a pipeline that does not match it.
        let training = catalog
            .list_runs(&DagFilter::project("churn").pipeline("training"))
            .unwrap();
        let by_uid = DagFilter::project("churn")
            .pipeline("features")
            .run(training[0].run_uid.clone());
        let runs = catalog.list_runs(&by_uid).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].pipeline_name, "training");
    }

    #[test]
    fn test_list_dag_uses_current_snapshot() {
        let (_store, catalog) = populated();
        let filter = DagFilter::project("churn").pipeline("training");
        let dag = catalog.list_dag(&filter).unwrap();
        assert_eq!(dag.nodes.len(), 3);
        assert_eq!(dag.edges.len(), 2);
        assert!(dag.nodes.iter().all(|n| n.sequence_version == 0));

        let nodes = catalog.list_nodes(&DagFilter::project("churn")).unwrap();
        assert_eq!(nodes.len(), 7);
        assert!(catalog.list_dag(&DagFilter::project("nope")).unwrap().nodes.is_empty());
    }

    #[test]
    fn test_history_and_verify() {
        let (store, catalog) = populated();
        let run = &store.list_runs().unwrap()[0];
        let history = catalog.history(&run.run_uid).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Finished);

        let report = catalog.verify_history(&run.run_uid).unwrap();
        assert!(report.valid);
        assert!(matches!(
            catalog.history("missing"),
            Err(StoreError::RunNotFound { .. })
        ));
    }
}
