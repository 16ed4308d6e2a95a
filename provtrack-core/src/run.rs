//! Run metadata and frozen graph snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::event::{TransformEdge, TransformNode};

/// Lifecycle status of a run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Open,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Open)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Open, RunStatus::Finished) | (RunStatus::Open, RunStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Open => "open",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "running" => Ok(RunStatus::Open),
            "finished" | "done" => Ok(RunStatus::Finished),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Grouping key under which a persistent writer keeps one open run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub project_name: String,
    pub pipeline_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_name, self.pipeline_name)?;
        if let Some(tag) = &self.user_tag {
            write!(f, "@{tag}")?;
        }
        Ok(())
    }
}

/// Metadata of the tracker's current (or last) session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub session_id: Uuid,
    pub project_name: String,
    pub pipeline_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunMetadata {
    pub fn key(&self) -> RunKey {
        RunKey {
            project_name: self.project_name.clone(),
            pipeline_name: self.pipeline_name.clone(),
            user_tag: self.user_tag.clone(),
        }
    }
}

/// A frozen copy of a run's graph at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub run: RunMetadata,
    pub nodes: Vec<TransformNode>,
    pub edges: Vec<TransformEdge>,
}

impl GraphSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_forward_only() {
        assert!(RunStatus::Open.can_transition_to(RunStatus::Finished));
        assert!(RunStatus::Open.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Finished.can_transition_to(RunStatus::Open));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Finished));
        assert!(!RunStatus::Open.can_transition_to(RunStatus::Open));
    }

    #[test]
    fn test_status_parse_and_display() {
        assert_eq!("finished".parse::<RunStatus>().unwrap(), RunStatus::Finished);
        assert_eq!("RUNNING".parse::<RunStatus>().unwrap(), RunStatus::Open);
        assert!("paused".parse::<RunStatus>().is_err());
        assert_eq!(RunStatus::Failed.to_string(), "failed");
        assert_eq!(
            serde_json::to_string(&RunStatus::Finished).unwrap(),
            "\"finished\""
        );
    }

    #[test]
    fn test_run_key_display() {
        let key = RunKey {
            project_name: "churn".into(),
            pipeline_name: "features".into(),
            user_tag: Some("nightly".into()),
        };
        assert_eq!(key.to_string(), "churn/features@nightly");
    }
}
