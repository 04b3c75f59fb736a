use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::NodeState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Success, failed and cancelled runs are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// What started a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDescriptor {
    /// Trigger kind: `manual`, `cron`, `webhook`, `task_event`, ...
    pub kind: String,
    /// The trigger node that fired. `None` starts every trigger node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Data delivered with the trigger; becomes the trigger node's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub fired_at: DateTime<Utc>,
}

impl TriggerDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            node_id: None,
            payload: None,
            fired_at: Utc::now(),
        }
    }

    pub fn manual() -> Self {
        Self::new("manual")
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Outcome class reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
    Skipped,
}

/// What every node executor returns. Never persisted verbatim; the engine
/// folds it into a [`NodeRunResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeExecutionResult {
    pub status: ResultStatus,
    /// Payload handed to downstream nodes.
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Named port that selects which outgoing edges fire.
    pub output_handle: Option<String>,
    /// Correlation key of an externally spawned session or task.
    pub session_key: Option<String>,
}

impl NodeExecutionResult {
    pub fn success(output: impl Into<Option<serde_json::Value>>) -> Self {
        Self {
            status: ResultStatus::Success,
            output: output.into(),
            error: None,
            duration_ms: 0,
            output_handle: None,
            session_key: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            output: None,
            error: Some(error.into()),
            duration_ms: 0,
            output_handle: None,
            session_key: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: ResultStatus::Skipped,
            output: None,
            error: None,
            duration_ms: 0,
            output_handle: None,
            session_key: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.output_handle = Some(handle.into());
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == ResultStatus::Failure
    }
}

/// One entry of a run's per-node ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunResult {
    pub node_id: String,
    pub node_type: String,
    pub status: ResultStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Loop iteration (zero-based) for nodes inside a loop body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// 1 for the first dispatch, incremented on each engine retry.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

/// One execution instance of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    pub status: RunStatus,
    pub trigger: TriggerDescriptor,
    #[serde(default)]
    pub node_results: Vec<NodeRunResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn new(pipeline_id: impl Into<String>, trigger: TriggerDescriptor) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.into(),
            status: RunStatus::Pending,
            trigger,
            node_results: vec![],
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    /// Results recorded for one node, in execution order.
    pub fn results_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeRunResult> + 'a {
        self.node_results.iter().filter(move |r| r.node_id == node_id)
    }

    /// Whether the node was invoked at least once.
    pub fn ran(&self, node_id: &str) -> bool {
        self.results_for(node_id).next().is_some()
    }

    /// Message of the first failed node, if any.
    pub fn first_failure(&self) -> Option<&str> {
        self.node_results
            .iter()
            .find(|r| r.status == ResultStatus::Failure)
            .and_then(|r| r.error.as_deref())
    }
}

/// A finalized run plus the engine's view of every node's state.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: PipelineRun,
    pub node_states: HashMap<String, NodeState>,
}
