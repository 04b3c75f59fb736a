//! Seams to the outside world. The engine and executors only ever talk to
//! collaborators through these traits.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::PipelineEvent;
use crate::run::PipelineRun;

/// Generic remote procedure call into the host (task service, notification
/// service, app runtime, ...). Failures surface as `Err`.
pub trait RemoteCall: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// Parameters for an isolated agent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolatedRunRequest {
    pub message: String,
    /// Tool allow-list. Empty means the host default set.
    #[serde(default)]
    pub tools: Vec<String>,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// What an isolated agent turn reports back. `status == "ok"` is success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolatedRunResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

impl IsolatedRunResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Runs an agent turn in a fresh, isolated session.
pub trait IsolatedExecutor: Send + Sync + 'static {
    fn run(&self, request: IsolatedRunRequest) -> BoxFuture<'_, Result<IsolatedRunResponse>>;
}

/// Fire-and-forget signal into a host session. Never awaited for correctness.
pub trait SystemEvents: Send + Sync + 'static {
    fn enqueue(&self, text: String, session_key: Option<String>);
}

/// Evaluates opaque boolean expressions (conditions, edge guards, loop stop
/// conditions) against a JSON value.
pub trait ExpressionEvaluator: Send + Sync + 'static {
    fn evaluate(&self, expression: &str, input: &serde_json::Value) -> Result<bool>;
}

/// Append-only store of run records keyed by pipeline id.
pub trait RunLog: Send + Sync + 'static {
    /// Append a run record. A later record with the same run id supersedes
    /// an earlier one.
    fn append<'a>(&'a self, pipeline_id: &'a str, run: &'a PipelineRun) -> BoxFuture<'a, Result<()>>;

    /// Most recent runs first, one record per run id.
    fn load_recent<'a>(
        &'a self,
        pipeline_id: &'a str,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Result<Vec<PipelineRun>>>;
}

/// Receives lifecycle events. Must not block the caller.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: PipelineEvent);
}
