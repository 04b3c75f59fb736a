pub mod agent;
pub mod app;
pub mod approval;
pub mod code;
pub mod condition;
pub mod notify;
pub mod output;

use std::time::Duration;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::node::PipelineNode;
use pipewright_core::run::NodeExecutionResult;
use pipewright_core::traits::{IsolatedRunRequest, IsolatedRunResponse};

use crate::context::ExecutionContext;

/// Error for a node routed to the wrong executor.
pub(crate) fn mismatched(executor: &str, node: &PipelineNode) -> PipelineError {
    PipelineError::ConfigValidation(format!(
        "{executor} executor cannot run {} node '{}'",
        node.node_type(),
        node.id
    ))
}

const ISOLATED_METHOD: &str = "isolated.run";

/// Slack on top of the turn's own timeout before the engine gives up on it.
const ISOLATED_GRACE_SECS: u64 = 30;

/// Run an isolated agent turn, bounded by its timeout plus a grace period.
pub(crate) async fn run_isolated(
    ctx: &ExecutionContext,
    request: IsolatedRunRequest,
) -> Result<IsolatedRunResponse> {
    let isolated = ctx.capabilities.isolated()?;
    let limit = request.timeout_seconds + ISOLATED_GRACE_SECS;

    match tokio::time::timeout(Duration::from_secs(limit), isolated.run(request)).await {
        Ok(response) => response.map_err(|e| PipelineError::external(ISOLATED_METHOD, e.to_string())),
        Err(_) => Err(PipelineError::TimeoutExceeded(limit)),
    }
}

/// Fold an isolated turn's response into a node result. A non-`ok` status
/// is a failure that still carries any partial summary as output.
pub(crate) fn isolated_result(response: IsolatedRunResponse) -> NodeExecutionResult {
    let output = response
        .summary
        .clone()
        .map(serde_json::Value::String)
        .or_else(|| response.result.clone());

    let mut result = if response.is_ok() {
        NodeExecutionResult::success(output)
    } else {
        let error = response
            .error
            .clone()
            .unwrap_or_else(|| format!("isolated run finished with status '{}'", response.status));
        let mut failed = NodeExecutionResult::failure(error);
        failed.output = output;
        failed
    };
    if let Some(key) = response.session_key {
        result = result.with_session_key(key);
    }
    result
}
