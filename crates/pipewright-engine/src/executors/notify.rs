use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::node::{NodeConfig, PipelineNode};
use pipewright_core::run::NodeExecutionResult;

use crate::context::ExecutionContext;
use crate::registry::NodeExecutor;
use crate::template::interpolate;

const CREATE_METHOD: &str = "notifications.create";

/// Renders the node's template against its input and sends it through the
/// notification service.
pub struct NotifyExecutor;

impl NodeExecutor for NotifyExecutor {
    fn node_type(&self) -> &str {
        "notify"
    }

    fn execute<'a>(
        &'a self,
        node: &'a PipelineNode,
        input: Option<&'a Value>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let NodeConfig::Notify(cfg) = &node.config else {
                return Err(super::mismatched("notify", node));
            };
            if cfg.channels.is_empty() {
                return Err(PipelineError::ConfigValidation(
                    "notify requires at least one channel".into(),
                ));
            }
            if cfg.template.trim().is_empty() {
                return Err(PipelineError::ConfigValidation(
                    "notify template is required".into(),
                ));
            }
            let remote = ctx.capabilities.remote()?;

            let message = interpolate(&cfg.template, input);
            let params = json!({
                "channels": cfg.channels,
                "message": message,
                "priority": cfg.priority.as_deref().unwrap_or("normal"),
                "source": "pipeline",
                "pipelineId": ctx.pipeline_id,
                "pipelineNodeId": node.id,
                "runId": ctx.run_id,
            });

            let response = remote
                .call(CREATE_METHOD, params)
                .await
                .map_err(|e| PipelineError::external(CREATE_METHOD, e.to_string()))?;

            info!(node_id = %node.id, channels = cfg.channels.len(), %message, "Notification sent");
            Ok(NodeExecutionResult::success(response))
        })
    }
}
