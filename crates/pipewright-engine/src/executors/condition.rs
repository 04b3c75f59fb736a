use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::node::{NodeConfig, PipelineNode};
use pipewright_core::run::NodeExecutionResult;

use crate::context::ExecutionContext;
use crate::registry::NodeExecutor;

/// Evaluates the node's expression against its input and routes through the
/// `true` or `false` handle. The input passes through unchanged.
pub struct ConditionExecutor;

impl NodeExecutor for ConditionExecutor {
    fn node_type(&self) -> &str {
        "condition"
    }

    fn execute<'a>(
        &'a self,
        node: &'a PipelineNode,
        input: Option<&'a Value>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let NodeConfig::Condition(cfg) = &node.config else {
                return Err(super::mismatched("condition", node));
            };
            if cfg.expression.trim().is_empty() {
                return Err(PipelineError::ConfigValidation(
                    "condition expression is required".into(),
                ));
            }

            let subject = input.cloned().unwrap_or(Value::Null);
            let verdict = ctx.capabilities.evaluator.evaluate(&cfg.expression, &subject)?;
            debug!(node_id = %node.id, expression = %cfg.expression, verdict, "Condition evaluated");

            let handle = if verdict { "true" } else { "false" };
            Ok(NodeExecutionResult::success(input.cloned()).with_handle(handle))
        })
    }
}
