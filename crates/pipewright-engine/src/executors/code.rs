use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::node::{NodeConfig, PipelineNode};
use pipewright_core::run::NodeExecutionResult;
use pipewright_core::traits::IsolatedRunRequest;

use crate::context::ExecutionContext;
use crate::registry::NodeExecutor;
use crate::template::with_context_block;

const CODE_TOOL: &str = "code_exec";
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Hands a task description to an isolated agent restricted to the code
/// execution tool.
pub struct CodeExecutor;

impl NodeExecutor for CodeExecutor {
    fn node_type(&self) -> &str {
        "code"
    }

    fn execute<'a>(
        &'a self,
        node: &'a PipelineNode,
        input: Option<&'a Value>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let NodeConfig::Code(cfg) = &node.config else {
                return Err(super::mismatched("code", node));
            };
            if cfg.description.trim().is_empty() {
                return Err(PipelineError::ConfigValidation(
                    "code description is required".into(),
                ));
            }

            let max_retries = cfg.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
            let language = cfg.language.as_deref().unwrap_or("any suitable language");
            let task = format!(
                "Write and execute code to accomplish the following task.\n\
                 Language: {language}\n\
                 If the code fails, fix it and try again, up to {max_retries} attempts.\n\
                 Report the final result.\n\n\
                 Task: {}",
                cfg.description.trim()
            );

            let request = IsolatedRunRequest {
                message: with_context_block(&task, input),
                tools: vec![CODE_TOOL.to_string()],
                timeout_seconds: cfg.timeout.unwrap_or(ctx.settings.code_timeout_secs),
                model: None,
                credentials: vec![],
                label: Some(node.label.clone()),
            };

            info!(node_id = %node.id, timeout_secs = request.timeout_seconds, "Dispatching code task");
            let response = super::run_isolated(ctx, request).await?;
            Ok(super::isolated_result(response))
        })
    }
}
