use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::node::{NodeConfig, PipelineNode, SessionTarget};
use pipewright_core::run::NodeExecutionResult;

use crate::context::ExecutionContext;
use crate::registry::NodeExecutor;

const INVOKE_METHOD: &str = "apps.invoke";
const DEFAULT_APP_TIMEOUT_SECS: u64 = 300;

/// Invokes an installed app through the app runtime.
pub struct AppExecutor;

impl NodeExecutor for AppExecutor {
    fn node_type(&self) -> &str {
        "app"
    }

    fn execute<'a>(
        &'a self,
        node: &'a PipelineNode,
        input: Option<&'a Value>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let NodeConfig::App(cfg) = &node.config else {
                return Err(super::mismatched("app", node));
            };
            if cfg.app_id.trim().is_empty() {
                return Err(PipelineError::ConfigValidation("app id is required".into()));
            }
            let remote = ctx.capabilities.remote()?;

            let session_target = match cfg.session_target {
                SessionTarget::Isolated => "isolated",
                SessionTarget::Main => "main",
            };
            let params = json!({
                "appId": cfg.app_id,
                "prompt": cfg.prompt,
                "input": input.cloned().unwrap_or(Value::Null),
                "sessionTarget": session_target,
                "lifecycle": cfg.lifecycle,
                "timeoutSeconds": cfg.timeout.unwrap_or(DEFAULT_APP_TIMEOUT_SECS),
                "pipelineId": ctx.pipeline_id,
                "runId": ctx.run_id,
            });

            let response = remote
                .call(INVOKE_METHOD, params)
                .await
                .map_err(|e| PipelineError::external(INVOKE_METHOD, e.to_string()))?;

            info!(node_id = %node.id, app_id = %cfg.app_id, "App invoked");
            let session_key = response
                .get("sessionKey")
                .and_then(Value::as_str)
                .map(String::from);
            let mut result = NodeExecutionResult::success(response);
            if let Some(key) = session_key {
                result = result.with_session_key(key);
            }
            Ok(result)
        })
    }
}
