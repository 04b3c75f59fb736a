use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::node::{NodeConfig, PipelineNode, SessionTarget};
use pipewright_core::run::NodeExecutionResult;
use pipewright_core::traits::IsolatedRunRequest;

use crate::context::ExecutionContext;
use crate::registry::NodeExecutor;
use crate::template::with_context_block;

/// Runs an agent turn. Isolated turns are awaited; main-session turns are
/// queued as a system event and reported as queued.
pub struct AgentExecutor;

impl NodeExecutor for AgentExecutor {
    fn node_type(&self) -> &str {
        "agent"
    }

    fn execute<'a>(
        &'a self,
        node: &'a PipelineNode,
        input: Option<&'a Value>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let NodeConfig::Agent(cfg) = &node.config else {
                return Err(super::mismatched("agent", node));
            };
            if cfg.prompt.trim().is_empty() {
                return Err(PipelineError::ConfigValidation(
                    "agent prompt is required".into(),
                ));
            }
            let message = with_context_block(cfg.prompt.trim(), input);

            match cfg.session_target {
                SessionTarget::Main => {
                    let events = ctx.capabilities.system_events()?;
                    events.enqueue(message, None);
                    info!(node_id = %node.id, "Agent turn queued on main session");
                    Ok(NodeExecutionResult::success(json!({ "queued": true })))
                }
                SessionTarget::Isolated => {
                    let request = IsolatedRunRequest {
                        message,
                        tools: cfg.skills.clone(),
                        timeout_seconds: cfg.timeout.unwrap_or(ctx.settings.agent_timeout_secs),
                        model: cfg.model.clone(),
                        credentials: cfg.credentials.clone(),
                        label: Some(node.label.clone()),
                    };
                    info!(node_id = %node.id, skills = request.tools.len(), "Running isolated agent turn");
                    let response = super::run_isolated(ctx, request).await?;
                    Ok(super::isolated_result(response))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pipewright_core::node::AgentStep;
    use pipewright_core::traits::IsolatedRunResponse;
    use pipewright_test_utils::{MockIsolated, RecordingEvents};

    use crate::context::Capabilities;
    use crate::registry::execute_guarded;

    fn node(target: SessionTarget) -> PipelineNode {
        PipelineNode::new(
            "writer",
            "Writer",
            NodeConfig::Agent(AgentStep {
                prompt: "Summarize the report".into(),
                model: Some("small".into()),
                skills: vec!["web_search".into()],
                credentials: vec!["github".into()],
                session_target: target,
                timeout: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_isolated_turn() {
        let isolated = Arc::new(MockIsolated::new(IsolatedRunResponse {
            status: "ok".into(),
            summary: Some("short summary".into()),
            session_key: Some("iso-1".into()),
            ..Default::default()
        }));
        let ctx = ExecutionContext::new("p", "r")
            .with_capabilities(Capabilities::new().with_isolated(isolated.clone()));

        let result = execute_guarded(&AgentExecutor, &node(SessionTarget::Isolated), None, &ctx).await;

        assert!(result.is_success());
        assert_eq!(result.output, Some(json!("short summary")));
        assert_eq!(result.session_key.as_deref(), Some("iso-1"));
        let request = &isolated.requests()[0];
        assert_eq!(request.tools, vec!["web_search".to_string()]);
        assert_eq!(request.model.as_deref(), Some("small"));
        assert_eq!(request.credentials, vec!["github".to_string()]);
        assert_eq!(request.timeout_seconds, 300);
        assert_eq!(request.message, "Summarize the report");
    }

    #[tokio::test]
    async fn test_main_session_enqueues() {
        let events = Arc::new(RecordingEvents::new());
        let ctx = ExecutionContext::new("p", "r")
            .with_capabilities(Capabilities::new().with_system_events(events.clone()));

        let input = json!("draft text");
        let result =
            execute_guarded(&AgentExecutor, &node(SessionTarget::Main), Some(&input), &ctx).await;

        assert!(result.is_success());
        assert_eq!(result.output, Some(json!({"queued": true})));
        let queued = events.queued();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].0.ends_with("[Context from previous step]\ndraft text"));
    }

    #[tokio::test]
    async fn test_main_session_without_events_fails() {
        let ctx = ExecutionContext::new("p", "r");
        let result = execute_guarded(&AgentExecutor, &node(SessionTarget::Main), None, &ctx).await;
        assert!(result.is_failure());
    }
}
