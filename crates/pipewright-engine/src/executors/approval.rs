use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::node::{ApprovalStep, NodeConfig, PipelineNode, TimeoutAction};
use pipewright_core::run::NodeExecutionResult;

use crate::context::ExecutionContext;
use crate::registry::NodeExecutor;
use crate::template::with_context_block;

const CREATE_METHOD: &str = "tasks.create";
const GET_METHOD: &str = "tasks.get";
const TITLE_MAX_CHARS: usize = 80;

/// Human approval gate.
///
/// Creates an approval task through the task service, then polls it until
/// it is resolved, the deadline passes, or the run is cancelled. Routes
/// through `approved` or `denied`.
pub struct ApprovalExecutor;

impl NodeExecutor for ApprovalExecutor {
    fn node_type(&self) -> &str {
        "approval"
    }

    fn execute<'a>(
        &'a self,
        node: &'a PipelineNode,
        input: Option<&'a Value>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let NodeConfig::Approval(cfg) = &node.config else {
                return Err(super::mismatched("approval", node));
            };
            if cfg.message.trim().is_empty() {
                return Err(PipelineError::ConfigValidation(
                    "approval message is required".into(),
                ));
            }

            let task_id = create_task(node, cfg, input, ctx).await?;
            info!(node_id = %node.id, task_id = %task_id, "Approval task created, waiting for decision");
            await_decision(node, cfg, &task_id, ctx).await
        })
    }
}

async fn create_task(
    node: &PipelineNode,
    cfg: &ApprovalStep,
    input: Option<&Value>,
    ctx: &ExecutionContext,
) -> Result<String> {
    let remote = ctx.capabilities.remote()?;

    let params = json!({
        "title": title_from(&cfg.message),
        "description": with_context_block(&cfg.message, input),
        "priority": "high",
        "kind": "approval",
        "assignees": cfg.approver_ids.clone().unwrap_or_default(),
        "metadata": {
            "pipelineNodeId": node.id,
            "pipelineId": ctx.pipeline_id,
            "runId": ctx.run_id,
            "source": "pipeline",
        },
    });

    let created = remote.call(CREATE_METHOD, params).await.map_err(|e| {
        PipelineError::external(CREATE_METHOD, format!("Failed to create approval task: {e}"))
    })?;

    task_id_of(&created).ok_or_else(|| {
        PipelineError::external(
            CREATE_METHOD,
            "Failed to create approval task: response carried no task id",
        )
    })
}

async fn await_decision(
    node: &PipelineNode,
    cfg: &ApprovalStep,
    task_id: &str,
    ctx: &ExecutionContext,
) -> Result<NodeExecutionResult> {
    let remote = ctx.capabilities.remote()?;
    let deadline = cfg
        .timeout_sec
        .filter(|secs| *secs > 0)
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let interval = ctx.settings.poll_interval;
    let mut last_status = "pending".to_string();

    loop {
        let polled = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(cancelled(node, task_id)),
            polled = remote.call(GET_METHOD, json!({ "id": task_id })) => {
                polled.map_err(|e| PipelineError::external(GET_METHOD, e.to_string()))?
            }
        };

        if let Some(task) = TaskSnapshot::from_value(&polled) {
            debug!(node_id = %node.id, task_id, status = %task.status, "Approval task polled");
            match task.status.as_str() {
                "completed" => {
                    let approved = task.resolution.as_deref() != Some("rejected");
                    return Ok(decision(task_id, &task, approved));
                }
                "rejected" | "cancelled" | "failed" => {
                    return Ok(decision(task_id, &task, false));
                }
                _ => last_status = task.status,
            }
        }

        let now = Instant::now();
        let wait = match deadline {
            Some(at) if now >= at => {
                return on_timeout(node, cfg, task_id, &last_status);
            }
            Some(at) => interval.min(at - now),
            None => interval,
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(cancelled(node, task_id)),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

fn on_timeout(
    node: &PipelineNode,
    cfg: &ApprovalStep,
    task_id: &str,
    last_status: &str,
) -> Result<NodeExecutionResult> {
    let secs = cfg.timeout_sec.unwrap_or_default();
    warn!(node_id = %node.id, task_id, timeout_secs = secs, action = ?cfg.timeout_action, "Approval timed out");

    let output = json!({
        "taskId": task_id,
        "status": last_status,
        "resolution": Value::Null,
        "approved": false,
        "timedOut": true,
    });

    match cfg.timeout_action {
        TimeoutAction::Deny => Ok(NodeExecutionResult::success(output)
            .with_handle("denied")
            .with_session_key(task_id)),
        TimeoutAction::Skip => Ok(NodeExecutionResult::skipped()
            .with_output(output)
            .with_error(format!("approval timed out after {secs}s"))
            .with_session_key(task_id)),
        TimeoutAction::Escalate => Err(PipelineError::Unsupported(format!(
            "approval timed out after {secs}s and escalation is not supported"
        ))),
    }
}

fn cancelled(node: &PipelineNode, task_id: &str) -> NodeExecutionResult {
    info!(node_id = %node.id, task_id, "Approval wait cancelled");
    NodeExecutionResult::skipped()
        .with_error("cancelled")
        .with_session_key(task_id)
}

fn decision(task_id: &str, task: &TaskSnapshot, approved: bool) -> NodeExecutionResult {
    let handle = if approved { "approved" } else { "denied" };
    NodeExecutionResult::success(json!({
        "taskId": task_id,
        "status": task.status,
        "resolution": task.resolution,
        "approved": approved,
        "timedOut": false,
    }))
    .with_handle(handle)
    .with_session_key(task_id)
}

/// Status and resolution of a polled task. A missing record or status
/// means the task is still pending.
struct TaskSnapshot {
    status: String,
    resolution: Option<String>,
}

impl TaskSnapshot {
    fn from_value(value: &Value) -> Option<Self> {
        let record = value.get("task").filter(|t| t.is_object()).unwrap_or(value);
        let status = record.get("status")?.as_str()?.to_string();
        let resolution = record
            .get("resolution")
            .and_then(Value::as_str)
            .map(String::from);
        Some(Self { status, resolution })
    }
}

/// Task id from `{id}` or `{task: {id}}`.
fn task_id_of(created: &Value) -> Option<String> {
    let id = created
        .get("id")
        .or_else(|| created.get("task").and_then(|t| t.get("id")))?;
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First line of the message, capped for use as a task title.
fn title_from(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        line.to_string()
    } else {
        let cut: String = line.chars().take(TITLE_MAX_CHARS - 1).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pipewright_core::run::ResultStatus;
    use pipewright_test_utils::ScriptedRemote;
    use tokio_util::sync::CancellationToken;

    use crate::context::{Capabilities, ExecutorSettings};
    use crate::registry::execute_guarded;

    fn node(timeout_sec: Option<u64>, action: TimeoutAction) -> PipelineNode {
        PipelineNode::new(
            "gate",
            "Gate",
            NodeConfig::Approval(ApprovalStep {
                message: "Ship release?".into(),
                approver_ids: Some(vec!["u-1".into()]),
                timeout_sec,
                timeout_action: action,
            }),
        )
    }

    fn ctx(remote: &Arc<ScriptedRemote>) -> ExecutionContext {
        ExecutionContext::new("p1", "r1")
            .with_capabilities(Capabilities::new().with_remote(remote.clone()))
            .with_settings(ExecutorSettings {
                poll_interval: Duration::from_secs(2),
                ..Default::default()
            })
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_is_approved() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-1"}));
        remote.respond(GET_METHOD, Value::Null);
        remote.respond(GET_METHOD, json!({"status": "in_progress"}));
        remote.respond(GET_METHOD, json!({"status": "completed", "resolution": "done"}));

        let result =
            execute_guarded(&ApprovalExecutor, &node(None, TimeoutAction::Deny), None, &ctx(&remote)).await;

        assert!(result.is_success());
        assert_eq!(result.output_handle.as_deref(), Some("approved"));
        assert_eq!(result.session_key.as_deref(), Some("t-1"));
        let out = result.output.unwrap();
        assert_eq!(out["approved"], true);
        assert_eq!(out["timedOut"], false);
        assert_eq!(remote.calls_to(GET_METHOD).len(), 3);
        assert!((4_000..4_100).contains(&result.duration_ms));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_resolution_is_denied() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"task": {"id": "t-2"}}));
        remote.respond(GET_METHOD, json!({"task": {"status": "completed", "resolution": "rejected"}}));

        let result =
            execute_guarded(&ApprovalExecutor, &node(None, TimeoutAction::Deny), None, &ctx(&remote)).await;

        assert_eq!(result.output_handle.as_deref(), Some("denied"));
        assert_eq!(result.output.unwrap()["approved"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_resolution_is_approved() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-c"}));
        remote.respond(GET_METHOD, json!({"status": "completed", "resolution": "custom_resolution"}));

        let result =
            execute_guarded(&ApprovalExecutor, &node(None, TimeoutAction::Deny), None, &ctx(&remote)).await;
        assert_eq!(result.output_handle.as_deref(), Some("approved"));
        assert_eq!(result.output.unwrap()["resolution"], "custom_resolution");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_is_denied() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-3"}));
        remote.respond(GET_METHOD, json!({"status": "cancelled"}));

        let result =
            execute_guarded(&ApprovalExecutor, &node(None, TimeoutAction::Deny), None, &ctx(&remote)).await;
        assert_eq!(result.output_handle.as_deref(), Some("denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deny() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-4"}));
        remote.respond(GET_METHOD, json!({"status": "pending"}));

        let result = execute_guarded(
            &ApprovalExecutor,
            &node(Some(5), TimeoutAction::Deny),
            None,
            &ctx(&remote),
        )
        .await;

        assert!(result.is_success());
        assert_eq!(result.output_handle.as_deref(), Some("denied"));
        let out = result.output.unwrap();
        assert_eq!(out["timedOut"], true);
        assert_eq!(out["approved"], false);
        assert!((5_000..5_100).contains(&result.duration_ms));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_skip() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-5"}));
        remote.respond(GET_METHOD, Value::Null);

        let result = execute_guarded(
            &ApprovalExecutor,
            &node(Some(3), TimeoutAction::Skip),
            None,
            &ctx(&remote),
        )
        .await;

        assert_eq!(result.status, ResultStatus::Skipped);
        assert!(result.output_handle.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_escalate_fails() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-6"}));
        remote.respond(GET_METHOD, Value::Null);

        let result = execute_guarded(
            &ApprovalExecutor,
            &node(Some(1), TimeoutAction::Escalate),
            None,
            &ctx(&remote),
        )
        .await;

        assert!(result.is_failure());
        assert!(result.error.unwrap().contains("not supported"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_waits_indefinitely() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-7"}));
        for _ in 0..50 {
            remote.respond(GET_METHOD, json!({"status": "pending"}));
        }
        remote.respond(GET_METHOD, json!({"status": "completed"}));

        let result = execute_guarded(
            &ApprovalExecutor,
            &node(Some(0), TimeoutAction::Deny),
            None,
            &ctx(&remote),
        )
        .await;

        assert_eq!(result.output_handle.as_deref(), Some("approved"));
        assert!((100_000..100_100).contains(&result.duration_ms));
    }

    #[tokio::test]
    async fn test_create_failure() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.fail(CREATE_METHOD, "connection refused");

        let result =
            execute_guarded(&ApprovalExecutor, &node(None, TimeoutAction::Deny), None, &ctx(&remote)).await;

        assert!(result.is_failure());
        assert!(result.error.unwrap().contains("Failed to create"));
        assert!(remote.calls_to(GET_METHOD).is_empty());
    }

    #[tokio::test]
    async fn test_create_returning_null_fails() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, Value::Null);

        let result =
            execute_guarded(&ApprovalExecutor, &node(None, TimeoutAction::Deny), None, &ctx(&remote)).await;

        assert!(result.is_failure());
        assert!(result.error.unwrap().contains("Failed to create"));
    }

    #[tokio::test]
    async fn test_create_without_id_fails() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"ok": true}));

        let result =
            execute_guarded(&ApprovalExecutor, &node(None, TimeoutAction::Deny), None, &ctx(&remote)).await;

        assert!(result.is_failure());
        assert!(result.error.unwrap().contains("Failed to create"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_skips() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-8"}));
        remote.respond(GET_METHOD, Value::Null);

        let cancel = CancellationToken::new();
        let ctx = ctx(&remote).with_cancel(cancel.clone());
        let node = node(None, TimeoutAction::Deny);

        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trip.cancel();
        });

        let result = execute_guarded(&ApprovalExecutor, &node, None, &ctx).await;
        assert_eq!(result.status, ResultStatus::Skipped);
        assert_eq!(result.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_stalled_poll() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-10"}));
        remote.hang(GET_METHOD);

        let cancel = CancellationToken::new();
        let ctx = ctx(&remote).with_cancel(cancel.clone());
        let node = node(Some(60), TimeoutAction::Deny);

        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trip.cancel();
        });

        let result = execute_guarded(&ApprovalExecutor, &node, None, &ctx).await;
        assert_eq!(result.status, ResultStatus::Skipped);
        assert_eq!(result.error.as_deref(), Some("cancelled"));
        assert_eq!(result.session_key.as_deref(), Some("t-10"));
        assert_eq!(remote.calls_to(GET_METHOD).len(), 1);
    }

    #[tokio::test]
    async fn test_create_params_carry_context() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.respond(CREATE_METHOD, json!({"id": "t-9"}));
        remote.respond(GET_METHOD, json!({"status": "completed"}));

        let input = json!({"build": 42});
        execute_guarded(&ApprovalExecutor, &node(None, TimeoutAction::Deny), Some(&input), &ctx(&remote)).await;

        let params = &remote.calls_to(CREATE_METHOD)[0];
        assert_eq!(params["title"], "Ship release?");
        assert_eq!(params["priority"], "high");
        assert_eq!(params["kind"], "approval");
        assert_eq!(params["assignees"], json!(["u-1"]));
        assert_eq!(params["metadata"]["pipelineNodeId"], "gate");
        assert_eq!(params["metadata"]["runId"], "r1");
        assert_eq!(params["metadata"]["source"], "pipeline");
        let description = params["description"].as_str().unwrap();
        assert!(description.starts_with("Ship release?\n\n[Context from previous step]\n"));
        assert!(description.contains("\"build\": 42"));
    }

    #[test]
    fn test_title_truncated() {
        let long = "x".repeat(200);
        assert_eq!(title_from(&long).chars().count(), TITLE_MAX_CHARS);
        assert_eq!(title_from("Line one\nLine two"), "Line one");
    }
}
