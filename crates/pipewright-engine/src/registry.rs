use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::error;

use pipewright_core::error::Result;
use pipewright_core::node::PipelineNode;
use pipewright_core::run::NodeExecutionResult;

use crate::context::ExecutionContext;

/// Runs one node type.
///
/// Implementations may return `Err`; [`execute_guarded`] turns errors and
/// panics into a `failure` result so nothing escapes to the engine.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Catalog type id this executor handles.
    fn node_type(&self) -> &str;

    fn execute<'a>(
        &'a self,
        node: &'a PipelineNode,
        input: Option<&'a Value>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>>;
}

/// Invoke an executor, converting errors and panics into `failure` and
/// stamping the measured duration on the result.
pub async fn execute_guarded(
    executor: &dyn NodeExecutor,
    node: &PipelineNode,
    input: Option<&Value>,
    ctx: &ExecutionContext,
) -> NodeExecutionResult {
    let start = Instant::now();
    let outcome = AssertUnwindSafe(executor.execute(node, input, ctx))
        .catch_unwind()
        .await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => NodeExecutionResult::failure(e.to_string()),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(node_id = %node.id, node_type = node.node_type(), %message, "Executor panicked");
            NodeExecutionResult::failure(format!("executor panicked: {message}"))
        }
    };
    result.with_duration_ms(elapsed_ms)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Registry of node executors keyed by node type.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for the same type.
    pub fn register(&mut self, executor: impl NodeExecutor) {
        let node_type = executor.node_type().to_string();
        self.executors.insert(node_type, Arc::new(executor));
    }

    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.executors.remove(node_type).is_some()
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Create a registry with every built-in executor registered.
    ///
    /// Trigger and loop nodes are handled by the engine and have no executor.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::executors::agent::AgentExecutor);
        registry.register(crate::executors::app::AppExecutor);
        registry.register(crate::executors::condition::ConditionExecutor);
        registry.register(crate::executors::approval::ApprovalExecutor);
        registry.register(crate::executors::code::CodeExecutor);
        registry.register(crate::executors::notify::NotifyExecutor);
        registry.register(crate::executors::output::OutputExecutor);
        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::error::PipelineError;
    use pipewright_core::node::{NodeConfig, OutputAction};
    use pipewright_core::run::ResultStatus;

    struct Exploding;

    impl NodeExecutor for Exploding {
        fn node_type(&self) -> &str {
            "output"
        }

        fn execute<'a>(
            &'a self,
            _node: &'a PipelineNode,
            input: Option<&'a Value>,
            _ctx: &'a ExecutionContext,
        ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
            Box::pin(async move {
                match input {
                    Some(_) => Err(PipelineError::Format("bad input".into())),
                    None => panic!("no input"),
                }
            })
        }
    }

    fn output_node() -> PipelineNode {
        PipelineNode::new(
            "out",
            "Out",
            NodeConfig::Output(OutputAction {
                format: Default::default(),
                destination: None,
                path: None,
            }),
        )
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ExecutorRegistry::with_builtins();
        assert_eq!(
            registry.list(),
            vec!["agent", "app", "approval", "code", "condition", "notify", "output"]
        );
        assert!(!registry.contains("loop"));
        assert!(!registry.contains("manual"));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ExecutorRegistry::with_builtins();
        registry.register(Exploding);
        assert_eq!(registry.list().len(), 7);
        assert!(registry.unregister("output"));
        assert!(registry.get("output").is_none());
    }

    #[tokio::test]
    async fn test_error_becomes_failure() {
        let ctx = ExecutionContext::new("p", "r");
        let input = serde_json::json!({});
        let result = execute_guarded(&Exploding, &output_node(), Some(&input), &ctx).await;
        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("Format error: bad input"));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let ctx = ExecutionContext::new("p", "r");
        let result = execute_guarded(&Exploding, &output_node(), None, &ctx).await;
        assert_eq!(result.status, ResultStatus::Failure);
        assert!(result.error.unwrap().contains("no input"));
    }
}
