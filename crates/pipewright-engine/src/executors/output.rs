use futures::future::BoxFuture;
use serde_json::Value;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::node::{NodeConfig, OutputFormat, PipelineNode};
use pipewright_core::run::NodeExecutionResult;

use crate::context::ExecutionContext;
use crate::registry::NodeExecutor;
use crate::template::{render_pretty, stringify};

/// Formats the input as JSON, markdown or text. Writing the result to its
/// destination is left to the host.
pub struct OutputExecutor;

impl NodeExecutor for OutputExecutor {
    fn node_type(&self) -> &str {
        "output"
    }

    fn execute<'a>(
        &'a self,
        node: &'a PipelineNode,
        input: Option<&'a Value>,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let NodeConfig::Output(cfg) = &node.config else {
                return Err(super::mismatched("output", node));
            };
            let formatted = format_output(cfg.format, input)?;
            Ok(NodeExecutionResult::success(formatted))
        })
    }
}

/// Render `input` in the requested format.
pub fn format_output(format: OutputFormat, input: Option<&Value>) -> Result<Value> {
    match format {
        OutputFormat::Json => match input {
            Some(Value::String(s)) => serde_json::from_str(s)
                .map_err(|e| PipelineError::Format(format!("input is not valid JSON: {e}"))),
            Some(other) => Ok(other.clone()),
            None => Ok(Value::Null),
        },
        OutputFormat::Markdown => Ok(Value::String(match input {
            Some(Value::String(s)) => s.clone(),
            Some(other) => format!("```json\n{}\n```", render_pretty(other)),
            None => String::new(),
        })),
        OutputFormat::Text => Ok(Value::String(input.map(stringify).unwrap_or_default())),
    }
}
